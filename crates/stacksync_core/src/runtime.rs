use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

use crate::api::ResourceKind;
use crate::config::StackConfig;

/// Resolved on-disk layout for one schema directory.
///
/// One directory per resource kind, one YAML file per item; entries get a
/// subdirectory per content type and labels live in a single tree file.
#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub schema_dir: PathBuf,
    pub labels_path: PathBuf,
    pub entries_dir: PathBuf,
    pub config_path: PathBuf,
}

impl ResolvedPaths {
    pub fn resolve(project_root: &Path, config: &StackConfig) -> Self {
        let schema_dir = project_root.join(config.schema_dir());
        Self {
            project_root: project_root.to_path_buf(),
            labels_path: schema_dir.join("labels.yaml"),
            entries_dir: schema_dir.join("entries"),
            config_path: project_root.join("stacksync.toml"),
            schema_dir,
        }
    }

    pub fn kind_dir(&self, kind: ResourceKind) -> PathBuf {
        self.schema_dir.join(kind.dir_name())
    }

    pub fn entries_dir_for(&self, content_type_uid: &str) -> PathBuf {
        self.entries_dir.join(content_type_uid)
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={}\nschema_dir={}\nentries_dir={}\nlabels_path={}\nconfig_path={}",
            self.project_root.display(),
            self.schema_dir.display(),
            self.entries_dir.display(),
            self.labels_path.display(),
            self.config_path.display(),
        )
    }
}

/// Push requires an existing schema directory; pull creates it on demand.
pub fn ensure_ready_for_push(paths: &ResolvedPaths) -> Result<()> {
    if !paths.schema_dir.exists() {
        bail!(
            "schema directory does not exist: {}\nRun `stacksync pull` first to seed it.",
            paths.schema_dir.display()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_builds_layout_under_schema_dir() {
        let config = StackConfig::default();
        let paths = ResolvedPaths::resolve(Path::new("/repo"), &config);
        assert_eq!(paths.schema_dir, Path::new("/repo/schema"));
        assert_eq!(paths.labels_path, Path::new("/repo/schema/labels.yaml"));
        assert_eq!(
            paths.entries_dir_for("event"),
            Path::new("/repo/schema/entries/event")
        );
        assert_eq!(
            paths.kind_dir(ResourceKind::ContentType),
            Path::new("/repo/schema/content-types")
        );
    }

    #[test]
    fn ensure_ready_for_push_rejects_missing_schema_dir() {
        let config = StackConfig::default();
        let paths = ResolvedPaths::resolve(Path::new("/definitely/not/here"), &config);
        let error = ensure_ready_for_push(&paths).expect_err("must fail");
        assert!(error.to_string().contains("schema directory does not exist"));
    }
}
