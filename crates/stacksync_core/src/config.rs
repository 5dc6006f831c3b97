use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "stacksync/0.3";
pub const DEFAULT_SCHEMA_DIR: &str = "schema";
pub const DEFAULT_BRANCH: &str = "main";

/// Policy for items that exist remotely but not locally during a push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionStrategy {
    /// Delete remote-only items.
    Delete,
    /// Leave remote-only items alone and report them as unmodified.
    #[default]
    Ignore,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StackConfig {
    #[serde(default)]
    pub stack: StackSection,
    #[serde(default)]
    pub schema: SchemaSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StackSection {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub management_token: Option<String>,
    pub branch: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SchemaSection {
    pub dir: Option<String>,
    pub deletion_strategy: Option<DeletionStrategy>,
}

impl StackConfig {
    /// Resolve the management API base URL: env STACKSYNC_API_URL > config.
    pub fn api_url(&self) -> Option<String> {
        env_or(
            "STACKSYNC_API_URL",
            self.stack.api_url.as_deref(),
        )
    }

    /// Resolve the stack API key: env STACKSYNC_API_KEY > config.
    pub fn api_key(&self) -> Option<String> {
        env_or("STACKSYNC_API_KEY", self.stack.api_key.as_deref())
    }

    /// Resolve the management token: env STACKSYNC_TOKEN > config.
    pub fn management_token(&self) -> Option<String> {
        env_or(
            "STACKSYNC_TOKEN",
            self.stack.management_token.as_deref(),
        )
    }

    /// Resolve the stack branch: env STACKSYNC_BRANCH > config > "main".
    pub fn branch(&self) -> String {
        env_or("STACKSYNC_BRANCH", self.stack.branch.as_deref())
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string())
    }

    /// Resolve user agent: env STACKSYNC_USER_AGENT > config > default.
    pub fn user_agent(&self) -> String {
        env_or("STACKSYNC_USER_AGENT", self.stack.user_agent.as_deref())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Resolve the schema directory name relative to the project root.
    pub fn schema_dir(&self) -> String {
        self.schema
            .dir
            .clone()
            .unwrap_or_else(|| DEFAULT_SCHEMA_DIR.to_string())
    }

    pub fn deletion_strategy(&self) -> DeletionStrategy {
        self.schema.deletion_strategy.unwrap_or_default()
    }
}

fn env_or(key: &str, fallback: Option<&str>) -> Option<String> {
    if let Ok(value) = env::var(key) {
        let trimmed = value.trim().to_string();
        if !trimmed.is_empty() {
            return Some(trimmed);
        }
    }
    fallback.map(ToString::to_string)
}

/// Load and parse a StackConfig from a TOML file. Returns default if the file
/// doesn't exist.
pub fn load_config(config_path: &Path) -> Result<StackConfig> {
    if !config_path.exists() {
        return Ok(StackConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: StackConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}
