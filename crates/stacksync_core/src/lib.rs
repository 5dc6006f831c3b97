pub mod api;
pub mod canonical;
pub mod config;
pub mod entries;
pub mod filesystem;
pub mod labels;
pub mod plan;
pub mod process;
pub mod pull;
pub mod push;
pub mod resources;
pub mod runtime;
