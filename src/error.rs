use std::path::PathBuf;
use thiserror::Error;

/// Typed failures raised by rustsible-local itself.
///
/// Everything else (I/O, YAML, template rendering) travels as `anyhow::Error`
/// with context attached at the boundary where it happened.
#[derive(Error, Debug)]
pub enum Error {
    #[error("either a list of host groups, plays or roles is required (use --hosts, --plays or --roles)")]
    NoSelection,

    #[error("invalid {flag} parameter: empty entry in '{value}'")]
    EmptyListEntry { flag: String, value: String },

    #[error("failed to decode --extra-vars as JSON: {0}")]
    ExtraVarsJson(#[from] serde_json::Error),

    #[error("--extra-vars must be a JSON object, got: {0}")]
    ExtraVarsNotObject(String),

    #[error("playbook path not valid: [{}]", .0.display())]
    PlaybookNotFound(PathBuf),

    #[error("invalid group name '{0}'")]
    InvalidGroupName(String),

    #[error("role '{name}' not found under {}", .search_path.display())]
    RoleNotFound { name: String, search_path: PathBuf },

    #[error("module '{0}' not found")]
    ModuleNotFound(String),

    #[error("module '{module}' returned invalid output: {message}")]
    ModuleOutput { module: String, message: String },
}
