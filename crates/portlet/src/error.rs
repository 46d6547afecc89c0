//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use portlet_config::ConfigError;
use portlet_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONFIG: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Resources ────────────────────────────────────────────────────

    #[error("{resource_type} '{identifier}' not found")]
    #[diagnostic(
        code(portlet::not_found),
        help("Run: portlet {list_command} to see available {resource_type}s")
    )]
    NotFound {
        resource_type: String,
        identifier: String,
        list_command: String,
    },

    #[error("{resource_type} '{identifier}' already exists")]
    #[diagnostic(code(portlet::conflict))]
    Conflict {
        resource_type: String,
        identifier: String,
    },

    // ── Probing ──────────────────────────────────────────────────────

    #[error("Service '{id}' is not reachable: {reason}")]
    #[diagnostic(
        code(portlet::unreachable),
        help("Check that the tunnel for this service is up and its target is correct.")
    )]
    Unreachable { id: String, reason: String },

    // ── Session ──────────────────────────────────────────────────────

    #[error("The service manager has shut down")]
    #[diagnostic(code(portlet::shut_down))]
    ShutDown,

    // ── Validation ───────────────────────────────────────────────────

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(portlet::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────

    #[error("No services configured")]
    #[diagnostic(
        code(portlet::no_config),
        help(
            "Create a starter config with: portlet config init\n\
             Expected at: {path}"
        )
    )]
    NoServices { path: String },

    #[error(transparent)]
    #[diagnostic(
        code(portlet::config),
        help("Check the config file, or print its location with: portlet config path")
    )]
    Config(#[from] ConfigError),

    // ── IO / Serialization ────────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to render config: {0}")]
    #[diagnostic(code(portlet::serialize))]
    Serialize(#[from] toml::ser::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::Validation { .. } => exit_code::USAGE,
            Self::NoServices { .. } | Self::Config(_) => exit_code::CONFIG,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ServiceNotFound { id } => CliError::NotFound {
                resource_type: "service".into(),
                identifier: id.to_string(),
                list_command: "list".into(),
            },

            CoreError::GroupNotFound { id } => CliError::NotFound {
                resource_type: "group".into(),
                identifier: id.to_string(),
                list_command: "list".into(),
            },

            CoreError::DuplicateService { id } => CliError::Conflict {
                resource_type: "service".into(),
                identifier: id.to_string(),
            },

            CoreError::DuplicateGroup { id } => CliError::Conflict {
                resource_type: "group".into(),
                identifier: id.to_string(),
            },

            CoreError::ManagerShutDown => CliError::ShutDown,
        }
    }
}
