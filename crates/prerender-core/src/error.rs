//! Error types for prerender-core
//!
//! Lifecycle failures are not errors: they are [`FinalStatus`] values on a
//! host, and admission refusals are [`RejectReason`]s. This module covers the
//! ambient failures around the engine (configuration, I/O, logging setup).
//!
//! [`FinalStatus`]: crate::status::FinalStatus
//! [`RejectReason`]: crate::status::RejectReason

use std::fmt::Write;
use thiserror::Error;

use crate::logging::LogError;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for prerender-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML deserialization errors (scenarios, config fragments)
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Logging setup errors
    #[error("Logging error: {0}")]
    Logging(#[from] LogError),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Show effective config", "prerender config")
                    .alternative("Verify the file exists and is readable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Validate JSON", "python -m json.tool < input.json")
                    .alternative("Check for trailing commas or invalid UTF-8."),
            ),
            Self::Toml(_) => Some(
                Remediation::new("Fix the TOML syntax and retry.")
                    .command("Show a valid config", "prerender config")
                    .alternative("Check for unquoted strings and unknown step names."),
            ),
            Self::Logging(LogError::AlreadyInitialized) => None,
            Self::Logging(_) => Some(
                Remediation::new("Fix the logging configuration and retry.")
                    .command("Use defaults", "prerender --log-level info config")
                    .alternative("Unset RUST_LOG if it contains an invalid directive."),
            ),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path or unset PRERENDER_CONFIG."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => {
                Remediation::new("Config parse failed. Fix the syntax and retry.")
                    .command("Show defaults", "prerender config")
                    .alternative("Compare your file against the default configuration.")
            }
            Self::SerializeFailed(_) => {
                Remediation::new("Failed to serialize configuration. Check config values.")
                    .command("Show defaults", "prerender config")
                    .alternative("Recreate the config from known-good defaults.")
            }
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Show defaults", "prerender config")
                    .alternative("memory.budget_percent must be in (0, 100].")
            }
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
