//! Interpreter configuration: tracing, strictness, call depth, placeholder
//! handling and ADDRESS defaults.
//!
//! Every field has a default, so an empty TOML file is a valid
//! configuration:
//!
//! ```toml
//! trace = true
//! max_call_depth = 64
//!
//! [interpolation]
//! missing_marker = "<unset>"
//!
//! [address]
//! default_target = "echo"
//! failure_policy = "abort"
//! ```

use std::path::{Path, PathBuf};

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::interpolate::InterpolationOptions;

/// Errors loading a configuration file.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("cannot read config file {}", path.display())]
    #[diagnostic(code(rexx::config::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    #[diagnostic(code(rexx::config::parse))]
    Parse(#[from] toml::de::Error),
}

/// Top-level interpreter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpreterConfig {
    /// Record a `>> line statement` trace line per executed statement.
    #[serde(default)]
    pub trace: bool,
    /// Print SAY output and trace lines as they happen, in addition to
    /// collecting them.
    #[serde(default)]
    pub echo: bool,
    /// Reading an unset variable is an error instead of yielding its name.
    #[serde(default)]
    pub strict_variables: bool,
    /// Maximum CALL nesting.
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
    /// Placeholder handling.
    #[serde(default)]
    pub interpolation: InterpolationConfig,
    /// ADDRESS dispatch settings.
    #[serde(default)]
    pub address: AddressConfig,
}

/// Unresolved placeholder handling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpolationConfig {
    /// Fail with `UnresolvedPlaceholder` instead of leaving text verbatim.
    #[serde(default)]
    pub strict: bool,
    /// Text substituted for unresolved placeholders.
    #[serde(default)]
    pub missing_marker: Option<String>,
}

/// ADDRESS dispatch configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressConfig {
    /// Target used when no `ADDRESS` instruction has selected one.
    #[serde(default)]
    pub default_target: Option<String>,
    /// What a `success: false` response does.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

/// Reaction to a failed ADDRESS response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Set `RC`/`ERRORTEXT` and continue.
    #[default]
    Report,
    /// Stop the script with an `AddressFailure` error.
    Abort,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            trace: false,
            echo: false,
            strict_variables: false,
            max_call_depth: default_max_call_depth(),
            interpolation: InterpolationConfig::default(),
            address: AddressConfig::default(),
        }
    }
}

impl InterpreterConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub(crate) fn interpolation_options(&self) -> InterpolationOptions {
        InterpolationOptions {
            strict: self.interpolation.strict,
            missing_marker: self.interpolation.missing_marker.clone(),
        }
    }
}

fn default_max_call_depth() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = InterpreterConfig::default();
        assert!(!config.trace);
        assert_eq!(config.max_call_depth, 256);
        assert_eq!(config.address.failure_policy, FailurePolicy::Report);
        assert_eq!(config.address.default_target, None);
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = InterpreterConfig::from_toml("").unwrap();
        assert_eq!(config, InterpreterConfig::default());
    }

    #[test]
    fn test_config_from_toml() {
        let config = InterpreterConfig::from_toml(
            r#"
            trace = true
            strict_variables = true
            max_call_depth = 8

            [interpolation]
            strict = true
            missing_marker = "?"

            [address]
            default_target = "echo"
            failure_policy = "abort"
            "#,
        )
        .unwrap();
        assert!(config.trace);
        assert!(config.strict_variables);
        assert_eq!(config.max_call_depth, 8);
        assert!(config.interpolation.strict);
        assert_eq!(config.interpolation.missing_marker.as_deref(), Some("?"));
        assert_eq!(config.address.default_target.as_deref(), Some("echo"));
        assert_eq!(config.address.failure_policy, FailurePolicy::Abort);
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let err = InterpreterConfig::from_toml("[address]\nfailure_policy = \"explode\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "echo = true").unwrap();
        let config = InterpreterConfig::from_file(file.path()).unwrap();
        assert!(config.echo);
    }

    #[test]
    fn test_missing_file() {
        let err = InterpreterConfig::from_file("/nonexistent/open-rexx.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
