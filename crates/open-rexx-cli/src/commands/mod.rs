//! Subcommand implementations.

pub mod check;
pub mod run;

use std::path::Path;

use miette::{IntoDiagnostic, Result, WrapErr};

/// Read a script file.
pub fn read_script(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to read script: {}", path.display()))
}
