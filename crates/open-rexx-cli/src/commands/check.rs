//! Check command implementation: parse only.

use std::path::PathBuf;

use miette::Result;

use super::read_script;

/// Parse the script and print a one-line summary.
pub fn run(script: PathBuf) -> Result<()> {
    let source = read_script(&script)?;
    tracing::info!("Checking {}", script.display());

    let program = open_rexx::parse(&source)?;
    println!(
        "✓ {}: {} commands, {} labels",
        script.display(),
        program.commands.len(),
        program.labels.len()
    );
    Ok(())
}
