//! Run command implementation.

use std::path::PathBuf;

use miette::{IntoDiagnostic, Result};

use open_rexx::{
    AddressRequest, AddressTarget, HandlerError, Interpreter, InterpreterConfig, Response, Value,
};

use super::read_script;

/// Run a script and return the process exit code.
pub fn run(
    script: PathBuf,
    config_path: Option<PathBuf>,
    trace: bool,
    strict: bool,
    args: Vec<String>,
) -> Result<i32> {
    let source = read_script(&script)?;

    let mut config = match &config_path {
        Some(path) => InterpreterConfig::from_file(path)?,
        None => InterpreterConfig::default(),
    };
    config.echo = true;
    config.trace |= trace;
    config.strict_variables |= strict;

    let mut interp = Interpreter::with_config(config);
    interp.set_script_name(script.display().to_string());
    interp.set_args(args.into_iter().map(Value::String).collect());
    interp.register_target(echo_target());

    tracing::info!("Running {}", script.display());
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .into_diagnostic()?;
    let result = runtime.block_on(interp.run_source(&source))?;

    tracing::debug!(rc = result.rc, "script finished");
    Ok(i32::try_from(result.rc).unwrap_or(i32::MAX))
}

/// `ADDRESS echo`: prints the command text and returns it as `RESULT`.
fn echo_target() -> AddressTarget {
    AddressTarget::new("echo", |request: AddressRequest| async move {
        println!("{}", request.message);
        Ok::<_, HandlerError>(Response::success(request.message))
    })
    .with_metadata("description", "prints the command text")
}
