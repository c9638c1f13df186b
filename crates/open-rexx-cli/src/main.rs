//! open-rexx CLI: run and syntax-check REXX-family scripts.
//!
//! `open-rexx run script.rexx -- args...` executes a script with a built-in
//! `echo` ADDRESS target. `open-rexx check script.rexx` only parses it.
//! The process exits with the script's `EXIT` value, or 1 on an uncaught
//! error.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

/// open-rexx CLI.
#[derive(Parser)]
#[command(name = "open-rexx", version, about = "REXX-family script interpreter")]
struct Cli {
    /// Log interpreter events (CALL, ADDRESS dispatch) to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script.
    Run(RunArgs),
    /// Parse a script and report syntax errors without running it.
    Check {
        /// Script file.
        script: PathBuf,
    },
}

#[derive(Parser)]
struct RunArgs {
    /// Script file.
    script: PathBuf,

    /// Print a `>> line statement` trace to stderr.
    #[arg(long)]
    trace: bool,

    /// Treat reads of unset variables as errors.
    #[arg(long)]
    strict: bool,

    /// Interpreter configuration file (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Arguments passed to the script (after `--`).
    #[arg(last = true)]
    args: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    // Enabled by --verbose or RUST_LOG.
    if cli.verbose || std::env::var("RUST_LOG").is_ok() {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("debug")
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let result = match cli.command {
        Commands::Run(args) => commands::run::run(
            args.script,
            args.config,
            args.trace,
            args.strict,
            args.args,
        ),
        Commands::Check { script } => commands::check::run(script).map(|()| 0),
    };

    match result {
        Ok(rc) => std::process::exit(rc),
        Err(report) => {
            eprintln!("{report:?}");
            std::process::exit(1);
        }
    }
}
