//! Crux CLI.
//!
//! `crux` with no script starts the interactive REPL; `crux <script> [args…]`
//! runs the file once. Exit codes follow the sysexits convention: 65 for a
//! compile error, 70 for a runtime error, 74 for an unreadable script, 64
//! for bad usage.

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use crux_runtime::{InterpretError, Vm};
use tracing_subscriber::EnvFilter;

mod repl;

const EX_USAGE: i32 = 64;
const EX_DATAERR: i32 = 65;
const EX_SOFTWARE: i32 = 70;
const EX_IOERR: i32 = 74;

#[derive(Parser)]
#[command(name = "crux")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "The Crux programming language", long_about = None)]
struct Cli {
    /// Script to run; omit for an interactive session.
    script: Option<PathBuf>,

    /// Arguments passed through to the script.
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            process::exit(EX_USAGE);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("CRUX_LOG"))
        .with_writer(std::io::stderr)
        .init();

    match cli.script {
        Some(script) => run_file(&script, cli.args),
        None => repl::run(),
    }
}

fn run_file(script: &PathBuf, extra_args: Vec<String>) {
    let source = match fs::read_to_string(script) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Could not open file \"{}\": {}.", script.display(), e);
            process::exit(EX_IOERR);
        }
    };

    let mut args = vec![script.display().to_string()];
    args.extend(extra_args);

    let mut vm = Vm::new(args);
    match vm.interpret(&source) {
        Ok(()) => {}
        Err(InterpretError::Compile) => process::exit(EX_DATAERR),
        Err(InterpretError::Runtime) => process::exit(EX_SOFTWARE),
    }
}
