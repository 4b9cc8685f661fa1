//! lily — command-line front end for the Lily runtime core.
//!
//! Lexing, parsing, and bytecode emission are out of scope for this
//! workspace (spec's Non-goals), so there is no real front end behind this
//! binary: every mode below ultimately hands the placeholder assembler in
//! `asm` a block of `.lilyasm`-shaped text and runs whatever `FunctionObj`
//! comes out. A `.lily` file is expected to already hold that text; this is
//! a deliberate, documented stand-in for "load a compiled program", not an
//! attempt to read real Lily source.
//!
//! Usage:
//!   lily program.lily     # assemble and run a file
//!   lily -s "<asm text>"  # assemble and run an inline snippet
//!   lily                  # REPL: paste an assembly block, blank line runs it

mod asm;

use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use lily_core::value::Value;
use lily_runtime::{Config, State};

#[derive(Parser)]
#[command(name = "lily")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Lily runtime core CLI",
    long_about = "Assembles and runs .lily/.lilyasm programs against the Lily runtime core. \
                   With no file and no -s, starts a REPL."
)]
struct Args {
    /// Program file to assemble and run (must end in .lily or .lilyasm)
    file: Option<PathBuf>,

    /// Assemble and run this text directly instead of reading a file
    #[arg(short = 's', long = "eval", value_name = "SOURCE")]
    eval: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("{0}: expected a .lily or .lilyasm file")]
    BadExtension(PathBuf),
    #[error("assembling {0}: {1}")]
    Asm(String, asm::AsmError),
    #[error("{0}")]
    Raised(String),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("lily=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let result = match (args.eval, args.file) {
        (Some(source), _) => run_source(&source, "<eval>"),
        (None, Some(path)) => run_file(&path),
        (None, None) => run_repl(),
    };

    if let Err(e) = result {
        eprintln!("lily: {e}");
        process::exit(1);
    }
}

fn run_file(path: &Path) -> Result<(), CliError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("lily") | Some("lilyasm") => {}
        _ => return Err(CliError::BadExtension(path.to_path_buf())),
    }
    tracing::info!(file = %path.display(), "assembling and running");
    let source = std::fs::read_to_string(path).map_err(|e| CliError::Io(path.to_path_buf(), e))?;
    run_source(&source, &path.display().to_string())
}

fn run_source(source: &str, label: &str) -> Result<(), CliError> {
    let function = asm::assemble(source).map_err(|e| CliError::Asm(label.to_string(), e))?;

    tracing::debug!(%label, "running assembled function");
    let mut state = State::new(Config::default());
    match state.call(&Value::Function(function), &[]) {
        Ok(value) => {
            println!("{value:?}");
            Ok(())
        }
        Err(e) => Err(CliError::Raised(e.format_with_trace())),
    }
}

/// A REPL for pasting a `.function ...` block at a time: lines accumulate
/// until a blank line, at which point the buffer is assembled and run as
/// one function. `exit`/`quit` on a line by itself ends the session. There
/// is no statement-level evaluation here — this runtime core has no
/// lexer/parser to give one a notion of "one Lily expression" in the first
/// place.
fn run_repl() -> Result<(), CliError> {
    let mut editor = DefaultEditor::new().expect("failed to initialize line editor");
    let mut buffer = String::new();

    println!("lily {} — paste a \".function ...\" block, blank line to run, \"exit\" to quit", env!("CARGO_PKG_VERSION"));

    loop {
        let prompt = if buffer.is_empty() { "lily> " } else { "...> " };
        match editor.readline(prompt) {
            Ok(line) => {
                let trimmed = line.trim();
                if buffer.is_empty() && (trimmed == "exit" || trimmed == "quit") {
                    break;
                }
                let _ = editor.add_history_entry(&line);
                if trimmed.is_empty() {
                    if !buffer.is_empty() {
                        if let Err(e) = run_source(&buffer, "<repl>") {
                            eprintln!("lily: {e}");
                        }
                        buffer.clear();
                    }
                } else {
                    buffer.push_str(&line);
                    buffer.push('\n');
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("lily: readline error: {e}");
                break;
            }
        }
    }
    Ok(())
}
