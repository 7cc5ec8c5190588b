//! CLI/REPL driver (SPEC_FULL §10 "CLI", §4.9). Grounded on
//! `passerine`'s `src/main.rs`: `clap` derive for argument parsing,
//! `log`/`simple_logger` for diagnostics, `rustyline` for the
//! interactive line editor, exit codes distinguishing a bad script
//! (65, `EX_DATAERR`) from a runtime failure (70, `EX_SOFTWARE`) the
//! way the book's `cloxMain` does with `sysexits.h`.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use ember::{Config, InterpretOutcome, Vm};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

#[derive(Parser, Debug)]
#[command(name = "ember", about = "A small dynamically-typed, class-based scripting language.")]
struct Args {
    /// Script to run. Omit to start the interactive REPL.
    path: Option<PathBuf>,
}

const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;

fn main() -> ExitCode {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .init()
        .expect("logger installs exactly once at startup");

    let args = Args::parse();
    match args.path {
        Some(path) => run_file(&path),
        None => {
            run_repl();
            ExitCode::SUCCESS
        }
    }
}

/// Reading the script is the one place a genuinely unexpected I/O
/// failure (permissions, a vanished file, bad encoding) can happen, as
/// opposed to the compile/runtime outcomes `Vm::interpret` already
/// models as values; `anyhow` gives that case a one-line `Context`
/// instead of a hand-rolled message.
fn read_script(path: &PathBuf) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("could not read file '{}'", path.display()))
}

fn run_file(path: &PathBuf) -> ExitCode {
    let source = match read_script(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::from(EX_DATAERR);
        }
    };

    let mut vm = Vm::new(Config::default());
    match vm.interpret(&source) {
        InterpretOutcome::Ok => ExitCode::SUCCESS,
        InterpretOutcome::CompileError => ExitCode::from(EX_DATAERR),
        InterpretOutcome::RuntimeError => ExitCode::from(EX_SOFTWARE),
    }
}

/// One VM instance for the whole session, so globals (and, transitively,
/// anything they hold alive) persist across lines (§4.9).
fn run_repl() {
    let mut vm = Vm::new(Config::default());
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("Could not start line editor: {}", e);
            return;
        }
    };

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                vm.interpret(&line);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Readline error: {}", e);
                break;
            }
        }
    }
}
