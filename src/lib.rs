//! A clox-style bytecode language: scanner, single-pass compiler,
//! stack-based VM, and tracing garbage collector (see DESIGN.md for how
//! each part is grounded). `main.rs` is a thin CLI/REPL shell around
//! this library; [`run_source`] is the one entry point it needs.

pub mod chunk;
pub mod compiler;
pub mod config;
pub mod errors;
pub mod handle;
pub mod heap;
pub mod natives;
pub mod object;
pub mod table;
pub mod scanner;
pub mod value;
pub mod vm;

pub use config::Config;
pub use vm::{InterpretOutcome, Vm};

/// Runs one source string against a fresh VM, for callers (tests,
/// one-shot file execution) that don't need to share state across
/// multiple calls. The REPL instead keeps its own long-lived [`Vm`]
/// (globals must persist between lines) and calls `Vm::interpret`
/// directly.
pub fn run_source(source: &str, config: Config) -> InterpretOutcome {
    let mut vm = Vm::new(config);
    vm.interpret(source)
}
