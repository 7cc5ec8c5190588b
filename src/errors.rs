//! Typed compile-time and runtime error values (§7), grounded on the
//! teacher's `Syntax` error type (`passerine/src/compiler/syntax.rs`):
//! a reason plus enough location data to render on `Display`, simplified
//! here to the line-granularity diagnostics §7 actually asks for (no
//! multi-span notes are needed for this language's error messages).

use std::fmt;

/// One compile-time diagnostic (§7 "Compile" format):
/// `[line N] Error[ at 'lexeme'|at end]: message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub line: u32,
    /// `None` for an error raised without a specific offending token
    /// (e.g. a semantic error discovered after the token was consumed),
    /// `Some("")` for an end-of-file error, `Some(lexeme)` otherwise.
    pub at: Option<String>,
    pub message: String,
}

impl CompileError {
    pub fn new(line: u32, at: Option<String>, message: impl Into<String>) -> CompileError {
        CompileError {
            line,
            at,
            message: message.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.at {
            None => {}
            Some(lexeme) if lexeme.is_empty() => write!(f, " at end")?,
            Some(lexeme) => write!(f, " at '{}'", lexeme)?,
        }
        write!(f, ": {}", self.message)
    }
}

/// One frame of a runtime stack trace (§7 "Runtime" format), innermost
/// frame first: `[line N] in <fn NAME>` or `[line N] in script`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub line: u32,
    pub name: Option<String>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "[line {}] in {}", self.line, name),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// A runtime error (§7), carrying the message and the full call-frame
/// trace captured at the point of failure, innermost-first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, trace: Vec<TraceFrame>) -> RuntimeError {
        RuntimeError {
            message: message.into(),
            trace,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for (i, frame) in self.trace.iter().enumerate() {
            if i + 1 == self.trace.len() {
                write!(f, "{}", frame)?;
            } else {
                writeln!(f, "{}", frame)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_formats_at_lexeme() {
        let e = CompileError::new(3, Some("+".to_string()), "Expect expression.");
        assert_eq!(format!("{}", e), "[line 3] Error at '+': Expect expression.");
    }

    #[test]
    fn compile_error_formats_at_end() {
        let e = CompileError::new(7, Some(String::new()), "Expect ';' after value.");
        assert_eq!(format!("{}", e), "[line 7] Error at end: Expect ';' after value.");
    }

    #[test]
    fn runtime_error_formats_trace_innermost_first() {
        let e = RuntimeError::new(
            "Undefined variable 'x'.",
            vec![
                TraceFrame { line: 4, name: Some("fib".to_string()) },
                TraceFrame { line: 9, name: None },
            ],
        );
        let rendered = format!("{}", e);
        assert_eq!(
            rendered,
            "Undefined variable 'x'.\n[line 4] in fib\n[line 9] in script"
        );
    }
}
