// File: src/errors.rs
//
// Error handling and reporting for the Lox interpreter.
// Compile diagnostics carry source line information; runtime errors
// carry a synthetic stack trace. Both render as pretty-printed messages.

use colored::Colorize;
use std::fmt;

/// Where a compile diagnostic points in the token stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorAt {
    /// At a concrete token, quoted in the message.
    Token(String),
    /// At end of input.
    End,
    /// No token to point at (scanner errors).
    Bare,
}

/// A single compile-time diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: usize,
    pub at: ErrorAt,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let line = format!("[line {}]", self.line);
        write!(f, "{} {}", line.bright_blue(), "Error".red().bold())?;
        match &self.at {
            ErrorAt::Token(lexeme) => write!(f, " at '{}'", lexeme)?,
            ErrorAt::End => write!(f, " at end")?,
            ErrorAt::Bare => {}
        }
        write!(f, ": {}", self.message.bold())
    }
}

/// One frame of a runtime stack trace, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub line: usize,
    /// `None` for the top-level script.
    pub function: Option<String>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let line = format!("[line {}]", self.line);
        match &self.function {
            Some(name) => write!(f, "{} in {}()", line.bright_blue(), name),
            None => write!(f, "{} in script", line.bright_blue()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}: {}", "Runtime Error".red().bold(), self.message.bold())?;
        for frame in &self.trace {
            writeln!(f, "{}", frame)?;
        }
        Ok(())
    }
}

/// Interpretation failure: either the source did not compile, or the
/// program failed while running. The two map to exit codes 65 and 70.
#[derive(Debug, Clone)]
pub enum LoxError {
    Compile(Vec<Diagnostic>),
    Runtime(RuntimeError),
}

impl LoxError {
    pub fn exit_code(&self) -> i32 {
        match self {
            LoxError::Compile(_) => 65,
            LoxError::Runtime(_) => 70,
        }
    }
}

impl fmt::Display for LoxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoxError::Compile(diagnostics) => {
                for diagnostic in diagnostics {
                    writeln!(f, "{}", diagnostic)?;
                }
                Ok(())
            }
            LoxError::Runtime(error) => write!(f, "{}", error),
        }
    }
}

impl std::error::Error for LoxError {}
