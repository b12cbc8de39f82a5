use std::fmt::Display;

use crate::code::CodeError;

/// A non-fatal finding attached to a [`super::ParsedPage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>, line: u32, column: u32) -> Self {
        Diagnostic {
            message: message.into(),
            line,
            column,
        }
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// A fatal parse failure in a page source.
#[derive(Debug)]
pub enum SourceError {
    /// The code section (or an embedded expression) failed to parse.
    Code(CodeError),
    /// The template, a directive, or the section structure is malformed.
    Syntax(Diagnostic),
}

impl SourceError {
    pub fn syntax(message: impl Into<String>, line: u32) -> Self {
        SourceError::Syntax(Diagnostic::new(message, line, 0))
    }

    pub fn line(&self) -> u32 {
        match self {
            SourceError::Code(e) => e.line,
            SourceError::Syntax(d) => d.line,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            SourceError::Code(e) => &e.message,
            SourceError::Syntax(d) => &d.message,
        }
    }
}

impl From<CodeError> for SourceError {
    fn from(item: CodeError) -> Self {
        SourceError::Code(item)
    }
}

impl Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Code(e) => write!(f, "code syntax error: {e}"),
            SourceError::Syntax(d) => write!(f, "syntax error: {d}"),
        }
    }
}

impl std::error::Error for SourceError {}
