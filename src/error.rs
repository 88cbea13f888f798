//! Backend errors and their user-facing diagnostics
//!
//! Every failure aborts the whole compilation unit. [`CodegenError`] is what
//! the library returns; [`Diagnostic`] is what the CLI prints or serializes.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ast::Span;

/// Fatal backend error
#[derive(Error, Debug)]
pub enum CodegenError {
    #[error("encoding error: {message}")]
    Encoding { message: String },

    #[error("label '{name}' is defined more than once")]
    DuplicateLabel { name: String },

    #[error("label '{name}' referenced at offset {patch_offset:#x} is never defined")]
    UnresolvedLabel { name: String, patch_offset: usize },

    #[error("unsupported construct: {message}")]
    UnsupportedConstruct { message: String, span: Option<Span> },

    #[error("use of undeclared variable '{name}'")]
    UndefinedVariable { name: String, span: Option<Span> },

    #[error("no entry point: {message}")]
    MissingEntryPoint { message: String },

    #[error("stack frame of '{function}' needs {size} bytes, limit is {limit}")]
    FrameOverflow {
        function: String,
        size: u64,
        limit: u32,
    },

    #[error("failed to write executable image: {0}")]
    ImageWrite(#[from] io::Error),
}

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, CodegenError>;

impl CodegenError {
    pub fn unsupported(message: impl Into<String>, span: Option<Span>) -> Self {
        CodegenError::UnsupportedConstruct {
            message: message.into(),
            span,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            CodegenError::Encoding { .. } => ErrorCode::E300,
            CodegenError::DuplicateLabel { .. } => ErrorCode::E301,
            CodegenError::UnresolvedLabel { .. } => ErrorCode::E302,
            CodegenError::UnsupportedConstruct { .. } => ErrorCode::E303,
            CodegenError::UndefinedVariable { .. } => ErrorCode::E304,
            CodegenError::FrameOverflow { .. } => ErrorCode::E305,
            CodegenError::MissingEntryPoint { .. } => ErrorCode::E400,
            CodegenError::ImageWrite(_) => ErrorCode::E401,
        }
    }

    /// Source position, for errors tied to an AST node
    pub fn span(&self) -> Option<Span> {
        match self {
            CodegenError::UnsupportedConstruct { span, .. }
            | CodegenError::UndefinedVariable { span, .. } => *span,
            _ => None,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let mut diag = Diagnostic::new(self.code(), self.to_string());
        if let Some(span) = self.span() {
            diag = diag.with_span(span);
        }
        match self {
            CodegenError::UndefinedVariable { name, .. } => diag
                .with_suggestion(format!("declare it first: `int {} = 0;`", name))
                .with_note("undeclared identifiers are rejected because strict locals are on"),
            CodegenError::MissingEntryPoint { .. } => {
                diag.with_suggestion("define `int main() { ... }`")
            }
            CodegenError::FrameOverflow { limit, .. } => {
                diag.with_note(format!("the per-function frame limit is {} bytes", limit))
            }
            _ => diag,
        }
    }
}

impl From<CodegenError> for Diagnostic {
    fn from(err: CodegenError) -> Self {
        err.to_diagnostic()
    }
}

/// Stable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Codegen errors (E300-E399)
    E300, // Encoding contract violated
    E301, // Duplicate label
    E302, // Unresolved label
    E303, // Unsupported construct
    E304, // Undeclared variable
    E305, // Frame overflow

    // Image errors (E400-E499)
    E400, // No entry point
    E401, // Image write failed
}

impl ErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorCode::E300 => "E300",
            ErrorCode::E301 => "E301",
            ErrorCode::E302 => "E302",
            ErrorCode::E303 => "E303",
            ErrorCode::E304 => "E304",
            ErrorCode::E305 => "E305",
            ErrorCode::E400 => "E400",
            ErrorCode::E401 => "E401",
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            ErrorCode::E300
            | ErrorCode::E301
            | ErrorCode::E302
            | ErrorCode::E303
            | ErrorCode::E304
            | ErrorCode::E305 => "codegen error",
            ErrorCode::E400 | ErrorCode::E401 => "image error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A reportable error with optional source context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: ErrorCode,
    pub message: String,
    pub span: Option<Span>,
    pub suggestion: Option<String>,
    pub notes: Vec<String>,
}

impl Diagnostic {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            span: None,
            suggestion: None,
            notes: Vec::new(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Render with the offending source line and a caret under the column
    pub fn format_with_source(&self, source: &str) -> String {
        let mut output = format!("error[{}]: {}\n", self.code, self.message);

        if let Some(span) = &self.span {
            let lines: Vec<&str> = source.lines().collect();
            if span.line > 0 && span.line <= lines.len() {
                let line_content = lines[span.line - 1];
                let gutter = span.line.to_string().len();

                output.push_str(&format!("{:>gutter$} |\n", ""));
                output.push_str(&format!("{:>gutter$} | {}\n", span.line, line_content));
                output.push_str(&format!(
                    "{:>gutter$} | {:>start$}^\n",
                    "",
                    "",
                    start = span.column.saturating_sub(1),
                ));
            }
        }

        if let Some(suggestion) = &self.suggestion {
            output.push_str(&format!("  = help: {}\n", suggestion));
        }
        for note in &self.notes {
            output.push_str(&format!("  = note: {}\n", note));
        }
        output
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"message\":{:?}}}", self.message))
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error[{}]", self.code)?;
        if let Some(span) = &self.span {
            write!(f, " at {}:{}", span.line, span.column)?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (help: {})", suggestion)?;
        }
        Ok(())
    }
}
