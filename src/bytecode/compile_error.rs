use thiserror::Error;

use crate::bytecode::buffer::BytecodeError;
use crate::bytecode::link::LinkError;
use crate::token::Token;

/// A positioned compile error.
///
/// `line` and `col` are 1-based; `len` is the width of the offending token and
/// controls the caret underline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
    pub line: usize,
    pub col: usize,
    pub len: usize,
    pub source_line: String,
}

impl Diagnostic {
    pub fn at(token: &Token, source_line: String, message: impl Into<String>) -> Self {
        Diagnostic {
            message: message.into(),
            line: token.line,
            col: token.col,
            len: token.len.max(1),
            source_line,
        }
    }

    fn underline(&self) -> String {
        let start = self.col.saturating_sub(1);
        let end = start + self.len;
        let width = self.source_line.chars().count().max(end);

        (0..width)
            .map(|i| {
                if i < start {
                    ' '
                } else if i < end {
                    '^'
                } else {
                    '~'
                }
            })
            .collect()
    }
}

impl std::fmt::Display for Diagnostic {
    /// Formats as the positioned header, the source line and a caret
    /// underline of the offending token.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "[error on line {}:{}] {}", self.line, self.col, self.message)?;
        writeln!(f, "\t|")?;
        writeln!(f, " {}\t| {}", self.line, self.source_line)?;
        write!(f, "\t| {}", self.underline())
    }
}

#[derive(Debug, Clone, Error)]
pub enum CompileError {
    /// Scanner, syntax and semantic errors; nothing was linked.
    #[error("{}", render_all(.0))]
    Diagnostics(Vec<Diagnostic>),

    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// Internal compiler error (shouldn't happen in normal use)
    #[error("internal compiler error: {0}")]
    Internal(#[from] BytecodeError),
}

impl CompileError {
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            CompileError::Diagnostics(d) => d,
            _ => &[],
        }
    }
}

fn render_all(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{Literal, TokenKind};

    fn token(col: usize, len: usize) -> Token {
        Token {
            kind: TokenKind::Identifier,
            lexeme: "y".repeat(len),
            literal: Literal::None,
            start: col - 1,
            len,
            line: 3,
            col,
            line_start: 0,
        }
    }

    #[test]
    fn test_diagnostic_format() {
        let d = Diagnostic::at(&token(5, 1), "x = y + 1".to_string(), "undeclared variable y");

        assert_eq!(
            d.to_string(),
            "[error on line 3:5] undeclared variable y\n\t|\n 3\t| x = y + 1\n\t|     ^~~~~"
        );
    }

    #[test]
    fn test_underline_spans_token_length() {
        let d = Diagnostic::at(&token(1, 3), "abc = 1".to_string(), "oops");
        assert!(d.to_string().ends_with("\t| ^^^~~~~"));
    }

    #[test]
    fn test_underline_past_end_of_line() {
        let d = Diagnostic::at(&token(4, 1), "abc".to_string(), "expected ')'");
        assert!(d.to_string().ends_with("\t|    ^"));
    }

    #[test]
    fn test_diagnostics_error_renders_each() {
        let err = CompileError::Diagnostics(vec![
            Diagnostic::at(&token(1, 1), "a".to_string(), "first"),
            Diagnostic::at(&token(1, 1), "b".to_string(), "second"),
        ]);

        let msg = err.to_string();
        assert!(msg.contains("first"));
        assert!(msg.contains("second"));
        assert_eq!(err.diagnostics().len(), 2);
    }

    #[test]
    fn test_error_implements_std_error() {
        let err = CompileError::Link(LinkError::UnresolvedCall {
            name: "f".to_string(),
        });
        let _: &dyn std::error::Error = &err;
        assert!(err.to_string().contains("link error"));
    }
}
