//! Error taxonomy for declarations, marshaling and native calls
//!
//! Every failure is synchronous and reported at the declare/call boundary.
//! `ErrorKind` says what went wrong; `FfiError` adds the context lines
//! (function, declaration, parameter) accumulated on the way out.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("conflicting declaration of '{name}'")]
    DeclarationConflict { name: String },

    #[error("invalid declaration of '{name}': {reason}")]
    InvalidDeclaration { name: String, reason: String },

    #[error("incomplete type '{ty}'")]
    IncompleteType { ty: String },

    #[error("type '{ty}' has no native representation{}", context_suffix(.context))]
    UnsupportedType { ty: String, context: Option<String> },

    #[error("wrong number of arguments: expected {}{expected}, got {found}", at_least(*.variadic))]
    ArgumentCountMismatch {
        expected: usize,
        found: usize,
        variadic: bool,
    },

    #[error("{}cannot convert '{found}' to '{expected}'", position_prefix(*.index))]
    ArgumentTypeMismatch {
        index: Option<usize>,
        expected: String,
        found: String,
    },

    #[error("{}value {value} out of range for '{target}'", position_prefix(*.index))]
    ConversionRange {
        index: Option<usize>,
        value: String,
        target: String,
    },

    #[error("undefined symbol: {name}")]
    SymbolNotFound { name: String },

    #[error("missing declaration for '{name}'")]
    UnknownName { name: String },

    #[error("unexpected failure preparing call to '{function}': {reason}")]
    CallPreparation { function: String, reason: String },

    #[error("callback has been released")]
    ClosureReleased,

    #[error("callback failed: {message}")]
    CallbackFailed { message: String },

    #[error("failed to load library '{name}': {reason}")]
    LibraryLoad { name: String, reason: String },

    #[error("invalid configuration: {message}")]
    Config { message: String },
}

fn position_prefix(index: Option<usize>) -> String {
    match index {
        Some(i) => format!("bad argument #{}: ", i + 1),
        None => String::new(),
    }
}

fn at_least(variadic: bool) -> &'static str {
    if variadic {
        "at least "
    } else {
        ""
    }
}

fn context_suffix(context: &Option<String>) -> String {
    match context {
        Some(c) => format!(" ({})", c),
        None => String::new(),
    }
}

#[derive(Debug, Clone)]
pub struct FfiError {
    pub kind: ErrorKind,
    pub context: Vec<String>,
}

impl FfiError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: Vec::new(),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context.push(context.into());
        self
    }

    pub fn conflict(name: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeclarationConflict { name: name.into() })
    }

    pub fn invalid_declaration(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidDeclaration {
            name: name.into(),
            reason: reason.into(),
        })
    }

    pub fn incomplete(ty: impl fmt::Display) -> Self {
        Self::new(ErrorKind::IncompleteType { ty: ty.to_string() })
    }

    pub fn unsupported(ty: impl fmt::Display) -> Self {
        Self::new(ErrorKind::UnsupportedType {
            ty: ty.to_string(),
            context: None,
        })
    }

    pub fn unsupported_in(ty: impl fmt::Display, context: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedType {
            ty: ty.to_string(),
            context: Some(context.into()),
        })
    }

    pub fn mismatch(expected: impl fmt::Display, found: impl Into<String>) -> Self {
        Self::new(ErrorKind::ArgumentTypeMismatch {
            index: None,
            expected: expected.to_string(),
            found: found.into(),
        })
    }

    pub fn range(value: impl fmt::Display, target: impl fmt::Display) -> Self {
        Self::new(ErrorKind::ConversionRange {
            index: None,
            value: value.to_string(),
            target: target.to_string(),
        })
    }

    pub fn unknown(name: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnknownName { name: name.into() })
    }

    /// Attach a parameter position to conversion errors raised while
    /// marshaling one argument. Other kinds pass through untouched.
    pub fn at_argument(mut self, position: usize) -> Self {
        match &mut self.kind {
            ErrorKind::ArgumentTypeMismatch { index, .. }
            | ErrorKind::ConversionRange { index, .. } => {
                if index.is_none() {
                    *index = Some(position);
                }
            }
            _ => {}
        }
        self
    }

    pub fn argument_index(&self) -> Option<usize> {
        match &self.kind {
            ErrorKind::ArgumentTypeMismatch { index, .. }
            | ErrorKind::ConversionRange { index, .. } => *index,
            _ => None,
        }
    }
}

impl From<ErrorKind> for FfiError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for FfiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for line in &self.context {
            write!(f, "\n  in {}", line)?;
        }
        Ok(())
    }
}

impl std::error::Error for FfiError {}

pub type Result<T> = std::result::Result<T, FfiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_position_is_one_based_in_message() {
        let err = FfiError::mismatch("int", "string").at_argument(1);
        assert_eq!(err.argument_index(), Some(1));
        assert_eq!(
            err.to_string(),
            "bad argument #2: cannot convert 'string' to 'int'"
        );
    }

    #[test]
    fn test_position_not_overwritten() {
        let err = FfiError::range("300", "unsigned char")
            .at_argument(0)
            .at_argument(3);
        assert_eq!(err.argument_index(), Some(0));
    }

    #[test]
    fn test_context_lines() {
        let err = FfiError::new(ErrorKind::SymbolNotFound { name: "puts".into() })
            .with_context("function 'puts'");
        assert_eq!(err.to_string(), "undefined symbol: puts\n  in function 'puts'");
    }

    #[test]
    fn test_count_mismatch_message() {
        let kind = ErrorKind::ArgumentCountMismatch {
            expected: 2,
            found: 1,
            variadic: true,
        };
        assert_eq!(
            kind.to_string(),
            "wrong number of arguments: expected at least 2, got 1"
        );
    }
}
