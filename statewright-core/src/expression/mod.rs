//! Restricted path and expression grammar evaluated against the working document
//!
//! Everything here is pure: parsing happens once when a definition is compiled,
//! evaluation reads the document and never mutates anything but the value it
//! is asked to write through [`Path::set`].

mod parser;
pub mod path;
pub mod template;

pub use parser::{BinaryOp, Expr, Function, UnaryOp};
pub use path::{Path, Segment};
pub use template::Template;

use thiserror::Error;

/// Errors raised while parsing or evaluating paths and expressions
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("path not found: {path}")]
    PathNotFound { path: String },

    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("division by zero")]
    DivisionByZero,
}
