//! The crate-wide error type.
//!
//! Every fallible operation in this crate returns [`Result`]; nothing panics
//! for a recoverable condition. Diagnostics that are not fatal (a skipped
//! relocation, a missing export) go through `log::warn!` instead of this type.

use std::result;

/// Errors produced while loading objects, resolving symbols, or emitting an image.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad format: {0}")]
    BadFormat(String),

    #[error("unresolved symbol(s): {}", .0.join(", "))]
    UnresolvedSymbol(Vec<String>),

    #[error("multiple definition of `{name}` in `{first}` and `{second}`")]
    MultipleDefinition {
        name: String,
        first: String,
        second: String,
    },

    #[error("backend failure: {0}")]
    BackendFailure(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("library not found: {0}")]
    NotFound(String),

    #[error("scroll error: {0}")]
    Scroll(#[from] scroll::Error),
}

pub type Result<T> = result::Result<T, Error>;
