//! Error taxonomy for the execution core.
//!
//! Mirrors the `UNCIL_ERR_KIND_*` partition of the reference implementation:
//! every error belongs to exactly one kind, and the kind alone determines how
//! the VM dispatch loop and the embedder boundary treat it.

use std::io;
use thiserror::Error;

/// Errors produced anywhere in the compiler or virtual machine.
///
/// `Trampoline` is not a real error: it is the dispatch loop's internal
/// signal that execution must switch to a different [`crate::view::View`]
/// (coroutine resume/yield, or a call that crosses a view boundary). It is
/// caught by the outer trampoline driver and must never reach the embedder.
#[derive(Debug, Error)]
pub enum UncilError {
    /// Out-of-memory or an internal invariant was violated.
    #[error("fatal: {0}")]
    Fatal(String),

    /// A value is already sitting in the view's exception slot and should be
    /// rethrown rather than wrapped again.
    #[error("unhandled exception: {0}")]
    UserException(String),

    /// Lexer or compiler error, anchored to a source line.
    #[error("syntax error at line {line}: {message}")]
    Syntax { line: u32, message: String },

    /// A native function or opcode received an unusable argument.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// Int/float conversion failed (including arithmetic overflow).
    #[error("conversion error: {0}")]
    Convert(String),

    /// I/O failure surfaced from an embedder-provided sink or source.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A value did not have the expected type.
    #[error("type error: {0}")]
    Type(String),

    /// Logic errors: unpack count mismatch, uncomparable values, unsupported
    /// operation.
    #[error("logic error: {0}")]
    Logic(String),

    /// Cooperative termination requested via `View::flow = Flow::Halt`.
    #[error("halted")]
    Halt,

    /// Internal control-flow signal: switch to another view. Carries the
    /// index of the view to resume. Never exposed to the embedder.
    #[error("trampoline to view {0}")]
    Trampoline(usize),
}

impl UncilError {
    /// High-level kind, matching `UNCIL_ERR_KIND(x)` of the reference headers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            UncilError::Fatal(_) => ErrorKind::Fatal,
            UncilError::UserException(_) => ErrorKind::UserException,
            UncilError::Syntax { .. } => ErrorKind::Syntax,
            UncilError::BadArgument(_) => ErrorKind::BadArgument,
            UncilError::Convert(_) => ErrorKind::Convert,
            UncilError::Io(_) => ErrorKind::Io,
            UncilError::Type(_) => ErrorKind::Type,
            UncilError::Logic(_) => ErrorKind::Logic,
            UncilError::Halt => ErrorKind::Halt,
            UncilError::Trampoline(_) => ErrorKind::Trampoline,
        }
    }

    /// The classification string stored in the `type` field of a constructed
    /// exception object (see §7 "Propagation").
    pub fn type_name(&self) -> &'static str {
        match self {
            UncilError::Fatal(_) => "fatal",
            UncilError::UserException(_) => "uncil",
            UncilError::Syntax { .. } => "syntax",
            UncilError::BadArgument(_) => "arg",
            UncilError::Convert(_) => "convert",
            UncilError::Io(_) => "io",
            UncilError::Type(_) => "type",
            UncilError::Logic(_) => "logic",
            UncilError::Halt => "halt",
            UncilError::Trampoline(_) => "trampoline",
        }
    }

    /// Fatal errors skip `try`/`catch` handlers entirely (§7 "Propagation").
    pub fn is_fatal(&self) -> bool {
        matches!(self, UncilError::Fatal(_))
    }

    pub fn is_trampoline(&self) -> bool {
        matches!(self, UncilError::Trampoline(_))
    }
}

/// High byte of the original C error codes, kept as a distinct type so match
/// arms read the same way the reference's `UNCIL_ERR_KIND_*` switch does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Fatal,
    UserException,
    Syntax,
    BadArgument,
    Convert,
    Io,
    Type,
    Logic,
    Trampoline,
    Halt,
}

pub type UncilResult<T> = Result<T, UncilError>;
