//! Runtime error taxonomy shared by the core and the execution state.

use std::fmt;

/// A runtime failure. Every fallible core operation returns one of these;
/// nothing in the core swallows an error or continues with partial state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RtError {
    /// The allocation gauge is exhausted. Fatal to the current operation,
    /// never to the host.
    OutOfMemory,
    /// An operation was invoked on a value of the wrong family, e.g.
    /// indexing a number. An expected user-script condition.
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    /// A table was indexed with nil.
    NilIndex,
    /// The call chain exceeded its depth limit.
    StackOverflow,
    /// A probe handler tried to re-enter a state that is already tracing.
    ReentrantTrace,
    /// A formatted script error raised through the runtime-error path.
    Runtime(String),
}

impl fmt::Display for RtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtError::OutOfMemory => write!(f, "out of memory"),
            RtError::TypeMismatch { expected, found } => {
                write!(f, "expected {expected}, got {found}")
            }
            RtError::NilIndex => write!(f, "table index is nil"),
            RtError::StackOverflow => write!(f, "stack overflow"),
            RtError::ReentrantTrace => write!(f, "re-entrant trace invocation"),
            RtError::Runtime(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for RtError {}
