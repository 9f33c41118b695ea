//! Error types for EchoForge

use thiserror::Error;

/// Core error type
///
/// Errors from helper primitives bubble up as one of these kinds; the
/// coordinator decides whether the engine recovers or terminates. No
/// exceptions-as-control-flow across component boundaries.
#[derive(Error, Debug)]
pub enum EfError {
    /// Null-equivalent, zero size, out-of-range slot/channel, bad block size.
    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    /// Method called before `init` or after `terminate`.
    #[error("Wrong state: {0}")]
    WrongState(String),

    /// Backend allocation failed. Recoverable by retrying with smaller sizes.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Kernel launch or FFT failure. Fatal when raised during `process`.
    #[error("Compute failure: {0}")]
    ComputeFailure(String),

    /// `init` called again without an intervening `terminate`.
    #[error("Already initialized")]
    AlreadyInitialized,

    /// Requested method not available on the current backend.
    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type EfResult<T> = Result<T, EfError>;

impl EfError {
    /// True for failures that must tear the engine down: a kernel or FFT
    /// failure on the block path leaves no consistent state to resume from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EfError::ComputeFailure(_))
    }

    pub(crate) fn invalid<T>(msg: impl Into<String>) -> EfResult<T> {
        Err(EfError::InvalidArg(msg.into()))
    }
}

/// Argument validation helpers shared by the public API surfaces.
pub fn ensure(cond: bool, msg: &str) -> EfResult<()> {
    if cond {
        Ok(())
    } else {
        EfError::invalid(msg)
    }
}
