//! Fatal error taxonomy
//!
//! Everything here escalates out of the whole call flow; recoverable
//! conditions (mic denial, a dropped connection, one failed negotiation) are
//! handled in place and never appear as errors.

use thiserror::Error;

/// Unrecoverable failures for the current call attempt
#[derive(Error, Debug)]
pub enum FatalError {
    #[error("failed to fetch auth token: {0}")]
    TokenFetch(String),

    #[error("signaling protocol violation: {0}")]
    Protocol(String),

    #[error("server error: {message}")]
    Server { message: String, code: Option<u32> },

    #[error("orchestrator internal error: {0}")]
    Internal(String),
}
