//! Top-level error taxonomy.
//!
//! Each component owns its own error enum; `GatewayError` aggregates
//! them so the server core can convert any component failure into a
//! wire-level `Error{code,message}` frame (see [`crate::codec::Message::Error`]).

use crate::codec::CodecError;
use crate::pool::PoolError;
use crate::session::SessionError;
use thiserror::Error;

/// Aggregate error type spanning all gateway components.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("rejected by security policy: {0}")]
    Security(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Maps this error onto the wire-level `Error{code,message}` contract.
    #[must_use]
    pub fn wire_code(&self) -> u16 {
        match self {
            Self::Codec(_) => 400,
            Self::Session(SessionError::DuplicateSession { .. }) => 409,
            Self::Session(SessionError::NotFound { .. }) => 404,
            Self::Session(SessionError::NotAuthenticated) => 401,
            Self::Pool(PoolError::Full) => 503,
            Self::Security(_) => 403,
            Self::Internal(_) => 500,
        }
    }
}
