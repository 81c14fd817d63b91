//! Error types returned to peers as call results, with stable error codes.

use serde::{Deserialize, Serialize};

use crate::token::EntropyError;

/// Errors a broker call can return to the calling peer.
///
/// None of these are fatal to the connection: the peer receives the error as the
/// reply to its call and may keep issuing calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("must be authenticated to connect to other user")]
    NotAuthenticated,

    #[error("could not connect - user not found")]
    UserNotFound,

    #[error("unknown connection")]
    UnknownConnection,

    #[error("could not connect - rejected")]
    Rejected,

    #[error("broker internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::NotAuthenticated => "not_authenticated",
            Self::UserNotFound => "user_not_found",
            Self::UnknownConnection => "unknown_connection",
            Self::Rejected => "rejected",
            Self::Internal(_) => "internal",
        }
    }

    /// Protocol errors are the caller's fault; internal errors are ours.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

impl From<EntropyError> for BrokerError {
    fn from(err: EntropyError) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Serializable error carried in a `Reply` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&BrokerError> for ErrorResponse {
    fn from(err: &BrokerError) -> Self {
        Self {
            code: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}
