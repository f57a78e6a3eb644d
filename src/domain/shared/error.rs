//! Call-control errors

use crate::domain::session::SessionState;
use crate::domain::shared::value_objects::TransactionRole;
use crate::infrastructure::protocols::sip::SipError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The requested operation is not legal from the current state.
    #[error("Invalid status: {operation} not allowed in {from}")]
    InvalidTransition {
        from: SessionState,
        operation: &'static str,
    },

    #[error("Answer sdp is missing")]
    MissingAnswer,

    /// `actual` is `None` when no transaction is bound at all.
    #[error("Invalid transaction role: expected {expected}, bound {actual:?}")]
    InvalidTransactionRole {
        expected: TransactionRole,
        actual: Option<TransactionRole>,
    },

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Unrecognized event {event} in {state}")]
    UnrecognizedEvent { state: SessionState, event: String },

    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl SessionError {
    /// True when the operation was refused because the session had already
    /// reached a terminal state.
    pub fn is_already_terminated(&self) -> bool {
        matches!(self, SessionError::InvalidTransition { from, .. } if from.is_terminal())
    }
}

impl From<SipError> for SessionError {
    fn from(err: SipError) -> Self {
        SessionError::TransportFailure(err.to_string())
    }
}
