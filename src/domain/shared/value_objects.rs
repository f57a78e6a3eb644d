//! Shared value objects used across the call-control layers

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// SIP Call-ID, the dialog's lookup key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(String);

impl CallId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh Call-ID scoped to `host`
    pub fn generate(host: &str) -> Self {
        Self(format!("{}@{}", Uuid::new_v4().simple(), host))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Which side originated the dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// We sent the INVITE (UAC)
    Outgoing,
    /// We received the INVITE (UAS)
    Incoming,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outgoing => "Outgoing",
            Direction::Incoming => "Incoming",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of the transaction a session is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

impl fmt::Display for TransactionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionRole::Client => f.write_str("client"),
            TransactionRole::Server => f.write_str("server"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_call_ids_are_unique() {
        let a = CallId::generate("127.0.0.1");
        let b = CallId::generate("127.0.0.1");
        assert_ne!(a, b);
        assert!(a.as_str().ends_with("@127.0.0.1"));
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::Outgoing.to_string(), "Outgoing");
        assert_eq!(Direction::Incoming.to_string(), "Incoming");
    }
}
