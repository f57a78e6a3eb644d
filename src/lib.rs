//! sipua - SIP user agent call-control core
//!
//! Layered the usual way: `domain` holds the invite session state machine
//! and shared types, `infrastructure` the SIP wire types, UDP stack, media
//! relay and metrics, and `application` the sessions, dispatcher and user
//! agent built on top of them.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{Session, UserAgent};
pub use domain::session::SessionState;
pub use domain::shared::error::SessionError;
pub use domain::shared::result::Result;
