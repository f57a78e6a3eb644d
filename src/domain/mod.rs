//! Domain layer - call-control rules independent of any transport
//!
//! This layer contains:
//! - The invite session state machine and its transition table
//! - Offer/answer storage
//! - Account profile and registration outcome
//! - Shared errors and value objects

pub mod account;
pub mod session;
pub mod shared;

// Re-export commonly used types
pub use shared::{Result, SessionError};
