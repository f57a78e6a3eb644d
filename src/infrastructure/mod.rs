//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - SIP protocol plumbing (messages, SDP, UDP transport, transactions)
//! - The RTP datagram relay
//! - Metrics recording

pub mod media;
pub mod metrics;
pub mod protocols;
