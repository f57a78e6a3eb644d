//! SIP protocol implementation
//!
//! This module implements the SIP plumbing a user agent needs, based on
//! RFC 3261.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │   Application Layer     │
//! │ (Sessions, Dispatcher)  │
//! └───────────┬─────────────┘
//!             │  TransactionLayer / ServerTransaction
//! ┌───────────▼─────────────┐
//! │   Transaction Layer     │
//! │  (SipStack, timers)     │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Layer       │
//! │        (UDP)            │
//! └─────────────────────────┘
//! ```

pub mod builder;
pub mod layer;
pub mod message;
pub mod sdp;
pub mod stack;
pub mod transaction;
pub mod transport;

pub use builder::{RequestBuilder, ResponseBuilder};
pub use layer::{
    ClientTransaction, IncomingRequest, ServerTransaction, Transaction, TransactionEvent,
    TransactionEvents, TransactionLayer,
};
pub use message::{copy_headers, SipError, SipHeaders, SipMessage, SipRequest, SipResponse};
pub use sdp::SdpSession;
pub use stack::SipStack;
pub use transaction::{SipTimers, TransactionId};
pub use transport::{Transport, UdpTransport};
