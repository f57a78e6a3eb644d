//! Application layer - sessions and the services that drive them
//!
//! This layer contains:
//! - `Session`, the per-dialog operation surface
//! - The Call-ID registry and the dispatcher routing network events
//! - `UserAgent`, the call and registration entry points

pub mod dispatcher;
pub mod registry;
pub mod session;
pub mod ua;

pub use dispatcher::{Dispatcher, InviteStateHandler};
pub use registry::SessionRegistry;
pub use session::{Session, SessionContext, SessionObserver};
pub use ua::{RegisterStateHandler, UserAgent};
