//! Shared kernel - error, result and value types used by every layer

pub mod error;
pub mod result;
pub mod value_objects;

pub use error::SessionError;
pub use result::Result;
pub use value_objects::*;
