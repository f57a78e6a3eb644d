//! Invite session domain: state machine and offer/answer slots

pub mod offer_answer;
pub mod state;

pub use offer_answer::OfferAnswer;
pub use state::{SessionEvent, SessionState};
