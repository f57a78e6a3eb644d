//! Invite session state machine
//!
//! Pure transition table for a single INVITE dialog. The table is
//! role-qualified: UAC-only events are refused on incoming sessions and
//! vice versa.

use crate::domain::shared::value_objects::Direction;
use std::fmt;

/// Invite session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Null,
    /// After INVITE is sent
    InviteSent,
    /// After INVITE is received
    InviteReceived,
    /// After a 1xx response is received
    Provisional,
    /// After a 1xx response with SDP is received
    EarlyMedia,
    /// After a 1xx response is sent
    WaitingForAnswer,
    /// After a 2xx response is received
    WaitingForAck,
    /// After a 2xx response is sent
    Answered,
    Canceled,
    /// After ACK is sent/received
    Confirmed,
    /// Session is rejected or failed
    Failure,
    /// Session is terminated
    Terminated,
}

impl SessionState {
    pub const ALL: [SessionState; 12] = [
        SessionState::Null,
        SessionState::InviteSent,
        SessionState::InviteReceived,
        SessionState::Provisional,
        SessionState::EarlyMedia,
        SessionState::WaitingForAnswer,
        SessionState::WaitingForAck,
        SessionState::Answered,
        SessionState::Canceled,
        SessionState::Confirmed,
        SessionState::Failure,
        SessionState::Terminated,
    ];

    /// Dialog neither answered nor failed yet
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            SessionState::Null
                | SessionState::InviteSent
                | SessionState::Provisional
                | SessionState::InviteReceived
                | SessionState::WaitingForAnswer
        )
    }

    pub fn is_established(&self) -> bool {
        matches!(
            self,
            SessionState::Answered | SessionState::WaitingForAck | SessionState::Confirmed
        )
    }

    /// Canceled or Terminated. Failure is deliberately left out, see
    /// [`SessionState::is_terminal`].
    pub fn is_ended(&self) -> bool {
        matches!(self, SessionState::Canceled | SessionState::Terminated)
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.is_ended() || matches!(self, SessionState::Failure)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Null => "Null",
            SessionState::InviteSent => "InviteSent",
            SessionState::InviteReceived => "InviteReceived",
            SessionState::Provisional => "Provisional",
            SessionState::EarlyMedia => "EarlyMedia",
            SessionState::WaitingForAnswer => "WaitingForAnswer",
            SessionState::WaitingForAck => "WaitingForACK",
            SessionState::Answered => "Answered",
            SessionState::Canceled => "Canceled",
            SessionState::Confirmed => "Confirmed",
            SessionState::Failure => "Failure",
            SessionState::Terminated => "Terminated",
        }
    }

    /// Look up the transition table.
    ///
    /// Returns `None` when `event` is not legal from `self` for a session
    /// of the given `direction`.
    pub fn next(self, direction: Direction, event: SessionEvent) -> Option<SessionState> {
        if let Some(role) = event.role() {
            if role != direction {
                return None;
            }
        }

        use SessionEvent as E;
        use SessionState as S;
        let next = match (self, event) {
            (S::Null, E::InviteSent) => S::InviteSent,
            (S::Null, E::InviteReceived) => S::InviteReceived,

            // UAC
            (S::InviteSent, E::ProvisionalReceived) => S::Provisional,
            (S::InviteSent | S::Provisional, E::EarlyMediaReceived) => S::EarlyMedia,
            (S::InviteSent | S::Provisional | S::EarlyMedia, E::SuccessReceived) => {
                S::WaitingForAck
            }
            (S::WaitingForAck, E::AckSent) => S::Confirmed,
            (S::InviteSent | S::Provisional | S::EarlyMedia, E::FailureReceived) => S::Failure,

            // UAS
            (S::InviteReceived, E::ProvisionalSent) => S::WaitingForAnswer,
            (S::InviteReceived | S::WaitingForAnswer, E::Accepted) => S::Answered,
            (S::Answered, E::AckReceived) => S::Confirmed,
            (S::InviteReceived | S::WaitingForAnswer | S::Answered, E::Reject) => S::Failure,

            // Either side
            (
                S::Null
                | S::InviteSent
                | S::Provisional
                | S::EarlyMedia
                | S::InviteReceived
                | S::WaitingForAnswer,
                E::Cancel,
            ) => S::Canceled,
            (S::WaitingForAck | S::Confirmed, E::Bye) => S::Terminated,

            _ => return None,
        };
        Some(next)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Transition trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// INVITE handed to a client transaction
    InviteSent,
    /// INVITE arrived on a server transaction
    InviteReceived,
    /// 1xx without SDP received
    ProvisionalReceived,
    /// 1xx with SDP received
    EarlyMediaReceived,
    /// 1xx sent by the application
    ProvisionalSent,
    /// 2xx sent by the application
    Accepted,
    /// 2xx received
    SuccessReceived,
    AckReceived,
    AckSent,
    /// CANCEL sent or received, or End() before an answer
    Cancel,
    /// Failure final response sent by the application
    Reject,
    /// Non-2xx final response, timeout or transport error on the INVITE
    FailureReceived,
    /// BYE sent or received
    Bye,
}

impl SessionEvent {
    pub const ALL: [SessionEvent; 13] = [
        SessionEvent::InviteSent,
        SessionEvent::InviteReceived,
        SessionEvent::ProvisionalReceived,
        SessionEvent::EarlyMediaReceived,
        SessionEvent::ProvisionalSent,
        SessionEvent::Accepted,
        SessionEvent::SuccessReceived,
        SessionEvent::AckReceived,
        SessionEvent::AckSent,
        SessionEvent::Cancel,
        SessionEvent::Reject,
        SessionEvent::FailureReceived,
        SessionEvent::Bye,
    ];

    /// Side that may raise this event, `None` for either.
    pub fn role(&self) -> Option<Direction> {
        match self {
            SessionEvent::InviteSent
            | SessionEvent::ProvisionalReceived
            | SessionEvent::EarlyMediaReceived
            | SessionEvent::SuccessReceived
            | SessionEvent::AckSent
            | SessionEvent::FailureReceived => Some(Direction::Outgoing),
            SessionEvent::InviteReceived
            | SessionEvent::ProvisionalSent
            | SessionEvent::Accepted
            | SessionEvent::AckReceived
            | SessionEvent::Reject => Some(Direction::Incoming),
            SessionEvent::Cancel | SessionEvent::Bye => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::InviteSent => "invite-sent",
            SessionEvent::InviteReceived => "invite-received",
            SessionEvent::ProvisionalReceived => "provisional-received",
            SessionEvent::EarlyMediaReceived => "early-media-received",
            SessionEvent::ProvisionalSent => "provisional-sent",
            SessionEvent::Accepted => "accepted",
            SessionEvent::SuccessReceived => "success-received",
            SessionEvent::AckReceived => "ack-received",
            SessionEvent::AckSent => "ack-sent",
            SessionEvent::Cancel => "cancel",
            SessionEvent::Reject => "reject",
            SessionEvent::FailureReceived => "failure-received",
            SessionEvent::Bye => "bye",
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
