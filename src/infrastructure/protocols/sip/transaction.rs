//! SIP transaction state machines
//!
//! Implements client and server transactions as per RFC 3261 Section 17,
//! with the INVITE "Accepted" states of RFC 6026 so that 2xx
//! retransmissions keep matching their transaction.
//!
//! ## Transaction Types
//! - INVITE Client Transaction (ICT) - Section 17.1.1
//! - INVITE Server Transaction (IST) - Section 17.2.1
//! - Non-INVITE Client Transaction (NICT) - Section 17.1.2
//! - Non-INVITE Server Transaction (NIST) - Section 17.2.2

use super::message::{SipError, SipHeaders, SipRequest, SipResponse};
use crate::config::SipTimerConfig;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Transaction ID - the Via branch plus the CSeq method, so that a CANCEL
/// and the INVITE it targets are kept apart
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn new(branch: &str, method: &str) -> Self {
        Self(format!("{}:{}", branch, method))
    }

    /// Key of the transaction a request belongs to. ACK is matched against
    /// the INVITE it acknowledges.
    pub fn for_request(request: &SipRequest) -> Result<Self, SipError> {
        let branch = request
            .via_branch()
            .ok_or_else(|| SipError::InvalidMessage("No branch parameter in Via header".into()))?;
        let method = match request.method() {
            rsip::Method::Ack => "INVITE".to_string(),
            method => method.to_string(),
        };
        Ok(Self::new(&branch, &method))
    }

    pub fn for_response(response: &SipResponse) -> Result<Self, SipError> {
        let branch = response
            .via_branch()
            .ok_or_else(|| SipError::InvalidMessage("No branch parameter in Via header".into()))?;
        let (_, method) = response
            .cseq()
            .ok_or_else(|| SipError::InvalidMessage("Missing CSeq header".into()))?;
        Ok(Self::new(&branch, &method))
    }

    /// Generate a new Via branch
    pub fn generate_branch() -> String {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let random: u64 = rng.gen();
        format!("z9hG4bK{:x}", random)
    }

    pub fn branch(&self) -> &str {
        self.0.split(':').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SIP Timers (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy)]
pub struct SipTimers {
    /// T1: RTT Estimate (default 500ms)
    pub t1: Duration,
    /// T2: Maximum retransmit interval (default 4s)
    pub t2: Duration,
    /// T4: Maximum duration a message remains in network (default 5s)
    pub t4: Duration,
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

impl From<&SipTimerConfig> for SipTimers {
    fn from(config: &SipTimerConfig) -> Self {
        Self {
            t1: Duration::from_millis(config.t1_ms),
            t2: Duration::from_millis(config.t2_ms),
            t4: Duration::from_millis(config.t4_ms),
        }
    }
}

/// Timer types for SIP transactions over UDP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    /// Timer A: INVITE request retransmit interval (T1, doubling)
    TimerA,
    /// Timer B: INVITE transaction timeout (64*T1)
    TimerB,
    /// Timer D: wait time for response retransmits (32s)
    TimerD,
    /// Timer E: non-INVITE request retransmit (T1, doubling up to T2)
    TimerE,
    /// Timer F: non-INVITE transaction timeout (64*T1)
    TimerF,
    /// Timer G: INVITE response retransmit (T1, doubling up to T2)
    TimerG,
    /// Timer H: wait time for ACK receipt (64*T1)
    TimerH,
    /// Timer I: wait time for ACK retransmits (T4)
    TimerI,
    /// Timer J: wait time for non-INVITE request retransmits (64*T1)
    TimerJ,
    /// Timer K: wait time for response retransmits (T4)
    TimerK,
    /// Timer L: accepted INVITE server lingers for request retransmits (64*T1)
    TimerL,
    /// Timer M: accepted INVITE client lingers for 2xx retransmits (64*T1)
    TimerM,
}

impl TimerType {
    pub fn duration(&self, timers: &SipTimers) -> Duration {
        match self {
            TimerType::TimerA | TimerType::TimerE | TimerType::TimerG => timers.t1,
            TimerType::TimerB
            | TimerType::TimerF
            | TimerType::TimerH
            | TimerType::TimerJ
            | TimerType::TimerL
            | TimerType::TimerM => timers.t1 * 64,
            TimerType::TimerD => Duration::from_secs(32),
            TimerType::TimerI | TimerType::TimerK => timers.t4,
        }
    }
}

/// INVITE Client Transaction States
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteClientState {
    Calling,
    Proceeding,
    /// 2xx received, absorbing retransmissions of it
    Accepted,
    /// 3xx-6xx received and ACKed
    Completed,
    Terminated,
}

/// INVITE Server Transaction States
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteServerState {
    Proceeding,
    /// 2xx sent
    Accepted,
    /// 3xx-6xx sent, waiting for ACK
    Completed,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonInviteClientState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonInviteServerState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Transaction type and state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    InviteClient(InviteClientState),
    InviteServer(InviteServerState),
    NonInviteClient(NonInviteClientState),
    NonInviteServer(NonInviteServerState),
}

impl TransactionState {
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            TransactionState::InviteClient(InviteClientState::Terminated)
                | TransactionState::InviteServer(InviteServerState::Terminated)
                | TransactionState::NonInviteClient(NonInviteClientState::Terminated)
                | TransactionState::NonInviteServer(NonInviteServerState::Terminated)
        )
    }

    /// Get state name for debugging
    pub fn name(&self) -> &'static str {
        match self {
            TransactionState::InviteClient(state) => match state {
                InviteClientState::Calling => "ICT-Calling",
                InviteClientState::Proceeding => "ICT-Proceeding",
                InviteClientState::Accepted => "ICT-Accepted",
                InviteClientState::Completed => "ICT-Completed",
                InviteClientState::Terminated => "ICT-Terminated",
            },
            TransactionState::InviteServer(state) => match state {
                InviteServerState::Proceeding => "IST-Proceeding",
                InviteServerState::Accepted => "IST-Accepted",
                InviteServerState::Completed => "IST-Completed",
                InviteServerState::Confirmed => "IST-Confirmed",
                InviteServerState::Terminated => "IST-Terminated",
            },
            TransactionState::NonInviteClient(state) => match state {
                NonInviteClientState::Trying => "NICT-Trying",
                NonInviteClientState::Proceeding => "NICT-Proceeding",
                NonInviteClientState::Completed => "NICT-Completed",
                NonInviteClientState::Terminated => "NICT-Terminated",
            },
            TransactionState::NonInviteServer(state) => match state {
                NonInviteServerState::Trying => "NIST-Trying",
                NonInviteServerState::Proceeding => "NIST-Proceeding",
                NonInviteServerState::Completed => "NIST-Completed",
                NonInviteServerState::Terminated => "NIST-Terminated",
            },
        }
    }
}

/// Active timer in a transaction
#[derive(Debug, Clone)]
pub struct ActiveTimer {
    pub timer_type: TimerType,
    pub expires_at: Instant,
    pub interval: Duration,
}

/// Actions that should be taken when a timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionTimerAction {
    None,
    RetransmitRequest,
    RetransmitResponse,
    /// Transaction timed out; client transactions report it upward
    Timeout,
    Terminate,
}

/// What the transaction user should do with a received response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseDisposition {
    /// Deliver the response upward
    pub pass_up: bool,
    /// (Re)send the ACK for a non-2xx INVITE final
    pub send_ack: bool,
}

/// One SIP transaction: state, timers and the messages needed to
/// retransmit
#[derive(Debug, Clone)]
pub struct SipTransaction {
    pub id: TransactionId,
    pub state: TransactionState,
    pub request: SipRequest,
    pub timers: Vec<ActiveTimer>,
    /// Last response, replayed when the request is retransmitted
    pub last_response: Option<SipResponse>,
    pub created_at: Instant,
    sip_timers: SipTimers,
}

impl SipTransaction {
    pub fn new_client(id: TransactionId, request: SipRequest, sip_timers: SipTimers) -> Self {
        let invite = request.method() == &rsip::Method::Invite;
        let mut transaction = Self {
            id,
            state: if invite {
                TransactionState::InviteClient(InviteClientState::Calling)
            } else {
                TransactionState::NonInviteClient(NonInviteClientState::Trying)
            },
            request,
            timers: Vec::new(),
            last_response: None,
            created_at: Instant::now(),
            sip_timers,
        };

        if invite {
            transaction.start_timer(TimerType::TimerA);
            transaction.start_timer(TimerType::TimerB);
        } else {
            transaction.start_timer(TimerType::TimerE);
            transaction.start_timer(TimerType::TimerF);
        }
        transaction
    }

    pub fn new_server(id: TransactionId, request: SipRequest, sip_timers: SipTimers) -> Self {
        let state = if request.method() == &rsip::Method::Invite {
            TransactionState::InviteServer(InviteServerState::Proceeding)
        } else {
            TransactionState::NonInviteServer(NonInviteServerState::Trying)
        };
        Self {
            id,
            state,
            request,
            timers: Vec::new(),
            last_response: None,
            created_at: Instant::now(),
            sip_timers,
        }
    }

    fn start_timer(&mut self, timer_type: TimerType) {
        let duration = timer_type.duration(&self.sip_timers);
        self.timers.push(ActiveTimer {
            timer_type,
            expires_at: Instant::now() + duration,
            interval: duration,
        });
        debug!(
            "Started {:?} for transaction {} (expires in {:?})",
            timer_type, self.id, duration
        );
    }

    fn stop_timer(&mut self, timer_type: TimerType) {
        self.timers.retain(|t| t.timer_type != timer_type);
    }

    fn stop_all_timers(&mut self) {
        self.timers.clear();
    }

    /// Process received response (for client transactions)
    pub fn process_response(&mut self, response: &SipResponse) -> Result<ResponseDisposition, SipError> {
        let status = response.status_code();
        let pass = |pass_up, send_ack| Ok(ResponseDisposition { pass_up, send_ack });

        match self.state {
            TransactionState::InviteClient(state) => match state {
                InviteClientState::Calling | InviteClientState::Proceeding => {
                    if status < 200 {
                        self.state = TransactionState::InviteClient(InviteClientState::Proceeding);
                        // Timer B only bounds Calling; a ringing INVITE waits for its final
                        self.stop_timer(TimerType::TimerA);
                        self.stop_timer(TimerType::TimerB);
                        pass(true, false)
                    } else if status < 300 {
                        self.state = TransactionState::InviteClient(InviteClientState::Accepted);
                        self.stop_all_timers();
                        self.start_timer(TimerType::TimerM);
                        pass(true, false)
                    } else {
                        self.state = TransactionState::InviteClient(InviteClientState::Completed);
                        self.stop_all_timers();
                        self.start_timer(TimerType::TimerD);
                        pass(true, true)
                    }
                }
                // 2xx retransmissions go up so the dialog can re-ACK them
                InviteClientState::Accepted => pass((200..300).contains(&status), false),
                InviteClientState::Completed => pass(false, status >= 300),
                InviteClientState::Terminated => Err(SipError::TransactionError(
                    "Transaction already terminated".into(),
                )),
            },

            TransactionState::NonInviteClient(state) => match state {
                NonInviteClientState::Trying | NonInviteClientState::Proceeding => {
                    if status < 200 {
                        self.state =
                            TransactionState::NonInviteClient(NonInviteClientState::Proceeding);
                    } else {
                        self.state =
                            TransactionState::NonInviteClient(NonInviteClientState::Completed);
                        self.stop_all_timers();
                        self.start_timer(TimerType::TimerK);
                    }
                    pass(true, false)
                }
                NonInviteClientState::Completed => pass(false, false),
                NonInviteClientState::Terminated => Err(SipError::TransactionError(
                    "Transaction already terminated".into(),
                )),
            },

            _ => Err(SipError::TransactionError("Not a client transaction".into())),
        }
    }

    /// Process received ACK for a non-2xx final (INVITE server transactions)
    pub fn process_ack(&mut self) -> Result<(), SipError> {
        match self.state {
            TransactionState::InviteServer(InviteServerState::Completed) => {
                self.state = TransactionState::InviteServer(InviteServerState::Confirmed);
                self.stop_all_timers();
                self.start_timer(TimerType::TimerI);
                Ok(())
            }
            TransactionState::InviteServer(InviteServerState::Confirmed) => Ok(()),
            _ => Err(SipError::TransactionError(format!(
                "Invalid state for ACK processing: {}",
                self.state.name()
            ))),
        }
    }

    /// Send response (for server transactions)
    pub fn send_response(&mut self, response: SipResponse) -> Result<(), SipError> {
        let status = response.status_code();

        match self.state {
            TransactionState::InviteServer(InviteServerState::Proceeding) => {
                if (200..300).contains(&status) {
                    self.state = TransactionState::InviteServer(InviteServerState::Accepted);
                    self.start_timer(TimerType::TimerL);
                } else if status >= 300 {
                    self.state = TransactionState::InviteServer(InviteServerState::Completed);
                    self.start_timer(TimerType::TimerG);
                    self.start_timer(TimerType::TimerH);
                }
            }
            // The dialog layer resends its 2xx through the transaction until ACKed
            TransactionState::InviteServer(InviteServerState::Accepted)
                if (200..300).contains(&status) => {}
            TransactionState::NonInviteServer(
                NonInviteServerState::Trying | NonInviteServerState::Proceeding,
            ) => {
                if status < 200 {
                    self.state =
                        TransactionState::NonInviteServer(NonInviteServerState::Proceeding);
                } else {
                    self.state = TransactionState::NonInviteServer(NonInviteServerState::Completed);
                    self.start_timer(TimerType::TimerJ);
                }
            }
            _ => {
                return Err(SipError::TransactionError(format!(
                    "Invalid state for sending response: {}",
                    self.state.name()
                )))
            }
        }

        self.last_response = Some(response);
        Ok(())
    }

    /// Handle timer expiration
    pub fn handle_timer_fired(&mut self, timer_type: TimerType) -> TransactionTimerAction {
        debug!(
            "Timer {:?} fired for transaction {} in state {}",
            timer_type,
            self.id,
            self.state.name()
        );

        match timer_type {
            TimerType::TimerA => self.backoff(TimerType::TimerA, None),
            TimerType::TimerE => {
                let cap = self.sip_timers.t2;
                self.backoff(TimerType::TimerE, Some(cap))
            }
            TimerType::TimerG => {
                let cap = self.sip_timers.t2;
                match self.backoff(TimerType::TimerG, Some(cap)) {
                    TransactionTimerAction::RetransmitRequest => {
                        TransactionTimerAction::RetransmitResponse
                    }
                    other => other,
                }
            }
            TimerType::TimerB | TimerType::TimerF | TimerType::TimerH => {
                self.terminate();
                TransactionTimerAction::Timeout
            }
            TimerType::TimerD
            | TimerType::TimerI
            | TimerType::TimerJ
            | TimerType::TimerK
            | TimerType::TimerL
            | TimerType::TimerM => {
                self.terminate();
                TransactionTimerAction::Terminate
            }
        }
    }

    /// Reschedule a retransmit timer with a doubled interval
    fn backoff(&mut self, timer_type: TimerType, cap: Option<Duration>) -> TransactionTimerAction {
        let still_sending = matches!(
            (timer_type, self.state),
            (
                TimerType::TimerA,
                TransactionState::InviteClient(InviteClientState::Calling)
            ) | (
                TimerType::TimerE,
                TransactionState::NonInviteClient(NonInviteClientState::Trying)
            ) | (
                TimerType::TimerG,
                TransactionState::InviteServer(InviteServerState::Completed)
            )
        );
        if !still_sending {
            self.stop_timer(timer_type);
            return TransactionTimerAction::None;
        }

        if let Some(timer) = self.timers.iter_mut().find(|t| t.timer_type == timer_type) {
            timer.interval = match cap {
                Some(cap) => std::cmp::min(timer.interval * 2, cap),
                None => timer.interval * 2,
            };
            timer.expires_at = Instant::now() + timer.interval;
        }
        TransactionTimerAction::RetransmitRequest
    }

    fn terminate(&mut self) {
        self.state = match self.state {
            TransactionState::InviteClient(_) => {
                TransactionState::InviteClient(InviteClientState::Terminated)
            }
            TransactionState::InviteServer(_) => {
                TransactionState::InviteServer(InviteServerState::Terminated)
            }
            TransactionState::NonInviteClient(_) => {
                TransactionState::NonInviteClient(NonInviteClientState::Terminated)
            }
            TransactionState::NonInviteServer(_) => {
                TransactionState::NonInviteServer(NonInviteServerState::Terminated)
            }
        };
        self.stop_all_timers();
    }

    /// Check for expired timers and return actions
    pub fn check_timers(&mut self, now: Instant) -> Vec<(TimerType, TransactionTimerAction)> {
        let expired: Vec<TimerType> = self
            .timers
            .iter()
            .filter(|t| t.expires_at <= now)
            .map(|t| t.timer_type)
            .collect();

        let mut actions = Vec::new();
        for timer_type in expired {
            if self.state.is_terminated() {
                break;
            }
            let action = self.handle_timer_fired(timer_type);
            if action != TransactionTimerAction::None {
                actions.push((timer_type, action));
            }
        }
        actions
    }
}
