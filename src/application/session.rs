//! Invite session: per-dialog state holder and operation surface
//!
//! Every operation runs under the session's transition gate, a reentrant
//! lock held from validation until the observer has been told about the
//! new state. The field lock is released before the observer runs, so a
//! state handler sees the post-transition state and may call back into
//! the same session. Sends only enqueue on the transaction layer; when a
//! send fails the state is left untouched.

use crate::domain::session::{OfferAnswer, SessionEvent, SessionState};
use crate::domain::shared::value_objects::{CallId, Direction, TransactionRole};
use crate::domain::shared::{Result, SessionError};
use crate::infrastructure::protocols::sip::builder::{cancel_for, RequestBuilder, ResponseBuilder};
use crate::infrastructure::protocols::sip::message::host_port;
use crate::infrastructure::protocols::sip::{
    copy_headers, SdpSession, ServerTransaction, SipHeaders, SipRequest, SipResponse, SipTimers,
    Transaction, TransactionEvent, TransactionEvents, TransactionId, TransactionLayer,
};
use parking_lot::{Mutex, ReentrantMutex};
use rsip::{Header, Method, Uri};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn, Span};

const SDP_CONTENT_TYPE: &str = "application/sdp";

/// Told about every applied transition
pub trait SessionObserver: Send + Sync {
    fn on_transition(
        &self,
        session: &Arc<Session>,
        request: Option<&SipRequest>,
        response: Option<&SipResponse>,
        state: SessionState,
    );
}

/// Collaborators shared by every session of a user agent
#[derive(Clone)]
pub struct SessionContext {
    pub layer: Arc<dyn TransactionLayer>,
    pub observer: Option<Weak<dyn SessionObserver>>,
    pub user_agent: String,
    /// Paces 2xx retransmission while an ACK is outstanding
    pub timers: SipTimers,
    pub span: Span,
}

/// Dialog identifiers and routing
#[derive(Debug, Clone)]
struct Dialog {
    local_party: String,
    local_tag: String,
    /// To header value for in-dialog requests, remote tag included
    remote_party: String,
    remote_target: Option<Uri>,
    /// Request-URI of the INVITE, used while no remote target is known
    request_uri: Uri,
    /// `host:port` in-dialog requests are sent to
    next_hop: String,
    invite_cseq: u32,
    local_cseq: u32,
}

struct SessionInner {
    status: SessionState,
    request: Option<SipRequest>,
    response: Option<SipResponse>,
    transaction: Option<Transaction>,
    media: OfferAnswer<SdpSession>,
    dialog: Dialog,
}

pub struct Session {
    me: Weak<Session>,
    id: CallId,
    direction: Direction,
    contact: String,
    ctx: SessionContext,
    span: Span,
    gate: ReentrantMutex<()>,
    inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("status", &self.status())
            .finish()
    }
}

pub(crate) fn new_tag() -> String {
    format!("{:08x}", rand::random::<u32>())
}

impl Session {
    /// Session for an INVITE we are about to send to `destination`
    pub(crate) fn outgoing(
        ctx: SessionContext,
        invite: SipRequest,
        offer: SdpSession,
        destination: String,
        contact: String,
    ) -> Result<Arc<Session>> {
        let id = invite
            .call_id()
            .ok_or_else(|| SessionError::InvalidArgument("INVITE without Call-ID".into()))?;
        let local_tag = invite
            .from_tag()
            .ok_or_else(|| SessionError::InvalidArgument("INVITE without From tag".into()))?;
        let local_party = invite
            .from_header()
            .map(|from| strip_tag(&from))
            .unwrap_or_default();
        let invite_cseq = invite.cseq().map(|(seq, _)| seq).unwrap_or(1);

        let dialog = Dialog {
            local_party,
            local_tag,
            remote_party: invite.to_header().unwrap_or_default(),
            remote_target: None,
            request_uri: invite.uri().clone(),
            next_hop: destination,
            invite_cseq,
            local_cseq: invite_cseq,
        };

        let mut media = OfferAnswer::new();
        media.provide_offer(offer);

        Ok(Self::build(
            ctx,
            id,
            Direction::Outgoing,
            contact,
            SessionInner {
                status: SessionState::Null,
                request: Some(invite),
                response: None,
                transaction: None,
                media,
                dialog,
            },
        ))
    }

    /// Session for an INVITE received from `source` on `transaction`
    pub(crate) fn incoming(
        ctx: SessionContext,
        transaction: Arc<dyn ServerTransaction>,
        source: SocketAddr,
    ) -> Result<Arc<Session>> {
        let invite = transaction.request().clone();
        let id = invite
            .call_id()
            .ok_or_else(|| SessionError::InvalidArgument("INVITE without Call-ID".into()))?;

        let remote_target = invite
            .contact_uri()
            .and_then(|uri| Uri::try_from(uri.as_str()).ok());
        let next_hop = remote_target
            .as_ref()
            .map(host_port)
            .unwrap_or_else(|| source.to_string());
        let invite_cseq = invite.cseq().map(|(seq, _)| seq).unwrap_or(1);
        let user = invite
            .uri()
            .auth
            .as_ref()
            .map(|auth| format!("{}@", auth.user))
            .unwrap_or_default();
        let contact = format!("sip:{}{}", user, ctx.layer.local_addr());

        let dialog = Dialog {
            local_party: invite.to_header().map(|to| strip_tag(&to)).unwrap_or_default(),
            local_tag: new_tag(),
            remote_party: invite.from_header().unwrap_or_default(),
            remote_target,
            request_uri: invite.uri().clone(),
            next_hop,
            invite_cseq,
            local_cseq: 1,
        };

        let mut media = OfferAnswer::new();
        if let Some(offer) = parse_sdp(invite.body()) {
            media.provide_offer(offer);
        }

        Ok(Self::build(
            ctx,
            id,
            Direction::Incoming,
            contact,
            SessionInner {
                status: SessionState::Null,
                request: Some(invite),
                response: None,
                transaction: Some(Transaction::Server(transaction)),
                media,
                dialog,
            },
        ))
    }

    fn build(
        ctx: SessionContext,
        id: CallId,
        direction: Direction,
        contact: String,
        inner: SessionInner,
    ) -> Arc<Session> {
        let span = tracing::info_span!(
            parent: &ctx.span,
            "invite_session",
            call_id = %id,
            direction = %direction
        );
        Arc::new_cyclic(|me| Session {
            me: me.clone(),
            id,
            direction,
            contact,
            ctx,
            span,
            gate: ReentrantMutex::new(()),
            inner: Mutex::new(inner),
        })
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Local URI advertised in Contact headers
    pub fn contact(&self) -> &str {
        &self.contact
    }

    pub fn status(&self) -> SessionState {
        self.inner.lock().status
    }

    /// Most recent request of the current exchange
    pub fn request(&self) -> Option<SipRequest> {
        self.inner.lock().request.clone()
    }

    /// Most recent response sent or received
    pub fn response(&self) -> Option<SipResponse> {
        self.inner.lock().response.clone()
    }

    pub fn transaction(&self) -> Option<Transaction> {
        self.inner.lock().transaction.clone()
    }

    pub fn local_tag(&self) -> String {
        self.inner.lock().dialog.local_tag.clone()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn provide_offer(&self, offer: SdpSession) {
        self.inner.lock().media.provide_offer(offer);
    }

    pub fn provide_answer(&self, answer: SdpSession) {
        self.inner.lock().media.provide_answer(answer);
    }

    pub fn offer(&self) -> Option<SdpSession> {
        self.inner.lock().media.offer().cloned()
    }

    pub fn answer(&self) -> Option<SdpSession> {
        self.inner.lock().media.answer().cloned()
    }

    /// The stored answer, whether provided for a 1xx or the 2xx
    pub fn early_media(&self) -> Option<SdpSession> {
        self.inner.lock().media.early_media()
    }

    /// Answer the received INVITE with `code` (2xx) and the provided answer
    pub fn accept(&self, code: u16) -> Result<SessionState> {
        let _gate = self.gate.lock();
        let (next, response) = {
            let mut inner = self.inner.lock();

            if !(200..300).contains(&code) {
                return Err(SessionError::InvalidArgument(format!(
                    "accept needs a 2xx code, got {}",
                    code
                )));
            }
            let Some(answer) = inner.media.answer().cloned() else {
                warn!(parent: &self.span, "Accept refused: answer sdp is missing");
                return Err(SessionError::MissingAnswer);
            };
            let transaction = self.server_transaction(&inner)?;
            let next = self.next_state(&inner, SessionEvent::Accepted, "accept")?;

            let request = transaction.request();
            let mut response = ResponseBuilder::new(code)
                .to_tag(inner.dialog.local_tag.clone())
                .header(Header::Contact(format!("<{}>", self.contact).into()))
                .header(Header::UserAgent(self.ctx.user_agent.clone().into()))
                .body(answer.to_bytes())
                .build_for_request(request);
            set_sdp_content_type(&mut response, request);

            transaction.respond(response.clone())?;
            info!(parent: &self.span, "Accepted with {}", code);

            inner.response = Some(response.clone());
            inner.status = next;
            (next, response)
        };

        self.notify(None, Some(&response), next);
        self.start_success_retransmission();
        Ok(next)
    }

    /// Refuse the received INVITE with a failure final response
    pub fn reject(&self, code: u16, reason: &str) -> Result<SessionState> {
        let _gate = self.gate.lock();
        let (next, response) = {
            let mut inner = self.inner.lock();
            if code < 300 {
                return Err(SessionError::InvalidArgument(format!(
                    "reject needs a 3xx-6xx code, got {}",
                    code
                )));
            }
            let transaction = self.server_transaction(&inner)?;
            let next = self.next_state(&inner, SessionEvent::Reject, "reject")?;
            let response = self.final_failure(&mut inner, &transaction, code, reason)?;
            inner.status = next;
            (next, response)
        };

        self.notify(None, Some(&response), next);
        Ok(next)
    }

    /// Send a 1xx for the received INVITE, carrying the answer when one
    /// is already provided
    pub fn provisional(&self, code: u16, reason: &str) -> Result<SessionState> {
        let _gate = self.gate.lock();
        let (next, transitioned, response) = {
            let mut inner = self.inner.lock();
            if !(100..200).contains(&code) {
                return Err(SessionError::InvalidArgument(format!(
                    "provisional needs a 1xx code, got {}",
                    code
                )));
            }
            let transaction = self.server_transaction(&inner)?;
            let (next, transitioned) = match inner.status {
                SessionState::WaitingForAnswer => (SessionState::WaitingForAnswer, false),
                _ => (
                    self.next_state(&inner, SessionEvent::ProvisionalSent, "provisional")?,
                    true,
                ),
            };

            let request = transaction.request();
            let mut builder = ResponseBuilder::new(code)
                .reason(reason)
                .to_tag(inner.dialog.local_tag.clone())
                .header(Header::Contact(format!("<{}>", self.contact).into()));
            let early = inner.media.early_media();
            if let Some(sdp) = &early {
                builder = builder.body(sdp.to_bytes());
            }
            let mut response = builder.build_for_request(request);
            if early.is_some() {
                set_sdp_content_type(&mut response, request);
            }

            transaction.respond(response.clone())?;
            debug!(parent: &self.span, "Sent {} {}", code, response.reason());

            inner.response = Some(response.clone());
            inner.status = next;
            (next, transitioned, response)
        };

        if transitioned {
            self.notify(None, Some(&response), next);
        }
        Ok(next)
    }

    /// End the session with whatever signaling its state calls for
    ///
    /// Before an answer the INVITE is canceled (outgoing) or refused with
    /// `code`/`reason` (incoming); afterwards a BYE is sent. Fails with an
    /// already-terminated [`SessionError::InvalidTransition`] once the
    /// session is terminal.
    pub fn end(&self, code: u16, reason: &str) -> Result<SessionState> {
        let _gate = self.gate.lock();
        let (next, request, response) = {
            let mut inner = self.inner.lock();
            let status = inner.status;

            match status {
                s if s.is_terminal() => {
                    warn!(parent: &self.span, "End refused: session already {}", s);
                    return Err(SessionError::InvalidTransition {
                        from: s,
                        operation: "end",
                    });
                }
                SessionState::Null => {
                    let next = self.next_state(&inner, SessionEvent::Cancel, "end")?;
                    info!(parent: &self.span, "Canceling session before any signaling");
                    inner.status = next;
                    (next, None, None)
                }
                SessionState::InviteSent | SessionState::Provisional | SessionState::EarlyMedia => {
                    let next = self.next_state(&inner, SessionEvent::Cancel, "end")?;
                    let Some(Transaction::Client(invite)) = inner.transaction.clone() else {
                        return Err(self.role_error(&inner, TransactionRole::Client));
                    };
                    info!(parent: &self.span, "Canceling session");
                    let cancel = cancel_for(&invite.request);
                    let (_, events) = self.ctx.layer.send_request(cancel.clone(), &invite.destination)?;
                    self.watch_outcome(Method::Cancel, events);
                    inner.status = next;
                    (next, Some(cancel), None)
                }
                SessionState::InviteReceived | SessionState::WaitingForAnswer => {
                    if code < 300 {
                        return Err(SessionError::InvalidArgument(format!(
                            "end before answer needs a 3xx-6xx code, got {}",
                            code
                        )));
                    }
                    let transaction = self.server_transaction(&inner)?;
                    let next = self.next_state(&inner, SessionEvent::Reject, "end")?;
                    info!(parent: &self.span, "Rejecting session");
                    let response = self.final_failure(&mut inner, &transaction, code, reason)?;
                    inner.status = next;
                    (next, None, Some(response))
                }
                SessionState::Answered => {
                    // The 2xx is out, so only a BYE can end it
                    let next = self.next_state(&inner, SessionEvent::Reject, "end")?;
                    info!(parent: &self.span, "Terminating answered session before ACK");
                    let bye = self.send_bye(&mut inner)?;
                    inner.status = next;
                    (next, Some(bye), None)
                }
                SessionState::WaitingForAck | SessionState::Confirmed => {
                    let next = self.next_state(&inner, SessionEvent::Bye, "end")?;
                    info!(parent: &self.span, "Terminating session");
                    let bye = self.send_bye(&mut inner)?;
                    inner.status = next;
                    (next, Some(bye), None)
                }
                other => {
                    return Err(SessionError::InvalidTransition {
                        from: other,
                        operation: "end",
                    })
                }
            }
        };

        self.notify(request.as_ref(), response.as_ref(), next);
        Ok(next)
    }

    /// 3xx redirection of the received INVITE
    pub fn redirect(&self, _target: &Uri, _code: u16) -> Result<SessionState> {
        Err(SessionError::NotImplemented("redirect"))
    }

    /// Mid-dialog INFO
    pub fn info(&self, _content_type: &str, _body: &[u8]) -> Result<()> {
        Err(SessionError::NotImplemented("info"))
    }

    /// Hand the INVITE to the transaction layer and enter InviteSent
    pub(crate) fn send_invite(&self) -> Result<TransactionEvents> {
        let _gate = self.gate.lock();
        let (next, invite, events) = {
            let mut inner = self.inner.lock();
            let next = self.next_state(&inner, SessionEvent::InviteSent, "invite")?;
            let invite = inner.request.clone().ok_or_else(|| {
                SessionError::InvalidArgument("no INVITE to send".into())
            })?;
            let (transaction, events) = self
                .ctx
                .layer
                .send_request(invite.clone(), &inner.dialog.next_hop)?;
            info!(parent: &self.span, "INVITE sent to {}", transaction.destination);

            inner.transaction = Some(Transaction::Client(transaction));
            inner.status = next;
            (next, invite, events)
        };

        self.notify(Some(&invite), None, next);
        Ok(events)
    }

    /// Enter InviteReceived for the INVITE the session was created from
    pub(crate) fn receive_invite(&self) -> Result<SessionState> {
        let request = self.request();
        self.apply(SessionEvent::InviteReceived, request, None)
    }

    /// 1xx on the INVITE transaction
    pub(crate) fn receive_provisional(&self, response: SipResponse) -> Result<SessionState> {
        let _gate = self.gate.lock();
        if response.status_code() == 100 {
            return Ok(self.status());
        }
        match parse_sdp(response.body()) {
            Some(sdp) => {
                {
                    let mut inner = self.inner.lock();
                    // A dropped 1xx must not replace the stored answer
                    if inner.status.next(self.direction, SessionEvent::EarlyMediaReceived).is_some() {
                        inner.media.provide_answer(sdp);
                    }
                }
                self.apply(SessionEvent::EarlyMediaReceived, None, Some(response))
            }
            None => self.apply(SessionEvent::ProvisionalReceived, None, Some(response)),
        }
    }

    /// 2xx on the INVITE transaction: store the answer, ACK, confirm
    pub(crate) fn receive_success(&self, response: SipResponse) -> Result<SessionState> {
        let _gate = self.gate.lock();
        let status = self.status();

        match status {
            SessionState::InviteSent | SessionState::Provisional | SessionState::EarlyMedia => {
                let ack = {
                    let mut inner = self.inner.lock();
                    self.next_state(&inner, SessionEvent::SuccessReceived, "2xx")?;
                    update_dialog(&mut inner.dialog, &response);
                    if let Some(sdp) = parse_sdp(response.body()) {
                        inner.media.provide_answer(sdp);
                    }
                    // ACK leaves before the handler hears about WaitingForACK
                    self.send_ack(&mut inner)?
                };
                self.apply(SessionEvent::SuccessReceived, None, Some(response))?;
                self.apply(SessionEvent::AckSent, Some(ack), None)
            }
            SessionState::WaitingForAck | SessionState::Confirmed => {
                debug!(parent: &self.span, "Retransmitted 2xx, ACKing again");
                let mut inner = self.inner.lock();
                self.send_ack(&mut inner)?;
                Ok(inner.status)
            }
            SessionState::Canceled => {
                // CANCEL lost the race with the 2xx
                info!(parent: &self.span, "2xx after cancel, sending ACK and BYE");
                let mut inner = self.inner.lock();
                update_dialog(&mut inner.dialog, &response);
                self.send_ack(&mut inner)?;
                self.send_bye(&mut inner)?;
                Ok(inner.status)
            }
            other => {
                debug!(parent: &self.span, "Dropping 2xx in {}", other);
                Err(SessionError::UnrecognizedEvent {
                    state: other,
                    event: SessionEvent::SuccessReceived.to_string(),
                })
            }
        }
    }

    /// 3xx-6xx on the INVITE transaction
    pub(crate) fn receive_failure(&self, response: SipResponse) -> Result<SessionState> {
        self.apply(SessionEvent::FailureReceived, None, Some(response))
    }

    /// INVITE transaction timed out or could not be sent
    pub(crate) fn transaction_failed(&self, reason: &str) -> Result<SessionState> {
        warn!(parent: &self.span, "INVITE transaction failed: {}", reason);
        self.apply(SessionEvent::FailureReceived, None, None)
    }

    pub(crate) fn receive_ack(&self, ack: SipRequest) -> Result<SessionState> {
        self.apply(SessionEvent::AckReceived, Some(ack), None)
    }

    /// Peer canceled the INVITE. The CANCEL itself is answered by the
    /// caller; here the INVITE gets its 487.
    pub(crate) fn receive_cancel(&self, cancel: SipRequest) -> Result<SessionState> {
        let _gate = self.gate.lock();
        let (next, response) = {
            let mut inner = self.inner.lock();
            let next = self.next_state(&inner, SessionEvent::Cancel, "cancel")?;
            let transaction = self.server_transaction(&inner)?;
            let response = self.final_failure(&mut inner, &transaction, 487, "")?;
            inner.request = Some(cancel.clone());
            inner.status = next;
            (next, response)
        };

        self.notify(Some(&cancel), Some(&response), next);
        Ok(next)
    }

    /// Peer sent BYE. Answers it with 200 and terminates, or 481 when the
    /// dialog cannot be torn down from its current state.
    pub(crate) fn receive_bye(
        &self,
        bye: SipRequest,
        transaction: Arc<dyn ServerTransaction>,
    ) -> Result<SessionState> {
        let _gate = self.gate.lock();
        if self.status() == SessionState::Answered {
            // The ACK is late or lost; the BYE proves the caller got the 2xx
            debug!(parent: &self.span, "BYE before ACK, taking it as the ACK");
            self.apply(SessionEvent::AckReceived, None, None)?;
        }
        let (next, response) = {
            let mut inner = self.inner.lock();
            let next = match self.next_state(&inner, SessionEvent::Bye, "bye") {
                Ok(next) => next,
                Err(e) => {
                    let refusal = ResponseBuilder::new(481).build_for_request(&bye);
                    transaction.respond(refusal)?;
                    return Err(e);
                }
            };
            let response = ResponseBuilder::ok()
                .header(Header::UserAgent(self.ctx.user_agent.clone().into()))
                .build_for_request(&bye);
            transaction.respond(response.clone())?;
            inner.request = Some(bye.clone());
            inner.response = Some(response.clone());
            inner.status = next;
            (next, response)
        };

        self.notify(Some(&bye), Some(&response), next);
        Ok(next)
    }

    /// Apply a network-driven transition and notify the observer
    pub(crate) fn apply(
        &self,
        event: SessionEvent,
        request: Option<SipRequest>,
        response: Option<SipResponse>,
    ) -> Result<SessionState> {
        let _gate = self.gate.lock();
        let next = {
            let mut inner = self.inner.lock();
            let Some(next) = inner.status.next(self.direction, event) else {
                debug!(parent: &self.span, "Dropping {} in {}", event, inner.status);
                return Err(SessionError::UnrecognizedEvent {
                    state: inner.status,
                    event: event.to_string(),
                });
            };
            if let Some(request) = &request {
                inner.request = Some(request.clone());
            }
            if let Some(response) = &response {
                if self.direction == Direction::Outgoing {
                    update_dialog(&mut inner.dialog, response);
                }
                inner.response = Some(response.clone());
            }
            inner.status = next;
            next
        };

        self.notify(request.as_ref(), response.as_ref(), next);
        Ok(next)
    }

    /// Resend the stored 2xx while the ACK is outstanding. Returns false
    /// once the session has left Answered.
    pub(crate) fn retransmit_success(&self) -> bool {
        let _gate = self.gate.lock();
        let inner = self.inner.lock();
        if inner.status != SessionState::Answered {
            return false;
        }
        let (Some(response), Some(Transaction::Server(transaction))) =
            (inner.response.clone(), inner.transaction.clone())
        else {
            return false;
        };
        match transaction.respond(response) {
            Ok(()) => debug!(parent: &self.span, "Retransmitted 2xx, ACK still outstanding"),
            Err(e) => debug!(parent: &self.span, "2xx retransmission failed: {}", e),
        }
        true
    }

    /// No ACK arrived within 64*T1: the dialog is torn down with a BYE
    pub(crate) fn ack_timed_out(&self) -> Result<SessionState> {
        let _gate = self.gate.lock();
        let status = self.status();
        if status != SessionState::Answered {
            return Ok(status);
        }
        warn!(parent: &self.span, "No ACK for the 2xx, ending session");
        self.end(0, "")
    }

    fn start_success_retransmission(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(retransmit_success(self.me.clone(), self.ctx.timers));
            }
            Err(_) => debug!(parent: &self.span, "No runtime, 2xx will not be retransmitted"),
        }
    }

    /// Log how a CANCEL or BYE transaction ended
    fn watch_outcome(&self, method: Method, events: TransactionEvents) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let span = self.span.clone();
        runtime.spawn(async move {
            match final_outcome(events).await {
                Some(TransactionEvent::Response(response)) => debug!(
                    parent: &span,
                    "{} answered {} {}",
                    method,
                    response.status_code(),
                    response.reason()
                ),
                Some(TransactionEvent::Timeout) => debug!(parent: &span, "{} timed out", method),
                Some(TransactionEvent::TransportError(e)) => {
                    debug!(parent: &span, "{} not delivered: {}", method, e)
                }
                None => debug!(parent: &span, "{} transaction dropped", method),
            }
        });
    }

    fn notify(&self, request: Option<&SipRequest>, response: Option<&SipResponse>, state: SessionState) {
        info!(parent: &self.span, "Session state => {}", state);
        let Some(observer) = self.ctx.observer.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        if let Some(me) = self.me.upgrade() {
            observer.on_transition(&me, request, response, state);
        }
    }

    fn next_state(
        &self,
        inner: &SessionInner,
        event: SessionEvent,
        operation: &'static str,
    ) -> Result<SessionState> {
        inner.status.next(self.direction, event).ok_or_else(|| {
            warn!(parent: &self.span, "Invalid status: {} in {}", operation, inner.status);
            SessionError::InvalidTransition {
                from: inner.status,
                operation,
            }
        })
    }

    fn server_transaction(&self, inner: &SessionInner) -> Result<Arc<dyn ServerTransaction>> {
        match &inner.transaction {
            Some(Transaction::Server(tx)) => Ok(tx.clone()),
            _ => Err(self.role_error(inner, TransactionRole::Server)),
        }
    }

    fn role_error(&self, inner: &SessionInner, expected: TransactionRole) -> SessionError {
        let err = SessionError::InvalidTransactionRole {
            expected,
            actual: inner.transaction.as_ref().map(Transaction::role),
        };
        error!(parent: &self.span, "{}", err);
        err
    }

    fn final_failure(
        &self,
        inner: &mut SessionInner,
        transaction: &Arc<dyn ServerTransaction>,
        code: u16,
        reason: &str,
    ) -> Result<SipResponse> {
        let response = ResponseBuilder::new(code)
            .reason(reason)
            .to_tag(inner.dialog.local_tag.clone())
            .build_for_request(transaction.request());
        transaction.respond(response.clone())?;
        info!(parent: &self.span, "Rejected with {} {}", code, response.reason());
        inner.response = Some(response.clone());
        Ok(response)
    }

    fn send_ack(&self, inner: &mut SessionInner) -> Result<SipRequest> {
        let dialog = &inner.dialog;
        let uri = dialog
            .remote_target
            .clone()
            .unwrap_or_else(|| dialog.request_uri.clone());
        let ack = RequestBuilder::new(Method::Ack, uri)
            .via(self.ctx.layer.local_addr(), &TransactionId::generate_branch())
            .from(&dialog.local_party, &dialog.local_tag)
            .to(&dialog.remote_party)
            .call_id(&self.id)
            .cseq(dialog.invite_cseq)
            .header(Header::UserAgent(self.ctx.user_agent.clone().into()))
            .build();
        self.ctx.layer.send_ack(ack.clone(), &dialog.next_hop)?;
        debug!(parent: &self.span, "ACK sent to {}", dialog.next_hop);
        Ok(ack)
    }

    fn send_bye(&self, inner: &mut SessionInner) -> Result<SipRequest> {
        let cseq = inner.dialog.local_cseq + 1;
        let dialog = &inner.dialog;
        let uri = dialog
            .remote_target
            .clone()
            .unwrap_or_else(|| dialog.request_uri.clone());
        let bye = RequestBuilder::new(Method::Bye, uri)
            .via(self.ctx.layer.local_addr(), &TransactionId::generate_branch())
            .from(&dialog.local_party, &dialog.local_tag)
            .to(&dialog.remote_party)
            .call_id(&self.id)
            .cseq(cseq)
            .header(Header::UserAgent(self.ctx.user_agent.clone().into()))
            .build();
        let (transaction, events) = self.ctx.layer.send_request(bye.clone(), &dialog.next_hop)?;
        debug!(parent: &self.span, "BYE sent to {}", transaction.destination);
        self.watch_outcome(Method::Bye, events);

        inner.dialog.local_cseq = cseq;
        inner.request = Some(bye.clone());
        inner.transaction = Some(Transaction::Client(transaction));
        Ok(bye)
    }
}

/// Resend the 2xx at T1, doubling up to T2, until the session leaves
/// Answered. At 64*T1 the missing ACK ends the session.
async fn retransmit_success(session: Weak<Session>, timers: SipTimers) {
    let deadline = Instant::now() + timers.t1 * 64;
    let mut interval = timers.t1;
    loop {
        sleep_until((Instant::now() + interval).min(deadline)).await;
        let Some(session) = session.upgrade() else { return };
        if Instant::now() >= deadline {
            if let Err(e) = session.ack_timed_out() {
                debug!(parent: session.span(), "ACK timeout not applied: {}", e);
            }
            return;
        }
        if !session.retransmit_success() {
            return;
        }
        interval = (interval * 2).min(timers.t2);
    }
}

/// First final outcome of a client transaction; 1xx are skipped
async fn final_outcome(mut events: TransactionEvents) -> Option<TransactionEvent> {
    while let Some(event) = events.recv().await {
        match event {
            TransactionEvent::Response(response) if response.is_provisional() => continue,
            other => return Some(other),
        }
    }
    None
}

/// Learn the remote tag and target from a response to our INVITE
fn update_dialog(dialog: &mut Dialog, response: &SipResponse) {
    if response.to_tag().is_some() {
        if let Some(to) = response.to_header() {
            dialog.remote_party = to;
        }
    }
    if let Some(contact) = response.contact_uri() {
        if let Ok(uri) = Uri::try_from(contact.as_str()) {
            dialog.next_hop = host_port(&uri);
            dialog.remote_target = Some(uri);
        }
    }
}

/// Copy the request's Content-Type, or declare SDP when it has none
fn set_sdp_content_type(response: &mut SipResponse, request: &SipRequest) {
    if request.content_type().is_some() {
        copy_headers("Content-Type", request, response);
    } else {
        response.append_header(Header::ContentType(SDP_CONTENT_TYPE.into()));
    }
}

fn parse_sdp(body: &[u8]) -> Option<SdpSession> {
    if body.is_empty() {
        return None;
    }
    std::str::from_utf8(body).ok().and_then(SdpSession::parse)
}

fn strip_tag(value: &str) -> String {
    match value.rfind(";tag=") {
        Some(pos) if value[..pos].contains('>') || !value.contains('<') => value[..pos].to_string(),
        _ => value.to_string(),
    }
}
