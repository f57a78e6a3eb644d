//! Routes transaction-layer events to sessions
//!
//! Inbound requests are looked up by Call-ID; INVITEs with no match create
//! a session. Client transaction events arrive with the session they
//! belong to. Every applied transition comes back through
//! [`SessionObserver`], where the application handler runs and terminal
//! sessions leave the registry.

use crate::application::registry::SessionRegistry;
use crate::application::session::{Session, SessionContext, SessionObserver};
use crate::domain::session::SessionState;
use crate::domain::shared::value_objects::Direction;
use crate::infrastructure::metrics;
use crate::infrastructure::protocols::sip::{
    IncomingRequest, ResponseBuilder, ServerTransaction, SipHeaders, SipRequest, SipResponse,
    SipTimers, TransactionEvent, TransactionLayer,
};
use parking_lot::RwLock;
use rsip::{Header, Method};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn, Span};

/// Application callback run once per applied transition
pub type InviteStateHandler = Arc<
    dyn Fn(&Arc<Session>, Option<&SipRequest>, Option<&SipResponse>, SessionState) + Send + Sync,
>;

pub(crate) const ALLOW: &str = "INVITE, ACK, CANCEL, BYE, OPTIONS";

pub struct Dispatcher {
    me: Weak<Dispatcher>,
    registry: SessionRegistry,
    layer: Arc<dyn TransactionLayer>,
    user_agent: String,
    timers: SipTimers,
    handler: RwLock<Option<InviteStateHandler>>,
    span: Span,
}

impl Dispatcher {
    pub fn new(
        layer: Arc<dyn TransactionLayer>,
        user_agent: String,
        timers: SipTimers,
        span: Span,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Dispatcher {
            me: me.clone(),
            registry: SessionRegistry::new(),
            layer,
            user_agent,
            timers,
            handler: RwLock::new(None),
            span,
        })
    }

    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&Arc<Session>, Option<&SipRequest>, Option<&SipResponse>, SessionState)
            + Send
            + Sync
            + 'static,
    {
        let handler: InviteStateHandler = Arc::new(handler);
        *self.handler.write() = Some(handler);
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Collaborators handed to every session this dispatcher owns
    pub fn context(&self) -> SessionContext {
        let observer: Weak<dyn SessionObserver> = self.me.clone();
        SessionContext {
            layer: self.layer.clone(),
            observer: Some(observer),
            user_agent: self.user_agent.clone(),
            timers: self.timers,
            span: self.span.clone(),
        }
    }

    /// Register a new session, keeping the active gauge current
    pub fn track(&self, session: Arc<Session>) -> crate::domain::Result<()> {
        let direction = session.direction();
        self.registry.insert(session)?;
        metrics::record_call(direction);
        metrics::update_active_sessions(self.registry.len());
        Ok(())
    }

    pub fn untrack(&self, session: &Arc<Session>) {
        if self.registry.remove_session(session) {
            metrics::update_active_sessions(self.registry.len());
        }
    }

    /// Route one request received from the network
    pub fn handle_request(&self, incoming: IncomingRequest) {
        let IncomingRequest {
            request,
            source,
            transaction,
        } = incoming;
        debug!(parent: &self.span, "Received {} from {}", request.short(), source);

        let Some(call_id) = request.call_id() else {
            warn!(parent: &self.span, "Dropping {} without Call-ID", request.method());
            return;
        };

        if request.method() == &Method::Ack {
            match self.registry.get(&call_id) {
                Some(session) => {
                    if let Err(e) = session.receive_ack(request) {
                        debug!(parent: session.span(), "ACK not applied: {}", e);
                    }
                }
                None => debug!(parent: &self.span, "ACK for unknown call {}", call_id),
            }
            return;
        }

        let Some(transaction) = transaction else {
            warn!(parent: &self.span, "Dropping {} without a server transaction", request.short());
            return;
        };

        match request.method() {
            Method::Invite => match self.registry.get(&call_id) {
                Some(_) => {
                    // Renegotiation is not supported
                    debug!(parent: &self.span, "Refusing re-INVITE for {}", call_id);
                    self.reply(&transaction, 488);
                }
                None => self.on_invite(transaction, source),
            },
            Method::Cancel => match self.registry.get(&call_id) {
                Some(session) if session.direction() == Direction::Incoming => {
                    self.reply(&transaction, 200);
                    if let Err(e) = session.receive_cancel(request) {
                        debug!(parent: session.span(), "CANCEL had no effect: {}", e);
                    }
                }
                _ => self.reply(&transaction, 481),
            },
            Method::Bye => match self.registry.get(&call_id) {
                Some(session) => {
                    if let Err(e) = session.receive_bye(request, transaction) {
                        debug!(parent: session.span(), "BYE refused: {}", e);
                    }
                }
                None => self.reply(&transaction, 481),
            },
            Method::Options => {
                let response = ResponseBuilder::ok()
                    .header(Header::Allow(ALLOW.into()))
                    .header(Header::Accept("application/sdp".into()))
                    .header(Header::UserAgent(self.user_agent.clone().into()))
                    .build_for_request(&request);
                if let Err(e) = transaction.respond(response) {
                    warn!(parent: &self.span, "Failed to answer OPTIONS: {}", e);
                }
            }
            other => {
                debug!(parent: &self.span, "Method {} not implemented", other);
                self.reply(&transaction, 501);
            }
        }
    }

    /// Route one event of an INVITE client transaction to its session
    pub fn handle_transaction_event(&self, session: &Arc<Session>, event: TransactionEvent) {
        let result = match event {
            TransactionEvent::Response(response) if response.is_provisional() => {
                session.receive_provisional(response)
            }
            TransactionEvent::Response(response) if response.is_success() => {
                session.receive_success(response)
            }
            TransactionEvent::Response(response) => session.receive_failure(response),
            TransactionEvent::Timeout => session.transaction_failed("timeout"),
            TransactionEvent::TransportError(e) => session.transaction_failed(&e),
        };
        if let Err(e) = result {
            debug!(parent: session.span(), "Transaction event dropped: {}", e);
        }
    }

    fn on_invite(&self, transaction: Arc<dyn ServerTransaction>, source: std::net::SocketAddr) {
        let session = match Session::incoming(self.context(), transaction.clone(), source) {
            Ok(session) => session,
            Err(e) => {
                warn!(parent: &self.span, "Malformed INVITE: {}", e);
                self.reply(&transaction, 400);
                return;
            }
        };
        if let Err(e) = self.track(session.clone()) {
            debug!(parent: &self.span, "{}", e);
            self.reply(&transaction, 488);
            return;
        }
        info!(parent: session.span(), "Incoming call from {}", source);
        if let Err(e) = session.receive_invite() {
            warn!(parent: session.span(), "INVITE not applied: {}", e);
        }
    }

    fn reply(&self, transaction: &Arc<dyn ServerTransaction>, code: u16) {
        let response = ResponseBuilder::new(code)
            .header(Header::UserAgent(self.user_agent.clone().into()))
            .build_for_request(transaction.request());
        if let Err(e) = transaction.respond(response) {
            warn!(parent: &self.span, "Failed to send {}: {}", code, e);
        }
    }
}

impl SessionObserver for Dispatcher {
    fn on_transition(
        &self,
        session: &Arc<Session>,
        request: Option<&SipRequest>,
        response: Option<&SipResponse>,
        state: SessionState,
    ) {
        metrics::record_transition(state);

        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(session, request, response, state);
        }

        if state.is_terminal() {
            self.untrack(session);
            debug!(parent: session.span(), "Session removed after {}", state);
        }
    }
}
