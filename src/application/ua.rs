//! User agent: call and registration entry points

use crate::application::dispatcher::{Dispatcher, ALLOW};
use crate::application::session::{new_tag, Session};
use crate::config::Config;
use crate::domain::account::{Profile, RegisterState};
use crate::domain::session::SessionState;
use crate::domain::shared::value_objects::CallId;
use crate::domain::shared::{Result, SessionError};
use crate::infrastructure::metrics;
use crate::infrastructure::protocols::sip::message::{header_param, host_port};
use crate::infrastructure::protocols::sip::stack::resolve;
use crate::infrastructure::protocols::sip::{
    IncomingRequest, RequestBuilder, SdpSession, SipHeaders, SipRequest, SipResponse, SipTimers,
    TransactionEvent, TransactionEvents, TransactionId, TransactionLayer,
};
use parking_lot::{Mutex, RwLock};
use rsip::{Header, Method, Uri};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Span};

pub type RegisterStateHandler = Arc<dyn Fn(&RegisterState) + Send + Sync>;

/// Status used when shutdown ends a call that was never answered
const SHUTDOWN_STATUS: u16 = 480;

pub struct UserAgent {
    config: Config,
    layer: Arc<dyn TransactionLayer>,
    dispatcher: Arc<Dispatcher>,
    register_handler: RwLock<Option<RegisterStateHandler>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    span: Span,
}

impl UserAgent {
    pub fn new(config: Config, layer: Arc<dyn TransactionLayer>, span: Span) -> Self {
        let dispatcher = Dispatcher::new(
            layer.clone(),
            config.ua.user_agent.clone(),
            SipTimers::from(&config.sip.timers),
            span.clone(),
        );
        Self {
            config,
            layer,
            dispatcher,
            register_handler: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
            span,
        }
    }

    /// Callback run on every session transition
    pub fn set_invite_state_handler<F>(&self, handler: F)
    where
        F: Fn(&Arc<Session>, Option<&SipRequest>, Option<&SipResponse>, SessionState)
            + Send
            + Sync
            + 'static,
    {
        self.dispatcher.set_handler(handler);
    }

    pub fn set_register_state_handler<F>(&self, handler: F)
    where
        F: Fn(&RegisterState) + Send + Sync + 'static,
    {
        let handler: RegisterStateHandler = Arc::new(handler);
        *self.register_handler.write() = Some(handler);
    }

    /// Dispatch requests from `incoming` until the channel closes.
    /// Requests are handled in arrival order.
    pub fn serve(&self, mut incoming: mpsc::UnboundedReceiver<IncomingRequest>) {
        let dispatcher = self.dispatcher.clone();
        let task = tokio::spawn(async move {
            while let Some(request) = incoming.recv().await {
                dispatcher.handle_request(request);
            }
            debug!("Inbound request channel closed");
        });
        self.track_task(task);
    }

    /// Place a call to `target` through `recipient` (registrar or proxy)
    pub async fn invite(
        &self,
        profile: &Profile,
        target: &Uri,
        recipient: &Uri,
        offer: SdpSession,
    ) -> Result<Arc<Session>> {
        let destination = host_port(recipient);
        resolve(&destination).await?;

        let local = self.layer.local_addr();
        let call_id = CallId::generate(&local.ip().to_string());
        let contact = format!("sip:{}@{}", profile.user(), local);

        let mut builder = RequestBuilder::new(Method::Invite, target.clone())
            .via(local, &TransactionId::generate_branch())
            .from(&profile.name_addr(), &new_tag())
            .to(&format!("<{}>", target))
            .call_id(&call_id)
            .cseq(1)
            .contact(&contact)
            .header(Header::Allow(ALLOW.into()))
            .header(Header::UserAgent(self.config.ua.user_agent.clone().into()));
        if !self.config.ua.supported.is_empty() {
            builder = builder.header(Header::Supported(self.config.ua.supported.join(", ").into()));
        }
        let invite = builder.body(offer.to_bytes(), "application/sdp").build();

        let session = Session::outgoing(self.dispatcher.context(), invite, offer, destination, contact)?;
        self.dispatcher.track(session.clone())?;
        info!(parent: session.span(), "Calling {} via {}", target, recipient);

        let events = match session.send_invite() {
            Ok(events) => events,
            Err(e) => {
                warn!(parent: session.span(), "INVITE not sent: {}", e);
                self.dispatcher.untrack(&session);
                return Err(e);
            }
        };

        let task = tokio::spawn(drive_client_transaction(
            self.dispatcher.clone(),
            session.clone(),
            events,
        ));
        self.track_task(task);
        Ok(session)
    }

    /// Register `profile` with `recipient` for `expires` seconds; 0 removes
    /// the binding. Digest challenges are reported, not answered.
    pub async fn send_register(
        &self,
        profile: &Profile,
        recipient: &Uri,
        expires: u32,
    ) -> Result<RegisterState> {
        let destination = host_port(recipient);
        resolve(&destination).await?;

        let local = self.layer.local_addr();
        let aor = profile.name_addr();
        let contact = format!("<sip:{}@{}>;expires={}", profile.user(), local, expires);
        let request = RequestBuilder::new(Method::Register, recipient.clone())
            .via(local, &TransactionId::generate_branch())
            .from(&aor, &new_tag())
            .to(&aor)
            .call_id(&CallId::generate(&local.ip().to_string()))
            .cseq(1)
            .header(Header::Contact(contact.into()))
            .header(Header::Expires(expires.to_string().into()))
            .header(Header::UserAgent(self.config.ua.user_agent.clone().into()))
            .build();

        let (_transaction, mut events) = self.layer.send_request(request, &destination)?;
        debug!(parent: &self.span, "REGISTER sent to {} (expires {})", destination, expires);

        let state = loop {
            match events.recv().await {
                Some(TransactionEvent::Response(response)) if response.is_provisional() => continue,
                Some(TransactionEvent::Response(response)) => {
                    let expiration = if response.is_success() {
                        granted_expiration(&response, expires)
                    } else {
                        0
                    };
                    break RegisterState {
                        account: profile.clone(),
                        status_code: response.status_code(),
                        reason: response.reason().to_string(),
                        expiration,
                    };
                }
                Some(TransactionEvent::Timeout) => {
                    break RegisterState {
                        account: profile.clone(),
                        status_code: 408,
                        reason: "Request Timeout".to_string(),
                        expiration: 0,
                    };
                }
                Some(TransactionEvent::TransportError(e)) => {
                    return Err(SessionError::TransportFailure(e));
                }
                None => {
                    return Err(SessionError::TransportFailure(
                        "REGISTER transaction ended without a final response".into(),
                    ));
                }
            }
        };

        metrics::record_registration(state.is_registered());
        info!(
            parent: &self.span,
            "Register {}: {} {} (expires {})",
            profile.uri,
            state.status_code,
            state.reason,
            state.expiration
        );

        let handler = self.register_handler.read().clone();
        if let Some(handler) = handler {
            handler(&state);
        }
        Ok(state)
    }

    pub fn session(&self, call_id: &CallId) -> Option<Arc<Session>> {
        self.dispatcher.registry().get(call_id)
    }

    pub fn session_count(&self) -> usize {
        self.dispatcher.registry().len()
    }

    /// End every live session and stop background tasks
    pub fn shutdown(&self) {
        for session in self.dispatcher.registry().sessions() {
            if let Err(e) = session.end(SHUTDOWN_STATUS, "") {
                debug!(parent: session.span(), "Not ended on shutdown: {}", e);
            }
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(parent: &self.span, "User agent stopped");
    }

    fn track_task(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }
}

/// Feed one INVITE client transaction's events to the dispatcher
async fn drive_client_transaction(
    dispatcher: Arc<Dispatcher>,
    session: Arc<Session>,
    mut events: TransactionEvents,
) {
    while let Some(event) = events.recv().await {
        dispatcher.handle_transaction_event(&session, event);
    }
    debug!(parent: session.span(), "INVITE transaction finished");
}

/// Lifetime granted by the registrar: Contact `expires` parameter, then
/// the Expires header, then what was asked for
fn granted_expiration(response: &SipResponse, requested: u32) -> u32 {
    response
        .header("Contact")
        .and_then(|contact| header_param(&contact, "expires"))
        .or_else(|| response.header("Expires"))
        .and_then(|value| value.parse().ok())
        .unwrap_or(requested)
}
