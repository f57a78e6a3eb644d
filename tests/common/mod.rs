//! Recording fakes for the transaction layer

#![allow(dead_code)]

use parking_lot::Mutex;
use rsip::{Header, Method, Uri};
use sipua::application::Session;
use sipua::domain::account::{AuthInfo, Profile};
use sipua::domain::session::SessionState;
use sipua::domain::shared::value_objects::CallId;
use sipua::infrastructure::protocols::sip::{
    ClientTransaction, IncomingRequest, RequestBuilder, ResponseBuilder, SdpSession,
    ServerTransaction, SipError, SipHeaders, SipRequest, SipResponse, TransactionEvent,
    TransactionEvents, TransactionId, TransactionLayer,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const LOCAL: &str = "127.0.0.1:5080";
pub const REMOTE: &str = "127.0.0.1:5090";

/// Transaction layer that records what it is asked to send
#[derive(Default)]
pub struct FakeLayer {
    requests: Mutex<Vec<(SipRequest, String)>>,
    events: Mutex<Vec<mpsc::UnboundedSender<TransactionEvent>>>,
    acks: Mutex<Vec<(SipRequest, String)>>,
    failing: AtomicBool,
}

impl FakeLayer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every following send fail
    pub fn fail_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<SipRequest> {
        self.requests.lock().iter().map(|(r, _)| r.clone()).collect()
    }

    pub fn request(&self, index: usize) -> (SipRequest, String) {
        self.requests.lock()[index].clone()
    }

    pub fn methods(&self) -> Vec<Method> {
        self.requests
            .lock()
            .iter()
            .map(|(r, _)| r.method().clone())
            .collect()
    }

    pub fn acks(&self) -> Vec<(SipRequest, String)> {
        self.acks.lock().clone()
    }

    /// Index of the first request sent for `call_id`
    pub fn index_of(&self, call_id: &CallId, method: Method) -> Option<usize> {
        self.requests.lock().iter().position(|(r, _)| {
            r.method() == &method && r.call_id().as_ref() == Some(call_id)
        })
    }

    /// Deliver an event on the transaction of request `index`
    pub fn deliver(&self, index: usize, event: TransactionEvent) {
        let events = self.events.lock();
        events[index].send(event).unwrap();
    }

    /// Wait until at least `count` requests have been sent
    pub async fn wait_for_requests(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.requests.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("request was never sent");
    }
}

impl TransactionLayer for FakeLayer {
    fn local_addr(&self) -> SocketAddr {
        LOCAL.parse().unwrap()
    }

    fn send_request(
        &self,
        request: SipRequest,
        destination: &str,
    ) -> Result<(ClientTransaction, TransactionEvents), SipError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SipError::TransportError("network unreachable".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut requests = self.requests.lock();
        let mut events = self.events.lock();
        requests.push((request.clone(), destination.to_string()));
        events.push(tx);
        Ok((
            ClientTransaction {
                id: TransactionId::for_request(&request)?,
                request,
                destination: destination.to_string(),
            },
            rx,
        ))
    }

    fn send_ack(&self, request: SipRequest, destination: &str) -> Result<(), SipError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SipError::TransportError("network unreachable".into()));
        }
        self.acks.lock().push((request, destination.to_string()));
        Ok(())
    }
}

/// Server transaction that records its responses
pub struct FakeServerTransaction {
    id: TransactionId,
    request: SipRequest,
    responses: Mutex<Vec<SipResponse>>,
}

impl FakeServerTransaction {
    pub fn new(request: SipRequest) -> Arc<Self> {
        Arc::new(Self {
            id: TransactionId::for_request(&request).unwrap(),
            request,
            responses: Mutex::new(Vec::new()),
        })
    }

    pub fn responses(&self) -> Vec<SipResponse> {
        self.responses.lock().clone()
    }

    pub fn codes(&self) -> Vec<u16> {
        self.responses.lock().iter().map(|r| r.status_code()).collect()
    }
}

impl ServerTransaction for FakeServerTransaction {
    fn id(&self) -> &TransactionId {
        &self.id
    }

    fn request(&self) -> &SipRequest {
        &self.request
    }

    fn respond(&self, response: SipResponse) -> Result<(), SipError> {
        self.responses.lock().push(response);
        Ok(())
    }
}

pub fn sdp(port: u16) -> SdpSession {
    SdpSession::create_audio_session(IpAddr::from([127, 0, 0, 1]), port)
}

pub fn profile() -> Profile {
    Profile::new(
        Uri::try_from("sip:100@127.0.0.1").unwrap(),
        "goSIP",
        AuthInfo {
            auth_user: "100".into(),
            password: "100".into(),
            realm: String::new(),
        },
        1800,
    )
}

pub fn uri(value: &str) -> Uri {
    Uri::try_from(value).unwrap()
}

/// Request from the remote party for an existing or new call
pub fn remote_request(method: Method, call_id: &str, cseq: u32, body: Option<&SdpSession>) -> SipRequest {
    let mut builder = RequestBuilder::new(method, uri("sip:100@127.0.0.1:5080"))
        .via(REMOTE.parse().unwrap(), &TransactionId::generate_branch())
        .from("<sip:400@127.0.0.1>", "remote")
        .to("<sip:100@127.0.0.1>")
        .call_id(&CallId::new(call_id))
        .cseq(cseq)
        .contact("sip:400@127.0.0.1:5090");
    if let Some(sdp) = body {
        builder = builder.body(sdp.to_bytes(), "application/sdp");
    }
    builder.build()
}

/// CANCEL matching a received INVITE
pub fn cancel_of(invite: &SipRequest) -> SipRequest {
    sipua::infrastructure::protocols::sip::builder::cancel_for(invite)
}

/// An inbound request with a recording server transaction
pub fn inbound(request: SipRequest) -> (IncomingRequest, Arc<FakeServerTransaction>) {
    let tx = FakeServerTransaction::new(request.clone());
    let transaction: Arc<dyn ServerTransaction> = tx.clone();
    (
        IncomingRequest {
            request,
            source: REMOTE.parse().unwrap(),
            transaction: Some(transaction),
        },
        tx,
    )
}

/// A 2xx ACK, which travels without a transaction
pub fn inbound_ack(call_id: &str) -> IncomingRequest {
    IncomingRequest {
        request: remote_request(Method::Ack, call_id, 1, None),
        source: REMOTE.parse().unwrap(),
        transaction: None,
    }
}

/// Response of the remote party to one of our requests
pub fn remote_response(request: &SipRequest, code: u16, body: Option<&SdpSession>) -> SipResponse {
    let mut builder = ResponseBuilder::new(code)
        .to_tag("callee")
        .header(Header::Contact("<sip:400@127.0.0.1:5090>".into()));
    if let Some(sdp) = body {
        builder = builder
            .header(Header::ContentType("application/sdp".into()))
            .body(sdp.to_bytes());
    }
    builder.build_for_request(request)
}

/// Handler sink collecting `(call-id, state)` pairs
pub type StateLog = mpsc::UnboundedReceiver<(CallId, SessionState)>;

pub fn state_sink() -> (
    impl Fn(&Arc<Session>, Option<&SipRequest>, Option<&SipResponse>, SessionState) + Send + Sync + 'static,
    StateLog,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |session: &Arc<Session>,
                        _request: Option<&SipRequest>,
                        _response: Option<&SipResponse>,
                        state: SessionState| {
        let _ = tx.send((session.id().clone(), state));
    };
    (handler, rx)
}

/// Next state reported to the handler
pub async fn next_state(log: &mut StateLog) -> (CallId, SessionState) {
    tokio::time::timeout(Duration::from_secs(2), log.recv())
        .await
        .expect("no state change within 2s")
        .expect("state log closed")
}

/// Wait until the handler reports `state` for `call_id`
pub async fn wait_for_state(log: &mut StateLog, call_id: &CallId, state: SessionState) {
    loop {
        let (id, seen) = next_state(log).await;
        if &id == call_id && seen == state {
            return;
        }
    }
}

/// Audio port announced by a description
pub fn audio_port(sdp: Option<SdpSession>) -> Option<u16> {
    sdp.and_then(|s| s.audio_addr()).map(|addr| addr.port())
}

/// Audio port announced by an SDP body
pub fn body_port(body: &[u8]) -> Option<u16> {
    audio_port(std::str::from_utf8(body).ok().and_then(SdpSession::parse))
}

/// Poll `check` until it holds. Handlers run before a terminal session
/// leaves the registry, so removal is observed shortly after the state.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}
