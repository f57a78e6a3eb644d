//! UDP SIP stack: transaction matching, timers and the wire
//!
//! Three background tasks share the stack: an inbound task feeding received
//! messages through the transaction table, an outbound task resolving
//! destinations and writing datagrams, and a timer task driving
//! retransmissions and timeouts.

use super::builder::{ack_for_failure, ResponseBuilder};
use super::layer::{
    ClientTransaction, IncomingRequest, ServerTransaction, TransactionEvent, TransactionEvents,
    TransactionLayer,
};
use super::message::{SipError, SipMessage, SipRequest, SipResponse};
use super::transaction::{SipTimers, SipTransaction, TransactionId, TransactionTimerAction};
use super::transport::{IncomingMessage, OutgoingMessage, Transport, UdpTransport};
use crate::config::SipConfig;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct Entry {
    fsm: SipTransaction,
    /// `host:port` for client transactions, the packet source for server ones
    destination: String,
    /// Present on client transactions
    events: Option<mpsc::UnboundedSender<TransactionEvent>>,
}

struct Outbound {
    data: Bytes,
    destination: String,
    transaction: Option<TransactionId>,
}

pub struct SipStack {
    me: Weak<SipStack>,
    advertised: SocketAddr,
    timers: SipTimers,
    transactions: DashMap<TransactionId, Entry>,
    outbound: mpsc::UnboundedSender<Outbound>,
    incoming_tx: mpsc::UnboundedSender<IncomingRequest>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<IncomingRequest>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SipStack {
    /// Bind the UDP transport and start the background tasks
    pub async fn bind(config: &SipConfig) -> Result<Arc<SipStack>, SipError> {
        let mut transport = UdpTransport::new(config.bind);
        let local = transport.start().await?;
        let inbound = transport
            .take_receiver()
            .ok_or_else(|| SipError::TransportError("Transport receiver already taken".into()))?;

        let advertised_ip = match config.public_ip {
            Some(ip) => ip,
            None if local.ip().is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            None => local.ip(),
        };
        let advertised = SocketAddr::new(advertised_ip, local.port());

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let stack = Arc::new_cyclic(|me| SipStack {
            me: me.clone(),
            advertised,
            timers: SipTimers::from(&config.timers),
            transactions: DashMap::new(),
            outbound,
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            tasks: Mutex::new(Vec::new()),
        });

        let tick = Duration::from_millis(config.timer_tick_ms.max(1));
        let tasks = vec![
            tokio::spawn(Self::inbound_loop(Arc::downgrade(&stack), inbound)),
            tokio::spawn(Self::outbound_loop(Arc::downgrade(&stack), transport, outbound_rx)),
            tokio::spawn(Self::timer_loop(Arc::downgrade(&stack), tick)),
        ];
        stack.tasks.lock().extend(tasks);

        info!("SIP stack bound on {} (advertised {})", local, advertised);
        Ok(stack)
    }

    /// Requests received from the network. Only the first call gets the
    /// receiver.
    pub fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<IncomingRequest>> {
        self.incoming_rx.lock().take()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Stop the background tasks. Pending transactions are dropped.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.transactions.clear();
        info!("SIP stack stopped");
    }

    async fn inbound_loop(weak: Weak<SipStack>, mut rx: mpsc::Receiver<IncomingMessage>) {
        while let Some(incoming) = rx.recv().await {
            let Some(stack) = weak.upgrade() else { break };
            match incoming.message {
                SipMessage::Response(response) => stack.handle_response(response),
                SipMessage::Request(request) => stack.handle_request(request, incoming.source),
            }
        }
    }

    async fn outbound_loop(
        weak: Weak<SipStack>,
        transport: UdpTransport,
        mut rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        while let Some(out) = rx.recv().await {
            let sent = match resolve(&out.destination).await {
                Ok(destination) => {
                    transport
                        .send(OutgoingMessage {
                            data: out.data,
                            destination,
                        })
                        .await
                }
                Err(e) => Err(e),
            };

            if let Err(e) = sent {
                warn!("Failed to send to {}: {}", out.destination, e);
                if let (Some(id), Some(stack)) = (out.transaction, weak.upgrade()) {
                    stack.fail_transaction(&id, e.to_string());
                }
            }
        }
    }

    async fn timer_loop(weak: Weak<SipStack>, tick: Duration) {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            let Some(stack) = weak.upgrade() else { break };
            stack.process_timers(Instant::now());
        }
    }

    fn enqueue(&self, data: Bytes, destination: String, transaction: Option<TransactionId>) -> Result<(), SipError> {
        self.outbound
            .send(Outbound {
                data,
                destination,
                transaction,
            })
            .map_err(|_| SipError::TransportError("SIP stack is shut down".into()))
    }

    fn fail_transaction(&self, id: &TransactionId, reason: String) {
        if let Some((_, entry)) = self.transactions.remove(id) {
            if let Some(events) = entry.events {
                let _ = events.send(TransactionEvent::TransportError(reason));
            }
        }
    }

    fn handle_response(&self, response: SipResponse) {
        let id = match TransactionId::for_response(&response) {
            Ok(id) => id,
            Err(e) => {
                warn!("Dropping response without transaction key: {}", e);
                return;
            }
        };

        let Some(mut entry) = self.transactions.get_mut(&id) else {
            debug!("Stray {} response for {}", response.status_code(), id);
            return;
        };

        let disposition = match entry.fsm.process_response(&response) {
            Ok(disposition) => disposition,
            Err(e) => {
                debug!("Transaction {} ignored response: {}", id, e);
                return;
            }
        };

        if disposition.send_ack {
            let ack = ack_for_failure(&entry.fsm.request, &response);
            let _ = self.enqueue(ack.to_bytes(), entry.destination.clone(), None);
        }
        if disposition.pass_up {
            if let Some(events) = &entry.events {
                let _ = events.send(TransactionEvent::Response(response));
            }
        }
    }

    fn handle_request(&self, request: SipRequest, source: SocketAddr) {
        let id = match TransactionId::for_request(&request) {
            Ok(id) => id,
            Err(e) => {
                warn!("Dropping request from {}: {}", source, e);
                return;
            }
        };

        if request.method() == &rsip::Method::Ack {
            if let Some(mut entry) = self.transactions.get_mut(&id) {
                // ACK for a non-2xx final stays inside the transaction
                if entry.fsm.process_ack().is_ok() {
                    return;
                }
            }
            self.deliver(IncomingRequest {
                request,
                source,
                transaction: None,
            });
            return;
        }

        if let Some(entry) = self.transactions.get(&id) {
            debug!("Retransmitted {} absorbed by {}", request.method(), id);
            if let Some(last) = &entry.fsm.last_response {
                let _ = self.enqueue(last.to_bytes(), entry.destination.clone(), None);
            }
            return;
        }

        let fsm = SipTransaction::new_server(id.clone(), request.clone(), self.timers);
        self.transactions.insert(
            id.clone(),
            Entry {
                fsm,
                destination: source.to_string(),
                events: None,
            },
        );

        let transaction = Arc::new(StackServerTransaction {
            id,
            request: request.clone(),
            stack: self.me.clone(),
        });

        if request.method() == &rsip::Method::Invite {
            let trying = ResponseBuilder::new(100).build_for_request(&request);
            if let Err(e) = transaction.respond(trying) {
                warn!("Failed to send 100 Trying: {}", e);
            }
        }

        self.deliver(IncomingRequest {
            request,
            source,
            transaction: Some(transaction),
        });
    }

    fn deliver(&self, incoming: IncomingRequest) {
        if self.incoming_tx.send(incoming).is_err() {
            debug!("No consumer for incoming requests");
        }
    }

    fn respond(&self, id: &TransactionId, response: SipResponse) -> Result<(), SipError> {
        let mut entry = self
            .transactions
            .get_mut(id)
            .ok_or_else(|| SipError::TransactionError(format!("Transaction not found: {}", id)))?;
        let data = response.to_bytes();
        entry.fsm.send_response(response)?;
        self.enqueue(data, entry.destination.clone(), None)
    }

    fn process_timers(&self, now: Instant) {
        let mut finished = Vec::new();

        for mut entry in self.transactions.iter_mut() {
            for (timer, action) in entry.fsm.check_timers(now) {
                match action {
                    TransactionTimerAction::RetransmitRequest => {
                        let data = entry.fsm.request.to_bytes();
                        let _ = self.enqueue(data, entry.destination.clone(), None);
                    }
                    TransactionTimerAction::RetransmitResponse => {
                        if let Some(last) = &entry.fsm.last_response {
                            let _ = self.enqueue(last.to_bytes(), entry.destination.clone(), None);
                        }
                    }
                    TransactionTimerAction::Timeout => {
                        warn!("Transaction {} timed out ({:?})", entry.key(), timer);
                        if let Some(events) = &entry.events {
                            let _ = events.send(TransactionEvent::Timeout);
                        }
                    }
                    TransactionTimerAction::Terminate | TransactionTimerAction::None => {}
                }
            }
            if entry.fsm.state.is_terminated() {
                finished.push(entry.key().clone());
            }
        }

        for id in finished {
            debug!("Removing terminated transaction {}", id);
            self.transactions.remove(&id);
        }
    }
}

impl TransactionLayer for SipStack {
    fn local_addr(&self) -> SocketAddr {
        self.advertised
    }

    fn send_request(
        &self,
        request: SipRequest,
        destination: &str,
    ) -> Result<(ClientTransaction, TransactionEvents), SipError> {
        let id = TransactionId::for_request(&request)?;
        let (events, rx) = mpsc::unbounded_channel();
        let data = request.to_bytes();

        self.transactions.insert(
            id.clone(),
            Entry {
                fsm: SipTransaction::new_client(id.clone(), request.clone(), self.timers),
                destination: destination.to_string(),
                events: Some(events),
            },
        );
        if let Err(e) = self.enqueue(data, destination.to_string(), Some(id.clone())) {
            self.transactions.remove(&id);
            return Err(e);
        }

        debug!("Created client transaction {} to {}", id, destination);
        Ok((
            ClientTransaction {
                id,
                request,
                destination: destination.to_string(),
            },
            rx,
        ))
    }

    fn send_ack(&self, request: SipRequest, destination: &str) -> Result<(), SipError> {
        self.enqueue(request.to_bytes(), destination.to_string(), None)
    }
}

struct StackServerTransaction {
    id: TransactionId,
    request: SipRequest,
    stack: Weak<SipStack>,
}

impl ServerTransaction for StackServerTransaction {
    fn id(&self) -> &TransactionId {
        &self.id
    }

    fn request(&self) -> &SipRequest {
        &self.request
    }

    fn respond(&self, response: SipResponse) -> Result<(), SipError> {
        let stack = self
            .stack
            .upgrade()
            .ok_or_else(|| SipError::TransportError("SIP stack is shut down".into()))?;
        stack.respond(&self.id, response)
    }
}

/// Resolve `host:port` to a socket address
pub async fn resolve(destination: &str) -> Result<SocketAddr, SipError> {
    if let Ok(addr) = destination.parse() {
        return Ok(addr);
    }
    tokio::net::lookup_host(destination)
        .await
        .map_err(|e| SipError::TransportError(format!("Failed to resolve {}: {}", destination, e)))?
        .next()
        .ok_or_else(|| SipError::TransportError(format!("No address for {}", destination)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SipTimerConfig;
    use crate::infrastructure::protocols::sip::builder::RequestBuilder;
    use crate::infrastructure::protocols::sip::SipHeaders;
    use crate::domain::shared::value_objects::CallId;
    use rsip::{Method, Uri};

    fn config() -> SipConfig {
        SipConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            public_ip: None,
            timers: SipTimerConfig {
                t1_ms: 50,
                t2_ms: 400,
                t4_ms: 500,
            },
            timer_tick_ms: 10,
        }
    }

    fn request(method: Method, local: SocketAddr, to: SocketAddr) -> SipRequest {
        let uri = Uri::try_from(format!("sip:bob@{}", to).as_str()).unwrap();
        RequestBuilder::new(method, uri)
            .via(local, &TransactionId::generate_branch())
            .from("<sip:alice@127.0.0.1>", "atag")
            .to(&format!("<sip:bob@{}>", to))
            .call_id(&CallId::generate("127.0.0.1"))
            .cseq(1)
            .build()
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_resolve() {
        assert_eq!(
            resolve("127.0.0.1:5060").await.unwrap(),
            "127.0.0.1:5060".parse::<SocketAddr>().unwrap()
        );
        assert!(resolve("missing-port").await.is_err());
    }

    #[tokio::test]
    async fn test_request_response_exchange() {
        let alice = SipStack::bind(&config()).await.unwrap();
        let bob = SipStack::bind(&config()).await.unwrap();
        let mut bob_incoming = bob.take_incoming().unwrap();
        assert!(bob.take_incoming().is_none());

        let req = request(Method::Options, alice.local_addr(), bob.local_addr());
        let (tx, mut events) = alice
            .send_request(req.clone(), &bob.local_addr().to_string())
            .unwrap();
        assert_eq!(tx.request, req);

        let incoming = next(&mut bob_incoming).await;
        assert_eq!(incoming.request.method(), &Method::Options);
        let server = incoming.transaction.unwrap();
        server
            .respond(ResponseBuilder::ok().build_for_request(&incoming.request))
            .unwrap();

        match next(&mut events).await {
            TransactionEvent::Response(resp) => {
                assert_eq!(resp.status_code(), 200);
                assert_eq!(resp.call_id(), req.call_id());
            }
            other => panic!("unexpected event {:?}", other),
        }

        alice.shutdown();
        bob.shutdown();
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let alice = SipStack::bind(&config()).await.unwrap();
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = silent.local_addr().unwrap();

        let req = request(Method::Options, alice.local_addr(), target);
        let (_, mut events) = alice.send_request(req, &target.to_string()).unwrap();

        // 64*T1 = 3.2s with the test timers
        let event = tokio::time::timeout(Duration::from_secs(6), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, TransactionEvent::Timeout));

        // The request was retransmitted at least once
        let mut buf = [0u8; 2048];
        let (n, _) = silent.recv_from(&mut buf).await.unwrap();
        assert!(n > 0);
    }

    #[tokio::test]
    async fn test_bad_destination_reports_transport_error() {
        let alice = SipStack::bind(&config()).await.unwrap();
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let req = request(Method::Options, alice.local_addr(), target);

        // No port: rejected before any lookup
        let (_, mut events) = alice.send_request(req, "missing-port").unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, TransactionEvent::TransportError(_)));
    }

    #[tokio::test]
    async fn test_invite_gets_trying_and_retransmission_is_absorbed() {
        let bob = SipStack::bind(&config()).await.unwrap();
        let mut bob_incoming = bob.take_incoming().unwrap();
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let invite = request(Method::Invite, peer_addr, bob.local_addr());
        peer.send_to(&invite.to_bytes(), bob.local_addr()).await.unwrap();
        peer.send_to(&invite.to_bytes(), bob.local_addr()).await.unwrap();

        let incoming = next(&mut bob_incoming).await;
        assert_eq!(incoming.request.method(), &Method::Invite);

        // Both copies are answered with 100 Trying, only one reaches the UA
        let mut buf = [0u8; 4096];
        for _ in 0..2 {
            let (n, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let resp = SipResponse::parse(&buf[..n]).unwrap();
            assert_eq!(resp.status_code(), 100);
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(200), bob_incoming.recv())
                .await
                .is_err()
        );
    }
}
