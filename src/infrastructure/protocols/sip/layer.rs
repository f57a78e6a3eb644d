//! Transaction-layer interface consumed by the call-control core
//!
//! Sending is fire-and-forget: every method enqueues and returns, and the
//! outcome of a client transaction arrives later on its event stream.

use super::message::{SipError, SipRequest, SipResponse};
use super::transaction::TransactionId;
use crate::domain::shared::value_objects::TransactionRole;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Something that happened to a client transaction
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    Response(SipResponse),
    /// Timer B/F expired without a final response
    Timeout,
    TransportError(String),
}

pub type TransactionEvents = mpsc::UnboundedReceiver<TransactionEvent>;

/// Handle on an outgoing request's transaction
#[derive(Debug, Clone)]
pub struct ClientTransaction {
    pub id: TransactionId,
    pub request: SipRequest,
    /// `host:port` the request was sent to
    pub destination: String,
}

/// Server side of a received request
#[cfg_attr(test, mockall::automock)]
pub trait ServerTransaction: Send + Sync {
    fn id(&self) -> &TransactionId;

    fn request(&self) -> &SipRequest;

    /// Send a response on this transaction
    fn respond(&self, response: SipResponse) -> Result<(), SipError>;
}

#[cfg_attr(test, mockall::automock)]
pub trait TransactionLayer: Send + Sync {
    /// Address advertised in Via and Contact
    fn local_addr(&self) -> SocketAddr;

    /// Start a client transaction for `request` towards `destination`
    /// (`host:port`)
    fn send_request(
        &self,
        request: SipRequest,
        destination: &str,
    ) -> Result<(ClientTransaction, TransactionEvents), SipError>;

    /// Send an ACK for a 2xx, which lives outside any transaction
    fn send_ack(&self, request: SipRequest, destination: &str) -> Result<(), SipError>;
}

/// Transaction currently bound to a session
#[derive(Clone)]
pub enum Transaction {
    Client(ClientTransaction),
    Server(Arc<dyn ServerTransaction>),
}

impl Transaction {
    pub fn role(&self) -> TransactionRole {
        match self {
            Transaction::Client(_) => TransactionRole::Client,
            Transaction::Server(_) => TransactionRole::Server,
        }
    }

    pub fn id(&self) -> &TransactionId {
        match self {
            Transaction::Client(tx) => &tx.id,
            Transaction::Server(tx) => tx.id(),
        }
    }

    pub fn request(&self) -> &SipRequest {
        match self {
            Transaction::Client(tx) => &tx.request,
            Transaction::Server(tx) => tx.request(),
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("role", &self.role())
            .field("id", self.id())
            .finish()
    }
}

/// A request received from the network
#[derive(Clone)]
pub struct IncomingRequest {
    pub request: SipRequest,
    pub source: SocketAddr,
    /// `None` for an ACK to a 2xx, which has no transaction of its own
    pub transaction: Option<Arc<dyn ServerTransaction>>,
}

impl fmt::Debug for IncomingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingRequest")
            .field("request", &self.request.short())
            .field("source", &self.source)
            .field("transaction", &self.transaction.as_ref().map(|tx| tx.id().clone()))
            .finish()
    }
}
