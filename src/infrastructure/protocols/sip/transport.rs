//! SIP transport layer - UDP datagrams in and out

use super::message::{SipError, SipMessage};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
}

/// Outgoing SIP message with destination information
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub destination: SocketAddr,
}

/// Transport layer trait
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Start the transport, returning the bound address
    async fn start(&mut self) -> Result<SocketAddr, SipError>;

    async fn stop(&mut self) -> Result<(), SipError>;

    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError>;

    /// Take the receiver for incoming messages. Only the first call gets it.
    fn take_receiver(&mut self) -> Option<mpsc::Receiver<IncomingMessage>>;
}

/// UDP transport implementation
pub struct UdpTransport {
    bind_addr: SocketAddr,
    socket: Option<Arc<UdpSocket>>,
    tx: mpsc::Sender<IncomingMessage>,
    rx: Option<mpsc::Receiver<IncomingMessage>>,
}

impl UdpTransport {
    pub fn new(bind_addr: SocketAddr) -> Self {
        let (tx, rx) = mpsc::channel(1000);
        Self {
            bind_addr,
            socket: None,
            tx,
            rx: Some(rx),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<IncomingMessage>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    // Keep-alive CRLFs
                    if buf[..size].iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }
                    debug!("Received {} bytes from {} via UDP", size, source);

                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => {
                            if tx.send(IncomingMessage { message, source }).await.is_err() {
                                debug!("Incoming channel closed, stopping UDP receive loop");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    // ICMP port unreachable surfaces here on some platforms
                    if e.kind() == std::io::ErrorKind::ConnectionReset {
                        continue;
                    }
                    error!("Failed to receive UDP packet: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn start(&mut self) -> Result<SocketAddr, SipError> {
        info!("Starting UDP transport on {}", self.bind_addr);

        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;
        let local = socket
            .local_addr()
            .map_err(|e| SipError::TransportError(e.to_string()))?;

        info!("UDP transport listening on {}", local);

        let socket = Arc::new(socket);
        self.socket = Some(socket.clone());

        let tx = self.tx.clone();
        tokio::spawn(async move {
            Self::receive_loop(socket, tx).await;
        });

        Ok(local)
    }

    async fn stop(&mut self) -> Result<(), SipError> {
        info!("Stopping UDP transport");
        self.socket = None;
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| SipError::TransportError("Socket not initialized".to_string()))?;

        debug!(
            "Sending {} bytes to {} via UDP",
            message.data.len(),
            message.destination
        );

        socket
            .send_to(&message.data, message.destination)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;

        Ok(())
    }

    fn take_receiver(&mut self) -> Option<mpsc::Receiver<IncomingMessage>> {
        self.rx.take()
    }
}
