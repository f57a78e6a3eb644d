//! RTP datagram relay
//!
//! A UDP socket bound inside the configured RTP port range. Reads run on
//! their own task and never touch session state.

use crate::config::MediaConfig;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Handle on one RTP socket. Clones share the socket.
#[derive(Clone)]
pub struct RtpUdpStream {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    reader: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RtpUdpStream {
    /// Bind the first free even port in `[port_min, port_max]`
    pub async fn bind(config: &MediaConfig) -> io::Result<Self> {
        let start = config.port_min + config.port_min % 2;
        for port in (start..=config.port_max).step_by(2) {
            match UdpSocket::bind(SocketAddr::new(config.bind_ip, port)).await {
                Ok(socket) => {
                    let local_addr = socket.local_addr()?;
                    info!("RTP socket bound to {}", local_addr);
                    return Ok(Self {
                        socket: Arc::new(socket),
                        local_addr,
                        reader: Arc::new(Mutex::new(None)),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!(
                "No free RTP port in {}-{}",
                config.port_min, config.port_max
            ),
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start the read loop; `on_packet` runs for every datagram received.
    /// A second call replaces the previous loop.
    pub fn start<F>(&self, on_packet: F)
    where
        F: Fn(&[u8], SocketAddr) + Send + Sync + 'static,
    {
        let socket = self.socket.clone();
        let local = self.local_addr;
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        debug!("Received RTP packet from {}: {} bytes", from, len);
                        on_packet(&buf[..len], from);
                    }
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                    Err(e) => {
                        error!("RTP recv error on {}: {}", local, e);
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.reader.lock().replace(task) {
            previous.abort();
        }
    }

    pub async fn send(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, dest).await
    }

    /// Non-blocking send, usable from the packet callback
    pub fn try_send(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.socket.try_send_to(data, dest)
    }

    /// Stop the read loop. The socket closes once every clone is dropped.
    pub fn close(&self) {
        if let Some(task) = self.reader.lock().take() {
            task.abort();
            info!("RTP reader on {} stopped", self.local_addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn media_config(port_min: u16, port_max: u16) -> MediaConfig {
        MediaConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_min,
            port_max,
        }
    }

    #[tokio::test]
    async fn test_bind_skips_ports_in_use() {
        let config = media_config(42000, 42100);
        let first = RtpUdpStream::bind(&config).await.unwrap();
        let second = RtpUdpStream::bind(&config).await.unwrap();

        assert_ne!(first.local_addr(), second.local_addr());
        assert_eq!(second.local_addr().port() % 2, 0);
        assert!(second.local_addr().port() <= 42100);
    }

    #[tokio::test]
    async fn test_exhausted_range_fails() {
        let config = media_config(42200, 42200);
        let _held = RtpUdpStream::bind(&config).await.unwrap();
        let err = RtpUdpStream::bind(&config).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn test_echo() {
        let echo = RtpUdpStream::bind(&media_config(42300, 42400)).await.unwrap();
        let responder = echo.clone();
        echo.start(move |data, from| {
            let _ = responder.try_send(data, from);
        });

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"rtp-payload", echo.local_addr()).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"rtp-payload");
        assert_eq!(from, echo.local_addr());

        echo.close();
    }

    #[tokio::test]
    async fn test_callback_sees_every_packet() {
        let stream = RtpUdpStream::bind(&media_config(42500, 42600)).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        stream.start(move |data, _| {
            let _ = tx.send(data.len());
        });

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for size in [10usize, 20, 30] {
            peer.send_to(&vec![0u8; size], stream.local_addr()).await.unwrap();
        }
        for size in [10usize, 20, 30] {
            let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, size);
        }
    }
}
