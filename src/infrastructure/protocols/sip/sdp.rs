//! Simple SDP (Session Description Protocol) handling

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Simple SDP session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSession {
    pub version: u32,
    pub origin: SdpOrigin,
    pub session_name: String,
    pub connection: SdpConnection,
    /// Session-level attributes, kept verbatim without the `a=` prefix
    pub attributes: Vec<String>,
    pub media: Vec<SdpMedia>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpOrigin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpConnection {
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

impl SdpConnection {
    fn for_ip(ip: IpAddr) -> Self {
        Self {
            network_type: "IN".to_string(),
            address_type: if ip.is_ipv4() { "IP4" } else { "IP6" }.to_string(),
            address: ip.to_string(),
        }
    }

    fn parse(value: &str) -> Option<Self> {
        let parts: Vec<&str> = value.split_whitespace().collect();
        if parts.len() < 3 {
            return None;
        }
        Some(Self {
            network_type: parts[0].to_string(),
            address_type: parts[1].to_string(),
            address: parts[2].to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpMedia {
    pub media_type: String,  // "audio", "video"
    pub port: u16,
    pub protocol: String,    // "RTP/AVP"
    pub formats: Vec<String>, // Codec payload types
    pub connection: Option<SdpConnection>,
    pub rtpmap: Vec<(String, String)>, // (payload_type, encoding)
    /// Other media attributes (fmtp, ptime, direction...)
    pub attributes: Vec<String>,
}

impl SdpMedia {
    /// Direction attribute, `sendrecv` when absent
    pub fn direction(&self) -> &str {
        self.attributes
            .iter()
            .map(String::as_str)
            .find(|a| matches!(*a, "sendrecv" | "sendonly" | "recvonly" | "inactive"))
            .unwrap_or("sendrecv")
    }
}

impl SdpSession {
    /// Create a simple audio SDP
    pub fn create_audio_session(local_ip: IpAddr, local_port: u16) -> Self {
        Self {
            version: 0,
            origin: SdpOrigin {
                username: "sipua".to_string(),
                session_id: chrono::Utc::now().timestamp().to_string(),
                session_version: "1".to_string(),
                network_type: "IN".to_string(),
                address_type: if local_ip.is_ipv4() { "IP4" } else { "IP6" }.to_string(),
                address: local_ip.to_string(),
            },
            session_name: "sipua".to_string(),
            connection: SdpConnection::for_ip(local_ip),
            attributes: Vec::new(),
            media: vec![SdpMedia {
                media_type: "audio".to_string(),
                port: local_port,
                protocol: "RTP/AVP".to_string(),
                formats: vec!["0".to_string(), "8".to_string(), "101".to_string()],
                connection: None,
                rtpmap: vec![
                    ("0".to_string(), "PCMU/8000".to_string()),
                    ("8".to_string(), "PCMA/8000".to_string()),
                    ("101".to_string(), "telephone-event/8000".to_string()),
                ],
                attributes: vec!["fmtp:101 0-16".to_string(), "sendrecv".to_string()],
            }],
        }
    }

    /// Parse SDP from string
    pub fn parse(sdp_body: &str) -> Option<Self> {
        let mut version = 0;
        let mut origin: Option<SdpOrigin> = None;
        let mut session_name = String::new();
        let mut connection: Option<SdpConnection> = None;
        let mut attributes = Vec::new();
        let mut media: Vec<SdpMedia> = Vec::new();
        let mut current_media: Option<SdpMedia> = None;

        for line in sdp_body.lines() {
            let line = line.trim();
            if line.len() < 2 || !line.contains('=') {
                continue;
            }

            let (field_type, value) = line.split_at(2);
            let value = value.trim();

            match field_type {
                "v=" => {
                    version = value.parse().unwrap_or(0);
                }
                "o=" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 6 {
                        origin = Some(SdpOrigin {
                            username: parts[0].to_string(),
                            session_id: parts[1].to_string(),
                            session_version: parts[2].to_string(),
                            network_type: parts[3].to_string(),
                            address_type: parts[4].to_string(),
                            address: parts[5].to_string(),
                        });
                    }
                }
                "s=" => {
                    session_name = value.to_string();
                }
                "c=" => {
                    let conn = SdpConnection::parse(value);
                    match current_media.as_mut() {
                        Some(m) => m.connection = conn,
                        None => connection = conn,
                    }
                }
                "m=" => {
                    if let Some(m) = current_media.take() {
                        media.push(m);
                    }

                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 4 {
                        current_media = Some(SdpMedia {
                            media_type: parts[0].to_string(),
                            port: parts[1].parse().unwrap_or(0),
                            protocol: parts[2].to_string(),
                            formats: parts[3..].iter().map(|s| s.to_string()).collect(),
                            connection: None,
                            rtpmap: Vec::new(),
                            attributes: Vec::new(),
                        });
                    }
                }
                "a=" => match current_media.as_mut() {
                    Some(media) => {
                        if let Some(rtpmap) = value.strip_prefix("rtpmap:") {
                            if let Some((pt, encoding)) = rtpmap.split_once(' ') {
                                media.rtpmap.push((pt.to_string(), encoding.to_string()));
                            }
                        } else {
                            media.attributes.push(value.to_string());
                        }
                    }
                    None => attributes.push(value.to_string()),
                },
                _ => {
                    // t=, b= and friends are regenerated or dropped
                }
            }
        }

        if let Some(m) = current_media.take() {
            media.push(m);
        }

        let origin = origin?;
        // A description may carry its connection only at media level
        let connection = connection.or_else(|| media.iter().find_map(|m| m.connection.clone()))?;

        Some(Self {
            version,
            origin,
            session_name,
            connection,
            attributes,
            media,
        })
    }

    /// Get media description for audio
    pub fn audio_media(&self) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.media_type == "audio")
    }

    /// Get supported codecs
    pub fn audio_codecs(&self) -> Vec<u8> {
        self.audio_media()
            .map(|audio| {
                audio
                    .formats
                    .iter()
                    .filter_map(|f| f.parse::<u8>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Where the peer expects audio RTP
    pub fn audio_addr(&self) -> Option<SocketAddr> {
        let audio = self.audio_media()?;
        let conn = audio.connection.as_ref().unwrap_or(&self.connection);
        let ip: IpAddr = conn.address.parse().ok()?;
        Some(SocketAddr::new(ip, audio.port))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v={}\r\n", self.version)?;
        write!(
            f,
            "o={} {} {} {} {} {}\r\n",
            self.origin.username,
            self.origin.session_id,
            self.origin.session_version,
            self.origin.network_type,
            self.origin.address_type,
            self.origin.address
        )?;
        write!(f, "s={}\r\n", self.session_name)?;
        write!(
            f,
            "c={} {} {}\r\n",
            self.connection.network_type, self.connection.address_type, self.connection.address
        )?;
        write!(f, "t=0 0\r\n")?;
        for attr in &self.attributes {
            write!(f, "a={}\r\n", attr)?;
        }

        for media in &self.media {
            write!(
                f,
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                media.formats.join(" ")
            )?;
            if let Some(conn) = &media.connection {
                write!(
                    f,
                    "c={} {} {}\r\n",
                    conn.network_type, conn.address_type, conn.address
                )?;
            }
            for (pt, encoding) in &media.rtpmap {
                write!(f, "a=rtpmap:{} {}\r\n", pt, encoding)?;
            }
            for attr in &media.attributes {
                write!(f, "a={}\r\n", attr)?;
            }
        }
        Ok(())
    }
}
