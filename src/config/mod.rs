//! Configuration management
//!
//! Defaults are always valid. A TOML file and `SIPUA__SECTION__KEY`
//! environment variables override them, in that order.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sip: SipConfig,
    pub ua: UaConfig,
    pub media: MediaConfig,
    pub account: AccountConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    pub bind: SocketAddr,
    /// Address advertised in Via/Contact when bound to a wildcard address
    pub public_ip: Option<IpAddr>,
    pub timers: SipTimerConfig,
    /// Resolution of the transaction timer task
    pub timer_tick_ms: u64,
}

/// RFC 3261 timer values in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipTimerConfig {
    pub t1_ms: u64,
    pub t2_ms: u64,
    pub t4_ms: u64,
}

impl SipTimerConfig {
    /// 64*T1, the lifetime bound of a transaction
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.t1_ms * 64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UaConfig {
    /// Value of the User-Agent header
    pub user_agent: String,
    /// Option tags sent in Supported
    pub supported: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub bind_ip: IpAddr,
    pub port_min: u16,
    pub port_max: u16,
}

/// Identity used by the demo binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub uri: String,
    pub display_name: String,
    pub auth_user: String,
    pub password: String,
    pub realm: String,
    pub expires: u32,
    /// Registrar / outbound proxy, e.g. `sip:127.0.0.1:5081`
    pub recipient: String,
    /// Call placed on startup, if any
    pub call_target: Option<String>,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5080),
            public_ip: None,
            timers: SipTimerConfig::default(),
            timer_tick_ms: 50,
        }
    }
}

impl Default for SipTimerConfig {
    fn default() -> Self {
        Self {
            t1_ms: 500,
            t2_ms: 4000,
            t4_ms: 5000,
        }
    }
}

impl Default for UaConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("sipua/{}", env!("CARGO_PKG_VERSION")),
            supported: vec!["replaces".to_string(), "timer".to_string()],
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_min: 10000,
            port_max: 20000,
        }
    }
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            uri: "sip:100@127.0.0.1".to_string(),
            display_name: "sipua".to_string(),
            auth_user: "100".to_string(),
            password: "100".to_string(),
            realm: String::new(),
            expires: 1800,
            recipient: "sip:127.0.0.1:5081".to_string(),
            call_target: Some("sip:400@127.0.0.1".to_string()),
        }
    }
}

impl Config {
    /// Load from an optional file plus environment overrides
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder
            .add_source(config::Environment::with_prefix("SIPUA").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.sip.bind.port(), 5080);
        assert_eq!(config.sip.timers.transaction_timeout(), Duration::from_secs(32));
        assert!(config.media.port_min < config.media.port_max);
        assert_eq!(config.account.expires, 1800);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[sip]\nbind = \"127.0.0.1:5999\"\n\n[sip.timers]\nt1_ms = 100\n\n[media]\nport_min = 30000\nport_max = 30010"
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.sip.bind, "127.0.0.1:5999".parse().unwrap());
        assert_eq!(config.sip.timers.t1_ms, 100);
        assert_eq!(config.sip.timers.t2_ms, 4000);
        assert_eq!(config.media.port_min, 30000);
        assert_eq!(config.account.auth_user, "100");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load(Some("/nonexistent/sipua.toml")).unwrap();
        assert_eq!(config.sip.timers.t1_ms, 500);
    }
}
