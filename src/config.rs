use std::time::Duration;

/// Default per-attempt dial timeout for outbound connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to accept WebSocket upgrades on.
    pub listen_addr: String,
    /// Alternate egress endpoints tried in order after the direct dial.
    pub fallbacks: Vec<String>,
    /// When set, clients must present it as `Sec-WebSocket-Protocol`.
    pub token: Option<String>,
    pub connect_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            fallbacks: Vec::new(),
            token: None,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub local_addr: String,
    /// `host:port` the server should dial for every local connection.
    pub target: String,
    pub token: Option<String>,
}

/// `0` disables the timeout.
pub fn connect_timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
