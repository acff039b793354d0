use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// A failed attempt to open an outbound connection.
///
/// Only the message matters for fallback decisions, see
/// [`DialError::is_infrastructure`].
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DialError {
    message: String,
}

impl DialError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// True when the failure looks like the hosting network refusing the
    /// egress rather than the destination refusing us.
    pub fn is_infrastructure(&self) -> bool {
        let msg = self.message.to_lowercase();
        msg.contains("proxy request") || msg.contains("cannot connect") || msg.contains("cloudflare")
    }
}

/// Anything that ends a tunnel session. Rendered to the client as
/// `ERROR:<display>`.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid CONNECT target, expected host:port")]
    InvalidTarget,

    #[error("Invalid CONNECT frame")]
    MalformedFrame,

    #[error("Already connected")]
    AlreadyConnected,

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("Remote write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_phrases_match_case_insensitively() {
        assert!(DialError::new("Proxy request failed").is_infrastructure());
        assert!(DialError::new("cannot connect to 1.2.3.4:443: timed out").is_infrastructure());
        assert!(DialError::new("blocked by CLOUDFLARE").is_infrastructure());
        assert!(!DialError::new("Connection refused (os error 111)").is_infrastructure());
    }

    #[test]
    fn error_frames_use_plain_messages() {
        assert_eq!(
            TunnelError::InvalidTarget.to_string(),
            "Invalid CONNECT target, expected host:port"
        );
        assert_eq!(TunnelError::MalformedFrame.to_string(), "Invalid CONNECT frame");
        assert_eq!(
            TunnelError::from(DialError::new("refused")).to_string(),
            "refused"
        );
    }
}
