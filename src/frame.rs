//! Text control frames exchanged over the WebSocket.
//!
//! Client to server: `CONNECT:<host:port>|<payload>`, `DATA:<text>`, `CLOSE`,
//! plus raw binary frames carrying tunnel bytes. Server to client:
//! `CONNECTED`, `CLOSE` and `ERROR:<message>`.

use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::TunnelError;

const CONNECT_PREFIX: &str = "CONNECT:";
const DATA_PREFIX: &str = "DATA:";
const CLOSE: &str = "CLOSE";
const CONNECTED: &str = "CONNECTED";
const ERROR_PREFIX: &str = "ERROR:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFrame<'a> {
    Connect { address: &'a str, payload: &'a str },
    Data(&'a [u8]),
    Close,
}

impl<'a> ClientFrame<'a> {
    /// Parses a text frame. Unknown text yields `Ok(None)`.
    pub fn parse_text(text: &'a str) -> Result<Option<Self>, TunnelError> {
        if let Some(rest) = text.strip_prefix(CONNECT_PREFIX) {
            let (address, payload) = rest.split_once('|').ok_or(TunnelError::MalformedFrame)?;
            return Ok(Some(ClientFrame::Connect { address, payload }));
        }
        if let Some(data) = text.strip_prefix(DATA_PREFIX) {
            return Ok(Some(ClientFrame::Data(data.as_bytes())));
        }
        if text == CLOSE {
            return Ok(Some(ClientFrame::Close));
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Connected,
    Close,
    Error(String),
}

impl ServerFrame {
    pub fn error(err: &TunnelError) -> Self {
        ServerFrame::Error(err.to_string())
    }

    /// Parses a status frame on the client side.
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            CONNECTED => Some(ServerFrame::Connected),
            CLOSE => Some(ServerFrame::Close),
            _ => text
                .strip_prefix(ERROR_PREFIX)
                .map(|msg| ServerFrame::Error(msg.to_string())),
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            ServerFrame::Connected => Message::text(CONNECTED),
            ServerFrame::Close => Message::text(CLOSE),
            ServerFrame::Error(msg) => Message::text(format!("{ERROR_PREFIX}{msg}")),
        }
    }
}

/// Builds the opening frame a client sends for `target`.
pub fn connect_request(target: &str, payload: &str) -> Message {
    Message::text(format!("{CONNECT_PREFIX}{target}|{payload}"))
}

/// Asks the server to tear the tunnel down without a reply.
pub fn close_request() -> Message {
    Message::text(CLOSE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_splits_at_first_pipe() {
        assert_eq!(
            ClientFrame::parse_text("CONNECT:example.com:9000|hello|world").unwrap(),
            Some(ClientFrame::Connect {
                address: "example.com:9000",
                payload: "hello|world",
            })
        );
        assert_eq!(
            ClientFrame::parse_text("CONNECT:[::1]:22|").unwrap(),
            Some(ClientFrame::Connect {
                address: "[::1]:22",
                payload: "",
            })
        );
    }

    #[test]
    fn connect_without_pipe_is_malformed() {
        assert!(matches!(
            ClientFrame::parse_text("CONNECT:bad"),
            Err(TunnelError::MalformedFrame)
        ));
    }

    #[test]
    fn data_and_close() {
        assert_eq!(
            ClientFrame::parse_text("DATA:GET / HTTP/1.1\r\n").unwrap(),
            Some(ClientFrame::Data(b"GET / HTTP/1.1\r\n"))
        );
        assert_eq!(ClientFrame::parse_text("CLOSE").unwrap(), Some(ClientFrame::Close));
        assert_eq!(ClientFrame::parse_text("CLOSE ").unwrap(), None);
        assert_eq!(ClientFrame::parse_text("HELLO").unwrap(), None);
    }

    #[test]
    fn server_frames_on_the_wire() {
        assert_eq!(ServerFrame::Connected.into_message(), Message::text("CONNECTED"));
        assert_eq!(ServerFrame::Close.into_message(), Message::text("CLOSE"));
        assert_eq!(
            ServerFrame::error(&TunnelError::MalformedFrame).into_message(),
            Message::text("ERROR:Invalid CONNECT frame")
        );
        assert_eq!(
            ServerFrame::parse("ERROR:nope"),
            Some(ServerFrame::Error("nope".to_string()))
        );
        assert_eq!(ServerFrame::parse("DATA:x"), None);
    }
}
