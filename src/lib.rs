//! WebSocket-to-TCP tunnel.
//!
//! A client opens a WebSocket, sends `CONNECT:<host:port>|<payload>` and the
//! server dials the destination (directly, then through configured fallback
//! egress endpoints), answering `CONNECTED`. From then on binary frames and
//! `DATA:` text frames go to the remote socket and remote bytes come back as
//! binary frames until either side closes.

pub mod address;
pub mod channel;
pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod frame;
pub mod server;
pub mod session;

#[cfg(test)]
mod tests;

pub use address::{parse_address, Endpoint};
pub use connector::{Dialer, FallbackConnector, TcpDialer};
pub use error::{DialError, TunnelError};
pub use session::TunnelSession;
