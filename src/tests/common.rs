//! Shared test doubles: a scripted in-memory dialer and WebSocket pairs.
#![cfg(test)]
use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio_tungstenite::{
    tungstenite::protocol::{Message, Role},
    WebSocketStream,
};

use crate::{connector::Dialer, error::DialError};

pub enum Script {
    Accept,
    Fail(&'static str),
    /// A dial that never completes.
    Hang,
}

enum Planned {
    Connect(MockStream),
    Fail(&'static str),
    Hang,
}

/// One end of an in-memory remote connection that counts shutdowns.
pub struct MockStream {
    inner: DuplexStream,
    shutdowns: Arc<AtomicUsize>,
}

impl AsyncRead for MockStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let res = Pin::new(&mut self.inner).poll_shutdown(cx);
        if res.is_ready() {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        res
    }
}

pub struct MockDialer {
    script: Mutex<VecDeque<Planned>>,
    attempts: Arc<Mutex<Vec<(String, u16)>>>,
    shutdowns: Arc<AtomicUsize>,
}

impl MockDialer {
    /// Returns the dialer and the far ends of every `Accept` entry, in order.
    pub fn new(script: Vec<Script>) -> (Self, Vec<DuplexStream>) {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let mut remotes = Vec::new();
        let script = script
            .into_iter()
            .map(|step| match step {
                Script::Accept => {
                    let (near, far) = tokio::io::duplex(64 * 1024);
                    remotes.push(far);
                    Planned::Connect(MockStream {
                        inner: near,
                        shutdowns: shutdowns.clone(),
                    })
                }
                Script::Fail(msg) => Planned::Fail(msg),
                Script::Hang => Planned::Hang,
            })
            .collect();
        let dialer = Self {
            script: Mutex::new(script),
            attempts: Arc::new(Mutex::new(Vec::new())),
            shutdowns,
        };
        (dialer, remotes)
    }

    pub fn attempts(&self) -> Arc<Mutex<Vec<(String, u16)>>> {
        self.attempts.clone()
    }

    pub fn shutdowns(&self) -> Arc<AtomicUsize> {
        self.shutdowns.clone()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    type Stream = MockStream;

    async fn dial(&self, host: &str, port: u16) -> Result<MockStream, DialError> {
        self.attempts.lock().unwrap().push((host.to_string(), port));
        let planned = self.script.lock().unwrap().pop_front();
        match planned {
            Some(Planned::Connect(stream)) => Ok(stream),
            Some(Planned::Fail(msg)) => Err(DialError::new(msg)),
            Some(Planned::Hang) => std::future::pending().await,
            None => Err(DialError::new("script exhausted")),
        }
    }
}

/// A connected server/client WebSocket pair over an in-memory pipe.
pub async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
    let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
    (server, client)
}

/// Reads client-side messages until the stream ends, skipping control frames.
pub async fn drain(client: &mut WebSocketStream<DuplexStream>) -> Vec<Message> {
    let mut seen = Vec::new();
    while let Some(Ok(msg)) = client.next().await {
        match msg {
            Message::Ping(_) | Message::Pong(_) => {}
            other => seen.push(other),
        }
    }
    seen
}
