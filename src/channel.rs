use std::sync::atomic::{AtomicU8, Ordering};

use futures_util::{stream::SplitSink, stream::SplitStream, SinkExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Mutex,
};
use tokio_tungstenite::{
    tungstenite::{
        self,
        protocol::{frame::coding::CloseCode, CloseFrame, Message},
    },
    WebSocketStream,
};

use crate::frame::ServerFrame;

pub type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;
pub type WsFrames<S> = SplitStream<WebSocketStream<S>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

/// The sending half of a client WebSocket, shared between the frame
/// dispatcher and the remote pump. Tracks the ready state so either side can
/// tell whether the client is still reachable.
pub struct ClientChannel<S> {
    sink: Mutex<WsSink<S>>,
    state: AtomicU8,
}

impl<S> ClientChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(sink: WsSink<S>) -> Self {
        Self {
            sink: Mutex::new(sink),
            state: AtomicU8::new(ReadyState::Open as u8),
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// The peer started the closing handshake.
    pub fn mark_closing(&self) {
        let _ = self.state.compare_exchange(
            ReadyState::Open as u8,
            ReadyState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// The underlying stream ended or failed.
    pub fn mark_closed(&self) {
        self.state.store(ReadyState::Closed as u8, Ordering::Release);
    }

    pub async fn send(&self, msg: Message) -> Result<(), tungstenite::Error> {
        if !self.is_open() {
            return Err(tungstenite::Error::AlreadyClosed);
        }
        self.sink.lock().await.send(msg).await
    }

    pub async fn send_frame(&self, frame: ServerFrame) -> Result<(), tungstenite::Error> {
        self.send(frame.into_message()).await
    }

    /// Sends a close frame and shuts the sink. Does nothing once closed.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<(), tungstenite::Error> {
        let prev = ReadyState::from_u8(self.state.swap(ReadyState::Closed as u8, Ordering::AcqRel));
        if prev == ReadyState::Closed {
            return Ok(());
        }
        let mut sink = self.sink.lock().await;
        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };
        let sent = sink.send(Message::Close(Some(frame))).await;
        let closed = sink.close().await;
        sent.and(closed)
    }
}
