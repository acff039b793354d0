use std::{io, ops::ControlFlow, sync::Arc};

use bytes::{Bytes, BytesMut};
use futures_util::{future::BoxFuture, FutureExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    tungstenite::{
        self,
        protocol::{frame::coding::CloseCode, Message},
    },
    WebSocketStream,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    channel::{ClientChannel, WsFrames},
    connector::{close_remote, Dialer, FallbackConnector, RemoteConnection},
    error::TunnelError,
    frame::{ClientFrame, ServerFrame},
};

const TCP_BUFFER_SIZE: usize = 65536;
const CLOSE_REASON: &str = "Server closed";

/// State reachable from the frame dispatcher and both relay tasks.
struct Shared<S> {
    id: Uuid,
    channel: ClientChannel<S>,
    // Flips to true exactly once, when cleanup starts.
    closed: watch::Sender<bool>,
}

impl<S> Shared<S> {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// A dial in flight. It carries the queue of client bytes that arrive before
/// the connection is up.
type Dialing<T> = BoxFuture<'static, Result<(RemoteConnection<T>, mpsc::UnboundedReceiver<Bytes>), TunnelError>>;

type WriterOutcome<T> = (WriteHalf<T>, io::Result<()>);

enum Event<T> {
    Frame(Option<Result<Message, tungstenite::Error>>),
    Dialed(Result<(RemoteConnection<T>, mpsc::UnboundedReceiver<Bytes>), TunnelError>),
    PumpFinished(Option<ReadHalf<T>>),
    WriterFinished(Option<WriterOutcome<T>>),
}

/// One client WebSocket bound to at most one outbound connection.
///
/// The session task only dispatches: it reads frames, drives the dial and
/// queues client bytes for a writer task. A pump task reads the remote and
/// writes binary frames back. Nothing the remote does can stop the session
/// task from seeing the client go away. Whichever side ends first,
/// [`TunnelSession::cleanup`] releases the writer, then the reader, then the
/// connection, then closes the WebSocket.
pub struct TunnelSession<S, D: Dialer> {
    shared: Arc<Shared<S>>,
    frames: WsFrames<S>,
    connector: Arc<FallbackConnector<D>>,
    // Present from CONNECT until cleanup.
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    dial: Option<Dialing<D::Stream>>,
    writer_task: Option<JoinHandle<WriterOutcome<D::Stream>>>,
    pump: Option<JoinHandle<ReadHalf<D::Stream>>>,
    writer: Option<WriteHalf<D::Stream>>,
    reader: Option<ReadHalf<D::Stream>>,
}

impl<S, D> TunnelSession<S, D>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    D: Dialer,
{
    pub fn new(ws: WebSocketStream<S>, connector: Arc<FallbackConnector<D>>) -> Self {
        let (sink, frames) = ws.split();
        let (closed, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                channel: ClientChannel::new(sink),
                closed,
            }),
            frames,
            connector,
            outbound: None,
            dial: None,
            writer_task: None,
            pump: None,
            writer: None,
            reader: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Drives the session until either side closes. Never fails: errors are
    /// reported to the client in-band as `ERROR:` frames.
    pub async fn run(mut self) {
        debug!(session = %self.shared.id, "Tunnel session started");
        while self.step().await.is_continue() {}
        self.cleanup().await;
        info!(session = %self.shared.id, "Tunnel session closed");
    }

    /// Waits for the next event and handles it. `Break` means the session is
    /// over and only cleanup remains.
    pub(crate) async fn step(&mut self) -> ControlFlow<()> {
        let event = tokio::select! {
            frame = self.frames.next() => Event::Frame(frame),
            dialed = dial_finished(&mut self.dial) => Event::Dialed(dialed),
            reader = task_finished(&mut self.pump) => Event::PumpFinished(reader),
            writer = task_finished(&mut self.writer_task) => Event::WriterFinished(writer),
        };

        let outcome = match event {
            Event::Frame(Some(Ok(msg))) => self.handle_message(msg),
            Event::Frame(Some(Err(err))) => {
                debug!(session = %self.shared.id, error = %err, "WebSocket error");
                self.shared.channel.mark_closed();
                return ControlFlow::Break(());
            }
            Event::Frame(None) => {
                self.shared.channel.mark_closed();
                return ControlFlow::Break(());
            }
            Event::Dialed(dialed) => self.start_relay(dialed).await,
            Event::PumpFinished(reader) => {
                self.reader = reader;
                return ControlFlow::Break(());
            }
            Event::WriterFinished(finished) => self.writer_finished(finished),
        };

        match outcome {
            Ok(flow) => flow,
            Err(err) => {
                warn!(session = %self.shared.id, error = %err, "Tunnel failed");
                if let Err(e) = self.shared.channel.send_frame(ServerFrame::error(&err)).await {
                    debug!(session = %self.shared.id, error = %e, "Could not report error to client");
                }
                ControlFlow::Break(())
            }
        }
    }

    pub(crate) fn handle_message(&mut self, msg: Message) -> Result<ControlFlow<()>, TunnelError> {
        if self.is_closed() {
            return Ok(ControlFlow::Break(()));
        }
        match msg {
            Message::Text(text) => match ClientFrame::parse_text(text.as_str())? {
                Some(ClientFrame::Connect { address, payload }) => self.connect(address, payload)?,
                Some(ClientFrame::Data(bytes)) => self.forward(Bytes::copy_from_slice(bytes)),
                Some(ClientFrame::Close) => return Ok(ControlFlow::Break(())),
                None => debug!(session = %self.shared.id, "Ignoring unknown text frame"),
            },
            Message::Binary(data) => self.forward(data),
            Message::Close(_) => {
                self.shared.channel.mark_closing();
                return Ok(ControlFlow::Break(()));
            }
            // Ping, pong and raw frames are answered by tungstenite.
            _ => {}
        }
        Ok(ControlFlow::Continue(()))
    }

    // Starts the dial; the session keeps reading frames while it runs.
    fn connect(&mut self, address: &str, payload: &str) -> Result<(), TunnelError> {
        if self.outbound.is_some() {
            return Err(TunnelError::AlreadyConnected);
        }

        info!(session = %self.shared.id, addr = address, "CONNECT requested");
        let (outbound, queued) = mpsc::unbounded_channel();
        let connector = self.connector.clone();
        let address = address.to_string();
        let payload = payload.to_string();
        self.outbound = Some(outbound);
        self.dial = Some(
            async move {
                let conn = connector.connect(&address, &payload).await?;
                Ok::<_, TunnelError>((conn, queued))
            }
            .boxed(),
        );
        Ok(())
    }

    // Bytes that arrive before a CONNECT are dropped. Bytes sent while the
    // dial runs are written once it succeeds.
    fn forward(&mut self, bytes: Bytes) {
        if let Some(outbound) = &self.outbound {
            // A closed queue means the writer already stopped and its
            // outcome is on the way to the dispatcher.
            let _ = outbound.send(bytes);
        }
    }

    async fn start_relay(
        &mut self,
        dialed: Result<(RemoteConnection<D::Stream>, mpsc::UnboundedReceiver<Bytes>), TunnelError>,
    ) -> Result<ControlFlow<()>, TunnelError> {
        let (RemoteConnection { endpoint, reader, writer }, queued) = dialed?;

        if let Err(err) = self.shared.channel.send_frame(ServerFrame::Connected).await {
            // The send failure is what gets reported.
            let _ = close_remote(reader, writer).await;
            return Err(err.into());
        }

        debug!(session = %self.shared.id, %endpoint, "Relaying");
        self.writer_task = Some(tokio::spawn(write_remote(self.shared.clone(), writer, queued)));
        self.pump = Some(tokio::spawn(pump_remote(self.shared.clone(), reader)));
        Ok(ControlFlow::Continue(()))
    }

    fn writer_finished(
        &mut self,
        finished: Option<WriterOutcome<D::Stream>>,
    ) -> Result<ControlFlow<()>, TunnelError> {
        let Some((writer, result)) = finished else {
            return Ok(ControlFlow::Break(()));
        };
        self.writer = Some(writer);
        result?;
        Ok(ControlFlow::Break(()))
    }

    /// Releases every resource exactly once. Safe to call repeatedly; later
    /// calls return immediately. Never fails.
    pub async fn cleanup(&mut self) {
        if self.shared.closed.send_replace(true) {
            return;
        }

        // Dropping a pending dial cancels it.
        self.dial = None;
        self.outbound = None;

        let writer = match self.writer_task.take() {
            Some(task) => task.await.ok().map(|(writer, _)| writer),
            None => self.writer.take(),
        };
        let reader = match self.pump.take() {
            Some(pump) => pump.await.ok(),
            None => self.reader.take(),
        };
        if let (Some(reader), Some(writer)) = (reader, writer) {
            // Teardown errors are dropped: nothing useful can be done with them.
            if let Err(e) = close_remote(reader, writer).await {
                debug!(session = %self.shared.id, error = %e, "Remote shutdown failed");
            }
        }

        let _ = self.shared.channel.close(CloseCode::Normal, CLOSE_REASON).await;
    }
}

async fn dial_finished<T>(
    dial: &mut Option<Dialing<T>>,
) -> Result<(RemoteConnection<T>, mpsc::UnboundedReceiver<Bytes>), TunnelError> {
    let Some(pending) = dial.as_mut() else {
        return std::future::pending().await;
    };
    let dialed = pending.await;
    *dial = None;
    dialed
}

async fn task_finished<T>(task: &mut Option<JoinHandle<T>>) -> Option<T> {
    let Some(handle) = task.as_mut() else {
        return std::future::pending().await;
    };
    let output = handle.await.ok();
    // A finished JoinHandle must not be polled again.
    *task = None;
    output
}

async fn write_flush<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Writes queued client bytes to the remote in order. A write stuck on a
/// peer that stopped reading is abandoned as soon as `closed` flips. Returns
/// the write half so cleanup can reunite it with the reader.
async fn write_remote<S, W>(
    shared: Arc<Shared<S>>,
    mut writer: WriteHalf<W>,
    mut queued: mpsc::UnboundedReceiver<Bytes>,
) -> WriterOutcome<W>
where
    W: AsyncWrite,
{
    let mut closed = shared.closed.subscribe();
    let result = loop {
        let bytes = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => break Ok(()),
            bytes = queued.recv() => match bytes {
                Some(bytes) => bytes,
                None => break Ok(()),
            },
        };
        let written = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => break Ok(()),
            written = write_flush(&mut writer, &bytes) => written,
        };
        if let Err(e) = written {
            debug!(session = %shared.id, error = %e, "Remote write failed");
            break Err(e);
        }
    };
    (writer, result)
}

/// Copies remote bytes to the client as binary frames. Returns the read half
/// so cleanup can reunite it with the writer.
async fn pump_remote<S, R>(shared: Arc<Shared<S>>, mut reader: ReadHalf<R>) -> ReadHalf<R>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead,
{
    let mut closed = shared.closed.subscribe();
    let mut buf = BytesMut::with_capacity(TCP_BUFFER_SIZE);
    buf.resize(TCP_BUFFER_SIZE, 0);

    loop {
        let n = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(session = %shared.id, error = %e, "Remote read failed");
                    break;
                }
            },
        };
        if !shared.channel.is_open() {
            break;
        }
        let frame = Message::Binary(Bytes::copy_from_slice(&buf[..n]));
        let sent = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => break,
            sent = shared.channel.send(frame) => sent,
        };
        if let Err(e) = sent {
            debug!(session = %shared.id, error = %e, "Client send failed");
            break;
        }
    }

    if !shared.is_closed() {
        debug!(session = %shared.id, "Remote finished first");
        let _ = shared.channel.send_frame(ServerFrame::Close).await;
    }
    reader
}
