use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use bytes::{Bytes, BytesMut};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter},
    net::{TcpListener, TcpStream},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message},
    WebSocketStream,
};
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    config::ClientConfig,
    frame::{close_request, connect_request, ServerFrame},
    server::token_header,
};

const TCP_BUFFER_SIZE: usize = 65536;
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Listens on `config.local_addr` and opens one tunnel per local connection.
pub async fn run_client(config: ClientConfig) -> Result<()> {
    info!("Starting client mode...");
    let url = Url::parse(&config.server_url).context("Invalid server URL")?;
    if !matches!(url.scheme(), "ws" | "wss") {
        bail!("Server URL must use ws:// or wss://, got {}", url.scheme());
    }
    info!(server = %url, dest = %config.target, "Tunnelling local connections");

    let listener = TcpListener::bind(&config.local_addr)
        .await
        .context("Failed to bind local TCP listener")?;
    info!(addr = %listener.local_addr()?, "Listening for local connections");

    let config = Arc::new(config);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (local_stream, peer) = accepted?;
                info!(%peer, "Accepted new local TCP connection");
                let config = config.clone();
                tokio::spawn(async move {
                    let id = Uuid::new_v4();
                    if let Err(e) = handle_local_connection(id, local_stream, config).await {
                        warn!(session = %id, "Client tunnel error: {:?}", e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Client shutting down.");
                return Ok(());
            }
        }
    }
}

/// Opens a tunnel for `local_stream` and relays until either side closes.
pub async fn handle_local_connection(id: Uuid, local_stream: TcpStream, config: Arc<ClientConfig>) -> Result<()> {
    let mut request = config.server_url.as_str().into_client_request()?;
    if let Some(token) = &config.token {
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, token_header(token)?);
    }

    let (ws_stream, _) = connect_async(request)
        .await
        .context("Failed to connect to WebSocket server")?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    ws_sender.send(connect_request(&config.target, "")).await?;
    await_connected(&mut ws_receiver).await?;
    info!(session = %id, dest = %config.target, "Tunnel established");

    relay(id, ws_sender, ws_receiver, local_stream).await
}

async fn await_connected<S>(ws_receiver: &mut SplitStream<WebSocketStream<S>>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = ws_receiver.next().await {
        if let Message::Text(text) = msg? {
            match ServerFrame::parse(text.as_str()) {
                Some(ServerFrame::Connected) => return Ok(()),
                Some(ServerFrame::Error(reason)) => bail!("Server refused tunnel: {reason}"),
                Some(ServerFrame::Close) => break,
                None => {}
            }
        }
    }
    Err(anyhow!("Server closed before the tunnel was established"))
}

async fn relay<S>(
    id: Uuid,
    mut ws_sender: SplitSink<WebSocketStream<S>, Message>,
    mut ws_receiver: SplitStream<WebSocketStream<S>>,
    mut local_stream: TcpStream,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_reader, local_writer) = local_stream.split();
    let mut local_writer = BufWriter::with_capacity(TCP_BUFFER_SIZE, local_writer);
    let mut buf = BytesMut::with_capacity(TCP_BUFFER_SIZE);
    buf.resize(TCP_BUFFER_SIZE, 0);

    let mut ping_interval = tokio::time::interval(WS_PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if ws_sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    info!(session = %id, "Failed to send ping, connection may be closed");
                    break;
                }
            },
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if local_writer.write_all(&data).await.is_err() || local_writer.flush().await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => match ServerFrame::parse(text.as_str()) {
                    Some(ServerFrame::Close) => break,
                    Some(ServerFrame::Error(reason)) => {
                        warn!(session = %id, %reason, "Server reported tunnel error");
                        break;
                    }
                    _ => {}
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            read = local_reader.read(&mut buf) => match read {
                Ok(n) if n > 0 => {
                    if ws_sender.send(Message::Binary(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                        break;
                    }
                }
                _ => {
                    ws_sender.send(close_request()).await.ok();
                    break;
                }
            },
        }
    }

    info!(session = %id, "Relay terminated. Closing connection.");
    ws_sender.close().await.ok();
    Ok(())
}
