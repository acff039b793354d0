use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use anyhow::{anyhow, bail, Context as _, Result};
use bytes::{Buf, BytesMut};
use http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue, StatusCode};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::handshake::server::{ErrorResponse, Request, Response},
};
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    connector::{Dialer, FallbackConnector, TcpDialer},
    session::TunnelSession,
};

const MAX_HEAD_SIZE: usize = 16 * 1024;
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
const LANDING_PAGE: &str = "Welcome to nginx!";

/// Binds `config.listen_addr` and serves tunnels until the listener fails.
pub async fn run_server(config: ServerConfig) -> Result<()> {
    info!("Starting server mode...");
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .context("Failed to bind server listener")?;
    info!(addr = %listener.local_addr()?, "Listening for WebSocket connections");
    if !config.fallbacks.is_empty() {
        info!(fallbacks = ?config.fallbacks, "Fallback egress configured");
    }

    let connector = FallbackConnector::new(TcpDialer::new(config.connect_timeout), config.fallbacks.clone());
    serve(listener, connector, config.token).await
}

/// Accept loop over an already bound listener.
pub async fn serve<D: Dialer>(
    listener: TcpListener,
    connector: FallbackConnector<D>,
    token: Option<String>,
) -> Result<()> {
    let connector = Arc::new(connector);
    let token: Option<Arc<str>> = token.map(Arc::from);

    loop {
        let (socket, peer) = listener.accept().await?;
        debug!(%peer, "Accepted new incoming connection");

        let connector = connector.clone();
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, peer, connector, token).await {
                warn!(%peer, "Connection handler error: {:?}", e);
            }
        });
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Route {
    Tunnel,
    Respond(StatusCode, &'static str, &'static str),
}

/// Decides what to do with a parsed request head.
fn route(req: &httparse::Request<'_, '_>, token: Option<&str>) -> Route {
    let header = |name: &str| {
        req.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .map(str::trim)
    };

    let is_upgrade = header("upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !is_upgrade {
        let path = req.path.unwrap_or("/").split('?').next().unwrap_or("/");
        return if path == "/" {
            Route::Respond(StatusCode::OK, "text/html", LANDING_PAGE)
        } else {
            Route::Respond(StatusCode::UPGRADE_REQUIRED, "text/plain", "Expected WebSocket")
        };
    }

    if let Some(token) = token {
        if header("sec-websocket-protocol") != Some(token) {
            return Route::Respond(StatusCode::UNAUTHORIZED, "text/plain", "Unauthorized");
        }
    }
    Route::Tunnel
}

async fn handle_connection<D: Dialer>(
    mut stream: TcpStream,
    peer: SocketAddr,
    connector: Arc<FallbackConnector<D>>,
    token: Option<Arc<str>>,
) -> Result<()> {
    let _ = stream.set_nodelay(true);

    let head = match timeout(HEAD_TIMEOUT, read_head(&mut stream)).await {
        Ok(head) => head?,
        Err(_) => bail!("Timed out waiting for request head"),
    };

    let decision = {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&head) {
            Ok(httparse::Status::Complete(_)) => route(&req, token.as_deref()),
            _ => Route::Respond(StatusCode::BAD_REQUEST, "text/plain", "Bad Request"),
        }
    };

    match decision {
        Route::Respond(status, content_type, body) => {
            debug!(%peer, %status, "Answering non-tunnel request");
            respond(&mut stream, status, content_type, body).await
        }
        Route::Tunnel => {
            let ws = accept_hdr_async(Rewind::new(head, stream), accept_callback)
                .await
                .context("WebSocket handshake failed")?;

            let session = TunnelSession::new(ws, connector);
            info!(%peer, session = %session.id(), "Tunnel session accepted");
            session.run().await;
            Ok(())
        }
    }
}

// Clients that offered a subprotocol (the token) expect one echoed back.
fn accept_callback(req: &Request, mut resp: Response) -> Result<Response, ErrorResponse> {
    let offered = req
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(protocol) = offered {
        if let Ok(value) = HeaderValue::from_str(protocol) {
            resp.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }
    }
    Ok(resp)
}

/// Reads until the end of the request head. The bytes are replayed to the
/// WebSocket handshake through [`Rewind`].
async fn read_head(stream: &mut TcpStream) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if find_head_end(&buf).is_some() {
            return Ok(buf);
        }
        if buf.len() >= MAX_HEAD_SIZE {
            respond(stream, StatusCode::BAD_REQUEST, "text/plain", "Bad Request").await?;
            bail!("Request head too large");
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(anyhow!("Connection closed before request head"));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

async fn respond(stream: &mut TcpStream, status: StatusCode, content_type: &str, body: &str) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        content_type,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// A stream that yields `prefix` before reading from `inner`.
pub struct Rewind<T> {
    prefix: BytesMut,
    inner: T,
}

impl<T> Rewind<T> {
    pub fn new(prefix: BytesMut, inner: T) -> Self {
        Self { prefix, inner }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Header value for offering `token` as a WebSocket subprotocol.
pub fn token_header(token: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(token).context("Token is not a valid header value")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route_of(raw: &str, token: Option<&str>) -> Route {
        let mut headers = [httparse::EMPTY_HEADER; 16];
        let mut req = httparse::Request::new(&mut headers);
        assert!(req.parse(raw.as_bytes()).unwrap().is_complete());
        route(&req, token)
    }

    #[test]
    fn plain_requests_are_not_tunnelled() {
        assert_eq!(
            route_of("GET /?x=1 HTTP/1.1\r\nHost: a\r\n\r\n", None),
            Route::Respond(StatusCode::OK, "text/html", LANDING_PAGE)
        );
        assert!(matches!(
            route_of("GET /ws HTTP/1.1\r\nHost: a\r\nUpgrade: h2c\r\n\r\n", None),
            Route::Respond(StatusCode::UPGRADE_REQUIRED, _, _)
        ));
    }

    #[test]
    fn upgrade_header_is_case_insensitive() {
        assert_eq!(
            route_of("GET /ws HTTP/1.1\r\nHost: a\r\nupgrade: WebSocket\r\n\r\n", None),
            Route::Tunnel
        );
    }

    #[test]
    fn token_must_match_subprotocol() {
        let raw = "GET / HTTP/1.1\r\nHost: a\r\nUpgrade: websocket\r\nSec-WebSocket-Protocol: s3cret\r\n\r\n";
        assert_eq!(route_of(raw, Some("s3cret")), Route::Tunnel);
        assert!(matches!(
            route_of(raw, Some("other")),
            Route::Respond(StatusCode::UNAUTHORIZED, _, _)
        ));
        assert!(matches!(
            route_of("GET / HTTP/1.1\r\nUpgrade: websocket\r\n\r\n", Some("s3cret")),
            Route::Respond(StatusCode::UNAUTHORIZED, _, _)
        ));
    }

    #[test]
    fn head_end_detection() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nrest"), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
    }
}
