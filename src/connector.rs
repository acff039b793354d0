use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, info, warn};
use trust_dns_resolver::{config::*, TokioAsyncResolver};

use crate::{
    address::{parse_address, Endpoint},
    error::{DialError, TunnelError},
};

/// Opens raw outbound byte streams.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn dial(&self, host: &str, port: u16) -> Result<Self::Stream, DialError>;
}

/// TCP dialer resolving names through trust-dns. IP literals skip the lookup.
pub struct TcpDialer {
    resolver: TokioAsyncResolver,
    connect_timeout: Option<Duration>,
}

impl TcpDialer {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self {
            resolver,
            connect_timeout,
        }
    }

    async fn connect_addr(&self, addr: SocketAddr) -> Result<TcpStream, DialError> {
        let attempt = TcpStream::connect(addr);
        let result = match self.connect_timeout {
            Some(limit) => timeout(limit, attempt).await.map_err(|_| {
                DialError::new(format!("cannot connect to {addr}: timed out after {limit:?}"))
            })?,
            None => attempt.await,
        };
        result.map_err(|e| describe_io_failure(addr, e))
    }
}

// A refusal or reset comes from the destination itself and must not be
// retried through another egress. Everything else is reported as
// "cannot connect" so the fallback list gets a chance.
fn describe_io_failure(addr: SocketAddr, err: io::Error) -> DialError {
    match err.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => {
            DialError::new(format!("connection to {addr} rejected: {err}"))
        }
        _ => DialError::new(format!("cannot connect to {addr}: {err}")),
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, DialError> {
        let addrs: Vec<SocketAddr> = if let Ok(ip) = host.parse::<IpAddr>() {
            vec![SocketAddr::new(ip, port)]
        } else {
            let response = self.resolver.lookup_ip(host).await.map_err(|e| {
                DialError::new(format!("cannot connect to {host}:{port}: lookup failed: {e}"))
            })?;
            response.iter().map(|ip| SocketAddr::new(ip, port)).collect()
        };

        let mut last_err = None;
        for addr in addrs {
            match self.connect_addr(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "Dial attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            DialError::new(format!("cannot connect to {host}:{port}: no addresses resolved"))
        }))
    }
}

/// An established outbound connection split into exclusively owned halves.
pub struct RemoteConnection<T> {
    pub endpoint: Endpoint,
    pub reader: ReadHalf<T>,
    pub writer: WriteHalf<T>,
}

/// Reunites the halves and shuts the connection down. Both halves must be
/// released by their users before this is called.
pub async fn close_remote<T>(reader: ReadHalf<T>, writer: WriteHalf<T>) -> io::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = reader.unsplit(writer);
    stream.shutdown().await
}

/// Dials a target directly, then through each configured fallback egress in
/// order. Only infrastructure-classified failures move on to the next
/// candidate.
pub struct FallbackConnector<D> {
    dialer: D,
    fallbacks: Arc<[String]>,
}

impl<D: Dialer> FallbackConnector<D> {
    pub fn new(dialer: D, fallbacks: impl Into<Arc<[String]>>) -> Self {
        Self {
            dialer,
            fallbacks: fallbacks.into(),
        }
    }

    pub async fn connect(
        &self,
        target: &str,
        first_payload: &str,
    ) -> Result<RemoteConnection<D::Stream>, TunnelError> {
        let requested = parse_address(target, None);
        let port = match requested.port {
            Some(port) if port != 0 && !requested.host.is_empty() => port,
            _ => return Err(TunnelError::InvalidTarget),
        };

        let candidates = std::iter::once(Endpoint {
            host: requested.host.clone(),
            port: Some(port),
        })
        .chain(self.fallbacks.iter().map(|entry| parse_address(entry, Some(port))));
        let last_index = self.fallbacks.len();

        let mut outcome = Err(DialError::new(format!("cannot connect to {requested}")));
        for (index, candidate) in candidates.enumerate() {
            outcome = self.attempt(candidate, first_payload).await;
            match &outcome {
                Err(err) if err.is_infrastructure() && index < last_index => {
                    warn!(%requested, error = %err, attempt = index, "Egress failed, trying next fallback");
                }
                _ => break,
            }
        }
        outcome.map_err(TunnelError::from)
    }

    async fn attempt(
        &self,
        endpoint: Endpoint,
        first_payload: &str,
    ) -> Result<RemoteConnection<D::Stream>, DialError> {
        let port = endpoint.port.unwrap_or_default();
        let stream = self.dialer.dial(&endpoint.host, port).await?;
        let (reader, mut writer) = tokio::io::split(stream);

        if !first_payload.is_empty() {
            let written = match writer.write_all(first_payload.as_bytes()).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                // Release errors are irrelevant next to the write failure.
                let _ = close_remote(reader, writer).await;
                return Err(DialError::new(e.to_string()));
            }
        }

        info!(%endpoint, "Outbound connection established");
        Ok(RemoteConnection {
            endpoint,
            reader,
            writer,
        })
    }
}
