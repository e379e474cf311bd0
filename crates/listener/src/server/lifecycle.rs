//! Binding, accept loops and connection serving for one listener generation.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::Request;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::handlers::RequestHandler;
use crate::error::{ListenerError, Result};
use crate::reload::DrainCoordinator;
use crate::tls::{FixedCertResolver, TlsPolicy};

/// Time allowed for reading the ClientHello and for completing the handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const LISTEN_BACKLOG: u32 = 1024;

/// Supplies the certificate for a ClientHello's server name.
#[async_trait]
pub trait CertificateSource: Send + Sync {
    async fn certificate_for(&self, server_name: &str) -> Result<Arc<CertifiedKey>>;
}

/// Addresses bound by the running generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundAddresses {
    pub http: SocketAddr,
    pub https: SocketAddr,
}

/// Listeners and tasks of one reload.
#[derive(Debug)]
pub(crate) struct Generation {
    cancel: CancellationToken,
    accept_tasks: Vec<JoinHandle<()>>,
    addresses: BoundAddresses,
    drain: DrainCoordinator,
}

impl Generation {
    pub(crate) fn addresses(&self) -> BoundAddresses {
        self.addresses
    }

    /// Token cancelled when the generation shuts down
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Close the listeners, then drain open connections in the background.
    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.accept_tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Accept loop ended abnormally");
            }
        }
        info!(
            http = %self.addresses.http,
            https = %self.addresses.https,
            open_connections = self.drain.active_count(),
            "Listeners closed"
        );
        self.drain.drain_in_background();
    }

    /// Signal shutdown without waiting, for use from `Drop`.
    pub(crate) fn abort(&self) {
        self.cancel.cancel();
    }
}

/// Bind `addr` with address reuse and TCP keep-alive (inherited by
/// accepted connections).
pub(crate) fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let bind_error = |source| ListenerError::Bind { addr, source };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_error)?;
    socket.set_reuseaddr(true).map_err(bind_error)?;
    socket.set_keepalive(true).map_err(bind_error)?;
    socket.bind(addr).map_err(bind_error)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_error)
}

/// Bind both ports and start serving. Nothing is left bound on error.
pub(crate) fn start(
    http_addr: SocketAddr,
    https_addr: SocketAddr,
    tls: &TlsPolicy,
    certs: Arc<dyn CertificateSource>,
    plain_handler: Arc<dyn RequestHandler>,
    tls_handler: Arc<dyn RequestHandler>,
    max_drain_time: Duration,
) -> Result<Generation> {
    let base_config = Arc::new(tls.server_config(Arc::new(Unresolved))?);

    let http_listener = bind(http_addr)?;
    let https_listener = bind(https_addr)?;
    let addresses = BoundAddresses {
        http: local_addr(&http_listener, http_addr)?,
        https: local_addr(&https_listener, https_addr)?,
    };

    let cancel = CancellationToken::new();
    let drain = DrainCoordinator::new(max_drain_time);

    let plain = tokio::spawn(accept_plain(
        http_listener,
        plain_handler,
        cancel.clone(),
        drain.clone(),
    ));
    let secure = tokio::spawn(accept_tls(
        https_listener,
        base_config,
        certs,
        tls_handler,
        cancel.clone(),
        drain.clone(),
    ));

    info!(http = %addresses.http, https = %addresses.https, "Listeners bound");

    Ok(Generation {
        cancel,
        accept_tasks: vec![plain, secure],
        addresses,
        drain,
    })
}

fn local_addr(listener: &TcpListener, requested: SocketAddr) -> Result<SocketAddr> {
    listener.local_addr().map_err(|source| ListenerError::Bind {
        addr: requested,
        source,
    })
}

async fn accept_plain(
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    cancel: CancellationToken,
    drain: DrainCoordinator,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept plain connection");
                    continue;
                }
            },
        };
        trace!(peer = %peer, "Accepted plain connection");

        let guard = drain.track();
        let handler = Arc::clone(&handler);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            serve_http(stream, handler, cancel).await;
            drop(guard);
        });
    }
    debug!("Plain accept loop stopped");
}

async fn accept_tls(
    listener: TcpListener,
    base_config: Arc<ServerConfig>,
    certs: Arc<dyn CertificateSource>,
    handler: Arc<dyn RequestHandler>,
    cancel: CancellationToken,
    drain: DrainCoordinator,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept TLS connection");
                    continue;
                }
            },
        };
        trace!(peer = %peer, "Accepted TLS connection");

        let guard = drain.track();
        let base_config = Arc::clone(&base_config);
        let certs = Arc::clone(&certs);
        let handler = Arc::clone(&handler);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match handshake(stream, &base_config, certs.as_ref()).await {
                Ok(tls) => serve_http(tls, handler, cancel).await,
                Err(e) => warn!(peer = %peer, error = %e, "TLS handshake failed"),
            }
            drop(guard);
        });
    }
    debug!("TLS accept loop stopped");
}

/// Read the ClientHello, resolve its certificate, then finish the handshake
/// with a per-connection copy of the generation's server configuration.
async fn handshake(
    stream: TcpStream,
    base_config: &ServerConfig,
    certs: &dyn CertificateSource,
) -> std::result::Result<tokio_rustls::server::TlsStream<TcpStream>, String> {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    let start = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor)
        .await
        .map_err(|_| "timed out reading ClientHello".to_string())?
        .map_err(|e| format!("invalid ClientHello: {}", e))?;

    let server_name = start
        .client_hello()
        .server_name()
        .unwrap_or_default()
        .to_string();
    let certified = certs
        .certificate_for(&server_name)
        .await
        .map_err(|e| format!("no certificate for '{}': {}", server_name, e))?;

    let mut config = base_config.clone();
    config.cert_resolver = Arc::new(FixedCertResolver(certified));

    tokio::time::timeout(HANDSHAKE_TIMEOUT, start.into_stream(Arc::new(config)))
        .await
        .map_err(|_| "timed out completing handshake".to_string())?
        .map_err(|e| e.to_string())
}

/// Serve HTTP/1.1 or HTTP/2 until the peer closes or the generation is
/// cancelled, in which case in-flight requests finish first.
async fn serve_http<I>(io: I, handler: Arc<dyn RequestHandler>, cancel: CancellationToken)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(handler.handle(req).await) }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    let mut shutting_down = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(error = %e, "Connection closed with error");
                }
                break;
            }
            _ = cancel.cancelled(), if !shutting_down => {
                shutting_down = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

/// Placeholder resolver of the generation's base configuration. Every
/// connection replaces it with a [`FixedCertResolver`].
#[derive(Debug)]
struct Unresolved;

impl ResolvesServerCert for Unresolved {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_reports_conflicts() {
        let first = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let taken = first.local_addr().unwrap();

        // SO_REUSEADDR does not allow two listening sockets on one port
        let err = bind(taken).unwrap_err();
        assert!(matches!(err, ListenerError::Bind { addr, .. } if addr == taken));
    }

    #[tokio::test]
    async fn test_shutdown_closes_listeners() {
        struct Nothing;
        #[async_trait]
        impl CertificateSource for Nothing {
            async fn certificate_for(&self, _: &str) -> Result<Arc<CertifiedKey>> {
                Err(crate::error::IssuanceError::NoCertificateAuthority.into())
            }
        }

        let settings = certgate_config::StaticSettings::new();
        let policy = TlsPolicy::from_settings(&settings).unwrap();
        let app: Arc<dyn RequestHandler> = Arc::new(super::super::handlers::AppHandler::new(
            Arc::new(certgate_config::StaticSettings::new()),
        ));
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let generation = start(
            loopback,
            loopback,
            &policy,
            Arc::new(Nothing),
            Arc::clone(&app),
            app,
            Duration::from_secs(1),
        )
        .unwrap();
        let addresses = generation.addresses();
        assert!(TcpStream::connect(addresses.http).await.is_ok());

        generation.shutdown().await;
        assert!(TcpStream::connect(addresses.http).await.is_err());
        assert!(TcpStream::connect(addresses.https).await.is_err());
    }
}
