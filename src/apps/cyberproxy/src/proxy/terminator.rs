use super::forwarder::{ForwardingEngine, UpstreamRequest};
use super::utils::{ProxyBody, ProxyError, ProxyResult, is_closed, text_response};
use crate::cert::CertificateAuthority;
use crate::config::AppConfig;
use crate::events::{CapturedExchange, EventBus, ExchangeTracker, Protocol};

use hyper::body::Incoming;
use hyper::http::uri::Authority;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, header};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoServer;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::LazyConfigAcceptor;
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Loopback-only TLS endpoint that decrypts tunneled traffic.
///
/// The ClientHello is read before any certificate is chosen; the SNI name (or
/// the configured fallback when the client sent none) selects the leaf the
/// handshake completes with.
#[derive(Clone)]
pub struct InterceptionTerminator {
    bind_addr: SocketAddr,
    listen_addr: Option<SocketAddr>,
    ca: CertificateAuthority,
    events: EventBus,
    forwarder: ForwardingEngine,
    fallback_hostname: Arc<str>,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
}

impl InterceptionTerminator {
    pub fn new(
        ca: CertificateAuthority,
        events: EventBus,
        forwarder: ForwardingEngine,
        config: &AppConfig,
        shutdown: CancellationToken,
    ) -> ProxyResult<Self> {
        let bind_addr: SocketAddr = config.proxy.terminator_bind_addr.parse().map_err(|e| {
            ProxyError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;
        if !bind_addr.ip().is_loopback() {
            return Err(ProxyError::Generic(format!(
                "terminator must bind to a loopback address, got {}",
                bind_addr
            )));
        }

        Ok(Self {
            bind_addr,
            listen_addr: None,
            ca,
            events,
            forwarder,
            fallback_hostname: Arc::from(config.tls.fallback_hostname.as_str()),
            handshake_timeout: Duration::from_millis(config.proxy.handshake_timeout_ms),
            shutdown,
        })
    }

    /// Returns the actual bound listen address, if the terminator has been started
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub async fn start(&mut self) -> ProxyResult<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let listen_addr = listener.local_addr()?;
        self.listen_addr = Some(listen_addr);
        info!("Interception terminator listening on {}", listen_addr);

        let shutdown = self.shutdown.clone();
        let terminator = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, peer)) => {
                                debug!("Terminator accepted connection from {}", peer);
                                let terminator = terminator.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = terminator.serve_connection(stream).await {
                                        if is_closed(&e) {
                                            debug!("tls client closed: {}", e);
                                        } else {
                                            warn!("tls interception failed for {}: {}", peer, e);
                                        }
                                    }
                                });
                            }
                            Err(e) => error!("Accept error: {}", e),
                        }
                    }
                }
            }
            debug!("Terminator accept loop stopped");
        });

        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Builds the server-side TLS context presented for `hostname`.
    pub async fn resolve_context(&self, hostname: &str) -> ProxyResult<Arc<ServerConfig>> {
        let leaf = self.ca.leaf_certificate_for(hostname).await?;
        let cert_chain = vec![leaf.cert_der.clone(), self.ca.root_certificate_der()];

        let mut cfg = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, leaf.key_der.clone_key())?;
        cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(Arc::new(cfg))
    }

    async fn serve_connection(&self, stream: TcpStream) -> ProxyResult<()> {
        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
        let start = timeout(self.handshake_timeout, acceptor)
            .await
            .map_err(|_| ProxyError::Tls(rustls::Error::General("ClientHello timed out".into())))??;

        let hostname = match start.client_hello().server_name() {
            Some(name) => name.to_string(),
            None => {
                debug!(
                    "No SNI presented, using fallback hostname {}",
                    self.fallback_hostname
                );
                self.fallback_hostname.to_string()
            }
        };

        let config = self.resolve_context(&hostname).await?;
        let tls = timeout(self.handshake_timeout, start.into_stream(config))
            .await
            .map_err(|_| ProxyError::Tls(rustls::Error::General("handshake timed out".into())))??;
        debug!("TLS established with client for {}", hostname);

        let terminator = self.clone();
        let svc = service_fn(move |req: Request<Incoming>| {
            let terminator = terminator.clone();
            async move { Ok::<_, Infallible>(terminator.handle_request(req).await) }
        });

        let auto = AutoServer::new(TokioExecutor::new());
        let connection = auto.serve_connection(TokioIo::new(tls), svc);
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                debug!("Dropping TLS connection for {} on shutdown", hostname);
                Ok(())
            }
            served = connection => served.map_err(|e| ProxyError::Generic(e.to_string())),
        }
    }

    /// Handles one decrypted request: assigns the exchange id, publishes it,
    /// and forwards to the origin named by the Host header.
    async fn handle_request(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()));

        let Some(authority) = host.filter(|h| h.parse::<Authority>().is_ok()) else {
            debug!("Rejecting decrypted request without a usable Host");
            return text_response(StatusCode::BAD_REQUEST, "Missing or invalid Host header");
        };

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let url = format!("https://{}{}", authority, path_and_query);

        let exchange =
            CapturedExchange::new(req.method().as_str(), url, req.headers(), Protocol::Https);
        let tracker = ExchangeTracker::begin(&self.events, exchange);

        let (parts, body) = req.into_parts();
        self.forwarder
            .forward(
                tracker,
                UpstreamRequest {
                    scheme: Protocol::Https,
                    authority,
                    path_and_query,
                    method: parts.method,
                    headers: parts.headers,
                    body,
                },
            )
            .await
    }
}
