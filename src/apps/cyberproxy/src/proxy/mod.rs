use crate::cert::CertificateAuthority;
use crate::config::AppConfig;
use crate::events::{CapturedExchange, EventBus, ExchangeTracker, Protocol};

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod forwarder;
pub mod terminator;
pub mod tunnel;
mod utils;

pub use forwarder::{ForwardingEngine, UpstreamRequest};
pub use terminator::InterceptionTerminator;
pub use tunnel::{TunnelSession, TunnelStats};
pub use utils::{
    ProxyBody, ProxyError, ProxyResult, bad_gateway, empty, error_chain, full, is_closed,
    parse_connect_target, strip_proxy_headers, text_response,
};


/// The public proxy listener.
///
/// Absolute-form requests are forwarded directly. `CONNECT host:port` is
/// acknowledged only once the terminator is reachable, after which the
/// connection becomes an opaque tunnel into it.
#[derive(Clone)]
pub struct ProxyServer {
    listen_addr: Option<SocketAddr>,
    config: AppConfig,
    events: EventBus,
    forwarder: ForwardingEngine,
    terminator: InterceptionTerminator,
    shutdown: CancellationToken,
}

impl ProxyServer {
    pub fn new(ca: CertificateAuthority, events: EventBus, config: AppConfig) -> ProxyResult<Self> {
        let shutdown = CancellationToken::new();
        let forwarder = ForwardingEngine::new(&config.proxy)?;
        let terminator = InterceptionTerminator::new(
            ca,
            events.clone(),
            forwarder.clone(),
            &config,
            shutdown.child_token(),
        )?;
        Ok(Self {
            listen_addr: None,
            config,
            events,
            forwarder,
            terminator,
            shutdown,
        })
    }

    /// Returns the actual bound listen address, if the server has been started
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub fn terminator_listen_addr(&self) -> Option<SocketAddr> {
        self.terminator.listen_addr()
    }

    pub fn terminator(&self) -> &InterceptionTerminator {
        &self.terminator
    }

    /// Starts the terminator, then binds the proxy listener and spawns the
    /// accept loop. Returns once both listeners are bound.
    pub async fn start(&mut self) -> ProxyResult<()> {
        self.terminator.start().await?;

        let bind_addr: SocketAddr = self.config.proxy.proxy_bind_addr.parse().map_err(|e| {
            ProxyError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;
        let listener = TcpListener::bind(bind_addr).await?;

        // Store the actual bound address
        let listen_addr = listener.local_addr()?;
        self.listen_addr = Some(listen_addr);
        info!("Proxy listening on {}", listen_addr);

        let shutdown = self.shutdown.clone();
        let server = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((io, peer)) => {
                                debug!("Accepted connection from {}", peer);
                                let shared = server.clone();
                                let shutdown = shutdown.clone();
                                tokio::spawn(async move {
                                    let svc = service_fn(move |req: Request<Incoming>| {
                                        let shared = shared.clone();
                                        async move {
                                            Ok::<_, Infallible>(shared.handle_plain_http(req).await)
                                        }
                                    });

                                    let connection = http1::Builder::new()
                                        .preserve_header_case(true)
                                        .title_case_headers(true)
                                        .serve_connection(TokioIo::new(io), svc)
                                        .with_upgrades();
                                    tokio::select! {
                                        _ = shutdown.cancelled() => {}
                                        served = connection => {
                                            if let Err(e) = served {
                                                if is_closed(&e) {
                                                    debug!("client closed: {}", e);
                                                } else {
                                                    error!("conn error: {}", e);
                                                }
                                            }
                                        }
                                    }
                                });
                            }
                            Err(e) => error!("Accept error: {}", e),
                        }
                    }
                }
            }
            debug!("Proxy accept loop stopped");
        });

        Ok(())
    }

    /// Resolves once the server has been shut down.
    pub async fn join(&self) {
        self.shutdown.cancelled().await;
    }

    /// Stops both accept loops and tears down every live tunnel.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Handles requests received on the cleartext proxy port.
    async fn handle_plain_http(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            return self.handle_connect(req).await;
        }

        // Forward proxies receive the request target in absolute form
        let uri = req.uri().clone();
        let (Some(scheme), Some(authority)) = (uri.scheme_str(), uri.authority()) else {
            debug!("Rejecting non-proxy request target {}", uri);
            return text_response(
                StatusCode::BAD_REQUEST,
                "Proxy requests must use an absolute-form target",
            );
        };
        let protocol = match scheme {
            "http" => Protocol::Http,
            "https" => Protocol::Https,
            other => {
                return text_response(
                    StatusCode::BAD_REQUEST,
                    format!("Unsupported scheme: {}", other),
                );
            }
        };

        let authority = authority.as_str().to_string();
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let url = format!("{}://{}{}", protocol, authority, path_and_query);

        let exchange = CapturedExchange::new(req.method().as_str(), url, req.headers(), protocol);
        let tracker = ExchangeTracker::begin(&self.events, exchange);

        let (mut parts, body) = req.into_parts();
        strip_proxy_headers(&mut parts.headers);
        self.forwarder
            .forward(
                tracker,
                UpstreamRequest {
                    scheme: protocol,
                    authority,
                    path_and_query,
                    method: parts.method,
                    headers: parts.headers,
                    body,
                },
            )
            .await
    }

    /// Acknowledges a CONNECT and splices the client into the terminator.
    async fn handle_connect(&self, mut req: Request<Incoming>) -> Response<ProxyBody> {
        // Host:port lives in the request-target for CONNECT (authority-form)
        let target = req
            .uri()
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_default();
        let (host, port) = match parse_connect_target(&target) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("Rejecting CONNECT: {}", e);
                return text_response(StatusCode::BAD_REQUEST, e.to_string());
            }
        };
        debug!("CONNECT {}:{}", host, port);

        let Some(terminator_addr) = self.terminator.listen_addr() else {
            return bad_gateway("Interception terminator is not running");
        };
        let terminator = match TcpStream::connect(terminator_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to reach terminator for {}: {}", target, e);
                return bad_gateway(format!("Tunnel could not be established: {}", e));
            }
        };

        let on_upgrade = upgrade::on(&mut req);
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let session = TunnelSession::new(target.clone(), TokioIo::new(upgraded), terminator);
                    if let Err(e) = session.run(cancel).await {
                        if is_closed(&e) {
                            debug!("tunnel to {} closed: {}", target, e);
                        } else {
                            warn!("tunnel to {} failed: {}", target, e);
                        }
                    }
                }
                Err(e) => warn!("upgrade error (CONNECT): {}", e),
            }
        });

        // 200 Connection Established
        Response::new(empty())
    }
}
