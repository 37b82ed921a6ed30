use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper_util::rt::{TokioExecutor, TokioIo};
use reqwest::Certificate;
use reqwest::Proxy;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::error;

use crate::events::{ExchangeEvent, Subscription};
use crate::{AppConfig, CertificateAuthority, CyberProxy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
}

pub struct ServerHandle {
    listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
    }
}

#[derive(Serialize, Deserialize)]
pub struct EchoResponse {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: std::collections::HashMap<String, String>,
    pub body: Option<String>,
}

pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// A CA in a fresh temporary directory plus a config whose listeners all
/// bind OS-assigned loopback ports. Keep the returned directory alive.
pub async fn create_ca_and_config() -> (CertificateAuthority, AppConfig, tempfile::TempDir) {
    install_crypto_provider();
    let cert_dir = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::new(cert_dir.path()).await.unwrap();

    let mut config = AppConfig::defaults().unwrap();
    config.proxy.proxy_bind_addr = "127.0.0.1:0".to_string();
    config.proxy.terminator_bind_addr = "127.0.0.1:0".to_string();
    config.proxy.upstream_connect_timeout_ms = 2000;
    config.proxy.upstream_timeout_ms = 5000;
    config.proxy.handshake_timeout_ms = 2000;
    config.tls.cert_dir = cert_dir.path().to_path_buf();
    config.web.web_bind_addr = "127.0.0.1:0".to_string();
    (ca, config, cert_dir)
}

pub async fn create_cyberproxy() -> (CyberProxy, CertificateAuthority, tempfile::TempDir) {
    let (ca, config, cert_dir) = create_ca_and_config().await;
    let mut proxy = CyberProxy::new(ca.clone(), config);
    proxy.start().await.unwrap();
    (proxy, ca, cert_dir)
}

/// What a fixture origin sends back.
#[derive(Debug, Clone, Copy)]
enum Origin {
    /// A JSON description of the request, with a known length.
    Echo,
    /// `chunks` lines of `chunk-{i}\n`, `interval` apart, length unknown.
    Stream { chunks: usize, interval: Duration },
}

type OriginBody = UnsyncBoxBody<Bytes, Infallible>;

/// TLS origin that answers every request with a JSON description of it.
/// Its leaf is minted by `ca` for `host`.
pub async fn create_echo_server(
    host: &str,
    ca: CertificateAuthority,
    proto: Protocol,
) -> ServerHandle {
    let acceptor = tls_acceptor(host, &ca, proto).await;
    spawn_origin(Some(acceptor), Origin::Echo, proto).await
}

/// Plaintext HTTP/1.1 origin with the same echo behaviour.
pub async fn create_plain_echo_server() -> ServerHandle {
    spawn_origin(None, Origin::Echo, Protocol::Http1).await
}

/// Plaintext HTTP/1.1 origin whose responses are chunked and trickle out.
pub async fn create_streaming_server(chunks: usize, interval: Duration) -> ServerHandle {
    spawn_origin(None, Origin::Stream { chunks, interval }, Protocol::Http1).await
}

/// TLS variant of [`create_streaming_server`], reachable through the terminator.
pub async fn create_tls_streaming_server(
    host: &str,
    ca: CertificateAuthority,
    chunks: usize,
    interval: Duration,
) -> ServerHandle {
    let acceptor = tls_acceptor(host, &ca, Protocol::Http1).await;
    spawn_origin(
        Some(acceptor),
        Origin::Stream { chunks, interval },
        Protocol::Http1,
    )
    .await
}

async fn tls_acceptor(host: &str, ca: &CertificateAuthority, proto: Protocol) -> TlsAcceptor {
    let cert = ca.leaf_certificate_for(host).await.expect("CA mint failed");

    let cert_chain = vec![cert.cert_der.clone(), ca.root_certificate_der()];

    let mut cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, cert.key_der.clone_key())
        .expect("server cert");
    cfg.alpn_protocols = match proto {
        Protocol::Http1 => vec![b"http/1.1".to_vec()],
        Protocol::Http2 => vec![b"h2".to_vec()],
    };
    TlsAcceptor::from(Arc::new(cfg))
}

async fn spawn_origin(acceptor: Option<TlsAcceptor>, origin: Origin, proto: Protocol) -> ServerHandle {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind target listener");
    let listen_addr = listener.local_addr().unwrap();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    break;
                }
                result = listener.accept() => {
                    let (stream, _) = match result {
                        Ok(s) => s,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls) => serve_origin(TokioIo::new(tls), origin, proto).await,
                                Err(e) => error!("tls accept error: {e}"),
                            },
                            None => serve_origin(TokioIo::new(stream), origin, proto).await,
                        }
                    });
                }
            }
        }
    });

    ServerHandle {
        listen_addr,
        shutdown_tx,
        task,
    }
}

async fn serve_origin<I>(io: TokioIo<I>, origin: Origin, proto: Protocol)
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let svc = hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| async move {
        let response = match origin {
            Origin::Echo => echo_response(req).await,
            Origin::Stream { chunks, interval } => streaming_response(chunks, interval),
        };
        Ok::<_, hyper::Error>(response)
    });

    match proto {
        Protocol::Http1 => {
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, svc)
                .await
            {
                error!("http1 error: {e}");
            }
        }
        Protocol::Http2 => {
            if let Err(e) = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                .serve_connection(io, svc)
                .await
            {
                error!("http2 error: {e}");
            }
        }
    }
}

async fn echo_response(req: hyper::Request<hyper::body::Incoming>) -> hyper::Response<OriginBody> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());

    let mut headers = std::collections::HashMap::new();
    for (name, value) in req.headers() {
        headers.insert(name.to_string(), value.to_str().unwrap_or("").to_string());
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            (!bytes.is_empty()).then(|| String::from_utf8_lossy(&bytes).to_string())
        }
        Err(_) => None,
    };

    let status = match path.as_str() {
        "/status/201" => 201,
        "/status/204" => 204,
        _ => 200,
    };
    let response = EchoResponse {
        method,
        path,
        query,
        headers,
        body,
    };
    let payload = if status == 204 {
        Bytes::new()
    } else {
        Bytes::from(serde_json::to_vec(&response).unwrap())
    };

    hyper::Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("x-origin", "echo")
        .body(Full::new(payload).boxed_unsync())
        .unwrap()
}

fn streaming_response(chunks: usize, interval: Duration) -> hyper::Response<OriginBody> {
    let frames = futures::stream::unfold(0usize, move |i| async move {
        if i == chunks {
            return None;
        }
        if i > 0 {
            tokio::time::sleep(interval).await;
        }
        let frame = Frame::data(Bytes::from(format!("chunk-{i}\n")));
        Some((Ok::<_, Infallible>(frame), i + 1))
    });

    hyper::Response::builder()
        .header("content-type", "text/plain")
        .header("x-origin", "stream")
        .body(StreamBody::new(frames).boxed_unsync())
        .unwrap()
}

pub fn create_client(ca: &CertificateAuthority, proxy: SocketAddr, proto: Protocol) -> reqwest::Client {
    let mut builder = reqwest::Client::builder();

    builder = match proto {
        Protocol::Http1 => builder.http1_only(),
        Protocol::Http2 => builder.http2_prior_knowledge(),
    };

    builder
        .add_root_certificate(Certificate::from_der(ca.root_certificate_der().as_ref()).unwrap())
        .proxy(Proxy::all(format!("http://{}", proxy)).unwrap())
        .timeout(Duration::from_secs(10))
        .user_agent("cyberproxy-test/1.0")
        .build()
        .unwrap()
}

/// Next event from `subscription`, failing the test after a few seconds.
pub async fn next_event(subscription: &mut Subscription) -> ExchangeEvent {
    timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event bus closed")
}

/// Sends a raw CONNECT and returns the stream plus the response head.
pub async fn raw_connect(proxy: SocketAddr, target: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    (stream, head)
}

/// Reads an HTTP response head, byte by byte so nothing after it is consumed.
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = timeout(Duration::from_secs(5), stream.read(&mut byte))
            .await
            .expect("timed out reading response head")
            .unwrap();
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).to_string()
}

/// Reads one unmasked server-to-client WebSocket text frame.
pub async fn read_text_frame(stream: &mut TcpStream) -> String {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0] & 0x0f, 0x1, "expected a text frame");

    let len = match header[1] & 0x7f {
        126 => {
            let mut extended = [0u8; 2];
            stream.read_exact(&mut extended).await.unwrap();
            u16::from_be_bytes(extended) as usize
        }
        127 => {
            let mut extended = [0u8; 8];
            stream.read_exact(&mut extended).await.unwrap();
            u64::from_be_bytes(extended) as usize
        }
        len => len as usize,
    };

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    String::from_utf8(payload).unwrap()
}
