use crate::cert::CertError;

use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::http::uri::Authority;
use hyper::{Response, StatusCode};
use tokio_rustls::rustls;

/// Errors raised while bridging, terminating or forwarding a connection.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
    #[error("Upstream error: {}", error_chain(.0))]
    Upstream(#[from] reqwest::Error),
    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),
    #[error("Malformed request: {0}")]
    MalformedRequest(String),
    #[error("Tunnel error: {0}")]
    Tunnel(String),
    #[error("Proxy error: {0}")]
    Generic(String),
}

impl From<hyper::http::Error> for ProxyError {
    fn from(err: hyper::http::Error) -> Self {
        ProxyError::Generic(format!("HTTP error: {}", err))
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

/// Body type of every response the proxy hands back to a client.
pub type ProxyBody = UnsyncBoxBody<Bytes, ProxyError>;

/// Renders an error with its source chain, `outer: inner: root`.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !rendered.contains(&cause_text) {
            rendered.push_str(": ");
            rendered.push_str(&cause_text);
        }
        source = cause.source();
    }
    rendered
}

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Plain-text response with the given status.
pub fn text_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let mut response = Response::new(full(message.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// 502 that also tells the client not to reuse the connection.
pub fn bad_gateway(message: impl Into<String>) -> Response<ProxyBody> {
    let mut response = text_response(StatusCode::BAD_GATEWAY, message);
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

/// Wrap a hyper Incoming body as a reqwest Body
pub fn wrap_body(incoming: Incoming) -> reqwest::Body {
    let stream = incoming.into_data_stream().map_err(|e| {
        let err: Box<dyn std::error::Error + Send + Sync> = Box::new(e);
        err
    });
    reqwest::Body::wrap_stream(stream)
}

/// Strip hop-by-hop headers from HTTP requests/responses
pub fn strip_proxy_headers(h: &mut HeaderMap) {
    // hop-by-hop headers (RFC 7230 6.1)
    const HOPS: &[&str] = &[
        "connection",
        "proxy-connection",
        "proxy-authorization",
        "keep-alive",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    for k in HOPS {
        h.remove(*k);
    }
}

/// Headers copied onto the upstream request. `host` is re-derived from the URL.
pub fn should_forward_header(name: &HeaderName) -> bool {
    match name.as_str() {
        // Skip pseudo-headers (HTTP/2 specific, start with :)
        h if h.starts_with(':') => false,
        "host" => false,
        "connection" => false,
        "proxy-connection" => false,
        "proxy-authorization" => false,
        "keep-alive" => false,
        "upgrade" => false,
        "transfer-encoding" => false,
        "te" => false,
        "trailer" => false,
        "http2-settings" => false,
        _ => true,
    }
}

/// Parses a CONNECT request target into host and port. Both are required.
pub fn parse_connect_target(target: &str) -> ProxyResult<(String, u16)> {
    let authority: Authority = target
        .parse()
        .map_err(|e| ProxyError::MalformedRequest(format!("invalid CONNECT target {:?}: {}", target, e)))?;

    let host = authority.host();
    if host.is_empty() || host == "[]" {
        return Err(ProxyError::MalformedRequest(format!(
            "CONNECT target {:?} has no host",
            target
        )));
    }
    match authority.port_u16() {
        Some(port) if port != 0 => Ok((host.to_string(), port)),
        _ => Err(ProxyError::MalformedRequest(format!(
            "CONNECT target {:?} has no port",
            target
        ))),
    }
}

/// Check if an error indicates a closed connection
pub fn is_closed<E: std::fmt::Display>(e: &E) -> bool {
    let s = e.to_string().to_lowercase();
    s.contains("broken pipe")
        || s.contains("connection reset")
        || s.contains("connection aborted")
        || s.contains("unexpected eof")
        || s.contains("close_notify")
        || s.contains("connection closed")
}
