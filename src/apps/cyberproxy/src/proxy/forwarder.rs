use super::utils::{
    ProxyBody, ProxyError, ProxyResult, bad_gateway, error_chain, should_forward_header,
    strip_proxy_headers, text_response, wrap_body,
};
use crate::config::ProxyConfig;
use crate::events::{ExchangeTracker, Protocol};

use bytes::Bytes;
use futures::TryStreamExt;
use http_body::{Body, Frame, SizeHint};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Incoming;
use hyper::header::HeaderMap;
use hyper::{Method, Response, StatusCode};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// A request on its way to the genuine origin.
#[derive(Debug)]
pub struct UpstreamRequest {
    pub scheme: Protocol,
    /// `host[:port]` of the origin
    pub authority: String,
    pub path_and_query: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Incoming,
}

impl UpstreamRequest {
    pub fn url(&self) -> ProxyResult<Url> {
        let raw = format!("{}://{}{}", self.scheme, self.authority, self.path_and_query);
        Url::parse(&raw)
            .map_err(|e| ProxyError::MalformedRequest(format!("invalid upstream URL {}: {}", raw, e)))
    }
}

/// Relays requests to the real origin and streams the responses back.
///
/// Origin certificates are not verified: the proxy exists to observe traffic
/// for hosts the operator already chose to intercept.
#[derive(Clone, Debug)]
pub struct ForwardingEngine {
    client: reqwest::Client,
}

impl ForwardingEngine {
    pub fn new(config: &ProxyConfig) -> ProxyResult<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .connect_timeout(Duration::from_millis(config.upstream_connect_timeout_ms))
            .read_timeout(Duration::from_millis(config.upstream_timeout_ms))
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .http2_adaptive_window(true)
            .build()?;
        Ok(Self { client })
    }

    /// Forwards `request`, settling `tracker` once the response has been
    /// fully delivered or has failed.
    pub async fn forward(
        &self,
        mut tracker: ExchangeTracker,
        request: UpstreamRequest,
    ) -> Response<ProxyBody> {
        let url = match request.url() {
            Ok(url) => url,
            Err(e) => {
                tracker.fail(&e);
                return text_response(StatusCode::BAD_REQUEST, e.to_string());
            }
        };

        let mut headers = HeaderMap::with_capacity(request.headers.len());
        for (name, value) in request.headers.iter() {
            if should_forward_header(name) {
                headers.append(name.clone(), value.clone());
            }
        }

        let method = request.method;
        let mut builder = self
            .client
            .request(method.clone(), url.clone())
            .headers(headers);
        if !request.body.is_end_stream() {
            builder = builder.body(wrap_body(request.body));
        }

        debug!("[{}] -> {} {}", tracker.id(), method, url);
        let upstream = match builder.send().await {
            Ok(upstream) => upstream,
            Err(e) => {
                let message = error_chain(&e);
                warn!("[{}] upstream request to {} failed: {}", tracker.id(), url, message);
                tracker.fail(&message);
                return bad_gateway(message);
            }
        };

        let status = upstream.status();
        debug!("[{}] <- {} from {}", tracker.id(), status, url);
        tracker.set_status(status.as_u16());

        let bodiless = method == Method::HEAD
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        let remaining = if bodiless {
            Some(0)
        } else {
            upstream.content_length()
        };

        let mut builder = Response::builder().status(status);
        if let Some(response_headers) = builder.headers_mut() {
            *response_headers = upstream.headers().clone();
            strip_proxy_headers(response_headers);
        }

        let stream = upstream
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(ProxyError::from);
        let body = ObservedBody {
            inner: StreamBody::new(stream).boxed_unsync(),
            remaining,
            tracker,
        };

        match builder.body(body.boxed_unsync()) {
            Ok(response) => response,
            // The tracker travelled with the body and reports the failure on drop.
            Err(e) => bad_gateway(format!("invalid upstream response: {}", e)),
        }
    }
}

/// Response body that settles its exchange when the last byte goes out.
///
/// A body whose length is known completes as soon as that many bytes have
/// been handed to the client connection, since hyper stops polling a
/// length-delimited body once it is satisfied. Anything else completes on
/// end of stream. Dropping the body early leaves the tracker pending, which
/// then reports the exchange as failed.
struct ObservedBody {
    inner: ProxyBody,
    remaining: Option<u64>,
    tracker: ExchangeTracker,
}

impl Body for ObservedBody {
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.remaining == Some(0) {
            this.tracker.complete();
            return Poll::Ready(None);
        }

        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(data), Some(remaining)) = (frame.data_ref(), this.remaining.as_mut()) {
                    *remaining = remaining.saturating_sub(data.len() as u64);
                    if *remaining == 0 {
                        this.tracker.complete();
                    }
                }
            }
            Poll::Ready(Some(Err(e))) => this.tracker.fail(e),
            Poll::Ready(None) => this.tracker.complete(),
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.remaining == Some(0) || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        match self.remaining {
            Some(remaining) => SizeHint::with_exact(remaining),
            None => self.inner.size_hint(),
        }
    }
}

impl Drop for ObservedBody {
    fn drop(&mut self) {
        if self.is_end_stream() {
            self.tracker.complete();
        }
    }
}
