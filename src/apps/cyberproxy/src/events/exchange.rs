use super::{ErrorEvent, EventBus, ExchangeEvent, ResponseEvent};
use hyper::HeaderMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

/// One intercepted request as first observed by the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedExchange {
    pub id: String,
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// Epoch milliseconds
    pub timestamp: i64,
    pub protocol: Protocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

impl CapturedExchange {
    /// Assigns a fresh id and timestamps the exchange.
    pub fn new(method: &str, url: String, headers: &HeaderMap, protocol: Protocol) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method: method.to_string(),
            url,
            headers: flatten_headers(headers),
            timestamp: chrono::Utc::now().timestamp_millis(),
            protocol,
            status_code: None,
            duration: None,
        }
    }
}

/// Repeated header values are joined with `", "`.
///
/// Names come out lowercase, as hyper normalises them on parse; the
/// client's original casing is not recoverable here.
pub fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut flat: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers.iter() {
        let value = String::from_utf8_lossy(value.as_bytes());
        flat.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    flat
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeState {
    Pending,
    Completed,
    Errored,
}

/// Owns the Pending state of one exchange and settles it exactly once.
///
/// Creating the tracker publishes the `request` event. The first of
/// [`complete`](Self::complete) or [`fail`](Self::fail) publishes the matching
/// `response` or `error` event; later calls are ignored. Dropping a tracker
/// that is still pending reports the exchange as abandoned.
#[derive(Debug)]
pub struct ExchangeTracker {
    id: String,
    bus: EventBus,
    started: Instant,
    status_code: Option<u16>,
    state: ExchangeState,
}

impl ExchangeTracker {
    pub fn begin(bus: &EventBus, exchange: CapturedExchange) -> Self {
        let id = exchange.id.clone();
        debug!(
            "[{}] {} {} ({})",
            id, exchange.method, exchange.url, exchange.protocol
        );
        bus.publish(ExchangeEvent::Request(exchange));
        Self {
            id,
            bus: bus.clone(),
            started: Instant::now(),
            status_code: None,
            state: ExchangeState::Pending,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_pending(&self) -> bool {
        self.state == ExchangeState::Pending
    }

    /// Records the upstream status; published on completion.
    pub fn set_status(&mut self, status_code: u16) {
        self.status_code = Some(status_code);
    }

    pub fn complete(&mut self) {
        if !self.is_pending() {
            return;
        }
        let Some(status_code) = self.status_code else {
            self.fail("response completed without a status");
            return;
        };
        self.state = ExchangeState::Completed;
        let duration = self.started.elapsed().as_millis() as u64;
        debug!("[{}] completed {} in {}ms", self.id, status_code, duration);
        self.bus.publish(ExchangeEvent::Response(ResponseEvent {
            id: self.id.clone(),
            status_code,
            duration,
        }));
    }

    pub fn fail(&mut self, error: impl fmt::Display) {
        if !self.is_pending() {
            return;
        }
        self.state = ExchangeState::Errored;
        let error = error.to_string();
        debug!("[{}] failed: {}", self.id, error);
        self.bus.publish(ExchangeEvent::Error(ErrorEvent {
            id: self.id.clone(),
            error,
        }));
    }
}

impl Drop for ExchangeTracker {
    fn drop(&mut self) {
        if self.is_pending() {
            self.fail("connection closed before the response completed");
        }
    }
}
