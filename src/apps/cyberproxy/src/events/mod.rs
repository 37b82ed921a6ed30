use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub mod exchange;

pub use exchange::{CapturedExchange, ExchangeTracker, Protocol};

#[cfg(test)]
mod tests;

/// Default number of events a subscriber may fall behind before it lags.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEvent {
    pub id: String,
    pub status_code: u16,
    /// Milliseconds from request receipt to response completion
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEvent {
    pub id: String,
    pub error: String,
}

/// Messages delivered to observers of the event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ExchangeEvent {
    Request(CapturedExchange),
    Response(ResponseEvent),
    Error(ErrorEvent),
}

impl ExchangeEvent {
    pub fn id(&self) -> &str {
        match self {
            ExchangeEvent::Request(exchange) => &exchange.id,
            ExchangeEvent::Response(response) => &response.id,
            ExchangeEvent::Error(error) => &error.id,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Fan-out of exchange events to every connected observer.
///
/// Publishing never waits on subscribers: each one has its own bounded backlog
/// and a subscriber that falls behind skips the oldest events instead of
/// slowing the proxy down. Late subscribers see only events published after
/// they joined.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExchangeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Delivers `event` to all current subscribers, returning how many there were.
    pub fn publish(&self, event: ExchangeEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("No observers connected, event dropped");
                0
            }
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A registered observer. Dropping it (or calling [`Subscription::unsubscribe`])
/// deregisters it from the bus.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<ExchangeEvent>,
}

impl Subscription {
    /// Waits for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<ExchangeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Observer fell behind, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}
