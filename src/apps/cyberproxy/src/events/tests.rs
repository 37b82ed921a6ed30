use super::{CapturedExchange, EventBus, ExchangeEvent, ExchangeTracker, Protocol};
use hyper::HeaderMap;
use hyper::header::{ACCEPT, HOST};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::timeout;

fn exchange(url: &str) -> CapturedExchange {
    let mut headers = HeaderMap::new();
    headers.insert(HOST, "api.example.com".parse().unwrap());
    headers.append(ACCEPT, "text/html".parse().unwrap());
    headers.append(ACCEPT, "application/json".parse().unwrap());
    CapturedExchange::new("GET", url.to_string(), &headers, Protocol::Https)
}

#[tokio::test]
async fn test_publish_reaches_every_subscriber() {
    let bus = EventBus::new(16);
    let mut first = bus.subscribe();
    let mut second = bus.subscribe();
    assert_eq!(bus.subscriber_count(), 2);

    let event = ExchangeEvent::Request(exchange("https://api.example.com/"));
    assert_eq!(bus.publish(event.clone()), 2);

    assert_eq!(first.recv().await, Some(event.clone()));
    assert_eq!(second.recv().await, Some(event));
}

#[tokio::test]
async fn test_publish_without_subscribers_is_harmless() {
    let bus = EventBus::new(16);
    assert_eq!(bus.publish(ExchangeEvent::Request(exchange("https://a/"))), 0);
}

#[tokio::test]
async fn test_late_subscribers_get_no_history() {
    let bus = EventBus::new(16);
    let _early = bus.subscribe();
    bus.publish(ExchangeEvent::Request(exchange("https://a/")));

    let mut late = bus.subscribe();
    assert!(
        timeout(Duration::from_millis(50), late.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_unsubscribe_deregisters() {
    let bus = EventBus::new(16);
    let subscription = bus.subscribe();
    assert_eq!(bus.subscriber_count(), 1);
    subscription.unsubscribe();
    assert_eq!(bus.subscriber_count(), 0);
}

#[tokio::test]
async fn test_slow_subscriber_does_not_block_publisher() {
    let bus = EventBus::new(4);
    let mut slow = bus.subscribe();
    let mut fast = bus.subscribe();

    // Far more events than the backlog; publish must never wait.
    for i in 0..100 {
        bus.publish(ExchangeEvent::Request(exchange(&format!("https://a/{}", i))));
        assert!(fast.recv().await.is_some());
    }

    // The slow observer skips what it missed and resumes with recent events.
    let next = slow.recv().await.expect("bus still open");
    match next {
        ExchangeEvent::Request(exchange) => assert_eq!(exchange.url, "https://a/96"),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_tracker_correlates_request_and_response() {
    let bus = EventBus::new(16);
    let mut observer = bus.subscribe();

    let captured = exchange("https://api.example.com/v1/data");
    let id = captured.id.clone();
    let mut tracker = ExchangeTracker::begin(&bus, captured);
    tracker.set_status(200);
    tracker.complete();
    tracker.fail("too late");
    drop(tracker);

    match observer.recv().await.unwrap() {
        ExchangeEvent::Request(request) => assert_eq!(request.id, id),
        other => panic!("expected request, got {:?}", other),
    }
    match observer.recv().await.unwrap() {
        ExchangeEvent::Response(response) => {
            assert_eq!(response.id, id);
            assert_eq!(response.status_code, 200);
        }
        other => panic!("expected response, got {:?}", other),
    }
    assert!(
        timeout(Duration::from_millis(50), observer.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_dropped_tracker_reports_error_once() {
    let bus = EventBus::new(16);
    let mut observer = bus.subscribe();

    let tracker = ExchangeTracker::begin(&bus, exchange("https://a/"));
    let id = tracker.id().to_string();
    drop(tracker);

    observer.recv().await.unwrap();
    match observer.recv().await.unwrap() {
        ExchangeEvent::Error(error) => assert_eq!(error.id, id),
        other => panic!("expected error, got {:?}", other),
    }
    assert!(
        timeout(Duration::from_millis(50), observer.recv())
            .await
            .is_err()
    );
}

#[test]
fn test_exchange_ids_are_unique() {
    let ids: HashSet<String> = (0..1000).map(|_| exchange("https://a/").id).collect();
    assert_eq!(ids.len(), 1000);
}

#[test]
fn test_event_wire_format() {
    let captured = exchange("https://api.example.com/v1/data");
    let json: serde_json::Value =
        serde_json::from_str(&ExchangeEvent::Request(captured.clone()).to_json().unwrap())
            .unwrap();
    assert_eq!(json["event"], "request");
    assert_eq!(json["data"]["id"], captured.id.as_str());
    assert_eq!(json["data"]["method"], "GET");
    assert_eq!(json["data"]["url"], "https://api.example.com/v1/data");
    assert_eq!(json["data"]["protocol"], "https");
    assert_eq!(json["data"]["headers"]["host"], "api.example.com");
    assert_eq!(
        json["data"]["headers"]["accept"],
        "text/html, application/json"
    );
    assert!(json["data"]["timestamp"].as_i64().unwrap() > 0);
    assert!(json["data"].get("statusCode").is_none());

    let response = ExchangeEvent::Response(super::ResponseEvent {
        id: captured.id.clone(),
        status_code: 204,
        duration: 12,
    });
    let json: serde_json::Value = serde_json::from_str(&response.to_json().unwrap()).unwrap();
    assert_eq!(json["event"], "response");
    assert_eq!(json["data"]["statusCode"], 204);
    assert_eq!(json["data"]["duration"], 12);

    let error = ExchangeEvent::Error(super::ErrorEvent {
        id: captured.id,
        error: "connection refused".to_string(),
    });
    let json: serde_json::Value = serde_json::from_str(&error.to_json().unwrap()).unwrap();
    assert_eq!(json["event"], "error");
    assert_eq!(json["data"]["error"], "connection refused");
}

#[test]
fn test_header_names_are_reported_lowercase() {
    let mut headers = HeaderMap::new();
    headers.insert(
        hyper::header::HeaderName::from_static("x-trace-id"),
        "abc".parse().unwrap(),
    );
    headers.insert(
        hyper::header::HeaderName::from_bytes(b"X-Client-Version").unwrap(),
        "1.2".parse().unwrap(),
    );

    let flat = super::exchange::flatten_headers(&headers);
    assert_eq!(flat["x-trace-id"], "abc");
    assert_eq!(flat["x-client-version"], "1.2");
    assert!(!flat.contains_key("X-Client-Version"));
}
