use crate::cert::CertificateAuthority;
use crate::events::{EventBus, Subscription};

use salvo::http::header::{self, HeaderValue};
use salvo::http::StatusError;
use salvo::oapi::endpoint;
use salvo::websocket::{Message, WebSocket, WebSocketUpgrade};
use salvo::writing::Text;
use salvo::{Depot, Request, Response, handler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

mod server;

pub use server::WebServer;


/// Filename offered to browsers downloading the root certificate.
pub const CERTIFICATE_FILENAME: &str = "CyberProxy_CA.crt";

/// Shared state injected into every dashboard handler.
#[derive(Clone)]
pub struct AppState {
    pub ca: CertificateAuthority,
    pub events: EventBus,
    pub shutdown: CancellationToken,
}

const INDEX_HTML: &str = r#"<!doctype html>
<html>
  <head><title>CyberProxy</title></head>
  <body>
    <h1>CyberProxy</h1>
    <p>Install the <a href="/cert">root certificate</a> in your trust store to intercept HTTPS traffic.</p>
    <p>Live exchanges stream over the WebSocket at <code>/events</code>.</p>
  </body>
</html>
"#;

#[handler]
pub async fn index_page(res: &mut Response) {
    res.render(Text::Html(INDEX_HTML));
}

/// Root certificate download for manual trust-store installation
#[endpoint]
pub async fn download_certificate(depot: &mut Depot, res: &mut Response) {
    let Ok(state) = depot.obtain::<AppState>() else {
        warn!("Failed to obtain AppState in download_certificate");
        res.status_code(salvo::http::StatusCode::INTERNAL_SERVER_ERROR);
        res.render(Text::Plain("Internal server error"));
        return;
    };

    let pem = state.ca.root_certificate_pem().to_string();
    let headers = res.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-x509-ca-cert"),
    );
    if let Ok(disposition) =
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", CERTIFICATE_FILENAME))
    {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }
    res.status_code(salvo::http::StatusCode::OK);
    res.body(pem);
}

/// WebSocket event channel: one text frame per exchange event.
#[handler]
pub async fn event_stream(
    req: &mut Request,
    depot: &mut Depot,
    res: &mut Response,
) -> Result<(), StatusError> {
    let state = depot.obtain::<AppState>().map_err(|_| {
        warn!("Failed to obtain AppState in event_stream");
        StatusError::internal_server_error()
    })?;
    let subscription = state.events.subscribe();
    let shutdown = state.shutdown.clone();

    WebSocketUpgrade::new()
        .upgrade(req, res, move |ws| stream_events(ws, subscription, shutdown))
        .await
}

async fn stream_events(
    mut ws: WebSocket,
    mut subscription: Subscription,
    shutdown: CancellationToken,
) {
    debug!("Observer connected");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let json = match event.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to serialize event {}: {}", event.id(), e);
                        continue;
                    }
                };
                if let Err(e) = ws.send(Message::text(json)).await {
                    debug!("Observer send failed: {}", e);
                    break;
                }
            }
            inbound = ws.recv() => match inbound {
                Some(Ok(message)) if message.is_close() => break,
                // Observers have nothing to say beyond open and close
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Observer receive failed: {}", e);
                    break;
                }
                None => break,
            }
        }
    }
    let _ = ws.close().await;
    debug!("Observer disconnected");
}
