use super::{AppState, download_certificate, event_stream, index_page};
use crate::cert::CertificateAuthority;
use crate::config::AppConfig;
use crate::events::EventBus;
use anyhow::Result;
use salvo::cors::{Any, Cors};
use salvo::http::Method;
use salvo::oapi::endpoint;
use salvo::server::ServerHandle;
use salvo::{Listener, Router, Server, affix_state, conn::TcpListener, oapi::OpenApi};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Dashboard server: certificate distribution and the live event channel.
pub struct WebServer {
    listen_addr: Option<SocketAddr>,
    ca: CertificateAuthority,
    events: EventBus,
    config: AppConfig,
    shutdown: CancellationToken,
    handle: Option<ServerHandle>,
}

impl WebServer {
    pub fn new(ca: CertificateAuthority, events: EventBus, config: AppConfig) -> Self {
        Self {
            listen_addr: None,
            ca,
            events,
            config,
            shutdown: CancellationToken::new(),
            handle: None,
        }
    }

    /// Returns the actual bound listen address, if the server has been started
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// Starts the server: binds the listener and spawns the accept loop.
    /// Returns immediately once the listener is bound.
    pub async fn start(&mut self) -> Result<()> {
        let bind_addr: SocketAddr = self
            .config
            .web
            .web_bind_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid web bind address: {}", e))?;

        let state = AppState {
            ca: self.ca.clone(),
            events: self.events.clone(),
            shutdown: self.shutdown.clone(),
        };

        let acceptor = TcpListener::new(bind_addr).try_bind().await?;
        // Store the actual bound address
        let listen_addr = acceptor.local_addr()?;
        self.listen_addr = Some(listen_addr);
        info!("Dashboard listening on http://{}", listen_addr);

        // The observer UI is served from elsewhere
        let cors = Cors::new()
            .allow_origin(Any)
            .allow_methods(vec![Method::GET, Method::OPTIONS])
            .allow_headers(Any)
            .into_handler();

        let app = Router::new()
            .hoop(cors)
            .hoop(affix_state::inject(state))
            .push(Router::with_path("/").get(index_page))
            .push(Router::with_path("/cert").get(download_certificate))
            .push(Router::with_path("/api/health").get(health_check))
            .push(Router::with_path("/events").get(event_stream));

        let doc = OpenApi::new("cyberproxy", env!("CARGO_PKG_VERSION")).merge_router(&app);
        let app = app.unshift(doc.into_router("/api/docs/openapi.json"));

        let server = Server::new(acceptor);
        self.handle = Some(server.handle());

        let did_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            server.serve(app).await;
            did_shutdown.cancel();
        });

        Ok(())
    }

    /// Returns a future that resolves when the server stops.
    pub async fn join(&self) {
        self.shutdown.cancelled().await;
    }

    pub async fn shutdown(&self) {
        // Ends open observer sockets so the graceful stop is not held up by them
        self.shutdown.cancel();

        if let Some(handle) = &self.handle {
            handle.stop_graceful(None);
        }
    }
}

// Health check endpoint
#[endpoint]
async fn health_check(res: &mut salvo::Response) {
    res.status_code(salvo::http::StatusCode::OK);
    res.render(salvo::writing::Text::Plain("OK"));
}
