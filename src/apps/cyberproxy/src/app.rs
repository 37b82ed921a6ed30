use crate::cert::CertificateAuthority;
use crate::config::AppConfig;
use crate::events::EventBus;
use crate::proxy::ProxyServer;
use crate::web::WebServer;

use anyhow::Result;
use std::net::SocketAddr;
use tracing::info;

/// The whole interception stack: proxy listener, TLS terminator and dashboard,
/// all sharing one authority and one event bus.
pub struct CyberProxy {
    ca: CertificateAuthority,
    config: AppConfig,
    events: EventBus,
    proxy: Option<ProxyServer>,
    web: Option<WebServer>,
}

impl CyberProxy {
    pub fn new(ca: CertificateAuthority, config: AppConfig) -> Self {
        let events = EventBus::new(config.events.capacity);
        Self {
            ca,
            config,
            events,
            proxy: None,
            web: None,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }

    /// Binds every listener. The authority is already loaded, so nothing is
    /// accepted before the root is usable.
    pub async fn start(&mut self) -> Result<()> {
        let mut proxy = ProxyServer::new(self.ca.clone(), self.events.clone(), self.config.clone())?;
        proxy.start().await?;
        self.proxy = Some(proxy);

        let mut web = WebServer::new(self.ca.clone(), self.events.clone(), self.config.clone());
        web.start().await?;
        self.web = Some(web);

        info!("CyberProxy started");
        Ok(())
    }

    pub fn proxy_listen_addr(&self) -> Option<SocketAddr> {
        self.proxy.as_ref().and_then(|p| p.listen_addr())
    }

    pub fn terminator_listen_addr(&self) -> Option<SocketAddr> {
        self.proxy.as_ref().and_then(|p| p.terminator_listen_addr())
    }

    pub fn web_listen_addr(&self) -> Option<SocketAddr> {
        self.web.as_ref().and_then(|w| w.listen_addr())
    }

    /// Resolves when either the proxy or the dashboard stops.
    pub async fn join(&self) -> Result<()> {
        match (&self.proxy, &self.web) {
            (Some(proxy), Some(web)) => {
                tokio::select! {
                    _ = proxy.join() => {}
                    _ = web.join() => {}
                }
                Ok(())
            }
            _ => Err(anyhow::anyhow!("CyberProxy has not been started")),
        }
    }

    pub async fn shutdown(&self) {
        if let Some(proxy) = &self.proxy {
            proxy.shutdown();
        }
        if let Some(web) = &self.web {
            web.shutdown().await;
        }
        info!("CyberProxy stopped");
    }
}
