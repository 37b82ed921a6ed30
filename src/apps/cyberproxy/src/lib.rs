// Library interface for cyberproxy
// This exposes the internal modules for testing and external use

pub mod app;
pub mod cert;
pub mod cli;
pub mod config;
pub mod events;
pub mod proxy;
pub mod web;

#[cfg(test)]
pub mod test_utils;


// Re-export commonly used types for convenience
pub use app::CyberProxy;
pub use cert::CertificateAuthority;
pub use config::AppConfig;
pub use events::EventBus;
pub use proxy::ProxyServer;
pub use web::WebServer;
