use anyhow::Result;
use clap::Args;
use confique::Config;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Utility function to expand $HOME in a PathBuf
pub fn expand_home_in_path(path: &PathBuf) -> Result<PathBuf> {
    let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in path"))?;

    if path_str.contains("$HOME") {
        let expanded = path_str.replace("$HOME", home_dir.to_str().unwrap_or("."));
        Ok(PathBuf::from(expanded))
    } else {
        Ok(path.clone())
    }
}

#[derive(Config, Clone, Debug, Serialize, Deserialize)]
#[config(layer_attr(derive(Args, Serialize, Clone)))]
pub struct AppConfig {
    #[config(nested, layer_attr(command(flatten)))]
    pub proxy: ProxyConfig,

    #[config(nested, layer_attr(command(flatten)))]
    pub tls: TlsConfig,

    #[config(nested, layer_attr(command(flatten)))]
    pub web: WebConfig,

    #[config(nested, layer_attr(command(flatten)))]
    pub events: EventsConfig,
}

#[derive(Clone, Config, Debug, Deserialize, Serialize)]
#[config(layer_attr(derive(Args, Clone, Serialize,)))]
pub struct ProxyConfig {
    /// The address the public proxy listener binds to (port 0 picks a free port)
    #[config(
        default = "127.0.0.1:8080",
        env = "PROXY_BIND_ADDR",
        layer_attr(arg(long))
    )]
    pub proxy_bind_addr: String,

    /// The loopback address of the TLS interception endpoint
    #[config(
        default = "127.0.0.1:8081",
        env = "TERMINATOR_BIND_ADDR",
        layer_attr(arg(long))
    )]
    pub terminator_bind_addr: String,

    /// Timeout for establishing a connection to an origin
    #[config(default = 30000, layer_attr(arg(long)))]
    pub upstream_connect_timeout_ms: u64,

    /// Longest an origin may stay silent, per read; long-lived streams are not cut off
    #[config(default = 60000, layer_attr(arg(long)))]
    pub upstream_timeout_ms: u64,

    /// Timeout for a client to complete its TLS handshake with the terminator
    #[config(default = 10000, layer_attr(arg(long)))]
    pub handshake_timeout_ms: u64,
}

#[derive(Clone, Config, Debug, Deserialize, Serialize)]
#[config(layer_attr(derive(Args, Clone, Serialize,)))]
pub struct TlsConfig {
    /// The directory where root certificates are stored
    #[config(default = "$HOME/.cyberproxy/certs", layer_attr(arg(long)))]
    pub cert_dir: PathBuf,

    /// Hostname used for certificate selection when a client sends no SNI
    #[config(default = "localhost", layer_attr(arg(long)))]
    pub fallback_hostname: String,
}

#[derive(Clone, Config, Debug, Deserialize, Serialize)]
#[config(layer_attr(derive(Args, Clone, Serialize,)))]
pub struct WebConfig {
    /// The address the dashboard server binds to
    #[config(
        default = "127.0.0.1:3000",
        env = "WEB_BIND_ADDR",
        layer_attr(arg(long))
    )]
    pub web_bind_addr: String,
}

#[derive(Clone, Config, Debug, Deserialize, Serialize)]
#[config(layer_attr(derive(Args, Clone, Serialize,)))]
pub struct EventsConfig {
    /// How many events an observer may fall behind before it starts skipping
    #[config(default = 1024, layer_attr(arg(long = "event-capacity")))]
    pub capacity: usize,
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Defaults only, without consulting the environment or a config file.
    pub fn defaults() -> Result<Self> {
        Ok(Self::builder().load()?)
    }

    /// Resolve all potential $HOME placeholders in configuration paths
    /// This should be called once during initialization to avoid repeated path resolution
    pub fn with_resolved_paths(mut self) -> Result<Self> {
        self.tls.cert_dir = expand_home_in_path(&self.tls.cert_dir)?;
        Ok(self)
    }

    /// Directory holding the config file, certificates and `services.json`.
    pub fn app_dir(&self) -> PathBuf {
        self.tls
            .cert_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
