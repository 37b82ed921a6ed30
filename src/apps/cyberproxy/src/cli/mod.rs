use crate::{AppConfig, CertificateAuthority, CyberProxy, config::expand_home_in_path};
use ca::{CaCommands, CaHandler};

use anyhow::Result;
use clap::{Parser, Subcommand};
use confique::Config;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

// Re-export PartialAppConfig for public usage
pub use crate::config::confique_app_config_layer::AppConfigLayer as PartialAppConfig;

mod ca;


#[derive(Parser)]
#[command(name = "cyberproxy")]
#[command(about = "An intercepting HTTP/HTTPS proxy with a live exchange feed")]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "$HOME/.cyberproxy/config.toml")]
    config_path: PathBuf,

    /// Configuration object
    #[command(flatten)]
    config: PartialAppConfig,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Internal helper struct that holds the resolved configuration
pub struct ResolvedCli {
    command: Option<Commands>,
    config: AppConfig,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Commands {
    /// Root certificate authority commands
    Ca {
        #[command(subcommand)]
        command: CaCommands,
    },
}

/// Bound addresses, written for other tools to discover the running proxy.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Services {
    proxy: String,
    terminator: String,
    web: String,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let log_level = if self.verbose { "debug" } else { "info" };
        tracing_subscriber::fmt()
            .with_env_filter(format!("cyberproxy={},{}", log_level, log_level))
            .init();

        // Load and resolve configuration once at the beginning
        let resolved_cli = self.resolve_config()?;

        // Handle subcommands first
        if let Some(ref command) = resolved_cli.command {
            return resolved_cli.handle_command(command).await;
        }

        // Default behavior - run the proxy
        resolved_cli.run_proxy().await
    }

    /// Load the configuration and resolve all $HOME placeholders
    fn resolve_config(self) -> Result<ResolvedCli> {
        let config_path = expand_home_in_path(&self.config_path)?;

        let config = AppConfig::builder()
            .preloaded(self.config)
            .env()
            .file(&config_path)
            .load()?
            .with_resolved_paths()?;

        Ok(ResolvedCli {
            command: self.command,
            config,
        })
    }
}

impl ResolvedCli {
    async fn handle_command(&self, command: &Commands) -> Result<()> {
        match command {
            Commands::Ca { command } => CaHandler::new(self.config.clone()).handle(command).await,
        }
    }

    async fn run_proxy(&self) -> Result<()> {
        let app_dir = self.config.app_dir();
        std::fs::create_dir_all(&app_dir)?;

        // The root must be usable before any listener accepts a connection
        let ca = CertificateAuthority::new(&self.config.tls.cert_dir).await?;
        info!(
            "Certificate Authority initialized, root at {}",
            ca.root_certificate_path().display()
        );

        let mut proxy = CyberProxy::new(ca, self.config.clone());
        proxy.start().await?;

        let services = Services {
            proxy: bound(proxy.proxy_listen_addr(), "proxy")?,
            terminator: bound(proxy.terminator_listen_addr(), "terminator")?,
            web: bound(proxy.web_listen_addr(), "web")?,
        };
        let services_path = write_services(&app_dir, &services)?;
        info!("Services information written to: {:?}", services_path);
        info!(
            "Proxy on {}, dashboard on http://{}",
            services.proxy, services.web
        );

        tokio::select! {
            result = proxy.join() => result?,
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Shutting down");
            }
        }
        proxy.shutdown().await;

        Ok(())
    }
}

fn bound(addr: Option<std::net::SocketAddr>, name: &str) -> Result<String> {
    addr.map(|a| a.to_string())
        .ok_or_else(|| anyhow::anyhow!("Failed to get {} listen address", name))
}

pub(crate) fn write_services(app_dir: &Path, services: &Services) -> Result<PathBuf> {
    let services_path = app_dir.join("services.json");
    let services_json = serde_json::to_string_pretty(services)?;
    std::fs::write(&services_path, services_json)?;
    Ok(services_path)
}
