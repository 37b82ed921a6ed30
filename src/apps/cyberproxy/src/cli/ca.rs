use crate::cert::CertificateAuthority;
use crate::cert::ca::get_root_cert_path;
use crate::config::AppConfig;
use anyhow::Result;
use clap::Subcommand;

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum CaCommands {
    /// Print where the root CA certificate is stored
    Path,
    /// Print the root CA certificate (PEM), creating the authority if needed
    Show,
}

pub struct CaHandler {
    config: AppConfig,
}

impl CaHandler {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn handle(&self, command: &CaCommands) -> Result<()> {
        let output = self.render(command).await?;
        println!("{}", output.trim_end());
        Ok(())
    }

    pub(crate) async fn render(&self, command: &CaCommands) -> Result<String> {
        match command {
            CaCommands::Path => Ok(get_root_cert_path(&self.config.tls.cert_dir)
                .display()
                .to_string()),
            CaCommands::Show => {
                let ca = CertificateAuthority::new(&self.config.tls.cert_dir).await?;
                Ok(ca.root_certificate_pem().to_string())
            }
        }
    }
}
