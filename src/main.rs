use std::path::PathBuf;

use anyhow::Context;
use aviso_auth::{
    config::ProxyConfig,
    logging::init_logging,
    metrics::init_exporter,
    server,
};
use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Authorizing reverse proxy for the Aviso notification store")]
struct Cli {
    /// YAML configuration file; defaults apply when omitted
    #[arg(short, long, env = "AVISO_AUTH_CONFIG")]
    config: Option<PathBuf>,

    /// Listen host
    #[arg(long, env = "AVISO_AUTH_HOST")]
    host: Option<String>,

    /// Listen port
    #[arg(long, env = "AVISO_AUTH_PORT")]
    port: Option<u16>,

    /// Backend base url, e.g. http://localhost:2379
    #[arg(long, env = "AVISO_AUTH_BACKEND_URL")]
    backend_url: Option<String>,

    #[arg(long, env = "AVISO_AUTH_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<ProxyConfig> {
        let mut config = match &self.config {
            Some(path) => ProxyConfig::from_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => ProxyConfig::default(),
        };

        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(url) = &self.backend_url {
            config.backend.url = url.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.log_json {
            config.logging.json = true;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    init_logging(&config.logging)?;
    config.validate()?;

    if let Some(metrics) = &config.metrics {
        init_exporter(metrics)?;
    }

    info!(
        backend = %config.backend.url,
        permission_store = %config.permission_store_url(),
        "Starting aviso-auth"
    );
    server::run(config).await
}
