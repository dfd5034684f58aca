use anyhow::Result;
use clap::Args;
use tablesnap_server::{archive_engine_factory, ControlServer};
use tracing::info;

use super::config::load;

#[derive(Args)]
pub struct ServerCommand {
    #[arg(long, help = "Override api.listen_addr (host:port)")]
    listen: Option<String>,
}

impl ServerCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let mut loaded = load(cli.config.as_deref())?;
        if let Some(listen) = &self.listen {
            loaded.config.api.listen_addr = listen.clone();
            loaded.config.validate()?;
        }

        match &loaded.path {
            Some(path) => info!(path = %path.display(), "Configuration loaded"),
            None => info!("No configuration file, using defaults; reloads will not be persisted"),
        }

        let server = ControlServer::new(archive_engine_factory(), loaded.path)?;
        server
            .run(loaded.config, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            })
            .await?;

        info!("Tablesnap stopped");
        Ok(())
    }
}
