use crate::engine::EngineFactory;
use crate::lock::OperationLock;
use crate::metrics::BackupMetrics;
use crate::routes::build_router;
use crate::state::AppState;
use prometheus::Registry;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tablesnap_core::{Config, Error, Result};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// A bound server generation, published after every successful bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    pub number: u64,
    pub addr: SocketAddr,
}

/// Owns the listener and restarts it whenever a new configuration arrives.
///
/// Reload requests are messages: handlers only ever send a validated
/// [`Config`] on the reload channel and this loop alone replaces the serving
/// generation.
pub struct ControlServer {
    factory: EngineFactory,
    config_path: Option<PathBuf>,
    lock: OperationLock,
    registry: Registry,
    metrics: BackupMetrics,
    reload_tx: mpsc::Sender<Config>,
    reload_rx: mpsc::Receiver<Config>,
    generation: watch::Sender<Option<Generation>>,
}

impl ControlServer {
    pub fn new(factory: EngineFactory, config_path: Option<PathBuf>) -> Result<Self> {
        let registry = Registry::new();
        let metrics = BackupMetrics::new(&registry)
            .map_err(|e| Error::Other(format!("cannot register metrics: {}", e)))?;
        // A second reload waits until the loop has taken the first.
        let (reload_tx, reload_rx) = mpsc::channel(1);
        let (generation, _) = watch::channel(None);
        Ok(Self {
            factory,
            config_path,
            lock: OperationLock::new(),
            registry,
            metrics,
            reload_tx,
            reload_rx,
            generation,
        })
    }

    pub fn reload_sender(&self) -> mpsc::Sender<Config> {
        self.reload_tx.clone()
    }

    pub fn generations(&self) -> watch::Receiver<Option<Generation>> {
        self.generation.subscribe()
    }

    fn state(&self, config: Config) -> Arc<AppState> {
        Arc::new(AppState {
            engine: (self.factory)(&config),
            config,
            lock: self.lock.clone(),
            metrics: self.metrics.clone(),
            registry: self.registry.clone(),
            reload_tx: self.reload_tx.clone(),
        })
    }

    /// Writes a configuration that has just been bound back to the file the
    /// server was started from. The running generation is kept on failure.
    async fn persist(&self, config: &Config) {
        let Some(path) = &self.config_path else {
            return;
        };
        let written = match config.to_toml_string() {
            Ok(document) => tokio::fs::write(path, document).await.map_err(Error::from),
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => info!(path = %path.display(), "Configuration written"),
            Err(e) => error!(path = %path.display(), error = %e, "Cannot write configuration"),
        }
    }

    /// Serves `config` until `shutdown` resolves.
    ///
    /// Failing to bind the first generation is fatal. A later generation
    /// that cannot bind falls back to the previous configuration, and only a
    /// generation that did bind is written to the configuration file.
    pub async fn run<F>(mut self, config: Config, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut current = config;
        let mut previous: Option<Config> = None;
        // Set while `current` is a reloaded configuration not yet written back.
        let mut unsaved = false;
        let mut number = 0u64;

        loop {
            let listener = match TcpListener::bind(&current.api.listen_addr).await {
                Ok(listener) => listener,
                Err(e) => match previous.take() {
                    Some(fallback) => {
                        error!(
                            listen_addr = %current.api.listen_addr,
                            error = %e,
                            "Cannot bind new configuration, reverting"
                        );
                        current = fallback;
                        unsaved = false;
                        continue;
                    }
                    None => {
                        return Err(Error::Other(format!(
                            "cannot listen on {}: {}",
                            current.api.listen_addr, e
                        )));
                    }
                },
            };

            number += 1;
            let addr = listener.local_addr()?;
            info!(
                generation = number,
                addr = %addr,
                storage = current.general.remote_storage.as_str(),
                "Serving API"
            );
            if unsaved {
                self.persist(&current).await;
                unsaved = false;
            }
            self.generation.send_replace(Some(Generation { number, addr }));

            let app = build_router(self.state(current.clone()));
            let serve = axum::serve(listener, app).into_future();

            tokio::select! {
                result = serve => {
                    // The listener never ends on its own unless accept fails for good.
                    result?;
                    warn!(generation = number, "API server stopped");
                    return Ok(());
                }
                reload = self.reload_rx.recv() => {
                    let Some(next) = reload else {
                        return Ok(());
                    };
                    info!(
                        generation = number,
                        listen_addr = %next.api.listen_addr,
                        "Restarting with new configuration"
                    );
                    previous = Some(std::mem::replace(&mut current, next));
                    unsaved = true;
                }
                _ = &mut shutdown => {
                    info!(generation = number, "Shutting down API server");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::archive_engine_factory;
    use std::time::Duration;
    use tokio::net::TcpStream;

    fn config(listen_addr: &str) -> Config {
        let mut config = Config::default();
        config.api.listen_addr = listen_addr.to_string();
        config
    }

    async fn next_generation(rx: &mut watch::Receiver<Option<Generation>>) -> Generation {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|g| g.is_some()))
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_reload_rebinds_listener() {
        let server = ControlServer::new(archive_engine_factory(), None).unwrap();
        let mut generations = server.generations();
        let reload = server.reload_sender();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.run(config("127.0.0.1:0"), async {
            let _ = stop_rx.await;
        }));

        let first = next_generation(&mut generations).await;
        assert_eq!(first.number, 1);
        TcpStream::connect(first.addr).await.unwrap();

        generations.mark_unchanged();
        reload.send(config("127.0.0.1:0")).await.unwrap();
        generations.changed().await.unwrap();
        let second = generations.borrow().unwrap();
        assert_eq!(second.number, 2);
        TcpStream::connect(second.addr).await.unwrap();

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bound_reload_is_written_to_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[api]\nlisten_addr = \"127.0.0.1:0\"\n").unwrap();

        let server = ControlServer::new(archive_engine_factory(), Some(path.clone())).unwrap();
        let mut generations = server.generations();
        let reload = server.reload_sender();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.run(config("127.0.0.1:0"), async {
            let _ = stop_rx.await;
        }));
        next_generation(&mut generations).await;

        let mut next = config("127.0.0.1:0");
        next.api.enable_metrics = false;
        generations.mark_unchanged();
        reload.send(next.clone()).await.unwrap();
        generations.changed().await.unwrap();

        let written = Config::load(&path).unwrap();
        assert_eq!(written, next);

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_rebind_keeps_previous_config() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = blocker.local_addr().unwrap().to_string();

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let original = "[api]\nlisten_addr = \"127.0.0.1:0\"\n";
        std::fs::write(&path, original).unwrap();

        let server = ControlServer::new(archive_engine_factory(), Some(path.clone())).unwrap();
        let mut generations = server.generations();
        let reload = server.reload_sender();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.run(config("127.0.0.1:0"), async {
            let _ = stop_rx.await;
        }));
        next_generation(&mut generations).await;

        generations.mark_unchanged();
        reload.send(config(&taken)).await.unwrap();
        generations.changed().await.unwrap();
        let fallback = generations.borrow().unwrap();
        assert_eq!(fallback.number, 2);
        assert_ne!(fallback.addr.to_string(), taken);
        // The address that failed never reaches the file.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_first_bind_failure_is_fatal() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = blocker.local_addr().unwrap().to_string();
        let server = ControlServer::new(archive_engine_factory(), None).unwrap();
        let result = server.run(config(&taken), std::future::pending()).await;
        assert!(result.is_err());
    }
}
