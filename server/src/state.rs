use crate::engine::BackupEngine;
use crate::lock::OperationLock;
use crate::metrics::BackupMetrics;
use prometheus::Registry;
use std::sync::Arc;
use tablesnap_core::Config;
use tokio::sync::mpsc;

/// State of one server generation.
///
/// `config` and `engine` belong to this generation only; the lock, the
/// metrics and the reload sender are shared by every generation.
pub struct AppState {
    pub config: Config,
    pub engine: Arc<dyn BackupEngine>,
    pub lock: OperationLock,
    pub metrics: BackupMetrics,
    pub registry: Registry,
    pub reload_tx: mpsc::Sender<Config>,
}
