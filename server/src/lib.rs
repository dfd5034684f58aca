pub mod engine;
pub mod handlers;
pub mod lock;
pub mod metrics;
pub mod response;
pub mod routes;
pub mod server;
pub mod state;

pub use engine::{archive_engine_factory, ArchiveEngine, BackupEngine, BackupSummary, EngineFactory};
pub use lock::{OperationGuard, OperationLock};
pub use metrics::BackupMetrics;
pub use response::{ApiError, ApiResponse};
pub use routes::build_router;
pub use server::{ControlServer, Generation};
pub use state::AppState;
