pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, RemoteStorageKind};
pub use error::{BoxError, Error, Result};
pub use types::*;
