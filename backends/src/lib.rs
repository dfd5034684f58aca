pub mod backend;
pub mod cos;
pub mod gcs;
pub mod local;
pub mod s3;
pub mod transfer;
pub mod walk;

pub use backend::{new_remote_storage, BoxReader, RemoteStorage};
pub use cos::{CosBackend, CosError};
pub use gcs::GcsBackend;
pub use local::LocalBackend;
pub use s3::S3Backend;
