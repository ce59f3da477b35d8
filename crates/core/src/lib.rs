pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use config::AppConfig;
pub use errors::{IngestError, Result};
pub use traits::{IndexSpec, MockStorageMaintainer, StorageMaintainer};
