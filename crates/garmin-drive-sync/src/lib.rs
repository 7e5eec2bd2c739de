pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod storage;
pub mod sync;

pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use sync::{run, RunOptions, SyncReport};
