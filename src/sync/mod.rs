pub mod config_sync;

pub use config_sync::{ConfigSync, SyncConfig, SyncResult};
