pub mod service;
pub mod validation;

pub use service::{DeleteLock, NewNodeParams, NodeService, NodeServiceConfig, UpdateNodeParams};
