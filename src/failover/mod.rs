pub mod manager;

pub use manager::{FailoverConfig, FailoverEvent, FailoverManager};
