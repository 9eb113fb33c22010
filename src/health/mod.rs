pub mod checker;

pub use checker::{FailoverTrigger, HealthChecker, HealthConfig};
