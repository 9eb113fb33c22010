pub mod service;

pub use service::{TrafficService, TrafficStats};
