pub mod lb;
pub mod strategies;

pub use lb::{LoadBalancer, SelectOptions};
pub use strategies::{GeoLocator, LbStrategy};
