pub mod authenticator;
pub mod token;

pub use authenticator::{AuthConfig, Authenticator};
