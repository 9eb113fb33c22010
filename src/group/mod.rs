pub mod service;

pub use service::{GroupService, NewGroupParams, UpdateGroupParams};
