pub mod accountant;
pub mod availability;
pub mod common;
pub mod model;
pub mod resource;
pub mod store;

pub use crate::common::ids::{FileId, FilesetId, JobId, SubscriptionId, WorkflowId};
pub use crate::common::{Map, Set};

pub type Error = crate::common::error::WmError;
pub type Result<T> = std::result::Result<T, Error>;

// Priority: Bigger number -> Higher priority
pub type Priority = i32;
