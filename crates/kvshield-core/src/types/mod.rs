//! Core types shared by store backends and components

mod batch;
mod policy;
mod rate_limit;
mod ttl;

pub use batch::{BatchItemError, BatchResult, BatchSuccess};
pub use policy::FailurePolicy;
pub use rate_limit::RateLimitStatus;
pub use ttl::{KeyTtl, WindowCount};
