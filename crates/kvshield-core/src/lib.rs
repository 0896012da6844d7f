//! kvshield-core: Core traits and types for the kvshield toolkit
//!
//! This crate provides the store abstraction, key construction, serialization
//! contract, error taxonomy and event sink shared by every kvshield component.

mod error;
mod traits;
mod types;

pub use error::{KvError, PublicError, Result, TaskError};
pub use traits::*;
pub use types::*;
