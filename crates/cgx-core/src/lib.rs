//! Shared building blocks for the cellgx RSX command processor.
//!
//! Holds the error taxonomy and the configuration surface so that the
//! memory and GPU crates do not depend on each other for either.

pub mod config;
pub mod error;

pub use config::{Config, MemoryConfig, ProcessorConfig};
pub use error::{GpuError, MemoryError};
