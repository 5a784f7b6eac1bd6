//! exmem common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all exmem components.

pub mod bid;
pub mod config;
pub mod error;
pub mod record;

pub use bid::Bid;
pub use config::{DiskConfig, DiskDriver, DiskSpec};
pub use error::{ExmemError, Result};
pub use record::Record;
