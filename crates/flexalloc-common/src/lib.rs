//! Flexalloc Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, the device-facing value types
//! and the configuration tree shared by the block I/O layer and its tools.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
