//! Logship Common - Shared types and utilities
//!
//! This crate provides common types, error definitions, configuration and
//! checksum helpers used across all Logship components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::SchemaHasher;
pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
