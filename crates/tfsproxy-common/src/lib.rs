//! tfsproxy Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, configuration, identifiers and
//! protocol checksums used across all tfsproxy components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{ProtocolCrc, murmur_hash2, tfs_crc};
pub use config::ProxyConfig;
pub use error::{Error, Result, StatusCode};
pub use types::*;
