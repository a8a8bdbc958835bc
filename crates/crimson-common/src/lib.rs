//! Crimson Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, identifiers, routing helpers,
//! and configuration types used across all Crimson components.

pub mod config;
pub mod error;
pub mod types;

pub use config::OsdConfig;
pub use error::{Error, Result};
pub use types::*;
