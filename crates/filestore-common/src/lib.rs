//! File store common - shared types and utilities
//!
//! This crate provides the identifier types, error definitions, and
//! configuration used across all file store components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, WriterKind};
pub use error::{Error, Result};
pub use types::*;
