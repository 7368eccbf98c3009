//! Shared utilities and error types for the Basil compiler
//!
//! This crate provides common functionality used across all compiler
//! components:
//! - Error types and handling utilities
//! - A dense growable bit set used by the liveness machinery
//! - Target settings

pub mod bitset;
pub mod error;
pub mod settings;

pub use bitset::*;
pub use error::*;
pub use settings::*;
