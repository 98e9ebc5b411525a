//! dynamig-core: Core types for the dynamig partition manager
//!
//! This crate provides the fundamental types used throughout dynamig:
//! - MIG profiles and the per-GPU-model profile catalog
//! - Placements, device selectors and slice lifecycle state
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod profile;
pub mod slice;

pub use config::*;
pub use error::*;
pub use profile::*;
pub use slice::*;
