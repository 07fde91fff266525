//! Shared building blocks for the enclave virtual-cluster syncer.
//!
//! This crate holds the pieces every other enclave crate needs: the error
//! type, the marker label/annotation conventions written onto host objects,
//! the name translator that projects virtual identities into the host
//! namespace, the syncer configuration surface, and retry helpers.

pub mod config;
pub mod constants;
pub mod error;
pub mod retry;
pub mod translate;

pub use error::Error;

/// Convenience result alias used throughout the enclave crates.
pub type Result<T, E = Error> = std::result::Result<T, E>;
