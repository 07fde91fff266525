//! The enclave syncer: bi-directional resource synchronization between a
//! virtual Kubernetes control plane and its host cluster.
//!
//! The virtual API server is authoritative for the spec of workload kinds;
//! the host is where the work happens and is authoritative for status.
//! One controller per kind runs the shared state machine in
//! [`sync::machine`] against two informer-backed caches, translating
//! identities through [`enclave_common::translate`] and persisting
//! non-deterministic bindings in [`mappings`].

pub mod cache;
pub mod client;
pub mod context;
pub mod kinds;
pub mod mappings;
pub mod runtime;
pub mod sync;
pub mod testing;
pub mod types;
