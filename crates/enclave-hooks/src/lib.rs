//! Request interceptors in front of the virtual API server.
//!
//! A fixed set of endpoints needs host knowledge to answer correctly: node
//! views, the apiserver's own endpoints, and pod subresources (exec,
//! attach, logs, port-forward) that must reach the host kubelet. Everything
//! else passes through to the virtual API server untouched.
//!
//! Hooks are stateless apart from cache reads and never write to the host.

pub mod cidr;
pub mod endpoints;
pub mod error;
pub mod nodes;
pub mod proxy;
pub mod server;

pub use error::Error;
pub use server::{serve, HookState, HostView, KubeHostView};
