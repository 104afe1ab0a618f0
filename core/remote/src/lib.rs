//! Remote backend access for the replication engine.
//!
//! [`RemoteResourceClient`] is the seam the replicators talk through.
//! [`RestClient`] talks to a WooCommerce-style REST API; [`MemoryRemote`]
//! serves documents from memory for tests and demos.

pub mod client;
pub mod memory;
pub mod rest;

pub use client::{IdFilter, RemoteResourceClient, ResourceQuery};
pub use memory::{MemoryRemote, RecordedRequest, RequestGate, RequestKind};
pub use rest::{RestClient, RestClientConfig};
