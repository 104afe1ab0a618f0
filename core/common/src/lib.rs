//! Common utilities and types shared across the replication crates.
//!
//! This module provides the error type and the identifiers that every layer
//! (remote client, local store, replicators) agrees on.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{CollectionName, RemoteId, ReplicationIdentifier, ReplicationMode, SecretString};
