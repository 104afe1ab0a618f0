//! Local replica contract for the replication engine.
//!
//! The engine consumes a local document store through [`LocalCollection`].
//! [`MemoryCollection`] is an in-memory implementation with JSON snapshots.

pub mod collection;
pub mod memory;

pub use collection::{
    parse_rest_document, BulkUpsertReport, LocalCollection, LocalDocument, RejectedDocument,
    DATE_MODIFIED_FIELD,
};
pub use memory::{
    CollectionSnapshot, CollectionStats, DocumentParser, DocumentRejector, MemoryCollection,
};
