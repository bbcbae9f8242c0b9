//! Convenient re-exports of commonly used types from docmapper.
//!
//! Import this prelude module to quickly access the most frequently used types
//! and traits without needing to import from multiple sub-modules:
//!
//! ```ignore
//! use docmapper::prelude::*;
//! ```
//!
//! This provides access to:
//! - The mapped type trait and derive
//! - Store backends and builders
//! - Query, update and pipeline construction
//! - Collection and cursor interfaces
//! - Error types

pub use docmapper_core::{
    backend::{BulkWriteOutcome, DeleteOutcome, StoreBackend, StoreBackendBuilder, UpdateOutcome},
    codec::reference::DbRef,
    collection::{BulkRequest, CollectionOptions, Filter, SerializationStrategy, TypedCollection, UpdateSpec, WriteResult},
    cursor::TypedCursor,
    error::{MapperError, MapperResult},
    mapper::{Mapper, MapperBuilder, Module},
    query::{DbQuery, DbUpdate, Pipeline, Projection, Query, SortSpec, Update},
    schema::MappedType,
    store::DocumentStore,
};
pub use docmapper_macros::MappedType;
