//! Main docmapper crate providing a unified interface for mapping Rust types to documents.
//!
//! This crate is the primary entry point for users of the docmapper framework.
//! It re-exports the core types and functionality from the sub-crates, the
//! `MappedType` derive and the available storage backends.
//!
//! # Features
//!
//! - **Native documents** - Values serialize straight into BSON, with no JSON text in between
//! - **Field codecs** - Hex strings stored as object ids, dates as BSON dates, UUIDs as binary subtype 4
//! - **Deferred queries** - Filters and updates are encoded with the same codecs as the fields they target
//! - **Multiple backends** - In-memory and MongoDB storage behind one backend trait
//!
//! # Quick Start
//!
//! ```ignore
//! use docmapper::{prelude::*, memory::InMemoryStore};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, MappedType)]
//! #[docmapper(collection = "users")]
//! pub struct User {
//!     #[serde(
//!         rename = "_id",
//!         with = "docmapper::codec::object_id",
//!         skip_serializing_if = "Option::is_none",
//!         default
//!     )]
//!     pub id: Option<String>,
//!     pub name: String,
//!     pub tags: Vec<String>,
//! }
//!
//! #[tokio::main]
//! async fn main() -> MapperResult<()> {
//!     let store = DocumentStore::new(InMemoryStore::builder().build().await?);
//!     let users = store.collection::<User>()?;
//!
//!     // Native strategy: the generated object id is visible on the saved value
//!     let result = users
//!         .insert_one(&User { id: None, name: "Alice".into(), tags: vec!["admin".into()] })
//!         .await?;
//!     let id = result.saved_object()?.id.clone();
//!
//!     // The hex id is converted back to an object id inside the filter
//!     let alice = users.find_one(DbQuery::is("_id", id.clone())).await?;
//!     println!("{alice:?}");
//!
//!     users
//!         .update_by_id(id.as_deref().unwrap_or_default(), DbUpdate::push("tags", "owner"))
//!         .await?;
//!
//!     let mut admins = users.find(DbQuery::is("tags", "admin"));
//!     admins.sort(SortSpec::new().ascending("name"))?;
//!     while let Some(user) = admins.next().await? {
//!         println!("{user:?}");
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # References
//!
//! A [`codec::reference::DbRef`] field stores `{ "$ref", "$id", "$db" }` and
//! converts its id with the id codec of the referenced type. It is resolved
//! against a store with [`codec::reference::DbRef::fetch`].
//!
//! # Backends
//!
//! - [`memory`] - In-memory storage for development and testing
//! - [`mongodb`] - Persistent MongoDB backend (requires `mongodb` feature)

pub mod prelude;

pub use docmapper_core::{
    backend, codec, collection, cursor, de, error, id, mapper, query, schema, ser, sink, source, store,
};

pub use docmapper_core::{codec_elements_marker, codec_marker};
pub use docmapper_core::{
    collection::TypedCollection,
    cursor::TypedCursor,
    mapper::Mapper,
    query::{DbQuery, DbUpdate, Query, Update},
    schema::MappedType,
    store::DocumentStore,
};
pub use docmapper_macros::MappedType;

// Re-export BSON types for convenience
pub use bson;

/// In-memory storage backend implementations.
pub mod memory {
    pub use docmapper_memory::{DEFAULT_DATABASE, InMemoryStore, InMemoryStoreBuilder};
}

/// MongoDB storage backend implementations.
///
/// This module is only available when the `mongodb` feature is enabled.
#[cfg(feature = "mongodb")]
pub mod mongodb {
    pub use docmapper_mongodb::{MongoDbStore, MongoDbStoreBuilder};
}
