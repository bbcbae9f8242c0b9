//! In-memory document storage backend for docmapper.
//!
//! This crate provides a thread-safe, in-memory implementation of the `StoreBackend` trait.
//! It uses async-aware read-write locks for concurrent access and is ideal for development,
//! testing, and small-scale deployments.
//!
//! # Features
//!
//! - **Thread-safe access** - Concurrent reads and writes using async-aware RwLock
//! - **Native documents** - Stores documents as BSON in insertion order
//! - **Query support** - Evaluates native filters, update modifiers, sorts and projections
//! - **Aggregation** - `$match`, `$sort`, `$skip`, `$limit`, `$project` and `$count` stages
//!
//! # Quick Start
//!
//! ```ignore
//! use docmapper::{DbQuery, DocumentStore, MappedType, memory::InMemoryStore};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, MappedType)]
//! #[docmapper(collection = "users")]
//! pub struct User {
//!     #[serde(rename = "_id", with = "docmapper::codec::object_id", skip_serializing_if = "Option::is_none", default)]
//!     pub id: Option<String>,
//!     pub name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = InMemoryStore::builder().build().await?;
//!     let store = DocumentStore::new(backend);
//!     let users = store.collection::<User>()?;
//!
//!     users.insert_one(&User { id: None, name: "Alice".to_string() }).await?;
//!     let alice = users.find_one(DbQuery::is("name", "Alice")).await?;
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmapper_memory;

pub mod evaluator;
mod path;
pub mod pipeline;
pub mod store;
pub mod update;

pub use store::{DEFAULT_DATABASE, InMemoryStore, InMemoryStoreBuilder};
