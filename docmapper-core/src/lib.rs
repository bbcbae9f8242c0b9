//! A serde object-document mapper that writes straight into native BSON documents.
//!
//! This crate is the core of the docmapper project and provides:
//!
//! - **Value sink and source** ([`sink`], [`source`]) - Native document writer and cursor reader
//! - **Serde bridge** ([`ser`], [`de`]) - Serializer and deserializer over native values
//! - **Codecs** ([`codec`]) - Schema-aware conversions such as hex strings to object ids
//! - **Mapper** ([`mapper`]) - Codec registry, modules and schema cache
//! - **Schemas and ids** ([`schema`], [`id`]) - Per-type field metadata and id conversion
//! - **Query and update model** ([`query`]) - Deferred filters and updates serialized against schemas
//! - **Store backend abstraction** ([`backend`]) - Traits for implementing different storage backends
//! - **Collections and cursors** ([`collection`], [`cursor`]) - Typed collection facade
//! - **Document store** ([`store`]) - Entry point handing out typed collections
//! - **Error handling** ([`error`]) - Error and result types
//!
//! # Example
//!
//! ```ignore
//! use docmapper_core::{mapper::Mapper, schema::MappedType};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! pub struct User {
//!     #[serde(rename = "_id", with = "docmapper_core::codec::object_id")]
//!     pub id: String,
//!     pub name: String,
//! }
//!
//! impl MappedType for User {
//!     fn collection_name() -> &'static str {
//!         "users"
//!     }
//! }
//!
//! let mapper = Mapper::default();
//! let document = mapper.to_document(&User { id: "5f1d7f3e9c1e4b2a3c4d5e6f".into(), name: "Alice".into() })?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmapper_core;

pub mod backend;
pub mod codec;
pub mod collection;
pub mod cursor;
pub mod de;
pub mod error;
pub mod id;
pub mod mapper;
pub mod query;
pub mod schema;
pub mod ser;
pub mod sink;
pub mod source;
pub mod store;
