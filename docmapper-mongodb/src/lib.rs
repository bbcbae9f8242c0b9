//! MongoDB backend implementation for docmapper.
//!
//! This crate provides a MongoDB-based implementation of the `StoreBackend` trait,
//! handing the native filters, updates and pipelines built by the mapping layer
//! straight to the MongoDB driver.
//!
//! To use this backend, include the `mongodb` feature in your `Cargo.toml`:
//! 
//! ```toml
//! [dependencies]
//! docmapper = { version = "x.y.z", features = ["mongodb"] }
//! ```
//!
//! # Features
//!
//! - **Persistent storage** - Data is persisted to MongoDB Atlas or self-hosted MongoDB
//! - **Full query support** - Filters, updates and aggregations run on MongoDB's query engine
//! - **Async/await** - Fully asynchronous API built on MongoDB's async driver
//! - **Indexing** - Support for creating and dropping MongoDB indexes
//! - **Map-reduce** - Runs inline `mapReduce` commands
//!
//! # Connection
//!
//! To use this backend, you need a MongoDB connection string. This can be provided
//! through the builder pattern.
//!
//! # Example
//!
//! ```ignore
//! use docmapper::{DocumentStore, backend::StoreBackendBuilder, mongodb::MongoDbStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MongoDbStore::builder("mongodb://localhost:27017", "my_database")
//!         .build()
//!         .await?;
//!     let store = DocumentStore::new(backend);
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmapper_mongodb;

pub mod store;

pub use store::{MongoDbStore, MongoDbStoreBuilder};
