//! Storage backend abstraction for the document mapper.
//!
//! This module defines the traits the mapping layer talks to. A backend speaks
//! native documents only: every filter, update and replacement it receives has
//! already been serialized by a [`TypedCollection`](crate::collection::TypedCollection),
//! and every document it returns is deserialized there.
//!
//! # Traits
//!
//! - [`StoreBackend`]: The core trait for storage backends
//! - [`StoreBackendBuilder`]: Factory trait for creating backend instances
//!
//! # Examples
//!
//! ```ignore
//! use docmapper::backend::{FindOptions, StoreBackend};
//! use bson::doc;
//! use futures::TryStreamExt;
//!
//! let backend = MyBackendImpl::new();
//!
//! backend.insert(vec![doc! { "name": "Alice", "age": 30 }], "users").await?;
//! let adults: Vec<_> = backend
//!     .find(doc! { "age": { "$gte": 18 } }, FindOptions::default(), "users")
//!     .await?
//!     .try_collect()
//!     .await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::stream::BoxStream;
use std::fmt::Debug;
use tracing::warn;

use crate::error::MapperResult;

/// Options of a find operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Option<Document>,
    pub projection: Option<Document>,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
}

/// The result of an insert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertOutcome {
    /// The `_id` of every inserted document, in insertion order.
    pub inserted_ids: Vec<Bson>,
}

/// The result of an update or replacement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    /// The `_id` of the document created by an upsert.
    pub upserted_id: Option<Bson>,
}

/// The result of a delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteOutcome {
    pub deleted: u64,
}

/// A single write of a bulk operation, in native form.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteModel {
    InsertOne {
        document: Document,
    },
    UpdateOne {
        filter: Document,
        update: Document,
        upsert: bool,
    },
    UpdateMany {
        filter: Document,
        update: Document,
        upsert: bool,
    },
    ReplaceOne {
        filter: Document,
        replacement: Document,
        upsert: bool,
    },
    DeleteOne {
        filter: Document,
    },
    DeleteMany {
        filter: Document,
    },
}

/// The combined result of a bulk write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkWriteOutcome {
    pub inserted: u64,
    pub matched: u64,
    pub modified: u64,
    pub deleted: u64,
    /// Ids of inserted documents, keyed by the index of their write.
    pub inserted_ids: Vec<(usize, Bson)>,
    /// Ids of upserted documents, keyed by the index of their write.
    pub upserted_ids: Vec<(usize, Bson)>,
}

/// Abstract interface for document storage backends.
///
/// Implementers of this trait provide concrete storage strategies for native
/// documents, from simple in-memory stores to database drivers. The trait
/// defines document lifecycle operations, queries and collection
/// administration.
///
/// # Thread Safety
///
/// All implementations must be thread-safe and support concurrent access from
/// multiple async tasks. The exact concurrency model is implementation-specific
/// but should be documented by the implementer.
///
/// # Error Handling
///
/// Operations return [`MapperResult<T>`](crate::error::MapperResult). Failures
/// of the underlying store are reported as
/// [`MapperError::Backend`](crate::error::MapperError::Backend) and are passed
/// to callers untouched; the mapping layer never retries.
#[async_trait]
pub trait StoreBackend: Send + Sync + Debug {
    /// Inserts documents into a collection.
    ///
    /// Documents without an `_id` receive one generated by the store.
    ///
    /// # Arguments
    ///
    /// * `documents` - The documents to insert
    /// * `collection` - The name of the collection to insert into. Created automatically if it doesn't exist.
    ///
    /// # Returns
    ///
    /// Returns the ids of the inserted documents, or
    /// [`MapperError::DocumentAlreadyExists`](crate::error::MapperError::DocumentAlreadyExists)
    /// if an id is already taken.
    async fn insert(&self, documents: Vec<Document>, collection: &str) -> MapperResult<InsertOutcome>;

    /// Finds the documents matching `filter`.
    ///
    /// # Arguments
    ///
    /// * `filter` - A native filter document
    /// * `options` - Sort, projection, skip and limit
    /// * `collection` - The name of the collection to query
    ///
    /// # Returns
    ///
    /// Returns a stream of the matching documents.
    async fn find(
        &self,
        filter: Document,
        options: FindOptions,
        collection: &str,
    ) -> MapperResult<BoxStream<'static, MapperResult<Document>>>;

    /// Applies `update` to the documents matching `filter`.
    ///
    /// # Arguments
    ///
    /// * `filter` - A native filter document
    /// * `update` - A native update document of modifiers
    /// * `upsert` - Insert a document seeded from the filter when nothing matches
    /// * `multi` - Update every match instead of the first one
    /// * `collection` - The name of the collection
    async fn update(
        &self,
        filter: Document,
        update: Document,
        upsert: bool,
        multi: bool,
        collection: &str,
    ) -> MapperResult<UpdateOutcome>;

    /// Replaces the first document matching `filter`.
    ///
    /// # Arguments
    ///
    /// * `filter` - A native filter document
    /// * `replacement` - The new document
    /// * `upsert` - Insert the replacement when nothing matches
    /// * `collection` - The name of the collection
    async fn replace(
        &self,
        filter: Document,
        replacement: Document,
        upsert: bool,
        collection: &str,
    ) -> MapperResult<UpdateOutcome>;

    /// Deletes the first document matching `filter`, or all of them when
    /// `many` is set.
    async fn delete(&self, filter: Document, many: bool, collection: &str) -> MapperResult<DeleteOutcome>;

    /// Counts the documents matching `filter`.
    async fn count(&self, filter: Document, collection: &str) -> MapperResult<u64>;

    /// Returns the distinct values of `field` among the documents matching
    /// `filter`.
    async fn distinct(&self, field: &str, filter: Document, collection: &str) -> MapperResult<Vec<Bson>>;

    /// Runs an aggregation pipeline.
    async fn aggregate(
        &self,
        pipeline: Vec<Document>,
        collection: &str,
    ) -> MapperResult<BoxStream<'static, MapperResult<Document>>>;

    /// Runs a map-reduce job and returns its `{ _id, value }` results.
    ///
    /// # Arguments
    ///
    /// * `map` - The JavaScript map function
    /// * `reduce` - The JavaScript reduce function
    /// * `filter` - Restricts the input documents
    /// * `collection` - The name of the collection
    async fn map_reduce(
        &self,
        map: &str,
        reduce: &str,
        filter: Option<Document>,
        collection: &str,
    ) -> MapperResult<Vec<Document>>;

    /// Executes a batch of writes.
    ///
    /// The default implementation dispatches each write in turn. An ordered
    /// batch stops at the first failure; an unordered batch runs every write
    /// and reports the first failure at the end.
    async fn bulk_write(
        &self,
        models: Vec<WriteModel>,
        ordered: bool,
        collection: &str,
    ) -> MapperResult<BulkWriteOutcome> {
        let mut outcome = BulkWriteOutcome::default();
        let mut first_error = None;

        for (index, model) in models.into_iter().enumerate() {
            let result = dispatch_write(self, index, model, &mut outcome, collection).await;

            if let Err(err) = result {
                if ordered {
                    return Err(err);
                }
                warn!(index, error = %err, "bulk write failed");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }

    /// Creates an index over `keys`.
    ///
    /// # Returns
    ///
    /// Returns the name of the index.
    async fn create_index(&self, keys: Document, unique: bool, collection: &str) -> MapperResult<String>;

    /// Drops the index called `name`.
    async fn drop_index(&self, name: &str, collection: &str) -> MapperResult<()>;

    /// Creates a new empty collection.
    async fn create_collection(&self, name: &str) -> MapperResult<()>;

    /// Drops a collection and all its documents.
    ///
    /// # Warning
    ///
    /// This operation is irreversible.
    async fn drop_collection(&self, name: &str) -> MapperResult<()>;

    /// Lists the names of all collections of the current database.
    async fn list_collections(&self) -> MapperResult<Vec<String>>;

    /// The name of the database this handle points at.
    fn database_name(&self) -> &str;

    /// Returns a handle to another database of the same store.
    fn database(&self, name: &str) -> Self
    where
        Self: Sized;

    /// Cleanly shuts down the backend, releasing all resources.
    ///
    /// The default implementation is a no-op, but backends with external
    /// connections should override this.
    async fn shutdown(self) -> MapperResult<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

async fn dispatch_write<B>(
    backend: &B,
    index: usize,
    model: WriteModel,
    outcome: &mut BulkWriteOutcome,
    collection: &str,
) -> MapperResult<()>
where
    B: StoreBackend + ?Sized,
{
    let updated = match model {
        WriteModel::InsertOne { document } => {
            let inserted = backend.insert(vec![document], collection).await?;
            outcome.inserted += 1;
            outcome
                .inserted_ids
                .extend(inserted.inserted_ids.into_iter().map(|id| (index, id)));
            return Ok(());
        }
        WriteModel::UpdateOne { filter, update, upsert } => {
            backend.update(filter, update, upsert, false, collection).await?
        }
        WriteModel::UpdateMany { filter, update, upsert } => {
            backend.update(filter, update, upsert, true, collection).await?
        }
        WriteModel::ReplaceOne {
            filter,
            replacement,
            upsert,
        } => backend.replace(filter, replacement, upsert, collection).await?,
        WriteModel::DeleteOne { filter } => {
            outcome.deleted += backend.delete(filter, false, collection).await?.deleted;
            return Ok(());
        }
        WriteModel::DeleteMany { filter } => {
            outcome.deleted += backend.delete(filter, true, collection).await?.deleted;
            return Ok(());
        }
    };

    outcome.matched += updated.matched;
    outcome.modified += updated.modified;
    if let Some(id) = updated.upserted_id {
        outcome.upserted_ids.push((index, id));
    }
    Ok(())
}

#[async_trait]
pub trait StoreBackendBuilder {
    type Backend: StoreBackend;

    async fn build(self) -> MapperResult<Self::Backend>;
}
