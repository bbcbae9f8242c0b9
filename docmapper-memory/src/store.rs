//! In-memory storage implementation for document stores.
//!
//! This module provides a simple but powerful in-memory backend that stores
//! native documents in insertion order behind async-safe read-write locks.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::{StreamExt, stream::{self, BoxStream}};
use mea::rwlock::RwLock;
use tracing::debug;

use docmapper_core::{
    backend::{DeleteOutcome, FindOptions, InsertOutcome, StoreBackend, StoreBackendBuilder, UpdateOutcome},
    error::{MapperError, MapperResult},
    schema::ID_FIELD,
};

use crate::{
    evaluator::{self, equals},
    path, pipeline, update,
};

/// The database used when none is configured.
pub const DEFAULT_DATABASE: &str = "docmapper";

#[derive(Debug, Default, Clone)]
struct CollectionData {
    documents: Vec<Document>,
    indexes: Vec<String>,
}

type DatabaseMap = HashMap<String, CollectionData>;
type StoreMap = HashMap<String, DatabaseMap>;

fn matching(documents: &[Document], filter: &Document) -> MapperResult<Vec<usize>> {
    let mut indexes = Vec::new();
    for (index, document) in documents.iter().enumerate() {
        if evaluator::matches(document, filter)? {
            indexes.push(index);
        }
    }
    Ok(indexes)
}

fn id_string(id: &Bson) -> String {
    match id {
        Bson::String(id) => id.clone(),
        Bson::ObjectId(id) => id.to_hex(),
        id => id.to_string(),
    }
}

/// Thread-safe in-memory document storage backend.
///
/// This struct implements the [`StoreBackend`] trait to provide a fully functional
/// document store that operates entirely in memory using async-aware read-write locks.
/// Filters, updates and aggregation stages are evaluated on native documents.
///
/// # Thread Safety
///
/// `InMemoryStore` is cloneable and uses an `Arc`-wrapped internal state, allowing
/// it to be safely shared across async tasks. Multiple clones of the same instance
/// share the same underlying data, and handles for other databases obtained with
/// [`StoreBackend::database`] share it as well.
///
/// # Performance
///
/// Queries scan all documents in a collection. Indexes are recorded by name
/// but neither speed up queries nor enforce uniqueness.
///
/// # Limitations
///
/// Map-reduce and `$where` need a JavaScript engine and are reported as
/// [`MapperError::Backend`] errors.
///
/// # Example
///
/// ```ignore
/// use docmapper_memory::InMemoryStore;
/// use docmapper::backend::StoreBackend;
/// use bson::doc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = InMemoryStore::new();
///
///     store.insert(vec![doc! { "name": "Alice", "age": 30 }], "users").await?;
///     assert_eq!(store.count(doc! { "age": { "$gt": 18 } }, "users").await?, 1);
///
///     Ok(())
/// }
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryStore {
    database: String,
    /// database name -> collection name -> collection
    store: Arc<RwLock<StoreMap>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Creates a new empty in-memory document store using
    /// [`DEFAULT_DATABASE`].
    pub fn new() -> Self {
        Self {
            database: DEFAULT_DATABASE.to_string(),
            store: Arc::new(RwLock::new(StoreMap::new())),
        }
    }

    /// Creates a builder for constructing an `InMemoryStore` with custom options.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use docmapper_memory::InMemoryStore;
    ///
    /// let store = InMemoryStore::builder().database("app").build().await.unwrap();
    /// ```
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder::default()
    }
}

#[async_trait]
impl StoreBackend for InMemoryStore {
    async fn insert(&self, documents: Vec<Document>, collection: &str) -> MapperResult<InsertOutcome> {
        debug!(database = %self.database, collection, count = documents.len(), "insert");

        let mut store = self.store.write().await;
        let data = store
            .entry(self.database.clone())
            .or_default()
            .entry(collection.to_string())
            .or_default();

        let mut outcome = InsertOutcome::default();
        for document in documents {
            let (id, document) = update::with_id(document);

            if data
                .documents
                .iter()
                .any(|existing| existing.get(ID_FIELD).is_some_and(|existing| equals(existing, &id)))
            {
                return Err(MapperError::DocumentAlreadyExists(id_string(&id), collection.to_string()));
            }

            data.documents.push(document);
            outcome.inserted_ids.push(id);
        }

        Ok(outcome)
    }

    async fn find(
        &self,
        filter: Document,
        options: FindOptions,
        collection: &str,
    ) -> MapperResult<BoxStream<'static, MapperResult<Document>>> {
        debug!(database = %self.database, collection, %filter, "find");

        let mut found = {
            let store = self.store.read().await;
            match store.get(&self.database).and_then(|database| database.get(collection)) {
                Some(data) => matching(&data.documents, &filter)?
                    .into_iter()
                    .map(|index| data.documents[index].clone())
                    .collect(),
                None => Vec::new(),
            }
        };

        if let Some(sort) = &options.sort {
            pipeline::sort(&mut found, sort);
        }

        let skip = options
            .skip
            .map(|skip| usize::try_from(skip).unwrap_or(usize::MAX))
            .unwrap_or(0);
        let limit = match options.limit.map(i64::unsigned_abs) {
            Some(0) | None => usize::MAX,
            Some(limit) => usize::try_from(limit).unwrap_or(usize::MAX),
        };

        let documents = found
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|document| match &options.projection {
                Some(projection) => pipeline::project(document, projection),
                None => Ok(document),
            })
            .collect::<Vec<_>>();

        Ok(stream::iter(documents).boxed())
    }

    async fn update(
        &self,
        filter: Document,
        update: Document,
        upsert: bool,
        multi: bool,
        collection: &str,
    ) -> MapperResult<UpdateOutcome> {
        debug!(database = %self.database, collection, %filter, %update, upsert, multi, "update");

        if !update::is_modifier_document(&update) {
            return Err(MapperError::Backend(
                "an update document must consist of modifiers".into(),
            ));
        }

        let mut store = self.store.write().await;
        let data = store
            .entry(self.database.clone())
            .or_default()
            .entry(collection.to_string())
            .or_default();

        let mut indexes = matching(&data.documents, &filter)?;
        if !multi {
            indexes.truncate(1);
        }

        let mut outcome = UpdateOutcome::default();
        for index in indexes {
            let mut updated = data.documents[index].clone();
            update::apply(&mut updated, &update, false)?;

            outcome.matched += 1;
            if updated != data.documents[index] {
                outcome.modified += 1;
                data.documents[index] = updated;
            }
        }

        if outcome.matched == 0 && upsert {
            let mut seeded = update::seed(&filter)?;
            update::apply(&mut seeded, &update, true)?;

            let (id, seeded) = update::with_id(seeded);
            data.documents.push(seeded);
            outcome.upserted_id = Some(id);
        }

        Ok(outcome)
    }

    async fn replace(
        &self,
        filter: Document,
        replacement: Document,
        upsert: bool,
        collection: &str,
    ) -> MapperResult<UpdateOutcome> {
        debug!(database = %self.database, collection, %filter, upsert, "replace");

        if update::is_modifier_document(&replacement) {
            return Err(MapperError::Backend(
                "a replacement document cannot contain modifiers".into(),
            ));
        }

        let mut store = self.store.write().await;
        let data = store
            .entry(self.database.clone())
            .or_default()
            .entry(collection.to_string())
            .or_default();

        match matching(&data.documents, &filter)?.first() {
            Some(&index) => {
                let current = &data.documents[index];
                let id = current.get(ID_FIELD).cloned().unwrap_or(Bson::Null);

                if let Some(new_id) = replacement.get(ID_FIELD) {
                    if !equals(new_id, &id) {
                        return Err(MapperError::Backend("the _id field cannot be modified".into()));
                    }
                }

                let mut replaced = Document::new();
                replaced.insert(ID_FIELD, id);
                replaced.extend(replacement.into_iter().filter(|(key, _)| key != ID_FIELD));

                let modified = u64::from(replaced != data.documents[index]);
                data.documents[index] = replaced;

                Ok(UpdateOutcome {
                    matched: 1,
                    modified,
                    upserted_id: None,
                })
            }
            None if upsert => {
                let mut seeded = replacement;
                if !seeded.contains_key(ID_FIELD) {
                    if let Some(id) = update::seed(&filter)?.get(ID_FIELD) {
                        seeded.insert(ID_FIELD, id.clone());
                    }
                }

                let (id, seeded) = update::with_id(seeded);
                data.documents.push(seeded);

                Ok(UpdateOutcome {
                    matched: 0,
                    modified: 0,
                    upserted_id: Some(id),
                })
            }
            None => Ok(UpdateOutcome::default()),
        }
    }

    async fn delete(&self, filter: Document, many: bool, collection: &str) -> MapperResult<DeleteOutcome> {
        debug!(database = %self.database, collection, %filter, many, "delete");

        let mut store = self.store.write().await;
        let Some(data) = store
            .get_mut(&self.database)
            .and_then(|database| database.get_mut(collection))
        else {
            return Ok(DeleteOutcome::default());
        };

        let mut indexes = matching(&data.documents, &filter)?;
        if !many {
            indexes.truncate(1);
        }

        for index in indexes.iter().rev() {
            data.documents.remove(*index);
        }

        Ok(DeleteOutcome {
            deleted: indexes.len() as u64,
        })
    }

    async fn count(&self, filter: Document, collection: &str) -> MapperResult<u64> {
        let store = self.store.read().await;
        match store.get(&self.database).and_then(|database| database.get(collection)) {
            Some(data) => Ok(matching(&data.documents, &filter)?.len() as u64),
            None => Ok(0),
        }
    }

    async fn distinct(&self, field: &str, filter: Document, collection: &str) -> MapperResult<Vec<Bson>> {
        let store = self.store.read().await;
        let Some(data) = store.get(&self.database).and_then(|database| database.get(collection)) else {
            return Ok(Vec::new());
        };

        let mut values: Vec<Bson> = Vec::new();
        for index in matching(&data.documents, &filter)? {
            for value in path::values_at(&data.documents[index], field) {
                let flattened = match value {
                    Bson::Array(items) => items.iter().collect(),
                    value => vec![value],
                };
                for value in flattened {
                    if !values.iter().any(|seen| equals(seen, value)) {
                        values.push(value.clone());
                    }
                }
            }
        }

        Ok(values)
    }

    async fn aggregate(
        &self,
        pipeline: Vec<Document>,
        collection: &str,
    ) -> MapperResult<BoxStream<'static, MapperResult<Document>>> {
        debug!(database = %self.database, collection, stages = pipeline.len(), "aggregate");

        let documents = {
            let store = self.store.read().await;
            store
                .get(&self.database)
                .and_then(|database| database.get(collection))
                .map(|data| data.documents.clone())
                .unwrap_or_default()
        };

        let results = pipeline::aggregate(documents, &pipeline)?;
        Ok(stream::iter(results.into_iter().map(Ok)).boxed())
    }

    async fn map_reduce(
        &self,
        _map: &str,
        _reduce: &str,
        _filter: Option<Document>,
        _collection: &str,
    ) -> MapperResult<Vec<Document>> {
        Err(MapperError::Backend(
            "map-reduce is not supported by the in-memory store".into(),
        ))
    }

    async fn create_index(&self, keys: Document, _unique: bool, collection: &str) -> MapperResult<String> {
        let name = keys
            .iter()
            .map(|(field, direction)| format!("{field}_{direction}"))
            .collect::<Vec<_>>()
            .join("_");

        let mut store = self.store.write().await;
        let data = store
            .entry(self.database.clone())
            .or_default()
            .entry(collection.to_string())
            .or_default();

        if !data.indexes.contains(&name) {
            data.indexes.push(name.clone());
        }
        Ok(name)
    }

    async fn drop_index(&self, name: &str, collection: &str) -> MapperResult<()> {
        let mut store = self.store.write().await;
        let data = store
            .get_mut(&self.database)
            .and_then(|database| database.get_mut(collection))
            .ok_or_else(|| MapperError::CollectionNotFound(collection.to_string()))?;

        let before = data.indexes.len();
        data.indexes.retain(|index| index != name);
        if data.indexes.len() == before {
            return Err(MapperError::Backend(format!("index '{name}' not found")));
        }
        Ok(())
    }

    async fn create_collection(&self, name: &str) -> MapperResult<()> {
        self.store
            .write()
            .await
            .entry(self.database.clone())
            .or_default()
            .entry(name.to_string())
            .or_default();

        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> MapperResult<()> {
        let mut store = self.store.write().await;

        if store
            .get_mut(&self.database)
            .and_then(|database| database.remove(name))
            .is_none()
        {
            return Err(MapperError::CollectionNotFound(name.to_string()));
        }

        Ok(())
    }

    async fn list_collections(&self) -> MapperResult<Vec<String>> {
        let mut names: Vec<String> = self
            .store
            .read()
            .await
            .get(&self.database)
            .map(|database| database.keys().cloned().collect())
            .unwrap_or_default();

        names.sort();
        Ok(names)
    }

    fn database_name(&self) -> &str {
        &self.database
    }

    fn database(&self, name: &str) -> Self {
        Self {
            database: name.to_string(),
            store: self.store.clone(),
        }
    }
}

/// Builder for constructing [`InMemoryStore`] instances.
///
/// # Example
///
/// ```ignore
/// use docmapper_memory::InMemoryStore;
/// use docmapper::backend::StoreBackendBuilder;
///
/// #[tokio::main]
/// async fn main() {
///     let store = InMemoryStore::builder().database("app").build().await.unwrap();
/// }
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStoreBuilder {
    database: Option<String>,
}

impl InMemoryStoreBuilder {
    /// Sets the database the built handle points at.
    pub fn database(mut self, name: impl Into<String>) -> Self {
        self.database = Some(name.into());
        self
    }
}

#[async_trait]
impl StoreBackendBuilder for InMemoryStoreBuilder {
    type Backend = InMemoryStore;

    /// Builds and returns a new [`InMemoryStore`] instance.
    ///
    /// This always succeeds and returns a freshly initialized store.
    async fn build(self) -> MapperResult<Self::Backend> {
        let store = InMemoryStore::new();
        Ok(match self.database {
            Some(name) => store.database(&name),
            None => store,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use futures::TryStreamExt;
    use pretty_assertions::assert_eq;

    async fn seeded() -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .insert(
                vec![
                    doc! { "_id": 1, "name": "a", "n": 3 },
                    doc! { "_id": 2, "name": "b", "n": 1 },
                    doc! { "_id": 3, "name": "c", "n": 2 },
                ],
                "items",
            )
            .await
            .unwrap();
        store
    }

    async fn all(store: &InMemoryStore, filter: Document, options: FindOptions) -> Vec<Document> {
        store.find(filter, options, "items").await.unwrap().try_collect().await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_generates_ids_and_rejects_duplicates() {
        let store = seeded().await;

        let outcome = store.insert(vec![doc! { "name": "d" }], "items").await.unwrap();
        assert!(matches!(outcome.inserted_ids.as_slice(), [Bson::ObjectId(_)]));

        let err = store.insert(vec![doc! { "_id": 1 }], "items").await.unwrap_err();
        assert!(matches!(err, MapperError::DocumentAlreadyExists(_, _)));
    }

    #[tokio::test]
    async fn test_find_with_options() {
        let store = seeded().await;

        let options = FindOptions {
            sort: Some(doc! { "n": 1 }),
            projection: Some(doc! { "name": 1, "_id": 0 }),
            skip: Some(1),
            limit: Some(1),
        };
        assert_eq!(all(&store, doc! {}, options).await, vec![doc! { "name": "c" }]);
        assert_eq!(store.count(doc! { "n": { "$gte": 2 } }, "items").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_update_and_upsert() {
        let store = seeded().await;

        let outcome = store
            .update(doc! {}, doc! { "$inc": { "n": 10 } }, false, true, "items")
            .await
            .unwrap();
        assert_eq!((outcome.matched, outcome.modified), (3, 3));

        let outcome = store
            .update(doc! { "name": "z" }, doc! { "$set": { "n": 0 } }, true, false, "items")
            .await
            .unwrap();
        let id = outcome.upserted_id.unwrap();
        let upserted = all(&store, doc! { "_id": id.clone() }, FindOptions::default()).await;
        assert_eq!(upserted, vec![doc! { "_id": id, "name": "z", "n": 0 }]);

        assert!(store
            .update(doc! {}, doc! { "name": "plain" }, false, false, "items")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_replace_keeps_id() {
        let store = seeded().await;

        let outcome = store
            .replace(doc! { "name": "b" }, doc! { "name": "bb" }, false, "items")
            .await
            .unwrap();
        assert_eq!(outcome.modified, 1);
        assert_eq!(
            all(&store, doc! { "_id": 2 }, FindOptions::default()).await,
            vec![doc! { "_id": 2, "name": "bb" }]
        );
    }

    #[tokio::test]
    async fn test_delete_and_distinct() {
        let store = seeded().await;
        store.insert(vec![doc! { "_id": 4, "name": "a", "n": 9 }], "items").await.unwrap();

        let names = store.distinct("name", doc! {}, "items").await.unwrap();
        assert_eq!(names, vec![Bson::from("a"), Bson::from("b"), Bson::from("c")]);

        let deleted = store.delete(doc! { "name": "a" }, true, "items").await.unwrap();
        assert_eq!(deleted.deleted, 2);
        assert_eq!(store.count(doc! {}, "items").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_databases_are_separate() {
        let store = seeded().await;
        let other = store.database("other");

        assert_eq!(other.count(doc! {}, "items").await.unwrap(), 0);
        assert_eq!(store.list_collections().await.unwrap(), vec!["items".to_string()]);
        assert!(other.list_collections().await.unwrap().is_empty());
        assert!(store.map_reduce("", "", None, "items").await.is_err());
    }
}
