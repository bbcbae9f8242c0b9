//! Typed collections.
//!
//! A [`TypedCollection`] binds one collection of a backend to a mapped type.
//! Values are serialized with the collection's [`Mapper`] on the way in and
//! deserialized on the way out; deferred [`Query`] and [`Update`] arguments are
//! bound to the type's schema and serialized just before they are handed to the
//! backend, while native documents pass through untouched.
//!
//! # Example
//!
//! ```ignore
//! use docmapper::{DbQuery, DbUpdate, DocumentStore, MappedType};
//!
//! #[derive(Debug, Serialize, Deserialize, MappedType)]
//! #[docmapper(collection = "users")]
//! pub struct User {
//!     #[serde(rename = "_id", with = "docmapper::codec::object_id")]
//!     pub id: Option<String>,
//!     pub name: String,
//! }
//!
//! # async fn example(store: &docmapper::DocumentStore<impl docmapper::backend::StoreBackend + 'static>) -> docmapper::error::MapperResult<()> {
//! let users = store.collection::<User>()?;
//! let saved = users.insert_one(&User { id: None, name: "Alice".into() }).await?;
//! let id: String = saved.saved_id()?;
//! users.update_by_id(&id, DbUpdate::set("name", "Alicia")).await?;
//! let alicia = users.find_one(DbQuery::is("name", "Alicia")).await?;
//! # Ok(()) }
//! ```

use std::{marker::PhantomData, sync::Arc};

use bson::{Bson, Document, doc, oid::ObjectId};
use futures::TryStreamExt;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, trace};

use crate::{
    backend::{
        BulkWriteOutcome, DeleteOutcome, FindOptions, StoreBackend, UpdateOutcome, WriteModel,
    },
    codec,
    cursor::TypedCursor,
    error::{MapperError, MapperResult},
    id::{IdHandler, id_from_native, id_to_native, resolve_id_handler},
    mapper::Mapper,
    query::{Pipeline, Query, SchemaBinding, Update},
    schema::{FieldSchema, ID_FIELD, MappedType},
};

/// A filter argument: a deferred query or a native filter document.
#[derive(Debug, Clone)]
pub enum Filter {
    Query(Query),
    Native(Document),
}

impl From<Query> for Filter {
    fn from(query: Query) -> Self {
        Filter::Query(query)
    }
}

impl From<Document> for Filter {
    fn from(document: Document) -> Self {
        Filter::Native(document)
    }
}

/// An update argument: a deferred update or a native update document.
#[derive(Debug, Clone)]
pub enum UpdateSpec {
    Update(Update),
    Native(Document),
}

impl From<Update> for UpdateSpec {
    fn from(update: Update) -> Self {
        UpdateSpec::Update(update)
    }
}

impl From<Document> for UpdateSpec {
    fn from(document: Document) -> Self {
        UpdateSpec::Native(document)
    }
}

/// How values are turned into documents on insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SerializationStrategy {
    /// Documents are fully built before the write. A missing or null `_id` is
    /// filled with a new object id when the id has no codec or an object id
    /// codec, and rejected otherwise. The write result carries the saved
    /// values with their ids.
    #[default]
    Native,
    /// Ids are left to the store and taken from its insert outcome. Saved
    /// values are not tracked.
    Streaming,
}

/// Per-collection settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionOptions {
    pub strategy: SerializationStrategy,
}

impl CollectionOptions {
    pub fn strategy(mut self, strategy: SerializationStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// A single write of a typed bulk operation.
#[derive(Debug, Clone)]
pub enum BulkRequest<D> {
    Insert(D),
    UpdateOne {
        filter: Filter,
        update: UpdateSpec,
        upsert: bool,
    },
    UpdateMany {
        filter: Filter,
        update: UpdateSpec,
        upsert: bool,
    },
    ReplaceOne {
        filter: Filter,
        replacement: D,
        upsert: bool,
    },
    DeleteOne(Filter),
    DeleteMany(Filter),
}

/// The outcome of an insert or save.
#[derive(Debug)]
pub struct WriteResult<D> {
    ids: Vec<Bson>,
    objects: Option<Vec<D>>,
    mapper: Arc<Mapper>,
    id_handler: Arc<dyn IdHandler>,
}

impl<D> WriteResult<D> {
    /// The native ids of the written documents.
    pub fn raw_ids(&self) -> &[Bson] {
        &self.ids
    }

    /// The id of the first written document.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::IllegalState`] if nothing was written, or a
    /// mapping error if the id does not convert to `K`.
    pub fn saved_id<K: DeserializeOwned>(&self) -> MapperResult<K> {
        let id = self
            .ids
            .first()
            .ok_or_else(|| MapperError::IllegalState("no document was written".into()))?;
        id_from_native(&self.mapper, self.id_handler.as_ref(), id)
    }

    /// The ids of all written documents.
    ///
    /// # Errors
    ///
    /// Returns a mapping error if an id does not convert to `K`.
    pub fn saved_ids<K: DeserializeOwned>(&self) -> MapperResult<Vec<K>> {
        self.ids
            .iter()
            .map(|id| id_from_native(&self.mapper, self.id_handler.as_ref(), id))
            .collect()
    }

    /// The first written value, as stored.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::IllegalState`] with the streaming strategy, which
    /// does not track written values.
    pub fn saved_object(&self) -> MapperResult<&D> {
        self.saved_objects()?
            .first()
            .ok_or_else(|| MapperError::IllegalState("no document was written".into()))
    }

    /// Every written value, as stored.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::IllegalState`] with the streaming strategy.
    pub fn saved_objects(&self) -> MapperResult<&[D]> {
        self.objects.as_deref().ok_or_else(|| {
            MapperError::IllegalState("saved objects are not tracked by the streaming strategy".into())
        })
    }
}

/// A collection bound to the mapped type `D`.
pub struct TypedCollection<B: StoreBackend, D: MappedType> {
    name: String,
    backend: Arc<B>,
    mapper: Arc<Mapper>,
    binding: SchemaBinding,
    id_handler: Arc<dyn IdHandler>,
    /// Whether a missing `_id` may be filled with a generated object id.
    object_ids: bool,
    options: CollectionOptions,
    _marker: PhantomData<fn() -> D>,
}

impl<B: StoreBackend, D: MappedType> std::fmt::Debug for TypedCollection<B, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedCollection")
            .field("name", &self.name)
            .field("database", &self.backend.database_name())
            .field("type", &std::any::type_name::<D>())
            .field("options", &self.options)
            .finish()
    }
}

impl<B: StoreBackend, D: MappedType> Clone for TypedCollection<B, D> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            backend: self.backend.clone(),
            mapper: self.mapper.clone(),
            binding: self.binding.clone(),
            id_handler: self.id_handler.clone(),
            object_ids: self.object_ids,
            options: self.options,
            _marker: PhantomData,
        }
    }
}

impl<B: StoreBackend, D: MappedType> TypedCollection<B, D> {
    /// Creates a typed collection (internal use).
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::Configuration`] if the type's id codec is unknown.
    pub(crate) fn new(
        name: impl Into<String>,
        backend: Arc<B>,
        mapper: Arc<Mapper>,
        options: CollectionOptions,
    ) -> MapperResult<Self> {
        let schema = mapper.schema_for::<D>();
        let id_handler = resolve_id_handler(&mapper, &schema)?;
        let object_ids = matches!(
            schema.id().and_then(FieldSchema::codec_name),
            None | Some("object_id" | "object_id_bytes")
        );

        Ok(Self {
            name: name.into(),
            binding: SchemaBinding::new(mapper.clone(), schema),
            backend,
            mapper,
            id_handler,
            object_ids,
            options,
            _marker: PhantomData,
        })
    }

    /// Returns the name of this collection.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database_name(&self) -> &str {
        self.backend.database_name()
    }

    pub fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    pub fn options(&self) -> CollectionOptions {
        self.options
    }

    pub(crate) fn backend(&self) -> &B {
        &self.backend
    }

    /// Serializes a filter argument.
    ///
    /// # Errors
    ///
    /// Fails when a deferred query cannot be bound or serialized.
    pub fn manage_filter(&self, filter: Filter) -> MapperResult<Document> {
        match filter {
            Filter::Query(mut query) => {
                query.initialize(self.binding.clone())?;
                let filter = query.serialize()?;
                trace!(collection = %self.name, %filter, "filter");
                Ok(filter)
            }
            Filter::Native(document) => Ok(document),
        }
    }

    /// Serializes an update argument.
    ///
    /// # Errors
    ///
    /// Fails when a deferred update cannot be bound or serialized.
    pub fn manage_update(&self, update: UpdateSpec) -> MapperResult<Document> {
        match update {
            UpdateSpec::Update(mut update) => {
                update.initialize(self.binding.clone())?;
                let update = update.serialize()?;
                trace!(collection = %self.name, %update, "update");
                Ok(update)
            }
            UpdateSpec::Native(document) => Ok(document),
        }
    }

    fn id_filter<K>(&self, id: &K) -> MapperResult<Document>
    where
        K: ?Sized + Serialize,
    {
        let id = id_to_native(&self.mapper, self.id_handler.as_ref(), id)?;
        Ok(doc! { ID_FIELD: id })
    }

    /// Serializes a value for insertion according to the collection's strategy.
    ///
    /// Under [`SerializationStrategy::Native`] a missing id is generated only
    /// for object id backed ids. Other id types must be set by the caller.
    fn prepare(&self, value: &D) -> MapperResult<Document> {
        let mut document = self.mapper.to_document(value)?;

        match self.options.strategy {
            SerializationStrategy::Native => {
                if matches!(document.get(ID_FIELD), None | Some(Bson::Null)) {
                    if !self.object_ids {
                        return Err(MapperError::Configuration(format!(
                            "{} has no id and its id codec cannot hold a generated object id",
                            std::any::type_name::<D>()
                        )));
                    }
                    document = with_generated_id(document);
                }
            }
            SerializationStrategy::Streaming => {
                if matches!(document.get(ID_FIELD), Some(Bson::Null)) {
                    document.remove(ID_FIELD);
                }
            }
        }

        Ok(document)
    }

    fn write_result(&self, ids: Vec<Bson>, objects: Option<Vec<D>>) -> WriteResult<D> {
        WriteResult {
            ids,
            objects,
            mapper: self.mapper.clone(),
            id_handler: self.id_handler.clone(),
        }
    }

    /// Inserts one value.
    ///
    /// # Errors
    ///
    /// Returns a mapping error if the value cannot be serialized, or the
    /// backend's error.
    pub async fn insert_one(&self, value: &D) -> MapperResult<WriteResult<D>> {
        self.insert_many(std::slice::from_ref(value)).await
    }

    /// Inserts several values in one backend call.
    ///
    /// # Errors
    ///
    /// Returns a mapping error if a value cannot be serialized, or the
    /// backend's error.
    pub async fn insert_many(&self, values: &[D]) -> MapperResult<WriteResult<D>> {
        debug!(collection = %self.name, count = values.len(), "insert");

        let documents = values
            .iter()
            .map(|value| self.prepare(value))
            .collect::<MapperResult<Vec<_>>>()?;

        match self.options.strategy {
            SerializationStrategy::Native => {
                let ids = documents
                    .iter()
                    .map(|document| document.get(ID_FIELD).cloned().unwrap_or(Bson::Null))
                    .collect();
                let saved = documents
                    .iter()
                    .map(|document| self.mapper.from_document(document))
                    .collect::<MapperResult<Vec<D>>>()?;

                self.backend.insert(documents, &self.name).await?;
                Ok(self.write_result(ids, Some(saved)))
            }
            SerializationStrategy::Streaming => {
                let outcome = self.backend.insert(documents, &self.name).await?;
                Ok(self.write_result(outcome.inserted_ids, None))
            }
        }
    }

    /// Inserts the value, or replaces the stored document with the same id.
    ///
    /// # Errors
    ///
    /// Returns a mapping error if the value cannot be serialized, or the
    /// backend's error.
    pub async fn save(&self, value: &D) -> MapperResult<WriteResult<D>> {
        let document = self.mapper.to_document(value)?;

        let Some(id) = document.get(ID_FIELD).filter(|id| !matches!(id, Bson::Null)).cloned() else {
            return self.insert_one(value).await;
        };

        debug!(collection = %self.name, %id, "save");
        self.backend
            .replace(doc! { ID_FIELD: id.clone() }, document.clone(), true, &self.name)
            .await?;

        let saved = match self.options.strategy {
            SerializationStrategy::Native => Some(vec![self.mapper.from_document(&document)?]),
            SerializationStrategy::Streaming => None,
        };
        Ok(self.write_result(vec![id], saved))
    }

    /// Starts a lazy query.
    ///
    /// Nothing is sent to the backend until the cursor is first advanced.
    pub fn find(&self, filter: impl Into<Filter>) -> TypedCursor<'_, B, D> {
        TypedCursor::new(self, filter.into())
    }

    pub fn find_all(&self) -> TypedCursor<'_, B, D> {
        self.find(Query::new())
    }

    /// Returns the first value matching `filter`.
    ///
    /// # Errors
    ///
    /// Fails when the filter cannot be serialized, the stored document does not
    /// deserialize, or the backend fails.
    pub async fn find_one(&self, filter: impl Into<Filter>) -> MapperResult<Option<D>> {
        let mut cursor = self.find(filter);
        cursor.limit(1)?;
        cursor.next().await
    }

    /// Returns the value with the given id.
    ///
    /// The id is converted with the type's id handler, so a hex string finds a
    /// document stored with a native object id.
    ///
    /// # Errors
    ///
    /// Fails like [`TypedCollection::find_one`], or when the id cannot be
    /// converted.
    pub async fn find_one_by_id<K>(&self, id: &K) -> MapperResult<Option<D>>
    where
        K: ?Sized + Serialize + Sync,
    {
        let filter = self.id_filter(id)?;
        self.find_one(filter).await
    }

    /// Updates the documents matching `filter`.
    ///
    /// # Errors
    ///
    /// Fails when the filter or update cannot be serialized, or the backend
    /// fails.
    pub async fn update(
        &self,
        filter: impl Into<Filter>,
        update: impl Into<UpdateSpec>,
        upsert: bool,
        multi: bool,
    ) -> MapperResult<UpdateOutcome> {
        let filter = self.manage_filter(filter.into())?;
        let update = self.manage_update(update.into())?;

        debug!(collection = %self.name, upsert, multi, "update");
        self.backend.update(filter, update, upsert, multi, &self.name).await
    }

    /// Updates the first document matching `filter`.
    ///
    /// # Errors
    ///
    /// Fails like [`TypedCollection::update`].
    pub async fn update_one(
        &self,
        filter: impl Into<Filter>,
        update: impl Into<UpdateSpec>,
    ) -> MapperResult<UpdateOutcome> {
        self.update(filter, update, false, false).await
    }

    /// Updates every document matching `filter`.
    ///
    /// # Errors
    ///
    /// Fails like [`TypedCollection::update`].
    pub async fn update_many(
        &self,
        filter: impl Into<Filter>,
        update: impl Into<UpdateSpec>,
    ) -> MapperResult<UpdateOutcome> {
        self.update(filter, update, false, true).await
    }

    /// Updates the document with the given id.
    ///
    /// # Errors
    ///
    /// Fails like [`TypedCollection::update`], or when the id cannot be
    /// converted.
    pub async fn update_by_id<K>(&self, id: &K, update: impl Into<UpdateSpec>) -> MapperResult<UpdateOutcome>
    where
        K: ?Sized + Serialize + Sync,
    {
        let filter = self.id_filter(id)?;
        self.update(filter, update, false, false).await
    }

    /// Replaces the first document matching `filter` with `value`.
    ///
    /// # Errors
    ///
    /// Fails when the filter or value cannot be serialized, or the backend
    /// fails.
    pub async fn replace_one(
        &self,
        filter: impl Into<Filter>,
        value: &D,
        upsert: bool,
    ) -> MapperResult<UpdateOutcome> {
        let filter = self.manage_filter(filter.into())?;
        let replacement = self.mapper.to_document(value)?;

        debug!(collection = %self.name, upsert, "replace");
        self.backend.replace(filter, replacement, upsert, &self.name).await
    }

    /// Replaces the document with the given id.
    ///
    /// # Errors
    ///
    /// Fails like [`TypedCollection::replace_one`], or when the id cannot be
    /// converted.
    pub async fn replace_by_id<K>(&self, id: &K, value: &D) -> MapperResult<UpdateOutcome>
    where
        K: ?Sized + Serialize + Sync,
    {
        let filter = self.id_filter(id)?;
        self.replace_one(filter, value, false).await
    }

    /// Deletes every document matching `filter`.
    ///
    /// # Errors
    ///
    /// Fails when the filter cannot be serialized, or the backend fails.
    pub async fn remove(&self, filter: impl Into<Filter>) -> MapperResult<DeleteOutcome> {
        let filter = self.manage_filter(filter.into())?;

        debug!(collection = %self.name, "remove");
        self.backend.delete(filter, true, &self.name).await
    }

    /// Deletes the document with the given id.
    ///
    /// # Errors
    ///
    /// Fails when the id cannot be converted, or the backend fails.
    pub async fn remove_by_id<K>(&self, id: &K) -> MapperResult<DeleteOutcome>
    where
        K: ?Sized + Serialize + Sync,
    {
        let filter = self.id_filter(id)?;

        debug!(collection = %self.name, "remove by id");
        self.backend.delete(filter, false, &self.name).await
    }

    /// Counts the documents matching `filter`.
    ///
    /// # Errors
    ///
    /// Fails when the filter cannot be serialized, or the backend fails.
    pub async fn count(&self, filter: impl Into<Filter>) -> MapperResult<u64> {
        let filter = self.manage_filter(filter.into())?;
        self.backend.count(filter, &self.name).await
    }

    /// Returns the distinct values of `field`, decoded through the field's
    /// codec.
    ///
    /// # Errors
    ///
    /// Fails when the filter cannot be serialized, a value does not convert to
    /// `R`, or the backend fails.
    pub async fn distinct<R>(&self, field: &str, filter: impl Into<Filter>) -> MapperResult<Vec<R>>
    where
        R: DeserializeOwned,
    {
        let filter = self.manage_filter(filter.into())?;
        let values = self.backend.distinct(field, filter, &self.name).await?;

        let field_codec = self
            .binding
            .schema()
            .resolve(field)
            .and_then(FieldSchema::codec_name)
            .map(|name| self.mapper.codec(name))
            .transpose()?;
        let context = self.mapper.codec_context();

        values
            .iter()
            .map(|value| {
                let generic = match &field_codec {
                    Some(field_codec) => codec::decode(field_codec.as_ref(), value, &context)
                        .map_err(|e| e.at_path(field))?,
                    None => value.clone(),
                };
                self.mapper.from_bson(&generic)
            })
            .collect()
    }

    /// Runs an aggregation and deserializes its output documents into `R`.
    ///
    /// `$match` stages holding deferred queries are serialized against `D`.
    ///
    /// # Errors
    ///
    /// Fails when a stage cannot be serialized, an output document does not
    /// deserialize, or the backend fails.
    pub async fn aggregate<R>(&self, pipeline: Pipeline) -> MapperResult<Vec<R>>
    where
        R: DeserializeOwned,
    {
        let stages = pipeline.serialize(&self.binding)?;

        debug!(collection = %self.name, stages = stages.len(), "aggregate");
        let documents: Vec<Document> = self
            .backend
            .aggregate(stages, &self.name)
            .await?
            .try_collect()
            .await?;

        documents
            .iter()
            .map(|document| self.mapper.from_document(document))
            .collect()
    }

    /// Runs a map-reduce job and deserializes its `{ _id, value }` documents
    /// into `R`.
    ///
    /// # Errors
    ///
    /// Fails when the filter cannot be serialized, an output document does not
    /// deserialize, or the backend fails.
    pub async fn map_reduce<R>(&self, map: &str, reduce: &str, filter: Option<Filter>) -> MapperResult<Vec<R>>
    where
        R: DeserializeOwned,
    {
        let filter = filter.map(|filter| self.manage_filter(filter)).transpose()?;

        debug!(collection = %self.name, "map reduce");
        let documents = self.backend.map_reduce(map, reduce, filter, &self.name).await?;

        documents
            .iter()
            .map(|document| self.mapper.from_document(document))
            .collect()
    }

    /// Executes a batch of writes.
    ///
    /// Filters and updates inside the batch are serialized exactly like those
    /// of the single-document operations.
    ///
    /// # Errors
    ///
    /// Fails when a request cannot be serialized, or the backend fails.
    pub async fn bulk_write(&self, requests: Vec<BulkRequest<D>>, ordered: bool) -> MapperResult<BulkWriteOutcome> {
        let models = requests
            .into_iter()
            .map(|request| self.write_model(request))
            .collect::<MapperResult<Vec<_>>>()?;

        debug!(collection = %self.name, writes = models.len(), ordered, "bulk write");
        self.backend.bulk_write(models, ordered, &self.name).await
    }

    fn write_model(&self, request: BulkRequest<D>) -> MapperResult<WriteModel> {
        Ok(match request {
            BulkRequest::Insert(value) => WriteModel::InsertOne {
                document: self.prepare(&value)?,
            },
            BulkRequest::UpdateOne { filter, update, upsert } => WriteModel::UpdateOne {
                filter: self.manage_filter(filter)?,
                update: self.manage_update(update)?,
                upsert,
            },
            BulkRequest::UpdateMany { filter, update, upsert } => WriteModel::UpdateMany {
                filter: self.manage_filter(filter)?,
                update: self.manage_update(update)?,
                upsert,
            },
            BulkRequest::ReplaceOne {
                filter,
                replacement,
                upsert,
            } => WriteModel::ReplaceOne {
                filter: self.manage_filter(filter)?,
                replacement: self.mapper.to_document(&replacement)?,
                upsert,
            },
            BulkRequest::DeleteOne(filter) => WriteModel::DeleteOne {
                filter: self.manage_filter(filter)?,
            },
            BulkRequest::DeleteMany(filter) => WriteModel::DeleteMany {
                filter: self.manage_filter(filter)?,
            },
        })
    }

    /// Creates an index over `keys`, returning its name.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn create_index(&self, keys: impl Into<Document>, unique: bool) -> MapperResult<String> {
        self.backend.create_index(keys.into(), unique, &self.name).await
    }

    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn drop_index(&self, name: &str) -> MapperResult<()> {
        self.backend.drop_index(name, &self.name).await
    }

    /// Drops the whole collection.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn drop(&self) -> MapperResult<()> {
        debug!(collection = %self.name, "drop");
        self.backend.drop_collection(&self.name).await
    }

    /// Views the same collection through another mapped type.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::Configuration`] if the id codec of `R` is unknown.
    pub fn with_type<R: MappedType>(&self) -> MapperResult<TypedCollection<B, R>> {
        TypedCollection::new(
            self.name.clone(),
            self.backend.clone(),
            self.mapper.clone(),
            self.options,
        )
    }
}

/// Moves a new object id to the front of `document`, dropping any null `_id`.
fn with_generated_id(document: Document) -> Document {
    let mut prepared = Document::new();
    prepared.insert(ID_FIELD, ObjectId::new());
    prepared.extend(document.into_iter().filter(|(key, _)| key != ID_FIELD));
    prepared
}
