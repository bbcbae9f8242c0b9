//! Main document store interface.
//!
//! A [`DocumentStore`] pairs a backend with a [`Mapper`] and hands out
//! [`TypedCollection`]s bound to mapped types.
//!
//! # Example
//!
//! ```ignore
//! use docmapper::store::DocumentStore;
//!
//! let store = DocumentStore::new(backend);
//! let users = store.collection::<User>()?;
//! ```

use std::{
    any::{Any, TypeId},
    sync::Arc,
};

use dashmap::DashMap;
use tracing::debug;

use crate::{
    backend::StoreBackend,
    collection::{CollectionOptions, TypedCollection},
    error::{MapperError, MapperResult},
    mapper::Mapper,
    schema::MappedType,
};

type ReferenceKey = (String, String, TypeId);

/// A document store bound to a specific backend implementation.
///
/// # Type Parameters
///
/// * `B` - The backend implementation type
///
/// # Example
///
/// ```ignore
/// let store = DocumentStore::with_mapper(backend, Mapper::builder().module(MyModule).build());
/// let users = store.collection::<User>()?;
/// ```
#[derive(Debug)]
pub struct DocumentStore<B: StoreBackend> {
    backend: Arc<B>,
    mapper: Arc<Mapper>,
    references: DashMap<ReferenceKey, Arc<dyn Any + Send + Sync>>,
}

impl<B: StoreBackend> DocumentStore<B> {
    /// Creates a store with the default mapper.
    pub fn new(backend: B) -> Self {
        Self::with_mapper(backend, Mapper::default())
    }

    /// Creates a store that maps values with `mapper`.
    pub fn with_mapper(backend: B, mapper: impl Into<Arc<Mapper>>) -> Self {
        Self {
            backend: Arc::new(backend),
            mapper: mapper.into(),
            references: DashMap::new(),
        }
    }

    pub fn mapper(&self) -> &Arc<Mapper> {
        &self.mapper
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn database_name(&self) -> &str {
        self.backend.database_name()
    }

    /// Gets the collection of `D`, named by [`MappedType::collection_name`].
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::Configuration`] if the id codec of `D` is unknown
    /// to the store's mapper.
    pub fn collection<D: MappedType>(&self) -> MapperResult<TypedCollection<B, D>> {
        self.collection_named(D::collection_name())
    }

    /// Gets a collection of `D` with an explicit name.
    ///
    /// # Errors
    ///
    /// Fails like [`DocumentStore::collection`].
    pub fn collection_named<D: MappedType>(&self, name: &str) -> MapperResult<TypedCollection<B, D>> {
        self.collection_with_options(name, CollectionOptions::default())
    }

    /// Gets a collection of `D` with an explicit name and options.
    ///
    /// # Errors
    ///
    /// Fails like [`DocumentStore::collection`].
    pub fn collection_with_options<D: MappedType>(
        &self,
        name: &str,
        options: CollectionOptions,
    ) -> MapperResult<TypedCollection<B, D>> {
        TypedCollection::new(name, self.backend.clone(), self.mapper.clone(), options)
    }

    /// Creates a new collection with the given name.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection already exists or creation fails.
    pub async fn create_collection(&self, name: &str) -> MapperResult<()> {
        self.backend.create_collection(name).await
    }

    /// Drops (deletes) a collection with the given name.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection does not exist or deletion fails.
    pub async fn drop_collection(&self, name: &str) -> MapperResult<()> {
        self.backend.drop_collection(name).await
    }

    /// Lists all collections of the store's database.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation fails.
    pub async fn list_collections(&self) -> MapperResult<Vec<String>> {
        self.backend.list_collections().await
    }

    /// Shuts down the backend.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::IllegalState`] while collections handed out by
    /// this store are still alive, or the backend's shutdown error.
    pub async fn shutdown(self) -> MapperResult<()> {
        drop(self.references);

        let backend = Arc::try_unwrap(self.backend).map_err(|_| {
            MapperError::IllegalState("the backend is still used by live collections".into())
        })?;
        backend.shutdown().await
    }
}

impl<B: StoreBackend + 'static> DocumentStore<B> {
    /// Gets the shared collection handle used to resolve references.
    ///
    /// Handles are cached per database, collection and type; the first caller
    /// creates the handle and later callers receive the same one. `None` means
    /// the store's own database.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::Configuration`] if the id codec of `D` is unknown.
    pub fn reference_collection<D: MappedType>(
        &self,
        database: Option<&str>,
        collection: &str,
    ) -> MapperResult<Arc<TypedCollection<B, D>>> {
        let database = database.unwrap_or(self.backend.database_name()).to_owned();
        let key = (database, collection.to_owned(), TypeId::of::<D>());

        let cached = self.references.get(&key).map(|handle| handle.clone());
        let handle = match cached {
            Some(handle) => handle,
            None => {
                let backend = if key.0 == self.backend.database_name() {
                    self.backend.clone()
                } else {
                    Arc::new(self.backend.database(&key.0))
                };

                debug!(database = %key.0, collection, "reference collection");
                let created: Arc<dyn Any + Send + Sync> = Arc::new(TypedCollection::<B, D>::new(
                    collection,
                    backend,
                    self.mapper.clone(),
                    CollectionOptions::default(),
                )?);
                self.references.entry(key).or_insert(created).clone()
            }
        };

        handle
            .downcast::<TypedCollection<B, D>>()
            .map_err(|_| MapperError::IllegalState("reference cache holds a handle of another type".into()))
    }
}
