//! Lazy typed cursors.

use bson::{Document, doc};
use futures::{StreamExt, stream::BoxStream};
use tracing::debug;

use crate::{
    backend::{FindOptions, StoreBackend},
    collection::{Filter, TypedCollection},
    error::{MapperError, MapperResult},
    query::{Projection, Query, SortSpec},
    schema::MappedType,
};

/// A query over a [`TypedCollection`] that runs on first use.
///
/// Sort, skip, limit, projection and extra conditions may be set until the
/// cursor is first advanced; afterwards each of them fails with
/// [`MapperError::IllegalState`].
pub struct TypedCursor<'a, B: StoreBackend, D: MappedType> {
    collection: &'a TypedCollection<B, D>,
    filter: Filter,
    refinement: Option<Query>,
    options: FindOptions,
    started: bool,
    stream: Option<BoxStream<'static, MapperResult<Document>>>,
}

impl<'a, B: StoreBackend, D: MappedType> TypedCursor<'a, B, D> {
    pub(crate) fn new(collection: &'a TypedCollection<B, D>, filter: Filter) -> Self {
        Self {
            collection,
            filter,
            refinement: None,
            options: FindOptions::default(),
            started: false,
            stream: None,
        }
    }

    fn check_pending(&self) -> MapperResult<()> {
        if self.started {
            return Err(MapperError::IllegalState(
                "cursor options cannot change after iteration started".into(),
            ));
        }
        Ok(())
    }

    pub fn sort(&mut self, sort: SortSpec) -> MapperResult<&mut Self> {
        self.check_pending()?;
        self.options.sort = Some(sort.into());
        Ok(self)
    }

    pub fn skip(&mut self, skip: u64) -> MapperResult<&mut Self> {
        self.check_pending()?;
        self.options.skip = Some(skip);
        Ok(self)
    }

    pub fn limit(&mut self, limit: i64) -> MapperResult<&mut Self> {
        self.check_pending()?;
        self.options.limit = Some(limit);
        Ok(self)
    }

    pub fn projection(&mut self, projection: Projection) -> MapperResult<&mut Self> {
        self.check_pending()?;
        self.options.projection = Some(projection.into());
        Ok(self)
    }

    /// Adds conditions to the cursor's filter.
    ///
    /// A deferred filter absorbs them with [`Query::merge`]; a native filter is
    /// combined with them under `$and` when the cursor runs.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::IllegalState`] once iteration started, or the
    /// merge error.
    pub fn and(&mut self, query: Query) -> MapperResult<&mut Self> {
        self.check_pending()?;

        match (&mut self.filter, &mut self.refinement) {
            (Filter::Query(current), _) => current.merge(query)?,
            (Filter::Native(_), Some(refinement)) => refinement.merge(query)?,
            (Filter::Native(_), refinement @ None) => *refinement = Some(query),
        }
        Ok(self)
    }

    fn filter_document(&self) -> MapperResult<Document> {
        let filter = self.collection.manage_filter(self.filter.clone())?;

        match &self.refinement {
            Some(refinement) => {
                let refinement = self.collection.manage_filter(Filter::Query(refinement.clone()))?;
                Ok(doc! { "$and": [filter, refinement] })
            }
            None => Ok(filter),
        }
    }

    /// Returns the next value, running the query on the first call.
    ///
    /// # Errors
    ///
    /// Fails when the filter cannot be serialized, a document does not
    /// deserialize, or the backend fails.
    pub async fn next(&mut self) -> MapperResult<Option<D>> {
        self.started = true;

        if self.stream.is_none() {
            let filter = self.filter_document()?;
            debug!(collection = %self.collection.name(), %filter, "find");

            let stream = self
                .collection
                .backend()
                .find(filter, self.options.clone(), self.collection.name())
                .await?;
            self.stream = Some(stream);
        }

        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        match stream.next().await {
            Some(document) => self.collection.mapper().from_document(&document?).map(Some),
            None => Ok(None),
        }
    }

    /// Drains the cursor into a vector.
    ///
    /// # Errors
    ///
    /// Fails like [`TypedCursor::next`].
    pub async fn to_vec(mut self) -> MapperResult<Vec<D>> {
        let mut values = Vec::new();
        while let Some(value) = self.next().await? {
            values.push(value);
        }
        Ok(values)
    }
}

impl<B: StoreBackend, D: MappedType> std::fmt::Debug for TypedCursor<'_, B, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedCursor")
            .field("collection", &self.collection.name())
            .field("filter", &self.filter)
            .field("options", &self.options)
            .field("started", &self.started)
            .finish()
    }
}
