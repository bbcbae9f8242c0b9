use async_trait::async_trait;
use bson::{Bson, Document, doc};
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use mongodb::{
    Client, Collection as MongoCollection, IndexModel,
    options::{ClientOptions, FindOptions as MongoFindOptions, IndexOptions},
};
use tracing::debug;

use docmapper_core::{
    backend::{
        DeleteOutcome, FindOptions, InsertOutcome, StoreBackend, StoreBackendBuilder, UpdateOutcome,
    },
    error::{MapperError, MapperResult},
};

fn backend_error(e: mongodb::error::Error) -> MapperError {
    MapperError::Backend(e.to_string())
}

#[derive(Debug)]
pub struct MongoDbStore {
    client: Client,
    database: String,
}

impl MongoDbStore {
    pub fn new(client: Client, database: String) -> Self {
        Self { client, database }
    }

    pub fn builder(dsn: &str, database: &str) -> MongoDbStoreBuilder {
        MongoDbStoreBuilder::new(dsn, database)
    }

    fn get_collection(&self, collection_name: &str) -> MongoCollection<Document> {
        self.client.database(&self.database).collection(collection_name)
    }
}

#[async_trait]
impl StoreBackend for MongoDbStore {
    async fn insert(&self, documents: Vec<Document>, collection: &str) -> MapperResult<InsertOutcome> {
        debug!(database = %self.database, collection, count = documents.len(), "insert");

        if documents.is_empty() {
            return Ok(InsertOutcome::default());
        }

        let mut inserted: Vec<(usize, Bson)> = self
            .get_collection(collection)
            .insert_many(documents)
            .await
            .map_err(backend_error)?
            .inserted_ids
            .into_iter()
            .collect();
        inserted.sort_by_key(|(index, _)| *index);

        Ok(InsertOutcome {
            inserted_ids: inserted.into_iter().map(|(_, id)| id).collect(),
        })
    }

    async fn find(
        &self,
        filter: Document,
        options: FindOptions,
        collection: &str,
    ) -> MapperResult<BoxStream<'static, MapperResult<Document>>> {
        debug!(database = %self.database, collection, %filter, "find");

        let mut find_options = MongoFindOptions::default();
        find_options.sort = options.sort;
        find_options.projection = options.projection;
        find_options.skip = options.skip;
        find_options.limit = options.limit;

        Ok(self
            .get_collection(collection)
            .find(filter)
            .with_options(find_options)
            .await
            .map_err(backend_error)?
            .map_err(backend_error)
            .boxed())
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

        let collection = self.get_collection(collection);
        let result = if multi {
            collection.update_many(filter, update).upsert(upsert).await
        } else {
            collection.update_one(filter, update).upsert(upsert).await
        };
        let result = result.map_err(backend_error)?;

        Ok(UpdateOutcome {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted_id: result.upserted_id,
        })
    }

    async fn replace(
        &self,
        filter: Document,
        replacement: Document,
        upsert: bool,
        collection: &str,
    ) -> MapperResult<UpdateOutcome> {
        debug!(database = %self.database, collection, %filter, upsert, "replace");

        let result = self
            .get_collection(collection)
            .replace_one(filter, replacement)
            .upsert(upsert)
            .await
            .map_err(backend_error)?;

        Ok(UpdateOutcome {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted_id: result.upserted_id,
        })
    }

    async fn delete(&self, filter: Document, many: bool, collection: &str) -> MapperResult<DeleteOutcome> {
        debug!(database = %self.database, collection, %filter, many, "delete");

        let collection = self.get_collection(collection);
        let result = if many {
            collection.delete_many(filter).await
        } else {
            collection.delete_one(filter).await
        };
        let result = result.map_err(backend_error)?;

        Ok(DeleteOutcome {
            deleted: result.deleted_count,
        })
    }

    async fn count(&self, filter: Document, collection: &str) -> MapperResult<u64> {
        self.get_collection(collection)
            .count_documents(filter)
            .await
            .map_err(backend_error)
    }

    async fn distinct(&self, field: &str, filter: Document, collection: &str) -> MapperResult<Vec<Bson>> {
        self.get_collection(collection)
            .distinct(field, filter)
            .await
            .map_err(backend_error)
    }

    async fn aggregate(
        &self,
        pipeline: Vec<Document>,
        collection: &str,
    ) -> MapperResult<BoxStream<'static, MapperResult<Document>>> {
        debug!(database = %self.database, collection, stages = pipeline.len(), "aggregate");

        Ok(self
            .get_collection(collection)
            .aggregate(pipeline)
            .await
            .map_err(backend_error)?
            .map_err(backend_error)
            .boxed())
    }

    async fn map_reduce(
        &self,
        map: &str,
        reduce: &str,
        filter: Option<Document>,
        collection: &str,
    ) -> MapperResult<Vec<Document>> {
        debug!(database = %self.database, collection, "map reduce");

        let mut command = doc! {
            "mapReduce": collection,
            "map": Bson::JavaScriptCode(map.to_string()),
            "reduce": Bson::JavaScriptCode(reduce.to_string()),
            "out": { "inline": 1 },
        };
        if let Some(filter) = filter {
            command.insert("query", filter);
        }

        let response = self
            .client
            .database(&self.database)
            .run_command(command)
            .await
            .map_err(backend_error)?;

        match response.get("results") {
            Some(Bson::Array(results)) => results
                .iter()
                .map(|result| match result {
                    Bson::Document(result) => Ok(result.clone()),
                    _ => Err(MapperError::Backend("unexpected map-reduce result".into())),
                })
                .collect(),
            _ => Err(MapperError::Backend("map-reduce returned no results".into())),
        }
    }

    async fn create_index(&self, keys: Document, unique: bool, collection: &str) -> MapperResult<String> {
        let result = self
            .get_collection(collection)
            .create_index(
                IndexModel::builder()
                    .keys(keys)
                    .options(IndexOptions::builder().unique(unique).build())
                    .build(),
            )
            .await
            .map_err(backend_error)?;

        Ok(result.index_name)
    }

    async fn drop_index(&self, name: &str, collection: &str) -> MapperResult<()> {
        self.get_collection(collection)
            .drop_index(name)
            .await
            .map_err(backend_error)
    }

    async fn create_collection(&self, name: &str) -> MapperResult<()> {
        self.client
            .database(&self.database)
            .create_collection(name)
            .await
            .map_err(backend_error)
    }

    async fn drop_collection(&self, name: &str) -> MapperResult<()> {
        self.get_collection(name).drop().await.map_err(backend_error)
    }

    async fn list_collections(&self) -> MapperResult<Vec<String>> {
        self.client
            .database(&self.database)
            .list_collection_names()
            .await
            .map_err(backend_error)
    }

    fn database_name(&self) -> &str {
        &self.database
    }

    fn database(&self, name: &str) -> Self {
        Self::new(self.client.clone(), name.to_string())
    }

    async fn shutdown(self) -> MapperResult<()> {
        self.client.shutdown().await;

        Ok(())
    }
}

pub struct MongoDbStoreBuilder {
    dsn: String,
    database: String,
}

impl MongoDbStoreBuilder {
    pub fn new(dsn: &str, database: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            database: database.to_string(),
        }
    }
}

#[async_trait]
impl StoreBackendBuilder for MongoDbStoreBuilder {
    type Backend = MongoDbStore;

    async fn build(self) -> MapperResult<Self::Backend> {
        Ok(MongoDbStore::new(
            Client::with_options(
                ClientOptions::parse(&self.dsn)
                    .await
                    .map_err(|e| MapperError::Initialization(e.to_string()))?,
            )
            .map_err(|e| MapperError::Initialization(e.to_string()))?,
            self.database,
        ))
    }
}
