//! Cross-collection references.
//!
//! A [`DbRef`] is stored as the conventional `{ "$ref", "$id", "$db" }`
//! document. The id travels through the id codec of the referenced type, so a
//! reference to a type whose `_id` is a hex string annotated with the object id
//! codec stores a native object id.

use std::{
    any::TypeId,
    fmt,
    marker::PhantomData,
    sync::LazyLock,
};

use bson::{Bson, Document};
use dashmap::DashMap;
use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, DeserializeSeed, IgnoredAny, MapAccess, Visitor},
    ser::{self, SerializeStruct},
};

use super::{CodecContext, FieldCodec, deserialize_with};
use crate::{
    backend::StoreBackend,
    error::{MapperError, MapperResult},
    schema::{FieldSchema, MappedType},
    store::DocumentStore,
};

pub const NAME: &str = "db_ref";
pub const MARKER: &str = crate::codec_marker!("db_ref");

const REF: &str = "$ref";
const ID: &str = "$id";
const DB: &str = "$db";

/// A typed reference to a document of type `T` whose id has type `K`.
pub struct DbRef<T, K = String> {
    id: K,
    collection: String,
    database: Option<String>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, K> DbRef<T, K> {
    /// Creates a reference to the document with `id` in `collection`.
    pub fn new(id: K, collection: impl Into<String>) -> Self {
        Self {
            id,
            collection: collection.into(),
            database: None,
            _marker: PhantomData,
        }
    }

    /// Points the reference at another database.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn id(&self) -> &K {
        &self.id
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }
}

impl<T: MappedType, K> DbRef<T, K> {
    /// Creates a reference into the default collection of `T`.
    pub fn to(id: K) -> Self {
        Self::new(id, T::collection_name())
    }
}

impl<T, K> DbRef<T, K>
where
    T: MappedType,
    K: Serialize + Send + Sync,
{
    /// Loads the referenced document.
    ///
    /// The collection handle is taken from the store's reference cache, so
    /// repeated fetches against one collection share a single handle.
    ///
    /// # Errors
    ///
    /// Returns any error raised while converting the id or querying the store.
    pub async fn fetch<B>(&self, store: &DocumentStore<B>) -> MapperResult<Option<T>>
    where
        B: StoreBackend + 'static,
    {
        store
            .reference_collection::<T>(self.database.as_deref(), &self.collection)?
            .find_one_by_id(&self.id)
            .await
    }
}

impl<T, K: Clone> Clone for DbRef<T, K> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            collection: self.collection.clone(),
            database: self.database.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T, K: fmt::Debug> fmt::Debug for DbRef<T, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbRef")
            .field("id", &self.id)
            .field("collection", &self.collection)
            .field("database", &self.database)
            .finish()
    }
}

impl<T, K: PartialEq> PartialEq for DbRef<T, K> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.collection == other.collection && self.database == other.database
    }
}

/// Id codec markers of referenced types, built once per type.
static ID_MARKERS: LazyLock<DashMap<TypeId, Option<&'static str>>> = LazyLock::new(DashMap::new);

fn id_marker<T: MappedType>() -> Option<&'static str> {
    *ID_MARKERS
        .entry(TypeId::of::<T>())
        .or_insert_with(|| T::schema().id().and_then(FieldSchema::codec_marker))
}

impl<T, K> Serialize for DbRef<T, K>
where
    T: MappedType,
    K: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            return Err(ser::Error::custom(MapperError::UnsupportedSink(
                std::any::type_name::<S>().to_string(),
            )));
        }

        serializer.serialize_newtype_struct(
            MARKER,
            &Shape {
                id: MarkedId {
                    value: &self.id,
                    marker: id_marker::<T>(),
                },
                collection: &self.collection,
                database: self.database.as_deref(),
            },
        )
    }
}

struct Shape<'a, K> {
    id: MarkedId<'a, K>,
    collection: &'a str,
    database: Option<&'a str>,
}

impl<K: Serialize> Serialize for Shape<'_, K> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let len = if self.database.is_some() { 3 } else { 2 };
        let mut state = serializer.serialize_struct("DbRef", len)?;
        state.serialize_field(REF, self.collection)?;
        state.serialize_field(ID, &self.id)?;
        match self.database {
            Some(database) => state.serialize_field(DB, database)?,
            None => state.skip_field(DB)?,
        }
        state.end()
    }
}

struct MarkedId<'a, K> {
    value: &'a K,
    marker: Option<&'static str>,
}

impl<K: Serialize> Serialize for MarkedId<'_, K> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.marker {
            Some(marker) => serializer.serialize_newtype_struct(marker, self.value),
            None => self.value.serialize(serializer),
        }
    }
}

impl<'de, T, K> Deserialize<'de> for DbRef<T, K>
where
    T: MappedType,
    K: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_newtype_struct(
            MARKER,
            RefVisitor {
                marker: id_marker::<T>(),
                _marker: PhantomData,
            },
        )
    }
}

struct RefVisitor<T, K> {
    marker: Option<&'static str>,
    _marker: PhantomData<fn() -> (T, K)>,
}

impl<'de, T, K> Visitor<'de> for RefVisitor<T, K>
where
    K: Deserialize<'de>,
{
    type Value = DbRef<T, K>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a database reference")
    }

    fn visit_newtype_struct<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(self)
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut id = None;
        let mut collection = None;
        let mut database = None;

        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                REF => collection = Some(map.next_value::<String>()?),
                ID => {
                    id = Some(map.next_value_seed(IdSeed::<K> {
                        marker: self.marker,
                        _marker: PhantomData,
                    })?)
                }
                DB => database = map.next_value::<Option<String>>()?,
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }

        Ok(DbRef {
            id: id.ok_or_else(|| de::Error::missing_field(ID))?,
            collection: collection.ok_or_else(|| de::Error::missing_field(REF))?,
            database,
            _marker: PhantomData,
        })
    }
}

struct IdSeed<K> {
    marker: Option<&'static str>,
    _marker: PhantomData<fn() -> K>,
}

impl<'de, K> DeserializeSeed<'de> for IdSeed<K>
where
    K: Deserialize<'de>,
{
    type Value = K;

    fn deserialize<D>(self, deserializer: D) -> Result<K, D::Error>
    where
        D: Deserializer<'de>,
    {
        match self.marker {
            Some(marker) => deserialize_with(marker, deserializer),
            None => K::deserialize(deserializer),
        }
    }
}

/// Native reference document passthrough with key order normalization.
#[derive(Debug, Clone, Copy, Default)]
pub struct DbRefCodec;

impl DbRefCodec {
    fn normalize(value: &Bson) -> MapperResult<Bson> {
        let Bson::Document(document) = value else {
            return Err(MapperError::mapping(value, "expected a database reference"));
        };

        let (Some(Bson::String(collection)), Some(id)) = (document.get(REF), document.get(ID)) else {
            return Err(MapperError::mapping(value, "expected a database reference"));
        };

        let mut normalized = Document::new();
        normalized.insert(REF, collection.clone());
        normalized.insert(ID, id.clone());
        match document.get(DB) {
            Some(Bson::String(database)) => {
                normalized.insert(DB, database.clone());
            }
            Some(Bson::Null) | None => {}
            Some(_) => return Err(MapperError::mapping(value, "expected a database name")),
        }

        Ok(Bson::Document(normalized))
    }
}

impl FieldCodec for DbRefCodec {
    fn name(&self) -> &'static str {
        NAME
    }

    fn to_native(&self, value: Bson, _context: &CodecContext) -> MapperResult<Bson> {
        Self::normalize(&value)
    }

    fn from_native(&self, value: &Bson, _context: &CodecContext) -> MapperResult<Bson> {
        Self::normalize(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mapper::Mapper, schema::Schema};
    use bson::{doc, oid::ObjectId};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_normalizes_key_order() {
        let id = ObjectId::new();
        let native = DbRefCodec
            .to_native(
                Bson::Document(doc! { "$db": "db", "$id": id, "$ref": "referenced" }),
                &CodecContext::default(),
            )
            .unwrap();

        let Bson::Document(document) = native else {
            panic!("expected a document");
        };
        assert_eq!(document.keys().collect::<Vec<_>>(), vec!["$ref", "$id", "$db"]);
    }

    #[test]
    fn test_rejects_non_references() {
        let err = DbRefCodec
            .to_native(Bson::String("referenced".into()), &CodecContext::default())
            .unwrap_err();

        assert!(matches!(err, MapperError::Mapping { ref type_name, .. } if type_name == "String"));
    }

    static TARGET_SCHEMAS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, Serialize, Deserialize)]
    struct Target {
        #[serde(rename = "_id")]
        id: String,
    }

    impl MappedType for Target {
        fn collection_name() -> &'static str {
            "targets"
        }

        fn schema() -> Schema {
            TARGET_SCHEMAS.fetch_add(1, Ordering::SeqCst);
            Schema::builder()
                .id(FieldSchema::new().codec(crate::codec::object_id::MARKER))
                .build()
        }
    }

    #[test]
    fn test_target_schema_is_built_once() {
        let mapper = Mapper::default();
        let id = ObjectId::new();

        for _ in 0..3 {
            let reference: DbRef<Target> = DbRef::to(id.to_hex());
            let stored = mapper.to_bson(&reference).unwrap();
            assert_eq!(stored, Bson::Document(doc! { "$ref": "targets", "$id": id }));

            let back: DbRef<Target> = mapper.from_bson(&stored).unwrap();
            assert_eq!(back, reference);
        }
        assert_eq!(TARGET_SCHEMAS.load(Ordering::SeqCst), 1);
    }
}
