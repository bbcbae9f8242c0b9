//! The object mapper: codec registry, cached schemas and value conversion.
//!
//! A [`Mapper`] is built once and shared (usually behind an `Arc`) by every
//! collection of a [`DocumentStore`](crate::store::DocumentStore). Codecs are
//! contributed by [`Module`]s; the built-in [`NativeTypesModule`] is always
//! installed.
//!
//! # Example
//!
//! ```ignore
//! use docmapper::mapper::Mapper;
//!
//! let mapper = Mapper::builder().instants_as_numbers(true).build();
//! let document = mapper.to_document(&person)?;
//! let person: Person = mapper.from_document(&document)?;
//! ```

use std::{
    any::TypeId,
    collections::HashMap,
    fmt,
    sync::Arc,
};

use bson::{Bson, Document};
use dashmap::DashMap;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::{
    codec::{
        CodecContext, FieldCodec,
        any::BsonValueCodec,
        date::{DateCodec, calendar::CalendarCodec, instant::InstantCodec},
        object_id::{ObjectIdCodec, bytes::ObjectIdBytesCodec},
        reference::DbRefCodec,
        uuid::UuidCodec,
    },
    de::BsonDeserializer,
    error::{MapperError, MapperResult},
    schema::{MappedType, Schema},
    ser::BsonSerializer,
    sink::BsonSink,
    source::BsonSource,
};

/// Mapper-wide settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapperConfig {
    /// Write instants as `Int64` nanoseconds since the epoch instead of dates.
    pub instants_as_numbers: bool,
}

/// Codecs by registry name.
#[derive(Debug, Default, Clone)]
pub struct CodecRegistry {
    codecs: HashMap<&'static str, Arc<dyn FieldCodec>>,
}

impl CodecRegistry {
    /// Registers `codec` under its own name, replacing any previous codec of
    /// that name.
    pub fn register(&mut self, codec: impl FieldCodec + 'static) -> &mut Self {
        self.codecs.insert(codec.name(), Arc::new(codec));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn FieldCodec>> {
        self.codecs.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.codecs.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.codecs.keys().copied()
    }
}

/// A bundle of codecs installed into a mapper at build time.
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    fn setup(&self, registry: &mut CodecRegistry);
}

/// Codecs for the native BSON types: object ids, dates, UUIDs, references and
/// untyped values.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeTypesModule;

impl Module for NativeTypesModule {
    fn name(&self) -> &str {
        "native-types"
    }

    fn setup(&self, registry: &mut CodecRegistry) {
        registry
            .register(ObjectIdCodec)
            .register(ObjectIdBytesCodec)
            .register(DateCodec)
            .register(CalendarCodec)
            .register(InstantCodec)
            .register(UuidCodec)
            .register(DbRefCodec)
            .register(BsonValueCodec);
    }
}

/// Converts Rust values to and from native BSON.
pub struct Mapper {
    config: MapperConfig,
    codecs: CodecRegistry,
    schemas: DashMap<TypeId, Arc<Schema>>,
}

impl Mapper {
    pub fn builder() -> MapperBuilder {
        MapperBuilder::default()
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// The codec registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::Configuration`] if no such codec is registered.
    pub fn codec(&self, name: &str) -> MapperResult<Arc<dyn FieldCodec>> {
        self.codecs
            .get(name)
            .ok_or_else(|| MapperError::Configuration(format!("no codec registered under '{name}'")))
    }

    pub fn codec_context(&self) -> CodecContext {
        CodecContext::new(self.config.instants_as_numbers)
    }

    /// The schema of `T`, computed once per mapper.
    pub fn schema_for<T: MappedType>(&self) -> Arc<Schema> {
        self.schemas
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(T::schema()))
            .clone()
    }

    /// Serializes `value` into a native BSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value's `Serialize` implementation fails or a
    /// codec rejects a field value.
    pub fn to_bson<T>(&self, value: &T) -> MapperResult<Bson>
    where
        T: ?Sized + Serialize,
    {
        let mut sink = BsonSink::new();
        value.serialize(BsonSerializer::new(&mut sink, self))?;
        sink.into_value()
    }

    /// Serializes `value` into a native document.
    ///
    /// # Errors
    ///
    /// Fails like [`Mapper::to_bson`], and when the value is not a document.
    pub fn to_document<T>(&self, value: &T) -> MapperResult<Document>
    where
        T: ?Sized + Serialize,
    {
        match self.to_bson(value)? {
            Bson::Document(document) => Ok(document),
            other => Err(MapperError::mapping(&other, "expected a document")),
        }
    }

    /// Deserializes a value from native BSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the value does not match the shape of `T` or a codec
    /// rejects a stored value.
    pub fn from_bson<T: DeserializeOwned>(&self, value: &Bson) -> MapperResult<T> {
        self.from_bson_borrowed(value)
    }

    /// Deserializes a value borrowing from `value`.
    ///
    /// # Errors
    ///
    /// Fails like [`Mapper::from_bson`].
    pub fn from_bson_borrowed<'de, T: Deserialize<'de>>(&self, value: &'de Bson) -> MapperResult<T> {
        let mut source = BsonSource::new(value);
        T::deserialize(BsonDeserializer::new(&mut source, self))
    }

    /// Deserializes a value from a native document.
    ///
    /// # Errors
    ///
    /// Fails like [`Mapper::from_bson`].
    pub fn from_document<T: DeserializeOwned>(&self, document: &Document) -> MapperResult<T> {
        let mut source = BsonSource::from_document(document);
        T::deserialize(BsonDeserializer::new(&mut source, self))
    }
}

impl Default for Mapper {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for Mapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codecs: Vec<_> = self.codecs.names().collect();
        codecs.sort_unstable();

        f.debug_struct("Mapper")
            .field("config", &self.config)
            .field("codecs", &codecs)
            .finish()
    }
}

/// Builder for [`Mapper`].
#[derive(Default)]
pub struct MapperBuilder {
    config: MapperConfig,
    modules: Vec<Box<dyn Module>>,
}

impl MapperBuilder {
    pub fn instants_as_numbers(mut self, enabled: bool) -> Self {
        self.config.instants_as_numbers = enabled;
        self
    }

    /// Adds a module whose codecs are installed after the built-in ones.
    pub fn module(mut self, module: impl Module + 'static) -> Self {
        self.modules.push(Box::new(module));
        self
    }

    pub fn build(self) -> Mapper {
        let mut codecs = CodecRegistry::default();
        NativeTypesModule.setup(&mut codecs);

        for module in &self.modules {
            debug!(module = module.name(), "installing mapper module");
            module.setup(&mut codecs);
        }

        Mapper {
            config: self.config,
            codecs,
            schemas: DashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::CodecContext, schema::FieldSchema};
    use bson::doc;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Debug)]
    struct Upper;

    impl FieldCodec for Upper {
        fn name(&self) -> &'static str {
            "upper"
        }

        fn to_native(&self, value: Bson, _context: &CodecContext) -> MapperResult<Bson> {
            match value {
                Bson::String(text) => Ok(Bson::String(text.to_uppercase())),
                other => Err(MapperError::mapping(&other, "expected a string")),
            }
        }

        fn from_native(&self, value: &Bson, _context: &CodecContext) -> MapperResult<Bson> {
            match value {
                Bson::String(text) => Ok(Bson::String(text.to_lowercase())),
                other => Err(MapperError::mapping(other, "expected a string")),
            }
        }
    }

    struct ShoutingModule;

    impl Module for ShoutingModule {
        fn name(&self) -> &str {
            "shouting"
        }

        fn setup(&self, registry: &mut CodecRegistry) {
            registry.register(Upper);
        }
    }

    mod upper {
        crate::codec::with_module!("upper");
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        #[serde(with = "upper")]
        text: String,
    }

    impl MappedType for Greeting {
        fn collection_name() -> &'static str {
            "greetings"
        }

        fn schema() -> Schema {
            Schema::builder()
                .field("text", FieldSchema::new().codec(upper::MARKER))
                .build()
        }
    }

    #[test]
    fn test_native_codecs_are_always_installed() {
        let mapper = Mapper::default();

        for name in ["object_id", "object_id_bytes", "date", "calendar", "instant", "uuid", "db_ref", "bson_value"] {
            assert!(mapper.codecs().contains(name), "{name}");
        }
        assert!(matches!(mapper.codec("upper"), Err(MapperError::Configuration(_))));
    }

    #[test]
    fn test_module_codecs_are_used() {
        let mapper = Mapper::builder().module(ShoutingModule).build();
        let greeting = Greeting { text: "hello".into() };

        let document = mapper.to_document(&greeting).unwrap();
        assert_eq!(document, doc! { "text": "HELLO" });
        assert_eq!(mapper.from_document::<Greeting>(&document).unwrap(), greeting);
    }

    #[test]
    fn test_schemas_are_cached() {
        let mapper = Mapper::default();

        let first = mapper.schema_for::<Greeting>();
        let second = mapper.schema_for::<Greeting>();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_builder_settings_reach_codecs() {
        let mapper = Mapper::builder().instants_as_numbers(true).build();

        assert!(mapper.codec_context().instants_as_numbers());
    }
}
