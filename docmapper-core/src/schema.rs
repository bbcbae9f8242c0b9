//! Static mapping metadata for mapped types.
//!
//! A [`Schema`] records, per stored field name, which codec (if any) the field
//! is serialized through, whether the field holds a collection and the schema
//! of nested documents. Query and update serialization uses it to encode
//! operator values exactly like the field itself would be encoded.
//!
//! Schemas are usually produced by `#[derive(MappedType)]`, but can be built by
//! hand:
//!
//! ```ignore
//! use docmapper::{codec, schema::{FieldSchema, Schema}};
//!
//! let schema = Schema::builder()
//!     .id(FieldSchema::new().codec(codec::object_id::MARKER))
//!     .field("tags", FieldSchema::new().collection())
//!     .build();
//! ```

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Serialize, de::DeserializeOwned};

/// The name of the identity field in stored documents.
pub const ID_FIELD: &str = "_id";

/// A Rust type stored as documents of one collection.
pub trait MappedType: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The default collection documents of this type are stored in.
    fn collection_name() -> &'static str;

    /// The mapping metadata of this type.
    fn schema() -> Schema {
        Schema::default()
    }
}

/// Mapping metadata for the fields of one document shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    fields: IndexMap<String, FieldSchema>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// The identity field.
    pub fn id(&self) -> Option<&FieldSchema> {
        self.fields.get(ID_FIELD)
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSchema)> {
        self.fields.iter().map(|(name, field)| (name.as_str(), field))
    }

    /// Resolves a dotted field path to the schema of its last segment.
    ///
    /// Array indexes and positional operators (`0`, `$`, `$[]`, `$[elem]`)
    /// address elements of a collection and are skipped, so `items.0.price`
    /// and `items.$.price` both resolve to `price` inside the schema of
    /// `items`.
    pub fn resolve(&self, path: &str) -> Option<&FieldSchema> {
        let mut schema = self;
        let mut resolved = None;

        for segment in path.split('.') {
            if is_positional(segment) {
                continue;
            }

            if let Some(field) = resolved.and_then(|field: &FieldSchema| field.nested.as_deref()) {
                schema = field;
            } else if resolved.is_some() {
                return None;
            }

            resolved = Some(schema.fields.get(segment)?);
        }

        resolved
    }
}

fn is_positional(segment: &str) -> bool {
    segment == "$"
        || (segment.starts_with("$[") && segment.ends_with(']'))
        || (!segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()))
}

/// Mapping metadata of a single field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSchema {
    codec: Option<&'static str>,
    collection: bool,
    nested: Option<Arc<Schema>>,
}

impl FieldSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes the field through the codec behind `marker`.
    pub fn codec(mut self, marker: &'static str) -> Self {
        self.codec = Some(marker);
        self
    }

    /// Marks the field as holding a collection of values.
    pub fn collection(mut self) -> Self {
        self.collection = true;
        self
    }

    /// Attaches the schema of an embedded document.
    pub fn nested(mut self, schema: Schema) -> Self {
        self.nested = Some(Arc::new(schema));
        self
    }

    /// The codec marker of this field.
    pub fn codec_marker(&self) -> Option<&'static str> {
        self.codec
    }

    /// The registry name of the field's codec.
    pub fn codec_name(&self) -> Option<&'static str> {
        self.codec.and_then(crate::codec::codec_name)
    }

    pub fn is_collection(&self) -> bool {
        self.collection
    }

    pub fn nested_schema(&self) -> Option<&Schema> {
        self.nested.as_deref()
    }
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    fields: IndexMap<String, FieldSchema>,
}

impl SchemaBuilder {
    /// Describes the identity field.
    pub fn id(self, field: FieldSchema) -> Self {
        self.field(ID_FIELD, field)
    }

    pub fn field(mut self, name: impl Into<String>, field: FieldSchema) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    pub fn build(self) -> Schema {
        Schema {
            fields: self.fields,
        }
    }
}
