//! Conversion of document ids between their Rust and native forms.
//!
//! Lookups by id take the id as a plain Rust value (`"5f0c..."`, a `Uuid`,
//! an `ObjectId`) and must produce the same native value the document's own
//! `_id` field was stored as. The [`IdHandler`] for a type is resolved from the
//! codec on its identity field.

use std::{fmt, sync::Arc};

use bson::Bson;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    codec::{CodecContext, FieldCodec},
    error::{MapperError, MapperResult},
    mapper::Mapper,
    schema::{FieldSchema, Schema},
};

/// Converts id values of one mapped type.
pub trait IdHandler: Send + Sync + fmt::Debug {
    /// Converts a generic id value into the stored form.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::Mapping`] when the value is not a valid id.
    fn to_native(&self, id: Bson) -> MapperResult<Bson>;

    /// Converts a stored id back into its generic form.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::Mapping`] when the value is not a valid id.
    fn from_native(&self, id: &Bson) -> MapperResult<Bson>;
}

/// Ids stored as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityIdHandler;

impl IdHandler for IdentityIdHandler {
    fn to_native(&self, id: Bson) -> MapperResult<Bson> {
        Ok(id)
    }

    fn from_native(&self, id: &Bson) -> MapperResult<Bson> {
        Ok(id.clone())
    }
}

/// Ids routed through the codec of the identity field.
#[derive(Debug, Clone)]
pub struct CodecIdHandler {
    codec: Arc<dyn FieldCodec>,
    context: CodecContext,
}

impl CodecIdHandler {
    pub fn new(codec: Arc<dyn FieldCodec>, context: CodecContext) -> Self {
        Self { codec, context }
    }
}

impl IdHandler for CodecIdHandler {
    fn to_native(&self, id: Bson) -> MapperResult<Bson> {
        match id {
            native @ Bson::ObjectId(_) => Ok(native),
            other => self.codec.to_native(other, &self.context),
        }
    }

    fn from_native(&self, id: &Bson) -> MapperResult<Bson> {
        self.codec.from_native(id, &self.context)
    }
}

/// Picks the id handler for a schema.
///
/// # Errors
///
/// Returns [`MapperError::Configuration`] when the identity field names a codec
/// the mapper does not know.
pub fn resolve_id_handler(mapper: &Mapper, schema: &Schema) -> MapperResult<Arc<dyn IdHandler>> {
    match schema.id().and_then(FieldSchema::codec_name) {
        Some(name) => Ok(Arc::new(CodecIdHandler::new(
            mapper.codec(name)?,
            mapper.codec_context(),
        ))),
        None => Ok(Arc::new(IdentityIdHandler)),
    }
}

/// Converts a Rust id value into its stored form.
///
/// An id that is already an object id is used untouched, whatever the
/// identity field's codec.
///
/// # Errors
///
/// Fails when the id cannot be serialized or the handler rejects it.
pub fn id_to_native<K>(mapper: &Mapper, handler: &dyn IdHandler, id: &K) -> MapperResult<Bson>
where
    K: ?Sized + Serialize,
{
    match mapper.to_bson(id)? {
        Bson::Null => Err(MapperError::IllegalState("document id must not be null".into())),
        native @ Bson::ObjectId(_) => Ok(native),
        generic => handler.to_native(generic),
    }
}

/// Converts a stored id into a Rust value.
///
/// # Errors
///
/// Fails when the handler rejects the id or it does not match `K`.
pub fn id_from_native<K>(mapper: &Mapper, handler: &dyn IdHandler, id: &Bson) -> MapperResult<K>
where
    K: DeserializeOwned,
{
    let generic = handler.from_native(id)?;
    mapper.from_bson(&generic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use bson::oid::ObjectId;
    use pretty_assertions::assert_eq;

    fn hex_id_schema() -> Schema {
        Schema::builder()
            .id(FieldSchema::new().codec(codec::object_id::MARKER))
            .build()
    }

    #[test]
    fn test_hex_ids_become_object_ids() {
        let mapper = Mapper::default();
        let handler = resolve_id_handler(&mapper, &hex_id_schema()).unwrap();
        let id = ObjectId::new();

        let native = id_to_native(&mapper, handler.as_ref(), &id.to_hex()).unwrap();
        assert_eq!(native, Bson::ObjectId(id));

        let back: String = id_from_native(&mapper, handler.as_ref(), &native).unwrap();
        assert_eq!(back, id.to_hex());
    }

    #[test]
    fn test_object_ids_pass_through_any_handler() {
        let mapper = Mapper::default();
        let schema = Schema::builder()
            .id(FieldSchema::new().codec(codec::date::MARKER))
            .build();
        let handler = resolve_id_handler(&mapper, &schema).unwrap();
        let id = ObjectId::new();

        assert_eq!(
            id_to_native(&mapper, handler.as_ref(), &id).unwrap(),
            Bson::ObjectId(id)
        );
    }

    #[test]
    fn test_plain_ids_are_kept() {
        let mapper = Mapper::default();
        let handler = resolve_id_handler(&mapper, &Schema::default()).unwrap();

        assert_eq!(
            id_to_native(&mapper, handler.as_ref(), "alice").unwrap(),
            Bson::String("alice".into())
        );
        assert!(matches!(
            id_to_native(&mapper, handler.as_ref(), &Option::<String>::None),
            Err(MapperError::IllegalState(_))
        ));
    }

    #[test]
    fn test_invalid_hex_is_a_mapping_error() {
        let mapper = Mapper::default();
        let handler = resolve_id_handler(&mapper, &hex_id_schema()).unwrap();

        assert!(matches!(
            id_to_native(&mapper, handler.as_ref(), "not-an-id"),
            Err(MapperError::Mapping { .. })
        ));
    }
}
