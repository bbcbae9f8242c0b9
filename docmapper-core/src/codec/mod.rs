//! Schema-aware scalar codecs.
//!
//! A codec converts between the generic serde shape of a value (what its
//! `Serialize` implementation produces on its own) and the native BSON
//! representation the database expects. Hex strings become object ids,
//! RFC 3339 strings become BSON dates, UUID byte arrays become binary
//! subtype 4, and so on.
//!
//! Codecs are attached to fields with serde's `with` attribute. The field
//! value then travels through the serializer wrapped in a newtype struct whose
//! name is a *codec marker* (see [`codec_marker!`]). A serializer that
//! understands markers looks the codec up in the [`Mapper`](crate::mapper::Mapper)
//! registry and writes the native value; any other binary serializer simply
//! sees a transparent newtype. Human readable serializers are rejected outright
//! because they cannot carry native values.
//!
//! # Example
//!
//! ```ignore
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Person {
//!     #[serde(rename = "_id", with = "docmapper::codec::object_id")]
//!     id: String,
//!     #[serde(with = "docmapper::codec::date")]
//!     born: chrono::DateTime<chrono::Utc>,
//!     #[serde(with = "docmapper::codec::object_id::each")]
//!     friends: Vec<String>,
//! }
//! ```

use std::{fmt, marker::PhantomData};

use bson::Bson;
use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, Visitor},
    ser,
};

use crate::error::{MapperError, MapperResult};

pub mod any;
pub mod date;
pub mod object_id;
pub mod reference;
pub mod uuid;

/// Prefix shared by every codec marker name.
pub const CODEC_MARKER_PREFIX: &str = "$__docmapper_codec.";

/// Prefix of markers that apply a codec to each element of a collection.
pub const ELEMENTS_MARKER_PREFIX: &str = "$__docmapper_codec_each.";

/// Builds the marker name for a codec at compile time.
///
/// ```ignore
/// const MARKER: &str = docmapper::codec_marker!("object_id");
/// assert_eq!(MARKER, "$__docmapper_codec.object_id");
/// ```
#[macro_export]
macro_rules! codec_marker {
    ($name:literal) => {
        concat!("$__docmapper_codec.", $name)
    };
}

/// Builds the marker name that applies a codec to each element of a
/// collection field.
#[macro_export]
macro_rules! codec_elements_marker {
    ($name:literal) => {
        concat!("$__docmapper_codec_each.", $name)
    };
}

/// How a codec applies to the value it is handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecShape {
    /// The codec converts the value as a whole, arrays included.
    Single,
    /// The value is a collection and the codec converts each element.
    Elements,
}

impl CodecShape {
    /// Applies `codec` to a generic value.
    pub fn encode(self, codec: &dyn FieldCodec, value: Bson, context: &CodecContext) -> MapperResult<Bson> {
        match self {
            CodecShape::Single => encode(codec, value, context),
            CodecShape::Elements => encode_elements(codec, value, context),
        }
    }

    /// Reverses `codec` on a native value.
    pub fn decode(self, codec: &dyn FieldCodec, value: &Bson, context: &CodecContext) -> MapperResult<Bson> {
        match self {
            CodecShape::Single => decode(codec, value, context),
            CodecShape::Elements => decode_elements(codec, value, context),
        }
    }
}

/// Splits a marker into its codec name and shape, if `name` is one.
pub fn parse_marker(name: &str) -> Option<(&str, CodecShape)> {
    if let Some(codec) = name.strip_prefix(CODEC_MARKER_PREFIX) {
        Some((codec, CodecShape::Single))
    } else {
        name.strip_prefix(ELEMENTS_MARKER_PREFIX)
            .map(|codec| (codec, CodecShape::Elements))
    }
}

/// Returns the codec name carried by a marker, if `name` is one.
pub fn codec_name(name: &str) -> Option<&str> {
    parse_marker(name).map(|(codec, _)| codec)
}

/// Mapper settings visible to codecs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecContext {
    instants_as_numbers: bool,
}

impl CodecContext {
    pub fn new(instants_as_numbers: bool) -> Self {
        Self {
            instants_as_numbers,
        }
    }

    /// Whether instants are written as `Int64` nanoseconds instead of BSON dates.
    pub fn instants_as_numbers(&self) -> bool {
        self.instants_as_numbers
    }
}

/// A two-way conversion between a generic value and its native BSON form.
///
/// Both directions must accept a value that is already in the target form
/// and return it unchanged. `Null` never reaches a codec. Arrays reach it
/// only when the field holding them is not a collection, in which case the
/// array is the value.
pub trait FieldCodec: Send + Sync + fmt::Debug {
    /// The registry name of this codec, also the suffix of its marker.
    fn name(&self) -> &'static str;

    /// Converts a generic value into its native representation.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::Mapping`] when the value has a shape the codec
    /// cannot convert.
    fn to_native(&self, value: Bson, context: &CodecContext) -> MapperResult<Bson>;

    /// Converts a native value back into the generic shape the field's
    /// `Deserialize` implementation expects.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::Mapping`] when the value has a shape the codec
    /// cannot convert.
    fn from_native(&self, value: &Bson, context: &CodecContext) -> MapperResult<Bson>;
}

/// Applies `codec` to a single generic value.
pub fn encode(codec: &dyn FieldCodec, value: Bson, context: &CodecContext) -> MapperResult<Bson> {
    match value {
        Bson::Null => Ok(Bson::Null),
        other => codec.to_native(other, context),
    }
}

/// Reverses `codec` on a single native value.
pub fn decode(codec: &dyn FieldCodec, value: &Bson, context: &CodecContext) -> MapperResult<Bson> {
    match value {
        Bson::Null => Ok(Bson::Null),
        other => codec.from_native(other, context),
    }
}

/// Applies `codec` to each element of an array. Any other value is taken to
/// be one element.
pub fn encode_elements(codec: &dyn FieldCodec, value: Bson, context: &CodecContext) -> MapperResult<Bson> {
    match value {
        Bson::Array(values) => values
            .into_iter()
            .map(|value| encode(codec, value, context))
            .collect::<MapperResult<Vec<_>>>()
            .map(Bson::Array),
        other => encode(codec, other, context),
    }
}

/// Reverses `codec` on each element of an array, or on a lone element.
pub fn decode_elements(codec: &dyn FieldCodec, value: &Bson, context: &CodecContext) -> MapperResult<Bson> {
    match value {
        Bson::Array(values) => values
            .iter()
            .map(|value| decode(codec, value, context))
            .collect::<MapperResult<Vec<_>>>()
            .map(Bson::Array),
        other => decode(codec, other, context),
    }
}

/// Serializes `value` wrapped in the codec marker `marker`.
///
/// This is the building block of every codec's `with` module, and the one to
/// use for user-defined codecs.
///
/// # Errors
///
/// Fails with [`MapperError::UnsupportedSink`] (as the serializer's own error
/// type) when the serializer is human readable.
pub fn serialize_with<T, S>(marker: &'static str, value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: ?Sized + Serialize,
    S: Serializer,
{
    if serializer.is_human_readable() {
        return Err(ser::Error::custom(MapperError::UnsupportedSink(
            std::any::type_name::<S>().to_string(),
        )));
    }

    serializer.serialize_newtype_struct(marker, value)
}

/// Deserializes a value wrapped in the codec marker `marker`.
///
/// Deserializers that do not recognize the marker forward the newtype
/// transparently, so the value is parsed generically.
pub fn deserialize_with<'de, T, D>(marker: &'static str, deserializer: D) -> Result<T, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    deserializer.deserialize_newtype_struct(marker, MarkedVisitor(PhantomData))
}

struct MarkedVisitor<T>(PhantomData<T>);

impl<'de, T> Visitor<'de> for MarkedVisitor<T>
where
    T: Deserialize<'de>,
{
    type Value = T;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a codec-managed value")
    }

    fn visit_newtype_struct<D>(self, deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
    {
        T::deserialize(deserializer)
    }
}

/// Implements a codec's `with` module for the codec called `$name`.
///
/// The module itself converts the field value as a whole. Its `each`
/// submodule converts every element of a collection field.
macro_rules! with_module {
    ($name:literal) => {
        pub const MARKER: &str = $crate::codec_marker!($name);

        $crate::codec::with_module!(@functions MARKER);

        /// Applies the codec to each element of a collection field.
        pub mod each {
            pub const MARKER: &str = $crate::codec_elements_marker!($name);

            $crate::codec::with_module!(@functions MARKER);
        }
    };
    (@functions $marker:expr) => {
        /// Serializes the field through this codec.
        pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
        where
            T: ?Sized + serde::Serialize,
            S: serde::Serializer,
        {
            $crate::codec::serialize_with($marker, value, serializer)
        }

        /// Deserializes the field through this codec.
        pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
        where
            T: serde::Deserialize<'de>,
            D: serde::Deserializer<'de>,
        {
            $crate::codec::deserialize_with($marker, deserializer)
        }
    };
}

pub(crate) use with_module;

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{Bson, oid::ObjectId};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Tagged {
        #[serde(with = "crate::codec::object_id")]
        id: String,
    }

    #[test]
    fn test_marker_names() {
        assert_eq!(codec_marker!("object_id"), "$__docmapper_codec.object_id");
        assert_eq!(codec_name(codec_marker!("date")), Some("date"));
        assert_eq!(codec_name("Person"), None);
        assert_eq!(
            parse_marker(object_id::each::MARKER),
            Some(("object_id", CodecShape::Elements))
        );
        assert_eq!(parse_marker(object_id::MARKER), Some(("object_id", CodecShape::Single)));
    }

    #[test]
    fn test_human_readable_sink_is_rejected() {
        let value = Tagged {
            id: ObjectId::new().to_hex(),
        };

        let err = serde_json::to_string(&value).unwrap_err();
        assert!(err.to_string().contains("Unsupported sink"));
    }

    #[test]
    fn test_unaware_deserializer_parses_generically() {
        let hex = ObjectId::new().to_hex();
        let value: Tagged = serde_json::from_str(&format!(r#"{{"id":"{hex}"}}"#)).unwrap();

        assert_eq!(value.id, hex);
    }

    #[test]
    fn test_encode_passes_null_and_maps_elements() {
        let codec = object_id::ObjectIdCodec;
        let context = CodecContext::default();
        let id = ObjectId::new();

        assert_eq!(encode(&codec, Bson::Null, &context).unwrap(), Bson::Null);
        assert_eq!(
            encode_elements(&codec, Bson::Array(vec![id.to_hex().into(), Bson::Null]), &context)
                .unwrap(),
            Bson::Array(vec![Bson::ObjectId(id), Bson::Null])
        );
        assert_eq!(
            encode_elements(&codec, id.to_hex().into(), &context).unwrap(),
            Bson::ObjectId(id)
        );
    }

    #[test]
    fn test_single_shape_hands_arrays_to_the_codec() {
        let codec = object_id::ObjectIdCodec;
        let context = CodecContext::default();
        let ids = Bson::Array(vec![ObjectId::new().to_hex().into()]);

        let err = CodecShape::Single.encode(&codec, ids.clone(), &context).unwrap_err();
        assert!(matches!(err, MapperError::Mapping { ref type_name, .. } if type_name == "Array"));
        assert!(CodecShape::Elements.encode(&codec, ids, &context).is_ok());
    }
}
