//! Object id codecs.
//!
//! [`object_id`](self) maps a 24 character hex string to a native `ObjectId`.
//! [`bytes`] maps a 12 byte array. Both accept a native `ObjectId` as input
//! and both apply element-wise to `Option`s and collections.

use bson::{Bson, oid::ObjectId};

use super::{CodecContext, FieldCodec, with_module};
use crate::error::{MapperError, MapperResult};

pub const NAME: &str = "object_id";
with_module!("object_id");

/// Hex string ⇄ `ObjectId`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectIdCodec;

impl FieldCodec for ObjectIdCodec {
    fn name(&self) -> &'static str {
        NAME
    }

    fn to_native(&self, value: Bson, _context: &CodecContext) -> MapperResult<Bson> {
        match value {
            Bson::ObjectId(_) => Ok(value),
            Bson::String(ref hex) => parse_hex(hex).map(Bson::ObjectId),
            // Extended JSON written by hand in a query literal.
            Bson::Document(ref document) => match document.get("$oid") {
                Some(Bson::String(hex)) if document.len() == 1 => parse_hex(hex).map(Bson::ObjectId),
                _ => Err(MapperError::mapping(&value, "expected an object id")),
            },
            other => Err(MapperError::mapping(&other, "expected an object id")),
        }
    }

    fn from_native(&self, value: &Bson, _context: &CodecContext) -> MapperResult<Bson> {
        match value {
            Bson::ObjectId(id) => Ok(Bson::String(id.to_hex())),
            Bson::String(_) => Ok(value.clone()),
            other => Err(MapperError::mapping(other, "expected an object id")),
        }
    }
}

fn parse_hex(hex: &str) -> MapperResult<ObjectId> {
    ObjectId::parse_str(hex).map_err(|_| MapperError::Mapping {
        type_name: "String".into(),
        message: format!("'{hex}' is not a valid object id"),
    })
}

/// 12 byte array ⇄ `ObjectId`.
pub mod bytes {
    use bson::{Binary, Bson, oid::ObjectId, spec::BinarySubtype};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::super::{CodecContext, FieldCodec, deserialize_with, serialize_with};
    use crate::error::{MapperError, MapperResult};

    pub const NAME: &str = "object_id_bytes";
    pub const MARKER: &str = crate::codec_marker!("object_id_bytes");

    pub fn serialize<S>(value: &[u8; 12], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serialize_with(MARKER, &RawBytes(value), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 12], D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = deserialize_with(MARKER, deserializer).map(|RawBuf(bytes)| bytes)?;

        bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| serde::de::Error::invalid_length(bytes.len(), &"12 bytes"))
    }

    struct RawBytes<'a>(&'a [u8; 12]);

    impl Serialize for RawBytes<'_> {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_bytes(self.0)
        }
    }

    struct RawBuf(Vec<u8>);

    impl<'de> Deserialize<'de> for RawBuf {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            struct BufVisitor;

            impl<'de> serde::de::Visitor<'de> for BufVisitor {
                type Value = RawBuf;

                fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    formatter.write_str("12 object id bytes")
                }

                fn visit_bytes<E>(self, v: &[u8]) -> Result<RawBuf, E> {
                    Ok(RawBuf(v.to_vec()))
                }

                fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<RawBuf, E> {
                    Ok(RawBuf(v))
                }

                fn visit_seq<A>(self, mut seq: A) -> Result<RawBuf, A::Error>
                where
                    A: serde::de::SeqAccess<'de>,
                {
                    let mut bytes = Vec::with_capacity(12);
                    while let Some(byte) = seq.next_element::<u8>()? {
                        bytes.push(byte);
                    }
                    Ok(RawBuf(bytes))
                }
            }

            deserializer.deserialize_bytes(BufVisitor)
        }
    }

    /// Byte array ⇄ `ObjectId`.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct ObjectIdBytesCodec;

    impl FieldCodec for ObjectIdBytesCodec {
        fn name(&self) -> &'static str {
            NAME
        }

        fn to_native(&self, value: Bson, _context: &CodecContext) -> MapperResult<Bson> {
            match value {
                Bson::ObjectId(_) => Ok(value),
                Bson::Binary(ref binary) => match <[u8; 12]>::try_from(binary.bytes.as_slice()) {
                    Ok(bytes) => Ok(Bson::ObjectId(ObjectId::from_bytes(bytes))),
                    Err(_) => Err(MapperError::mapping(&value, "expected 12 object id bytes")),
                },
                other => Err(MapperError::mapping(&other, "expected 12 object id bytes")),
            }
        }

        fn from_native(&self, value: &Bson, _context: &CodecContext) -> MapperResult<Bson> {
            match value {
                Bson::ObjectId(id) => Ok(Bson::Binary(Binary {
                    subtype: BinarySubtype::Generic,
                    bytes: id.bytes().to_vec(),
                })),
                Bson::Binary(_) => Ok(value.clone()),
                other => Err(MapperError::mapping(other, "expected an object id")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{Binary, spec::BinarySubtype};
    use pretty_assertions::assert_eq;

    fn generic_binary(bytes: &[u8]) -> Bson {
        Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: bytes.to_vec(),
        })
    }

    #[test]
    fn test_hex_round_trip() {
        let codec = ObjectIdCodec;
        let context = CodecContext::default();
        let id = ObjectId::new();

        let native = codec.to_native(Bson::String(id.to_hex()), &context).unwrap();
        assert_eq!(native, Bson::ObjectId(id));
        assert_eq!(codec.to_native(native.clone(), &context).unwrap(), native);
        assert_eq!(
            codec.from_native(&native, &context).unwrap(),
            Bson::String(id.to_hex())
        );
    }

    #[test]
    fn test_extended_json_literal() {
        let id = ObjectId::new();
        let literal = Bson::Document(bson::doc! { "$oid": id.to_hex() });

        assert_eq!(
            ObjectIdCodec.to_native(literal, &CodecContext::default()).unwrap(),
            Bson::ObjectId(id)
        );
    }

    #[test]
    fn test_wrong_shape_is_a_mapping_error() {
        let err = ObjectIdCodec
            .to_native(Bson::Boolean(true), &CodecContext::default())
            .unwrap_err();

        assert!(matches!(err, MapperError::Mapping { ref type_name, .. } if type_name == "Boolean"));
        assert!(ObjectIdCodec
            .to_native(Bson::String("nope".into()), &CodecContext::default())
            .is_err());
    }

    #[test]
    fn test_bytes_round_trip() {
        let codec = bytes::ObjectIdBytesCodec;
        let context = CodecContext::default();
        let id = ObjectId::new();

        let native = codec.to_native(generic_binary(&id.bytes()), &context).unwrap();
        assert_eq!(native, Bson::ObjectId(id));
        assert_eq!(codec.from_native(&native, &context).unwrap(), generic_binary(&id.bytes()));
    }
}
