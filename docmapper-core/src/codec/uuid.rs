//! UUID codec.
//!
//! Stores `uuid::Uuid` values as BSON binary subtype 4 instead of degrading
//! them to strings or generic binaries.

use bson::{Binary, Bson, spec::BinarySubtype};

use super::{CodecContext, FieldCodec, with_module};
use crate::error::{MapperError, MapperResult};

pub const NAME: &str = "uuid";
with_module!("uuid");

#[derive(Debug, Clone, Copy, Default)]
pub struct UuidCodec;

impl FieldCodec for UuidCodec {
    fn name(&self) -> &'static str {
        NAME
    }

    fn to_native(&self, value: Bson, _context: &CodecContext) -> MapperResult<Bson> {
        match value {
            Bson::Binary(Binary {
                subtype: BinarySubtype::Uuid,
                ..
            }) => Ok(value),
            Bson::Binary(Binary { ref bytes, .. }) if bytes.len() == 16 => Ok(uuid_binary(bytes.clone())),
            Bson::String(ref text) => ::uuid::Uuid::parse_str(text)
                .map(|parsed| uuid_binary(parsed.as_bytes().to_vec()))
                .map_err(|e| MapperError::Mapping {
                    type_name: "String".into(),
                    message: format!("'{text}' is not a UUID: {e}"),
                }),
            other => Err(MapperError::mapping(&other, "expected a UUID")),
        }
    }

    fn from_native(&self, value: &Bson, _context: &CodecContext) -> MapperResult<Bson> {
        match value {
            Bson::Binary(Binary { bytes, .. }) if bytes.len() == 16 => Ok(Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: bytes.clone(),
            })),
            Bson::String(_) => Ok(value.clone()),
            other => Err(MapperError::mapping(other, "expected a UUID")),
        }
    }
}

fn uuid_binary(bytes: Vec<u8>) -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Uuid,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_keeps_the_bit_pattern() {
        let context = CodecContext::default();
        let id = ::uuid::Uuid::new_v4();

        let native = UuidCodec
            .to_native(Bson::String(id.to_string()), &context)
            .unwrap();
        assert_eq!(native, uuid_binary(id.as_bytes().to_vec()));

        let generic = UuidCodec.from_native(&native, &context).unwrap();
        assert_eq!(
            UuidCodec.to_native(generic, &context).unwrap(),
            native
        );
    }

    #[test]
    fn test_rejects_short_binaries() {
        let short = Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: vec![1, 2, 3],
        });

        assert!(UuidCodec.to_native(short, &CodecContext::default()).is_err());
    }
}
