//! Codec for untyped "any BSON value" containers.
//!
//! Fields typed as [`Bson`], [`Document`] or `serde_json::Value` can hold a
//! heterogeneous tree. Native values pass through untouched; sub-documents
//! written as canonical or relaxed extended JSON (`{"$oid": "..."}`,
//! `{"$date": ...}`) are rebuilt into the native value they describe, key by
//! key, so a tree assembled from text ends up identical to one built natively.

use bson::{Bson, Document, de::deserialize_from_bson};

use super::{CodecContext, FieldCodec, with_module};
use crate::error::{MapperError, MapperResult};

pub const NAME: &str = "bson_value";
with_module!("bson_value");

const EXTENDED_KEYS: &[&str] = &[
    "$oid",
    "$date",
    "$numberInt",
    "$numberLong",
    "$numberDouble",
    "$numberDecimal",
    "$binary",
    "$uuid",
    "$timestamp",
    "$regularExpression",
    "$symbol",
    "$code",
    "$minKey",
    "$maxKey",
    "$undefined",
    "$dbPointer",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct BsonValueCodec;

impl FieldCodec for BsonValueCodec {
    fn name(&self) -> &'static str {
        NAME
    }

    fn to_native(&self, value: Bson, _context: &CodecContext) -> MapperResult<Bson> {
        rebuild(value)
    }

    fn from_native(&self, value: &Bson, _context: &CodecContext) -> MapperResult<Bson> {
        Ok(value.clone())
    }
}

fn rebuild(value: Bson) -> MapperResult<Bson> {
    match value {
        Bson::Document(document) if is_extended(&document) => {
            let literal = Bson::Document(document);
            deserialize_from_bson::<Bson>(literal.clone())
                .map_err(|e| MapperError::mapping(&literal, format!("invalid extended JSON value: {e}")))
        }
        Bson::Document(document) => {
            let mut native = Document::new();
            for (key, value) in document {
                native.insert(key, rebuild(value)?);
            }
            Ok(Bson::Document(native))
        }
        Bson::Array(values) => values
            .into_iter()
            .map(rebuild)
            .collect::<MapperResult<Vec<_>>>()
            .map(Bson::Array),
        other => Ok(other),
    }
}

fn is_extended(document: &Document) -> bool {
    document
        .keys()
        .next()
        .is_some_and(|key| EXTENDED_KEYS.contains(&key.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{DateTime, doc, oid::ObjectId};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rebuilds_extended_json_key_by_key() {
        let id = ObjectId::new();
        let textual = Bson::Document(doc! {
            "ref": { "$oid": id.to_hex() },
            "list": [{ "$numberLong": "7" }, "plain"],
            "nested": { "when": { "$date": { "$numberLong": "1000" } }, "n": 1 },
        });

        let native = BsonValueCodec
            .to_native(textual, &CodecContext::default())
            .unwrap();

        assert_eq!(
            native,
            Bson::Document(doc! {
                "ref": id,
                "list": [7_i64, "plain"],
                "nested": { "when": DateTime::from_millis(1000), "n": 1 },
            })
        );
    }

    #[test]
    fn test_operators_are_not_mistaken_for_extended_json() {
        let query = Bson::Document(doc! { "$gt": 5 });

        assert_eq!(
            BsonValueCodec
                .to_native(query.clone(), &CodecContext::default())
                .unwrap(),
            query
        );
    }
}
