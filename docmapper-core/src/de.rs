//! `serde::Deserializer` over native BSON values.
//!
//! [`BsonDeserializer`] reads the next value of a [`BsonSource`], one token
//! at a time. Strings and generic binaries are borrowed straight from the
//! document. Newtype structs named with a codec marker take the current native
//! value whole and route it through the codec's `from_native` before the
//! field's own `Deserialize` implementation sees it. Native values without a
//! generic shape (object ids, dates, decimals, ...) arrive as
//! [`Token::Embedded`] and are presented in their canonical extended JSON
//! form, which is exactly what bson's own `Deserialize` implementations accept.

use bson::{Binary, Bson, Document, spec::BinarySubtype};
use serde::{
    Deserializer,
    de::{
        DeserializeSeed, EnumAccess, MapAccess, SeqAccess, VariantAccess, Visitor,
        value::{BorrowedStrDeserializer, StringDeserializer},
    },
    forward_to_deserialize_any,
};

use crate::{
    codec,
    error::{MapperError, MapperResult},
    mapper::Mapper,
    source::{BsonSource, Number, Token},
};

const ENUM_SHAPE: &str = "expected a string or a single-key document for an enum";

/// Where a deserializer takes its value from.
enum Input<'s, 'de> {
    /// The next value of a source over the stored document.
    Source(&'s mut BsonSource<'de>),
    /// A value a codec produced while reading.
    Owned(Bson),
}

/// Deserializes Rust values from native BSON.
pub struct BsonDeserializer<'s, 'de, 'm> {
    input: Input<'s, 'de>,
    mapper: &'m Mapper,
}

impl<'s, 'de, 'm> BsonDeserializer<'s, 'de, 'm> {
    /// Creates a deserializer that consumes the next value of `source`.
    pub fn new(source: &'s mut BsonSource<'de>, mapper: &'m Mapper) -> Self {
        Self {
            input: Input::Source(source),
            mapper,
        }
    }

    fn owned(value: Bson, mapper: &'m Mapper) -> Self {
        Self {
            input: Input::Owned(value),
            mapper,
        }
    }
}

/// Presents a native value through its canonical extended JSON shape.
fn visit_embedded<'de, V>(value: &Bson, visitor: V) -> MapperResult<V::Value>
where
    V: Visitor<'de>,
{
    let shape = serde_json::to_value(value)?;
    Deserializer::deserialize_any(shape, visitor).map_err(MapperError::from)
}

fn is_generic_binary(binary: &Binary) -> bool {
    matches!(binary.subtype, BinarySubtype::Generic)
}

fn missing(token: Token) -> MapperError {
    MapperError::Structure(format!("{token:?} token without a value"))
}

fn unexpected(source: &BsonSource<'_>, message: &str) -> MapperError {
    match source.current_value() {
        Some(value) => MapperError::mapping(value, message),
        None => MapperError::Structure(message.to_owned()),
    }
}

/// Advances `source` onto the start of its next value.
fn next_value_token(source: &mut BsonSource<'_>) -> MapperResult<Token> {
    match source.next_token() {
        Some(token) if token.is_value() => Ok(token),
        Some(token) => Err(MapperError::Structure(format!(
            "expected a value, found {token:?}"
        ))),
        None => Err(MapperError::Structure("source is exhausted".into())),
    }
}

/// Consumes tokens up to and including the `end` token of the container the
/// source is in, skipping over nested containers.
fn skip_rest(source: &mut BsonSource<'_>, end: Token) -> MapperResult<()> {
    loop {
        match source.next_token() {
            Some(token) if token == end => return Ok(()),
            Some(Token::StartObject | Token::StartArray) => source.skip_children(),
            Some(_) => {}
            None => {
                return Err(MapperError::Structure(
                    "source ended inside a container".into(),
                ));
            }
        }
    }
}

fn visit_source<'de, V>(source: &mut BsonSource<'de>, mapper: &Mapper, visitor: V) -> MapperResult<V::Value>
where
    V: Visitor<'de>,
{
    let token = next_value_token(source)?;

    match token {
        Token::StartObject => {
            let mut map = SourceMap {
                source,
                mapper,
                done: false,
            };
            let value = visitor.visit_map(&mut map)?;
            map.finish()?;
            Ok(value)
        }
        Token::StartArray => {
            let mut seq = SourceSeq {
                source,
                mapper,
                done: false,
            };
            let value = visitor.visit_seq(&mut seq)?;
            seq.finish()?;
            Ok(value)
        }
        Token::String => visitor.visit_borrowed_str(source.text().ok_or_else(|| missing(token))?),
        Token::Int32 | Token::Int64 | Token::Double => match source.number_value() {
            Some(Number::Int32(v)) => visitor.visit_i32(v),
            Some(Number::Int64(v)) => visitor.visit_i64(v),
            Some(Number::Double(v)) => visitor.visit_f64(v),
            None => Err(missing(token)),
        },
        Token::Boolean => visitor.visit_bool(source.bool_value().ok_or_else(|| missing(token))?),
        Token::Null => visitor.visit_unit(),
        Token::Binary => {
            visitor.visit_borrowed_bytes(source.binary_value().ok_or_else(|| missing(token))?)
        }
        Token::Embedded => visit_embedded(source.embedded_object().ok_or_else(|| missing(token))?, visitor),
        Token::EndObject | Token::EndArray | Token::FieldName => Err(MapperError::Structure(format!(
            "expected a value, found {token:?}"
        ))),
    }
}

fn visit_owned<'de, V>(value: Bson, mapper: &Mapper, visitor: V) -> MapperResult<V::Value>
where
    V: Visitor<'de>,
{
    match value {
        Bson::String(text) => visitor.visit_string(text),
        Bson::Binary(binary) if is_generic_binary(&binary) => visitor.visit_byte_buf(binary.bytes),
        Bson::Document(document) => visitor.visit_map(OwnedMap {
            entries: document.into_iter(),
            pending: None,
            mapper,
        }),
        Bson::Array(values) => visitor.visit_seq(OwnedSeq {
            values: values.into_iter(),
            mapper,
        }),
        Bson::Int32(v) => visitor.visit_i32(v),
        Bson::Int64(v) => visitor.visit_i64(v),
        Bson::Double(v) => visitor.visit_f64(v),
        Bson::Boolean(v) => visitor.visit_bool(v),
        Bson::Null => visitor.visit_unit(),
        other => visit_embedded(&other, visitor),
    }
}

impl<'de> Deserializer<'de> for BsonDeserializer<'_, 'de, '_> {
    type Error = MapperError;

    fn is_human_readable(&self) -> bool {
        false
    }

    fn deserialize_any<V>(self, visitor: V) -> MapperResult<V::Value>
    where
        V: Visitor<'de>,
    {
        match self.input {
            Input::Source(source) => visit_source(source, self.mapper, visitor),
            Input::Owned(value) => visit_owned(value, self.mapper, visitor),
        }
    }

    fn deserialize_option<V>(self, visitor: V) -> MapperResult<V::Value>
    where
        V: Visitor<'de>,
    {
        let mapper = self.mapper;

        match self.input {
            Input::Source(source) => {
                if matches!(source.peek_value(), Some(Bson::Null | Bson::Undefined)) {
                    source.skip_value()?;
                    visitor.visit_none()
                } else {
                    visitor.visit_some(BsonDeserializer::new(source, mapper))
                }
            }
            Input::Owned(Bson::Null | Bson::Undefined) => visitor.visit_none(),
            input => visitor.visit_some(Self { input, mapper }),
        }
    }

    fn deserialize_unit<V>(self, visitor: V) -> MapperResult<V::Value>
    where
        V: Visitor<'de>,
    {
        let mapper = self.mapper;

        match self.input {
            Input::Source(source) if source.peek_token() == Some(Token::Null) => {
                source.skip_value()?;
                visitor.visit_unit()
            }
            Input::Owned(Bson::Null) => visitor.visit_unit(),
            input => Self { input, mapper }.deserialize_any(visitor),
        }
    }

    fn deserialize_unit_struct<V>(self, _name: &'static str, visitor: V) -> MapperResult<V::Value>
    where
        V: Visitor<'de>,
    {
        self.deserialize_unit(visitor)
    }

    fn deserialize_bytes<V>(self, visitor: V) -> MapperResult<V::Value>
    where
        V: Visitor<'de>,
    {
        let mapper = self.mapper;

        match self.input {
            Input::Source(source) => match source.peek_value() {
                Some(Bson::Binary(binary)) => {
                    source.skip_value()?;
                    visitor.visit_borrowed_bytes(&binary.bytes)
                }
                _ => visit_source(source, mapper, visitor),
            },
            Input::Owned(Bson::Binary(binary)) => visitor.visit_byte_buf(binary.bytes),
            Input::Owned(value) => visit_owned(value, mapper, visitor),
        }
    }

    fn deserialize_byte_buf<V>(self, visitor: V) -> MapperResult<V::Value>
    where
        V: Visitor<'de>,
    {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_newtype_struct<V>(self, name: &'static str, visitor: V) -> MapperResult<V::Value>
    where
        V: Visitor<'de>,
    {
        let Some((codec_name, shape)) = codec::parse_marker(name) else {
            return visitor.visit_newtype_struct(self);
        };

        let mapper = self.mapper;
        let codec = mapper.codec(codec_name)?;
        let context = mapper.codec_context();
        let generic = match self.input {
            Input::Source(source) => shape.decode(codec.as_ref(), source.next_value()?, &context)?,
            Input::Owned(value) => shape.decode(codec.as_ref(), &value, &context)?,
        };

        visitor.visit_newtype_struct(BsonDeserializer::owned(generic, mapper))
    }

    fn deserialize_enum<V>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> MapperResult<V::Value>
    where
        V: Visitor<'de>,
    {
        let mapper = self.mapper;

        match self.input {
            Input::Source(source) => match next_value_token(source)? {
                Token::String => {
                    let variant = source.text().ok_or_else(|| missing(Token::String))?;
                    visitor.visit_enum(BorrowedStrDeserializer::<MapperError>::new(variant))
                }
                Token::StartObject => {
                    if source.next_token() != Some(Token::FieldName) {
                        return Err(MapperError::Serialization(ENUM_SHAPE.into()));
                    }
                    let variant = source
                        .current_name()
                        .ok_or_else(|| missing(Token::FieldName))?;
                    let value = visitor.visit_enum(EnumDeserializer {
                        variant: Key::Borrowed(variant),
                        value: BsonDeserializer::new(&mut *source, mapper),
                    })?;

                    match source.next_token() {
                        Some(Token::EndObject) => Ok(value),
                        _ => Err(MapperError::Serialization(ENUM_SHAPE.into())),
                    }
                }
                _ => Err(unexpected(source, ENUM_SHAPE)),
            },
            Input::Owned(Bson::String(variant)) => {
                visitor.visit_enum(StringDeserializer::<MapperError>::new(variant))
            }
            Input::Owned(Bson::Document(document)) if document.len() == 1 => {
                let Some((variant, value)) = document.into_iter().next() else {
                    return Err(MapperError::Serialization("empty enum document".into()));
                };
                visitor.visit_enum(EnumDeserializer {
                    variant: Key::Owned(variant),
                    value: BsonDeserializer::owned(value, mapper),
                })
            }
            Input::Owned(value) => Err(MapperError::mapping(&value, ENUM_SHAPE)),
        }
    }

    fn deserialize_ignored_any<V>(self, visitor: V) -> MapperResult<V::Value>
    where
        V: Visitor<'de>,
    {
        if let Input::Source(source) = self.input {
            source.skip_value()?;
        }
        visitor.visit_unit()
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        seq tuple tuple_struct map struct identifier
    }
}

/// A document key, borrowed or owned.
enum Key<'de> {
    Borrowed(&'de str),
    Owned(String),
}

impl<'de> Key<'de> {
    fn deserialize<S>(self, seed: S) -> MapperResult<S::Value>
    where
        S: DeserializeSeed<'de>,
    {
        match self {
            Key::Borrowed(key) => seed.deserialize(BorrowedStrDeserializer::<MapperError>::new(key)),
            Key::Owned(key) => seed.deserialize(StringDeserializer::<MapperError>::new(key)),
        }
    }
}

/// Fields of a document read from a source.
struct SourceMap<'s, 'de, 'm> {
    source: &'s mut BsonSource<'de>,
    mapper: &'m Mapper,
    done: bool,
}

impl SourceMap<'_, '_, '_> {
    /// Skips whatever the visitor left unread.
    fn finish(&mut self) -> MapperResult<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        skip_rest(self.source, Token::EndObject)
    }
}

impl<'de> MapAccess<'de> for SourceMap<'_, 'de, '_> {
    type Error = MapperError;

    fn next_key_seed<K>(&mut self, seed: K) -> MapperResult<Option<K::Value>>
    where
        K: DeserializeSeed<'de>,
    {
        if self.done {
            return Ok(None);
        }

        match self.source.next_token() {
            Some(Token::FieldName) => {
                let name = self
                    .source
                    .current_name()
                    .ok_or_else(|| missing(Token::FieldName))?;
                seed.deserialize(BorrowedStrDeserializer::<MapperError>::new(name))
                    .map(Some)
            }
            Some(Token::EndObject) => {
                self.done = true;
                Ok(None)
            }
            other => Err(MapperError::Structure(format!(
                "expected a field name, found {other:?}"
            ))),
        }
    }

    fn next_value_seed<S>(&mut self, seed: S) -> MapperResult<S::Value>
    where
        S: DeserializeSeed<'de>,
    {
        seed.deserialize(BsonDeserializer::new(&mut *self.source, self.mapper))
    }
}

/// Elements of an array read from a source.
struct SourceSeq<'s, 'de, 'm> {
    source: &'s mut BsonSource<'de>,
    mapper: &'m Mapper,
    done: bool,
}

impl SourceSeq<'_, '_, '_> {
    fn finish(&mut self) -> MapperResult<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        skip_rest(self.source, Token::EndArray)
    }
}

impl<'de> SeqAccess<'de> for SourceSeq<'_, 'de, '_> {
    type Error = MapperError;

    fn next_element_seed<S>(&mut self, seed: S) -> MapperResult<Option<S::Value>>
    where
        S: DeserializeSeed<'de>,
    {
        if self.done {
            return Ok(None);
        }

        match self.source.peek_token() {
            Some(Token::EndArray) => {
                self.source.next_token();
                self.done = true;
                Ok(None)
            }
            Some(_) => seed
                .deserialize(BsonDeserializer::new(&mut *self.source, self.mapper))
                .map(Some),
            None => Err(MapperError::Structure("source ended inside an array".into())),
        }
    }
}

/// Fields of a document a codec produced.
struct OwnedMap<'m> {
    entries: <Document as IntoIterator>::IntoIter,
    pending: Option<Bson>,
    mapper: &'m Mapper,
}

impl<'de> MapAccess<'de> for OwnedMap<'_> {
    type Error = MapperError;

    fn next_key_seed<K>(&mut self, seed: K) -> MapperResult<Option<K::Value>>
    where
        K: DeserializeSeed<'de>,
    {
        match self.entries.next() {
            Some((key, value)) => {
                self.pending = Some(value);
                Key::Owned(key).deserialize(seed).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<S>(&mut self, seed: S) -> MapperResult<S::Value>
    where
        S: DeserializeSeed<'de>,
    {
        let value = self
            .pending
            .take()
            .ok_or_else(|| MapperError::Structure("value requested before its key".into()))?;

        seed.deserialize(BsonDeserializer::owned(value, self.mapper))
    }
}

/// Elements of an array a codec produced.
struct OwnedSeq<'m> {
    values: std::vec::IntoIter<Bson>,
    mapper: &'m Mapper,
}

impl<'de> SeqAccess<'de> for OwnedSeq<'_> {
    type Error = MapperError;

    fn next_element_seed<S>(&mut self, seed: S) -> MapperResult<Option<S::Value>>
    where
        S: DeserializeSeed<'de>,
    {
        match self.values.next() {
            Some(value) => seed
                .deserialize(BsonDeserializer::owned(value, self.mapper))
                .map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.values.len())
    }
}

struct EnumDeserializer<'s, 'de, 'm> {
    variant: Key<'de>,
    value: BsonDeserializer<'s, 'de, 'm>,
}

impl<'s, 'de, 'm> EnumAccess<'de> for EnumDeserializer<'s, 'de, 'm> {
    type Error = MapperError;
    type Variant = BsonDeserializer<'s, 'de, 'm>;

    fn variant_seed<S>(self, seed: S) -> MapperResult<(S::Value, Self::Variant)>
    where
        S: DeserializeSeed<'de>,
    {
        let variant = self.variant.deserialize(seed)?;
        Ok((variant, self.value))
    }
}

impl<'de> VariantAccess<'de> for BsonDeserializer<'_, 'de, '_> {
    type Error = MapperError;

    fn unit_variant(self) -> MapperResult<()> {
        match self.input {
            Input::Source(source) => match source.peek_value() {
                Some(Bson::Null) => source.skip_value(),
                Some(other) => Err(MapperError::mapping(other, "expected a unit variant")),
                None => Err(MapperError::Structure("expected a unit variant".into())),
            },
            Input::Owned(Bson::Null) => Ok(()),
            Input::Owned(other) => Err(MapperError::mapping(&other, "expected a unit variant")),
        }
    }

    fn newtype_variant_seed<S>(self, seed: S) -> MapperResult<S::Value>
    where
        S: DeserializeSeed<'de>,
    {
        seed.deserialize(self)
    }

    fn tuple_variant<V>(self, _len: usize, visitor: V) -> MapperResult<V::Value>
    where
        V: Visitor<'de>,
    {
        self.deserialize_any(visitor)
    }

    fn struct_variant<V>(
        self,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> MapperResult<V::Value>
    where
        V: Visitor<'de>,
    {
        self.deserialize_any(visitor)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bson::{DateTime, doc, oid::ObjectId};
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};

    use crate::{
        mapper::Mapper,
        source::{BsonSource, Token},
    };

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum Shape {
        Point,
        Circle(f64),
        Rect { w: i32, h: i32 },
        Pair(i32, i32),
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Everything {
        small: u8,
        big: u64,
        flag: bool,
        missing: Option<String>,
        present: Option<i64>,
        shapes: Vec<Shape>,
        tags: HashMap<String, String>,
        id: ObjectId,
        at: DateTime,
        raw: bson::Bson,
        #[serde(with = "crate::codec::object_id")]
        hex: String,
        #[serde(with = "crate::codec::object_id", default)]
        maybe: Option<String>,
        #[serde(with = "crate::codec::uuid")]
        token: ::uuid::Uuid,
    }

    fn sample() -> Everything {
        Everything {
            small: 7,
            big: 1 << 40,
            flag: true,
            missing: None,
            present: Some(3),
            shapes: vec![
                Shape::Point,
                Shape::Circle(1.5),
                Shape::Rect { w: 2, h: 3 },
                Shape::Pair(4, 5),
            ],
            tags: HashMap::from([("k".to_string(), "v".to_string())]),
            id: ObjectId::new(),
            at: DateTime::from_millis(1_700_000_000_000),
            raw: bson::Bson::Document(doc! { "nested": [1, "two"] }),
            hex: ObjectId::new().to_hex(),
            maybe: Some(ObjectId::new().to_hex()),
            token: ::uuid::Uuid::new_v4(),
        }
    }

    #[test]
    fn test_round_trip_through_native_values() {
        let mapper = Mapper::default();
        let value = sample();

        let document = mapper.to_document(&value).unwrap();
        assert!(matches!(document.get("hex"), Some(bson::Bson::ObjectId(_))));
        assert!(matches!(
            document.get("token"),
            Some(bson::Bson::Binary(bson::Binary {
                subtype: bson::spec::BinarySubtype::Uuid,
                ..
            }))
        ));

        let back: Everything = mapper.from_document(&document).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_borrowed_strings() {
        #[derive(Deserialize)]
        struct View<'a> {
            name: &'a str,
        }

        let mapper = Mapper::default();
        let value = bson::Bson::Document(doc! { "name": "borrowed" });
        let mut source = BsonSource::new(&value);
        let view = View::deserialize(super::BsonDeserializer::new(&mut source, &mapper)).unwrap();

        assert_eq!(view.name, "borrowed");
        assert_eq!(source.next_token(), None);
    }

    #[test]
    fn test_unread_values_are_skipped_token_by_token() {
        #[derive(Debug, PartialEq, Deserialize)]
        struct Partial {
            keep: String,
            after: Vec<i32>,
        }

        let mapper = Mapper::default();
        let document = doc! {
            "ignored": { "deep": [1, { "deeper": [[], {}] }], "id": ObjectId::new() },
            "keep": "yes",
            "skipped": [{ "a": 1 }, [2, 3]],
            "after": [4, 5],
        };

        assert_eq!(
            mapper.from_document::<Partial>(&document).unwrap(),
            Partial {
                keep: "yes".into(),
                after: vec![4, 5],
            }
        );
    }

    #[test]
    fn test_deserializer_consumes_exactly_one_value() {
        let mapper = Mapper::default();
        let value = bson::Bson::Array(vec![
            doc! { "x": [1, 2], "y": "z" }.into(),
            bson::Bson::Int32(7),
        ]);
        let mut source = BsonSource::new(&value);
        assert_eq!(source.next_token(), Some(Token::StartArray));

        let first: HashMap<String, bson::Bson> =
            HashMap::deserialize(super::BsonDeserializer::new(&mut source, &mapper)).unwrap();
        let second = i32::deserialize(super::BsonDeserializer::new(&mut source, &mapper)).unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second, 7);
        assert_eq!(source.next_token(), Some(Token::EndArray));
    }

    #[test]
    fn test_codec_failure_is_a_mapping_error() {
        #[derive(Debug, Deserialize)]
        struct Bad {
            #[serde(with = "crate::codec::object_id")]
            #[allow(dead_code)]
            id: String,
        }

        let mapper = Mapper::default();
        let err = mapper.from_document::<Bad>(&doc! { "id": true }).unwrap_err();

        assert!(matches!(err, crate::error::MapperError::Mapping { .. }));
    }
}
