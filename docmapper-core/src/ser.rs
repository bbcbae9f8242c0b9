//! `serde::Serializer` that drives a [`BsonSink`].
//!
//! The serializer is binary (`is_human_readable` is `false`) and understands
//! two conventions on top of plain serde:
//!
//! * newtype structs named with a codec marker are serialized generically,
//!   converted by the codec registered in the [`Mapper`] and written with
//!   [`BsonSink::write_object`];
//! * structs whose name starts with `$` are bson's own extended JSON shapes
//!   (`ObjectId`, `DateTime`, `Timestamp`, ...). They are collected and turned
//!   back into the native value they describe.

use bson::{Binary, Bson, Document, de::deserialize_from_bson, spec::BinarySubtype};
use serde::{
    Serialize,
    ser::{self, Impossible},
};

use crate::{
    codec::{self, CodecShape},
    error::{MapperError, MapperResult},
    mapper::Mapper,
    sink::BsonSink,
};

/// Newtype name bson uses for its own `Uuid` type.
const BSON_UUID_NEWTYPE: &str = "$__bson_private_uuid";

/// Serializes Rust values into a [`BsonSink`].
pub struct BsonSerializer<'a> {
    sink: &'a mut BsonSink,
    mapper: &'a Mapper,
}

impl<'a> BsonSerializer<'a> {
    pub fn new(sink: &'a mut BsonSink, mapper: &'a Mapper) -> Self {
        Self { sink, mapper }
    }

    fn write_codec<T>(self, codec_name: &str, shape: CodecShape, value: &T) -> MapperResult<()>
    where
        T: ?Sized + Serialize,
    {
        let codec = self.mapper.codec(codec_name)?;
        let generic = self.mapper.to_bson(value)?;
        let native = shape.encode(codec.as_ref(), generic, &self.mapper.codec_context())?;

        self.sink.write_object(native)
    }
}

/// How a [`Compound`] closes its frame(s).
enum Close {
    Array,
    Object,
    Native,
    VariantArray,
    VariantObject,
}

/// State shared by every compound serializer (sequences, maps, structs, variants).
pub struct Compound<'a> {
    sink: &'a mut BsonSink,
    mapper: &'a Mapper,
    close: Close,
}

impl<'a> Compound<'a> {
    fn child(&mut self) -> BsonSerializer<'_> {
        BsonSerializer::new(&mut *self.sink, self.mapper)
    }

    fn field<T>(&mut self, key: &str, value: &T) -> MapperResult<()>
    where
        T: ?Sized + Serialize,
    {
        self.sink.write_field_name(key)?;
        value.serialize(self.child())
    }

    fn finish(self) -> MapperResult<()> {
        match self.close {
            Close::Array => self.sink.write_end_array(),
            Close::Object => self.sink.write_end_object(),
            Close::Native => self.sink.write_end_object_with(native_from_extended),
            Close::VariantArray => {
                self.sink.write_end_array()?;
                self.sink.write_end_object()
            }
            Close::VariantObject => {
                self.sink.write_end_object()?;
                self.sink.write_end_object()
            }
        }
    }
}

/// Rebuilds the native value described by one of bson's extended JSON shapes.
fn native_from_extended(document: Document) -> MapperResult<Bson> {
    let shape = Bson::Document(document);
    deserialize_from_bson::<Bson>(shape.clone())
        .map_err(|e| MapperError::mapping(&shape, format!("not a native value: {e}")))
}

impl<'a> ser::Serializer for BsonSerializer<'a> {
    type Ok = ();
    type Error = MapperError;

    type SerializeSeq = Compound<'a>;
    type SerializeTuple = Compound<'a>;
    type SerializeTupleStruct = Compound<'a>;
    type SerializeTupleVariant = Compound<'a>;
    type SerializeMap = Compound<'a>;
    type SerializeStruct = Compound<'a>;
    type SerializeStructVariant = Compound<'a>;

    fn is_human_readable(&self) -> bool {
        false
    }

    fn serialize_bool(self, v: bool) -> MapperResult<()> {
        self.sink.write_bool(v)
    }

    fn serialize_i8(self, v: i8) -> MapperResult<()> {
        self.sink.write_i32(i32::from(v))
    }

    fn serialize_i16(self, v: i16) -> MapperResult<()> {
        self.sink.write_i32(i32::from(v))
    }

    fn serialize_i32(self, v: i32) -> MapperResult<()> {
        self.sink.write_i32(v)
    }

    fn serialize_i64(self, v: i64) -> MapperResult<()> {
        self.sink.write_i64(v)
    }

    fn serialize_u8(self, v: u8) -> MapperResult<()> {
        self.sink.write_i32(i32::from(v))
    }

    fn serialize_u16(self, v: u16) -> MapperResult<()> {
        self.sink.write_i32(i32::from(v))
    }

    fn serialize_u32(self, v: u32) -> MapperResult<()> {
        self.sink.write_i64(i64::from(v))
    }

    fn serialize_u64(self, v: u64) -> MapperResult<()> {
        let v = i64::try_from(v).map_err(|_| {
            MapperError::Serialization(format!("{v} does not fit in a signed 64-bit integer"))
        })?;
        self.sink.write_i64(v)
    }

    fn serialize_f32(self, v: f32) -> MapperResult<()> {
        self.sink.write_f64(f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> MapperResult<()> {
        self.sink.write_f64(v)
    }

    fn serialize_char(self, v: char) -> MapperResult<()> {
        self.sink.write_string(v.to_string())
    }

    fn serialize_str(self, v: &str) -> MapperResult<()> {
        self.sink.write_string(v)
    }

    fn serialize_bytes(self, v: &[u8]) -> MapperResult<()> {
        self.sink.write_binary(v)
    }

    fn serialize_none(self) -> MapperResult<()> {
        self.sink.write_null()
    }

    fn serialize_some<T>(self, value: &T) -> MapperResult<()>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_unit(self) -> MapperResult<()> {
        self.sink.write_null()
    }

    fn serialize_unit_struct(self, _name: &'static str) -> MapperResult<()> {
        self.sink.write_null()
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> MapperResult<()> {
        self.sink.write_string(variant)
    }

    fn serialize_newtype_struct<T>(self, name: &'static str, value: &T) -> MapperResult<()>
    where
        T: ?Sized + Serialize,
    {
        if let Some((codec_name, shape)) = codec::parse_marker(name) {
            return self.write_codec(codec_name, shape, value);
        }

        if name == BSON_UUID_NEWTYPE {
            return match self.mapper.to_bson(value)? {
                Bson::Binary(Binary { bytes, .. }) => self.sink.write_object(Bson::Binary(Binary {
                    subtype: BinarySubtype::Uuid,
                    bytes,
                })),
                other => Err(MapperError::mapping(&other, "expected UUID bytes")),
            };
        }

        value.serialize(self)
    }

    fn serialize_newtype_variant<T>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> MapperResult<()>
    where
        T: ?Sized + Serialize,
    {
        self.sink.write_start_object()?;
        self.sink.write_field_name(variant)?;
        value.serialize(BsonSerializer::new(&mut *self.sink, self.mapper))?;
        self.sink.write_end_object()
    }

    fn serialize_seq(self, _len: Option<usize>) -> MapperResult<Compound<'a>> {
        self.sink.write_start_array()?;
        Ok(Compound {
            sink: self.sink,
            mapper: self.mapper,
            close: Close::Array,
        })
    }

    fn serialize_tuple(self, len: usize) -> MapperResult<Compound<'a>> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(self, _name: &'static str, len: usize) -> MapperResult<Compound<'a>> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> MapperResult<Compound<'a>> {
        self.sink.write_start_object()?;
        self.sink.write_field_name(variant)?;
        self.sink.write_start_array()?;
        Ok(Compound {
            sink: self.sink,
            mapper: self.mapper,
            close: Close::VariantArray,
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> MapperResult<Compound<'a>> {
        self.sink.write_start_object()?;
        Ok(Compound {
            sink: self.sink,
            mapper: self.mapper,
            close: Close::Object,
        })
    }

    fn serialize_struct(self, name: &'static str, _len: usize) -> MapperResult<Compound<'a>> {
        self.sink.write_start_object()?;
        Ok(Compound {
            sink: self.sink,
            mapper: self.mapper,
            close: if name.starts_with('$') {
                Close::Native
            } else {
                Close::Object
            },
        })
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> MapperResult<Compound<'a>> {
        self.sink.write_start_object()?;
        self.sink.write_field_name(variant)?;
        self.sink.write_start_object()?;
        Ok(Compound {
            sink: self.sink,
            mapper: self.mapper,
            close: Close::VariantObject,
        })
    }
}

impl ser::SerializeSeq for Compound<'_> {
    type Ok = ();
    type Error = MapperError;

    fn serialize_element<T>(&mut self, value: &T) -> MapperResult<()>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self.child())
    }

    fn end(self) -> MapperResult<()> {
        self.finish()
    }
}

impl ser::SerializeTuple for Compound<'_> {
    type Ok = ();
    type Error = MapperError;

    fn serialize_element<T>(&mut self, value: &T) -> MapperResult<()>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self.child())
    }

    fn end(self) -> MapperResult<()> {
        self.finish()
    }
}

impl ser::SerializeTupleStruct for Compound<'_> {
    type Ok = ();
    type Error = MapperError;

    fn serialize_field<T>(&mut self, value: &T) -> MapperResult<()>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self.child())
    }

    fn end(self) -> MapperResult<()> {
        self.finish()
    }
}

impl ser::SerializeTupleVariant for Compound<'_> {
    type Ok = ();
    type Error = MapperError;

    fn serialize_field<T>(&mut self, value: &T) -> MapperResult<()>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self.child())
    }

    fn end(self) -> MapperResult<()> {
        self.finish()
    }
}

impl ser::SerializeMap for Compound<'_> {
    type Ok = ();
    type Error = MapperError;

    fn serialize_key<T>(&mut self, key: &T) -> MapperResult<()>
    where
        T: ?Sized + Serialize,
    {
        let key = key.serialize(KeySerializer)?;
        self.sink.write_field_name(key)
    }

    fn serialize_value<T>(&mut self, value: &T) -> MapperResult<()>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self.child())
    }

    fn end(self) -> MapperResult<()> {
        self.finish()
    }
}

impl ser::SerializeStruct for Compound<'_> {
    type Ok = ();
    type Error = MapperError;

    fn serialize_field<T>(&mut self, key: &'static str, value: &T) -> MapperResult<()>
    where
        T: ?Sized + Serialize,
    {
        self.field(key, value)
    }

    fn end(self) -> MapperResult<()> {
        self.finish()
    }
}

impl ser::SerializeStructVariant for Compound<'_> {
    type Ok = ();
    type Error = MapperError;

    fn serialize_field<T>(&mut self, key: &'static str, value: &T) -> MapperResult<()>
    where
        T: ?Sized + Serialize,
    {
        self.field(key, value)
    }

    fn end(self) -> MapperResult<()> {
        self.finish()
    }
}

/// Turns map keys into document keys. Strings, chars, integers and unit
/// variants are accepted; anything else is an error.
struct KeySerializer;

impl KeySerializer {
    fn reject(kind: &str) -> MapperError {
        MapperError::Serialization(format!("document keys must be strings, found {kind}"))
    }
}

impl ser::Serializer for KeySerializer {
    type Ok = String;
    type Error = MapperError;

    type SerializeSeq = Impossible<String, MapperError>;
    type SerializeTuple = Impossible<String, MapperError>;
    type SerializeTupleStruct = Impossible<String, MapperError>;
    type SerializeTupleVariant = Impossible<String, MapperError>;
    type SerializeMap = Impossible<String, MapperError>;
    type SerializeStruct = Impossible<String, MapperError>;
    type SerializeStructVariant = Impossible<String, MapperError>;

    fn is_human_readable(&self) -> bool {
        false
    }

    fn serialize_bool(self, _v: bool) -> MapperResult<String> {
        Err(Self::reject("a boolean"))
    }

    fn serialize_i8(self, v: i8) -> MapperResult<String> {
        Ok(v.to_string())
    }

    fn serialize_i16(self, v: i16) -> MapperResult<String> {
        Ok(v.to_string())
    }

    fn serialize_i32(self, v: i32) -> MapperResult<String> {
        Ok(v.to_string())
    }

    fn serialize_i64(self, v: i64) -> MapperResult<String> {
        Ok(v.to_string())
    }

    fn serialize_u8(self, v: u8) -> MapperResult<String> {
        Ok(v.to_string())
    }

    fn serialize_u16(self, v: u16) -> MapperResult<String> {
        Ok(v.to_string())
    }

    fn serialize_u32(self, v: u32) -> MapperResult<String> {
        Ok(v.to_string())
    }

    fn serialize_u64(self, v: u64) -> MapperResult<String> {
        Ok(v.to_string())
    }

    fn serialize_f32(self, _v: f32) -> MapperResult<String> {
        Err(Self::reject("a float"))
    }

    fn serialize_f64(self, _v: f64) -> MapperResult<String> {
        Err(Self::reject("a float"))
    }

    fn serialize_char(self, v: char) -> MapperResult<String> {
        Ok(v.to_string())
    }

    fn serialize_str(self, v: &str) -> MapperResult<String> {
        Ok(v.to_string())
    }

    fn serialize_bytes(self, _v: &[u8]) -> MapperResult<String> {
        Err(Self::reject("bytes"))
    }

    fn serialize_none(self) -> MapperResult<String> {
        Err(Self::reject("none"))
    }

    fn serialize_some<T>(self, value: &T) -> MapperResult<String>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_unit(self) -> MapperResult<String> {
        Err(Self::reject("unit"))
    }

    fn serialize_unit_struct(self, _name: &'static str) -> MapperResult<String> {
        Err(Self::reject("a unit struct"))
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> MapperResult<String> {
        Ok(variant.to_string())
    }

    fn serialize_newtype_struct<T>(self, _name: &'static str, value: &T) -> MapperResult<String>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> MapperResult<String>
    where
        T: ?Sized + Serialize,
    {
        Err(Self::reject("a newtype variant"))
    }

    fn serialize_seq(self, _len: Option<usize>) -> MapperResult<Self::SerializeSeq> {
        Err(Self::reject("a sequence"))
    }

    fn serialize_tuple(self, _len: usize) -> MapperResult<Self::SerializeTuple> {
        Err(Self::reject("a tuple"))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> MapperResult<Self::SerializeTupleStruct> {
        Err(Self::reject("a tuple struct"))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> MapperResult<Self::SerializeTupleVariant> {
        Err(Self::reject("a tuple variant"))
    }

    fn serialize_map(self, _len: Option<usize>) -> MapperResult<Self::SerializeMap> {
        Err(Self::reject("a map"))
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> MapperResult<Self::SerializeStruct> {
        Err(Self::reject("a struct"))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> MapperResult<Self::SerializeStructVariant> {
        Err(Self::reject("a struct variant"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bson::{DateTime, doc, oid::ObjectId};
    use pretty_assertions::assert_eq;
    use serde::Serialize;

    use crate::mapper::Mapper;

    #[derive(Serialize)]
    enum Shape {
        Point,
        Circle(f64),
        Rect { w: i32, h: i32 },
    }

    #[derive(Serialize)]
    struct Everything {
        small: u8,
        big: u64,
        flag: bool,
        missing: Option<String>,
        shapes: Vec<Shape>,
        tags: BTreeMap<u32, String>,
        id: ObjectId,
        at: DateTime,
        #[serde(with = "crate::codec::object_id")]
        hex: String,
    }

    #[test]
    fn test_serializes_into_native_values() {
        let mapper = Mapper::default();
        let id = ObjectId::new();
        let other = ObjectId::new();

        let value = Everything {
            small: 7,
            big: 1 << 40,
            flag: true,
            missing: None,
            shapes: vec![Shape::Point, Shape::Circle(1.5), Shape::Rect { w: 2, h: 3 }],
            tags: BTreeMap::from([(1, "one".to_string())]),
            id,
            at: DateTime::from_millis(42),
            hex: other.to_hex(),
        };

        assert_eq!(
            mapper.to_document(&value).unwrap(),
            doc! {
                "small": 7,
                "big": 1_i64 << 40,
                "flag": true,
                "missing": null,
                "shapes": ["Point", { "Circle": 1.5 }, { "Rect": { "w": 2, "h": 3 } }],
                "tags": { "1": "one" },
                "id": id,
                "at": DateTime::from_millis(42),
                "hex": other,
            }
        );
    }

    #[test]
    fn test_u64_overflow_is_rejected() {
        let mapper = Mapper::default();

        assert!(mapper.to_bson(&u64::MAX).is_err());
    }

    #[test]
    fn test_unknown_codec_is_a_configuration_error() {
        #[derive(Serialize)]
        struct Odd {
            #[serde(serialize_with = "odd")]
            value: i32,
        }

        fn odd<S: serde::Serializer>(value: &i32, serializer: S) -> Result<S::Ok, S::Error> {
            crate::codec::serialize_with(crate::codec_marker!("nope"), value, serializer)
        }

        let err = Mapper::default().to_document(&Odd { value: 1 }).unwrap_err();
        assert!(matches!(err, crate::error::MapperError::Configuration(_)));
    }
}
