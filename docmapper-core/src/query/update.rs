//! Deferred update documents.
//!
//! An [`Update`] maps modifiers (`$set`, `$inc`, `$push`, ...) to the fields
//! they touch. Each value remembers whether it is a field value, which goes
//! through the field's codec, or an operand of its own (`$inc` amounts, the
//! `$unset` sentinel, `$rename` targets), which is written as-is.

use bson::{Bson, Document};
use indexmap::IndexMap;
use tracing::{trace, warn};

use super::{Condition, ConditionWriter, Query, QueryValue, SchemaBinding};
use crate::error::{MapperError, MapperResult};

/// The value of one modifier on one field.
#[derive(Debug, Clone)]
pub struct UpdateOperationValue {
    pub value: Condition,
    /// Whether the value is written through the field's codec.
    pub requires_codec: bool,
}

/// A deferred update.
#[derive(Debug, Clone, Default)]
pub struct Update {
    operations: IndexMap<String, IndexMap<String, UpdateOperationValue>>,
    binding: Option<SchemaBinding>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// The operation of `modifier` on `field`.
    pub fn get(&self, modifier: &str, field: &str) -> Option<&UpdateOperationValue> {
        self.operations.get(modifier)?.get(field)
    }

    /// Adds a raw modifier operation.
    ///
    /// A later operation of the same modifier on the same field replaces the
    /// earlier one.
    pub fn add_operation(
        self,
        modifier: &str,
        field: &str,
        value: impl QueryValue + 'static,
        requires_codec: bool,
    ) -> Self {
        self.add(modifier, field, Condition::simple(value), requires_codec)
    }

    fn add(mut self, modifier: &str, field: &str, value: Condition, requires_codec: bool) -> Self {
        self.operations
            .entry(modifier.to_owned())
            .or_default()
            .insert(field.to_owned(), UpdateOperationValue { value, requires_codec });
        self
    }

    pub fn set(self, field: &str, value: impl QueryValue + 'static) -> Self {
        self.add("$set", field, Condition::simple(value), true)
    }

    pub fn set_on_insert(self, field: &str, value: impl QueryValue + 'static) -> Self {
        self.add("$setOnInsert", field, Condition::simple(value), true)
    }

    pub fn unset(self, field: &str) -> Self {
        self.add("$unset", field, Condition::simple(1), false)
    }

    pub fn inc(self, field: &str, amount: impl QueryValue + 'static) -> Self {
        self.add("$inc", field, Condition::simple(amount), false)
    }

    pub fn mul(self, field: &str, factor: impl QueryValue + 'static) -> Self {
        self.add("$mul", field, Condition::simple(factor), false)
    }

    pub fn min(self, field: &str, value: impl QueryValue + 'static) -> Self {
        self.add("$min", field, Condition::simple(value), true)
    }

    pub fn max(self, field: &str, value: impl QueryValue + 'static) -> Self {
        self.add("$max", field, Condition::simple(value), true)
    }

    pub fn rename(self, field: &str, new_name: impl Into<String>) -> Self {
        self.add("$rename", field, Condition::simple(new_name.into()), false)
    }

    /// Appends one element to the collection `field`.
    pub fn push(self, field: &str, value: impl QueryValue + 'static) -> Self {
        self.add("$push", field, Condition::element(value), true)
    }

    /// Appends every element of `values` to the collection `field`.
    pub fn push_all<I, V>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: QueryValue + 'static,
    {
        self.add("$push", field, each(values), true)
    }

    pub fn add_to_set(self, field: &str, value: impl QueryValue + 'static) -> Self {
        self.add("$addToSet", field, Condition::element(value), true)
    }

    pub fn add_to_set_all<I, V>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: QueryValue + 'static,
    {
        self.add("$addToSet", field, each(values), true)
    }

    /// Removes the elements equal to `value` from the collection `field`.
    pub fn pull(self, field: &str, value: impl QueryValue + 'static) -> Self {
        self.add("$pull", field, Condition::element(value), true)
    }

    /// Removes the elements matching `query` from the collection `field`.
    ///
    /// Keys of `query` are relative to the element.
    pub fn pull_where(self, field: &str, query: Query) -> Self {
        self.add(
            "$pull",
            field,
            Condition::Compound {
                query,
                target_is_collection: true,
            },
            true,
        )
    }

    pub fn pull_all<I, V>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: QueryValue + 'static,
    {
        self.add("$pullAll", field, Condition::elements(values), true)
    }

    pub fn pop_first(self, field: &str) -> Self {
        self.add("$pop", field, Condition::simple(-1), false)
    }

    pub fn pop_last(self, field: &str) -> Self {
        self.add("$pop", field, Condition::simple(1), false)
    }

    pub fn bit_and(self, field: &str, value: i64) -> Self {
        self.bit(field, "and", value)
    }

    pub fn bit_or(self, field: &str, value: i64) -> Self {
        self.bit(field, "or", value)
    }

    pub fn bit_xor(self, field: &str, value: i64) -> Self {
        self.bit(field, "xor", value)
    }

    fn bit(mut self, field: &str, operation: &str, value: i64) -> Self {
        let fields = self.operations.entry("$bit".to_owned()).or_default();

        match fields.get_mut(field) {
            Some(UpdateOperationValue {
                value: Condition::Compound { query, .. },
                ..
            }) => {
                query
                    .conditions
                    .insert(operation.to_owned(), Condition::simple(value));
            }
            _ => {
                let mut query = Query::new();
                query
                    .conditions
                    .insert(operation.to_owned(), Condition::simple(value));
                fields.insert(
                    field.to_owned(),
                    UpdateOperationValue {
                        value: Condition::nested(query),
                        requires_codec: false,
                    },
                );
            }
        }

        self
    }

    /// Sets `field` to the current date.
    pub fn current_date(self, field: &str) -> Self {
        self.add("$currentDate", field, Condition::simple(true), false)
    }

    /// Binds the update to the mapper and schema it is serialized against.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::IllegalState`] if the update is already bound to
    /// a different mapper or schema.
    pub fn initialize(&mut self, binding: SchemaBinding) -> MapperResult<()> {
        match &self.binding {
            Some(current) if current.same_as(&binding) => Ok(()),
            Some(_) => {
                warn!("update is already bound to another schema");
                Err(MapperError::IllegalState(
                    "update is already bound to another schema".into(),
                ))
            }
            None => {
                self.binding = Some(binding);
                Ok(())
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.binding.is_some()
    }

    /// Serializes the update into a native update document.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::IllegalState`] before [`Update::initialize`], or a
    /// codec failure wrapped with the offending field path.
    pub fn serialize(&self) -> MapperResult<Document> {
        let binding = self
            .binding
            .as_ref()
            .ok_or_else(|| MapperError::IllegalState("update is not bound to a schema".into()))?;
        let writer = ConditionWriter::new(binding.mapper(), binding.schema());

        let mut update = Document::new();
        for (modifier, fields) in &self.operations {
            let mut values = Document::new();
            for (field, operation) in fields {
                let value = if operation.requires_codec {
                    writer.leaf(field, &operation.value)?
                } else {
                    writer.generic(&operation.value)?
                };
                values.insert(field.as_str(), value);
            }
            update.insert(modifier.as_str(), Bson::Document(values));
        }

        trace!(%update, "serialized update");
        Ok(update)
    }
}

fn each<I, V>(values: I) -> Condition
where
    I: IntoIterator<Item = V>,
    V: QueryValue + 'static,
{
    let mut query = Query::new();
    query
        .conditions
        .insert("$each".to_owned(), Condition::elements(values));
    Condition::Compound {
        query,
        target_is_collection: true,
    }
}

/// Static constructors for single-operation updates.
pub struct DbUpdate;

impl DbUpdate {
    pub fn set(field: &str, value: impl QueryValue + 'static) -> Update {
        Update::new().set(field, value)
    }

    pub fn set_on_insert(field: &str, value: impl QueryValue + 'static) -> Update {
        Update::new().set_on_insert(field, value)
    }

    pub fn unset(field: &str) -> Update {
        Update::new().unset(field)
    }

    pub fn inc(field: &str, amount: impl QueryValue + 'static) -> Update {
        Update::new().inc(field, amount)
    }

    pub fn mul(field: &str, factor: impl QueryValue + 'static) -> Update {
        Update::new().mul(field, factor)
    }

    pub fn min(field: &str, value: impl QueryValue + 'static) -> Update {
        Update::new().min(field, value)
    }

    pub fn max(field: &str, value: impl QueryValue + 'static) -> Update {
        Update::new().max(field, value)
    }

    pub fn rename(field: &str, new_name: impl Into<String>) -> Update {
        Update::new().rename(field, new_name)
    }

    pub fn push(field: &str, value: impl QueryValue + 'static) -> Update {
        Update::new().push(field, value)
    }

    pub fn push_all<I, V>(field: &str, values: I) -> Update
    where
        I: IntoIterator<Item = V>,
        V: QueryValue + 'static,
    {
        Update::new().push_all(field, values)
    }

    pub fn add_to_set(field: &str, value: impl QueryValue + 'static) -> Update {
        Update::new().add_to_set(field, value)
    }

    pub fn add_to_set_all<I, V>(field: &str, values: I) -> Update
    where
        I: IntoIterator<Item = V>,
        V: QueryValue + 'static,
    {
        Update::new().add_to_set_all(field, values)
    }

    pub fn pull(field: &str, value: impl QueryValue + 'static) -> Update {
        Update::new().pull(field, value)
    }

    pub fn pull_where(field: &str, query: Query) -> Update {
        Update::new().pull_where(field, query)
    }

    pub fn pull_all<I, V>(field: &str, values: I) -> Update
    where
        I: IntoIterator<Item = V>,
        V: QueryValue + 'static,
    {
        Update::new().pull_all(field, values)
    }

    pub fn pop_first(field: &str) -> Update {
        Update::new().pop_first(field)
    }

    pub fn pop_last(field: &str) -> Update {
        Update::new().pop_last(field)
    }

    pub fn bit_and(field: &str, value: i64) -> Update {
        Update::new().bit_and(field, value)
    }

    pub fn bit_or(field: &str, value: i64) -> Update {
        Update::new().bit_or(field, value)
    }

    pub fn bit_xor(field: &str, value: i64) -> Update {
        Update::new().bit_xor(field, value)
    }

    pub fn current_date(field: &str) -> Update {
        Update::new().current_date(field)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        codec::{self, CodecContext, FieldCodec},
        mapper::{CodecRegistry, Mapper, Module},
        query::DbQuery,
        schema::{FieldSchema, Schema},
    };
    use bson::{doc, oid::ObjectId};
    use pretty_assertions::assert_eq;

    #[derive(Debug)]
    struct FooToBar;

    impl FieldCodec for FooToBar {
        fn name(&self) -> &'static str {
            "foo_to_bar"
        }

        fn to_native(&self, value: Bson, _context: &CodecContext) -> MapperResult<Bson> {
            match value {
                Bson::String(text) if text == "foo" => Ok(Bson::String("bar".into())),
                other => Ok(other),
            }
        }

        fn from_native(&self, value: &Bson, _context: &CodecContext) -> MapperResult<Bson> {
            match value {
                Bson::String(text) if text == "bar" => Ok(Bson::String("foo".into())),
                other => Ok(other.clone()),
            }
        }
    }

    struct FooModule;

    impl Module for FooModule {
        fn name(&self) -> &str {
            "foo"
        }

        fn setup(&self, registry: &mut CodecRegistry) {
            registry.register(FooToBar);
        }
    }

    fn serialize(mut update: Update, mapper: Mapper, schema: Schema) -> Document {
        update
            .initialize(SchemaBinding::new(Arc::new(mapper), Arc::new(schema)))
            .unwrap();
        update.serialize().unwrap()
    }

    #[test]
    fn test_codecs_follow_modifier_semantics() {
        let mapper = Mapper::builder().module(FooModule).build();
        let schema = Schema::builder()
            .field(
                "word",
                FieldSchema::new().codec(crate::codec_marker!("foo_to_bar")),
            )
            .build();
        let update = DbUpdate::set("word", "foo").unset("word");

        assert_eq!(
            serialize(update, mapper, schema),
            doc! { "$set": { "word": "bar" }, "$unset": { "word": 1 } }
        );
    }

    #[test]
    fn test_element_operations_encode_each_element() {
        let first = ObjectId::new();
        let second = ObjectId::new();
        let schema = Schema::builder()
            .field(
                "refs",
                FieldSchema::new()
                    .collection()
                    .codec(codec::object_id::MARKER),
            )
            .build();
        let update = Update::new()
            .push_all("refs", [first.to_hex(), second.to_hex()])
            .pull_all("stale", [1, 2])
            .add_to_set("tags", "new")
            .inc("count", 1);

        assert_eq!(
            serialize(update, Mapper::default(), schema.clone()),
            doc! {
                "$push": { "refs": { "$each": [first, second] } },
                "$pullAll": { "stale": [1, 2] },
                "$addToSet": { "tags": "new" },
                "$inc": { "count": 1 },
            }
        );

        let pushed = serialize(DbUpdate::push("refs", first.to_hex()), Mapper::default(), schema);
        assert_eq!(pushed, doc! { "$push": { "refs": first } });
    }

    #[test]
    fn test_pull_where_uses_element_context() {
        let owner = ObjectId::new();
        let schema = Schema::builder()
            .field(
                "items",
                FieldSchema::new().collection().nested(
                    Schema::builder()
                        .field("owner", FieldSchema::new().codec(codec::object_id::MARKER))
                        .build(),
                ),
            )
            .build();
        let update = DbUpdate::pull_where("items", DbQuery::is("owner", owner.to_hex()));

        assert_eq!(
            serialize(update, Mapper::default(), schema),
            doc! { "$pull": { "items": { "owner": owner } } }
        );
    }

    #[test]
    fn test_bitwise_operations_merge_per_field() {
        let update = DbUpdate::bit_and("flags", 12).bit_or("flags", 1).pop_first("queue");

        assert_eq!(
            serialize(update, Mapper::default(), Schema::default()),
            doc! {
                "$bit": { "flags": { "and": 12_i64, "or": 1_i64 } },
                "$pop": { "queue": -1 },
            }
        );
    }

    #[test]
    fn test_unbound_update_cannot_serialize() {
        assert!(matches!(
            DbUpdate::current_date("at").serialize(),
            Err(MapperError::IllegalState(_))
        ));
    }
}
