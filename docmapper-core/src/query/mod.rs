//! Deferred query conditions.
//!
//! A [`Query`] records conditions as an ordered tree of [`Condition`]s whose
//! leaf values stay un-serialized until the query is bound to a mapped type
//! and serialized. Binding supplies the [`Mapper`] and the [`Schema`] of the
//! type, so every leaf is encoded through the codec of the field it targets:
//! filtering on a hex-string id field produces a native object id, filtering
//! on a date field produces a native date.
//!
//! # Example
//!
//! ```ignore
//! use docmapper::query::{DbQuery, Query};
//!
//! let query = Query::new()
//!     .is("status", "active")
//!     .greater_than("age", 18)
//!     .or([DbQuery::is("role", "admin"), DbQuery::exists("invited_by")])?;
//! ```
//!
//! Dotted paths accumulate into one nested condition per leading segment and
//! group operators (`$and`, `$or`, `$nor`) accumulate into one list per
//! operator, so calling `or` twice is the same as calling it once with all the
//! sub-queries. Setting the same operator twice on one field keeps the last
//! value, in the position of the first.

use std::{fmt, sync::Arc};

use bson::{Bson, Document, doc};
use indexmap::{IndexMap, map::Entry};
use serde::Serialize;
use tracing::{trace, warn};

use crate::{
    error::{MapperError, MapperResult},
    mapper::Mapper,
    schema::Schema,
};

mod pipeline;
mod serialize;
mod sort;
mod update;

pub use pipeline::{Pipeline, Stage};
pub use sort::{Projection, SortSpec};
pub use update::{DbUpdate, Update, UpdateOperationValue};

pub(crate) use serialize::ConditionWriter;

/// Operators combining whole sub-queries.
pub const GROUP_OPERATORS: &[&str] = &["$and", "$or", "$nor"];

const EQ: &str = "$eq";

pub(crate) fn is_group_operator(key: &str) -> bool {
    GROUP_OPERATORS.contains(&key)
}

/// A value held by a condition until serialization.
pub trait QueryValue: fmt::Debug + Send + Sync {
    /// Serializes the value generically, before any field codec applies.
    ///
    /// # Errors
    ///
    /// Fails when the value's `Serialize` implementation fails.
    fn to_bson(&self, mapper: &Mapper) -> MapperResult<Bson>;
}

impl<T> QueryValue for T
where
    T: Serialize + fmt::Debug + Send + Sync + 'static,
{
    fn to_bson(&self, mapper: &Mapper) -> MapperResult<Bson> {
        mapper.to_bson(self)
    }
}

/// A node of a deferred condition tree.
#[derive(Debug, Clone)]
pub enum Condition {
    /// A single value.
    Simple {
        value: Arc<dyn QueryValue>,
        target_is_collection: bool,
    },
    /// A list of conditions, serialized as an array.
    Collection {
        conditions: Vec<Condition>,
        target_is_collection: bool,
    },
    /// A nested query, serialized as a document.
    Compound {
        query: Query,
        target_is_collection: bool,
    },
}

impl Condition {
    pub fn simple(value: impl QueryValue + 'static) -> Self {
        Condition::Simple {
            value: Arc::new(value),
            target_is_collection: false,
        }
    }

    /// A single value addressed to the elements of a collection field.
    pub fn element(value: impl QueryValue + 'static) -> Self {
        Condition::Simple {
            value: Arc::new(value),
            target_is_collection: true,
        }
    }

    /// A list of values addressed to the elements of a collection field.
    pub fn elements<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: QueryValue + 'static,
    {
        Condition::Collection {
            conditions: values.into_iter().map(Condition::element).collect(),
            target_is_collection: true,
        }
    }

    pub fn nested(query: Query) -> Self {
        Condition::Compound {
            query,
            target_is_collection: false,
        }
    }

    pub fn target_is_collection(&self) -> bool {
        match self {
            Condition::Simple {
                target_is_collection,
                ..
            }
            | Condition::Collection {
                target_is_collection,
                ..
            }
            | Condition::Compound {
                target_is_collection,
                ..
            } => *target_is_collection,
        }
    }

    /// Turns a non-compound condition into `{ $eq: <condition> }`.
    fn make_compound(&mut self) {
        if matches!(self, Condition::Compound { .. }) {
            return;
        }

        let previous = std::mem::replace(self, Condition::nested(Query::new()));
        let mut query = Query::new();
        query.conditions.insert(EQ.to_owned(), previous);
        *self = Condition::nested(query);
    }

    fn compound_mut(&mut self) -> MapperResult<&mut Query> {
        self.make_compound();
        match self {
            Condition::Compound { query, .. } => Ok(query),
            _ => Err(MapperError::IllegalState("expected a nested condition".into())),
        }
    }
}

/// The mapper and schema a query is serialized against.
#[derive(Debug, Clone)]
pub struct SchemaBinding {
    mapper: Arc<Mapper>,
    schema: Arc<Schema>,
}

impl SchemaBinding {
    pub fn new(mapper: Arc<Mapper>, schema: Arc<Schema>) -> Self {
        Self { mapper, schema }
    }

    pub fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Whether both bindings share the same mapper and schema instances.
    pub fn same_as(&self, other: &SchemaBinding) -> bool {
        Arc::ptr_eq(&self.mapper, &other.mapper) && Arc::ptr_eq(&self.schema, &other.schema)
    }
}

/// A deferred query.
#[derive(Debug, Clone, Default)]
pub struct Query {
    conditions: IndexMap<String, Condition>,
    binding: Option<SchemaBinding>,
    invalid: Option<String>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Condition> {
        self.conditions.get(key)
    }

    pub fn conditions(&self) -> impl Iterator<Item = (&str, &Condition)> {
        self.conditions.iter().map(|(key, condition)| (key.as_str(), condition))
    }

    /// Sets `field` equal to `value`.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::Configuration`] if `field` is a group operator.
    pub fn put(&mut self, field: &str, value: impl QueryValue + 'static) -> MapperResult<()> {
        self.place(field, None, Condition::simple(value))
    }

    /// Applies `operator` with `value` to `field`.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::Configuration`] if `field` is a group operator.
    pub fn put_op(
        &mut self,
        field: &str,
        operator: &str,
        value: impl QueryValue + 'static,
    ) -> MapperResult<()> {
        self.place(field, Some(operator), Condition::simple(value))
    }

    /// Applies `operator` with an already built condition to `field`.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::Configuration`] if `field` is a group operator.
    pub fn put_condition(
        &mut self,
        field: &str,
        operator: Option<&str>,
        condition: Condition,
    ) -> MapperResult<()> {
        self.place(field, operator, condition)
    }

    /// Adds sub-queries to the group `operator`.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::Configuration`] if `operator` is not a group
    /// operator or its key already holds something other than a group.
    pub fn put_group<I>(&mut self, operator: &str, queries: I) -> MapperResult<()>
    where
        I: IntoIterator<Item = Query>,
    {
        if !is_group_operator(operator) {
            return Err(MapperError::Configuration(format!(
                "'{operator}' is not a group operator"
            )));
        }

        self.extend_group(operator, queries.into_iter().map(Condition::nested).collect())
    }

    fn extend_group(&mut self, operator: &str, queries: Vec<Condition>) -> MapperResult<()> {
        match self.conditions.entry(operator.to_owned()) {
            Entry::Occupied(mut entry) => match entry.get_mut() {
                Condition::Collection { conditions, .. } => {
                    conditions.extend(queries);
                    Ok(())
                }
                _ => Err(MapperError::Configuration(format!(
                    "'{operator}' already holds a condition that is not a group"
                ))),
            },
            Entry::Vacant(entry) => {
                entry.insert(Condition::Collection {
                    conditions: queries,
                    target_is_collection: false,
                });
                Ok(())
            }
        }
    }

    fn place(&mut self, field: &str, operator: Option<&str>, condition: Condition) -> MapperResult<()> {
        if is_group_operator(field) {
            return Err(MapperError::Configuration(format!(
                "'{field}' is a group operator and takes sub-queries"
            )));
        }

        if !field.starts_with('$') {
            if let Some((head, rest)) = field.split_once('.') {
                let nested = self
                    .conditions
                    .entry(head.to_owned())
                    .or_insert_with(|| Condition::nested(Query::new()))
                    .compound_mut()?;
                return nested.place(rest, operator, condition);
            }
        }

        match operator {
            None => match self.conditions.get_mut(field) {
                Some(Condition::Compound { query, .. }) => {
                    query.conditions.insert(EQ.to_owned(), condition);
                }
                _ => {
                    self.conditions.insert(field.to_owned(), condition);
                }
            },
            Some(operator) => {
                let entry = self
                    .conditions
                    .entry(field.to_owned())
                    .or_insert_with(|| Condition::nested(Query::new()));
                entry
                    .compound_mut()?
                    .conditions
                    .insert(operator.to_owned(), condition);
            }
        }

        Ok(())
    }

    /// Records a failed fluent call; the error surfaces on serialization.
    fn record(mut self, result: MapperResult<()>) -> Self {
        if let Err(err) = result {
            warn!(error = %err, "invalid query condition");
            self.invalid.get_or_insert_with(|| err.to_string());
        }
        self
    }

    fn with_op(mut self, field: &str, operator: &str, condition: Condition) -> Self {
        let result = self.place(field, Some(operator), condition);
        self.record(result)
    }

    /// Merges the conditions of `other` into this query.
    ///
    /// Groups are extended and nested conditions merged key by key; any other
    /// condition of `other` replaces the one under the same key.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::Configuration`] when a group key holds an
    /// incompatible condition on either side.
    pub fn merge(&mut self, other: Query) -> MapperResult<()> {
        if let Some(invalid) = other.invalid {
            self.invalid.get_or_insert(invalid);
        }

        for (key, condition) in other.conditions {
            if is_group_operator(&key) {
                let Condition::Collection { conditions, .. } = condition else {
                    return Err(MapperError::Configuration(format!(
                        "'{key}' holds a condition that is not a group"
                    )));
                };
                self.extend_group(&key, conditions)?;
                continue;
            }

            let mergeable = matches!(
                (self.conditions.get(&key), &condition),
                (Some(Condition::Compound { .. }), Condition::Compound { .. })
            );

            if mergeable {
                if let (Some(Condition::Compound { query: mine, .. }), Condition::Compound { query: theirs, .. }) =
                    (self.conditions.get_mut(&key), condition)
                {
                    mine.merge(theirs)?;
                }
            } else {
                self.conditions.insert(key, condition);
            }
        }

        Ok(())
    }

    /// Binds the query to the mapper and schema it is serialized against.
    ///
    /// Binding again to the same mapper and schema is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::IllegalState`] if the query is already bound to a
    /// different mapper or schema.
    pub fn initialize(&mut self, binding: SchemaBinding) -> MapperResult<()> {
        match &self.binding {
            Some(current) if current.same_as(&binding) => Ok(()),
            Some(_) => {
                warn!("query is already bound to another schema");
                Err(MapperError::IllegalState(
                    "query is already bound to another schema".into(),
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

    /// Serializes the query into a native filter document.
    ///
    /// Serialization reads the condition tree only; calling it again yields an
    /// equal document.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::IllegalState`] before [`Query::initialize`], the
    /// first error recorded by a fluent call, or a codec failure wrapped with the
    /// offending field path.
    pub fn serialize(&self) -> MapperResult<Document> {
        let binding = self
            .binding
            .as_ref()
            .ok_or_else(|| MapperError::IllegalState("query is not bound to a schema".into()))?;

        if let Some(invalid) = &self.invalid {
            return Err(MapperError::Configuration(invalid.clone()));
        }

        let filter = ConditionWriter::new(binding.mapper(), binding.schema()).query(self, None)?;
        trace!(%filter, "serialized query");
        Ok(filter)
    }

    /// `field == value`.
    pub fn is(mut self, field: &str, value: impl QueryValue + 'static) -> Self {
        let result = self.put(field, value);
        self.record(result)
    }

    pub fn not_equals(self, field: &str, value: impl QueryValue + 'static) -> Self {
        self.with_op(field, "$ne", Condition::simple(value))
    }

    pub fn greater_than(self, field: &str, value: impl QueryValue + 'static) -> Self {
        self.with_op(field, "$gt", Condition::simple(value))
    }

    pub fn greater_than_equals(self, field: &str, value: impl QueryValue + 'static) -> Self {
        self.with_op(field, "$gte", Condition::simple(value))
    }

    pub fn less_than(self, field: &str, value: impl QueryValue + 'static) -> Self {
        self.with_op(field, "$lt", Condition::simple(value))
    }

    pub fn less_than_equals(self, field: &str, value: impl QueryValue + 'static) -> Self {
        self.with_op(field, "$lte", Condition::simple(value))
    }

    /// `field` equals one of `values`.
    pub fn is_in<I, V>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: QueryValue + 'static,
    {
        self.with_op(field, "$in", Condition::elements(values))
    }

    pub fn not_in<I, V>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: QueryValue + 'static,
    {
        self.with_op(field, "$nin", Condition::elements(values))
    }

    /// The collection `field` contains all of `values`.
    pub fn all<I, V>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: QueryValue + 'static,
    {
        self.with_op(field, "$all", Condition::elements(values))
    }

    pub fn size(self, field: &str, size: i64) -> Self {
        self.with_op(field, "$size", Condition::simple(size))
    }

    pub fn exists(self, field: &str) -> Self {
        self.with_op(field, "$exists", Condition::simple(true))
    }

    pub fn not_exists(self, field: &str) -> Self {
        self.with_op(field, "$exists", Condition::simple(false))
    }

    /// `field % divisor == remainder`.
    pub fn modulo(self, field: &str, divisor: i64, remainder: i64) -> Self {
        self.with_op(field, "$mod", Condition::simple(vec![divisor, remainder]))
    }

    pub fn regex(self, field: &str, pattern: impl Into<String>) -> Self {
        self.with_op(field, "$regex", Condition::simple(pattern.into()))
    }

    pub fn regex_with_options(
        self,
        field: &str,
        pattern: impl Into<String>,
        options: impl Into<String>,
    ) -> Self {
        self.with_op(field, "$regex", Condition::simple(pattern.into()))
            .with_op(field, "$options", Condition::simple(options.into()))
    }

    /// An element of the collection `field` matches `query`.
    ///
    /// Keys of `query` are relative to the element.
    pub fn elem_match(self, field: &str, query: Query) -> Self {
        self.with_op(
            field,
            "$elemMatch",
            Condition::Compound {
                query,
                target_is_collection: true,
            },
        )
    }

    /// `field` does not match the operator expression `query`.
    ///
    /// ```ignore
    /// Query::new().not("age", DbQuery::operator("$gt", 30));
    /// ```
    pub fn not(self, field: &str, query: Query) -> Self {
        self.with_op(field, "$not", Condition::nested(query))
    }

    /// A bare operator entry, such as `$comment` or an operator inside `not`.
    pub fn operator(mut self, operator: &str, value: impl QueryValue + 'static) -> Self {
        let result = if operator.starts_with('$') {
            self.put(operator, value)
        } else {
            Err(MapperError::Configuration(format!(
                "'{operator}' is not an operator"
            )))
        };
        self.record(result)
    }

    /// A server-side JavaScript predicate.
    pub fn where_js(self, code: impl Into<String>) -> Self {
        self.operator("$where", code.into())
    }

    /// A full text search.
    pub fn text(self, search: impl Into<String>) -> Self {
        self.operator("$text", doc! { "$search": search.into() })
    }

    /// Adds `queries` to this query's `$or` group.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::Configuration`] if `$or` already holds something
    /// other than a group.
    pub fn or<I>(mut self, queries: I) -> MapperResult<Self>
    where
        I: IntoIterator<Item = Query>,
    {
        self.put_group("$or", queries)?;
        Ok(self)
    }

    /// Adds `queries` to this query's `$and` group.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::Configuration`] if `$and` already holds something
    /// other than a group.
    pub fn and<I>(mut self, queries: I) -> MapperResult<Self>
    where
        I: IntoIterator<Item = Query>,
    {
        self.put_group("$and", queries)?;
        Ok(self)
    }

    /// Adds `queries` to this query's `$nor` group.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::Configuration`] if `$nor` already holds something
    /// other than a group.
    pub fn nor<I>(mut self, queries: I) -> MapperResult<Self>
    where
        I: IntoIterator<Item = Query>,
    {
        self.put_group("$nor", queries)?;
        Ok(self)
    }
}

/// Static constructors for single-condition queries.
pub struct DbQuery;

impl DbQuery {
    pub fn empty() -> Query {
        Query::new()
    }

    pub fn is(field: &str, value: impl QueryValue + 'static) -> Query {
        Query::new().is(field, value)
    }

    pub fn not_equals(field: &str, value: impl QueryValue + 'static) -> Query {
        Query::new().not_equals(field, value)
    }

    pub fn greater_than(field: &str, value: impl QueryValue + 'static) -> Query {
        Query::new().greater_than(field, value)
    }

    pub fn greater_than_equals(field: &str, value: impl QueryValue + 'static) -> Query {
        Query::new().greater_than_equals(field, value)
    }

    pub fn less_than(field: &str, value: impl QueryValue + 'static) -> Query {
        Query::new().less_than(field, value)
    }

    pub fn less_than_equals(field: &str, value: impl QueryValue + 'static) -> Query {
        Query::new().less_than_equals(field, value)
    }

    pub fn is_in<I, V>(field: &str, values: I) -> Query
    where
        I: IntoIterator<Item = V>,
        V: QueryValue + 'static,
    {
        Query::new().is_in(field, values)
    }

    pub fn not_in<I, V>(field: &str, values: I) -> Query
    where
        I: IntoIterator<Item = V>,
        V: QueryValue + 'static,
    {
        Query::new().not_in(field, values)
    }

    pub fn all<I, V>(field: &str, values: I) -> Query
    where
        I: IntoIterator<Item = V>,
        V: QueryValue + 'static,
    {
        Query::new().all(field, values)
    }

    pub fn size(field: &str, size: i64) -> Query {
        Query::new().size(field, size)
    }

    pub fn exists(field: &str) -> Query {
        Query::new().exists(field)
    }

    pub fn not_exists(field: &str) -> Query {
        Query::new().not_exists(field)
    }

    pub fn modulo(field: &str, divisor: i64, remainder: i64) -> Query {
        Query::new().modulo(field, divisor, remainder)
    }

    pub fn regex(field: &str, pattern: impl Into<String>) -> Query {
        Query::new().regex(field, pattern)
    }

    pub fn regex_with_options(
        field: &str,
        pattern: impl Into<String>,
        options: impl Into<String>,
    ) -> Query {
        Query::new().regex_with_options(field, pattern, options)
    }

    pub fn elem_match(field: &str, query: Query) -> Query {
        Query::new().elem_match(field, query)
    }

    pub fn not(field: &str, query: Query) -> Query {
        Query::new().not(field, query)
    }

    pub fn operator(operator: &str, value: impl QueryValue + 'static) -> Query {
        Query::new().operator(operator, value)
    }

    pub fn where_js(code: impl Into<String>) -> Query {
        Query::new().where_js(code)
    }

    pub fn text(search: impl Into<String>) -> Query {
        Query::new().text(search)
    }

    /// # Errors
    ///
    /// Never fails for a fresh query; the signature matches [`Query::or`].
    pub fn or<I>(queries: I) -> MapperResult<Query>
    where
        I: IntoIterator<Item = Query>,
    {
        Query::new().or(queries)
    }

    /// # Errors
    ///
    /// Never fails for a fresh query; the signature matches [`Query::and`].
    pub fn and<I>(queries: I) -> MapperResult<Query>
    where
        I: IntoIterator<Item = Query>,
    {
        Query::new().and(queries)
    }

    /// # Errors
    ///
    /// Never fails for a fresh query; the signature matches [`Query::nor`].
    pub fn nor<I>(queries: I) -> MapperResult<Query>
    where
        I: IntoIterator<Item = Query>,
    {
        Query::new().nor(queries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec, schema::FieldSchema};
    use bson::oid::ObjectId;
    use pretty_assertions::assert_eq;

    fn bind(query: &mut Query, schema: Schema) {
        let binding = SchemaBinding::new(Arc::new(Mapper::default()), Arc::new(schema));
        query.initialize(binding).unwrap();
    }

    fn serialize(mut query: Query, schema: Schema) -> Document {
        bind(&mut query, schema);
        query.serialize().unwrap()
    }

    fn id_schema() -> Schema {
        Schema::builder()
            .id(FieldSchema::new().codec(codec::object_id::MARKER))
            .field(
                "refs",
                FieldSchema::new()
                    .collection()
                    .codec(codec::object_id::MARKER),
            )
            .field(
                "child",
                FieldSchema::new().nested(
                    Schema::builder()
                        .field("owner", FieldSchema::new().codec(codec::object_id::MARKER))
                        .build(),
                ),
            )
            .build()
    }

    #[test]
    fn test_and_of_comparisons() {
        let query = DbQuery::and([DbQuery::greater_than("n", 5), DbQuery::less_than("n", 11)]).unwrap();

        assert_eq!(
            serialize(query, Schema::default()),
            doc! { "$and": [{ "n": { "$gt": 5 } }, { "n": { "$lt": 11 } }] }
        );
    }

    #[test]
    fn test_groups_accumulate() {
        let chained = Query::new()
            .or([DbQuery::is("a", 1)])
            .unwrap()
            .or([DbQuery::is("b", 2)])
            .unwrap();
        let once = DbQuery::or([DbQuery::is("a", 1), DbQuery::is("b", 2)]).unwrap();

        let chained = serialize(chained, Schema::default());
        assert_eq!(chained, serialize(once, Schema::default()));
        assert_eq!(chained, doc! { "$or": [{ "a": 1 }, { "b": 2 }] });
    }

    #[test]
    fn test_nested_paths_accumulate() {
        let query = Query::new().is("child.simple", 1).is("child.other", "x");

        let Some(Condition::Compound { query: nested, .. }) = query.get("child") else {
            panic!("expected one compound condition under 'child'");
        };
        assert_eq!(nested.conditions().count(), 2);
        assert_eq!(query.conditions().count(), 1);

        assert_eq!(
            serialize(query, Schema::default()),
            doc! { "child.simple": 1, "child.other": "x" }
        );
    }

    #[test]
    fn test_group_over_other_condition_is_rejected() {
        let mut query = Query::new();

        assert!(matches!(
            query.put("$or", 1),
            Err(MapperError::Configuration(_))
        ));
        assert!(matches!(
            query.put_group("$gt", [Query::new()]),
            Err(MapperError::Configuration(_))
        ));

        let mut merged = Query::new();
        merged.conditions.insert("$or".into(), Condition::simple(1));
        assert!(matches!(
            merged.put_group("$or", [Query::new()]),
            Err(MapperError::Configuration(_))
        ));
    }

    #[test]
    fn test_operators_apply_field_codecs() {
        let first = ObjectId::new();
        let second = ObjectId::new();
        let query = Query::new()
            .is("_id", first.to_hex())
            .is_in("refs", [first.to_hex(), second.to_hex()])
            .is("child.owner", second.to_hex())
            .exists("child");

        assert_eq!(
            serialize(query, id_schema()),
            doc! {
                "_id": first,
                "refs": { "$in": [first, second] },
                "child": { "$exists": true },
                "child.owner": second,
            }
        );
    }

    #[test]
    fn test_last_write_wins_per_operator() {
        let query = Query::new()
            .modulo("n", 3, 1)
            .greater_than("n", 1)
            .modulo("n", 5, 0);

        assert_eq!(
            serialize(query, Schema::default()),
            doc! { "n": { "$mod": [5_i64, 0_i64], "$gt": 1 } }
        );
    }

    #[test]
    fn test_equality_then_operator_becomes_eq() {
        let query = Query::new().is("n", 3).less_than("n", 10);

        assert_eq!(
            serialize(query, Schema::default()),
            doc! { "n": { "$eq": 3, "$lt": 10 } }
        );
    }

    #[test]
    fn test_elem_match_uses_element_context() {
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
        let query = DbQuery::elem_match(
            "items",
            Query::new().is("owner", owner.to_hex()).greater_than("qty", 2),
        );

        assert_eq!(
            serialize(query, schema),
            doc! { "items": { "$elemMatch": { "owner": owner, "qty": { "$gt": 2 } } } }
        );
    }

    #[test]
    fn test_not_and_generic_operators() {
        let query = Query::new()
            .not("age", DbQuery::operator("$gt", 30))
            .regex_with_options("name", "^a", "i")
            .size("tags", 2)
            .text("coffee")
            .where_js("this.a > 1");

        assert_eq!(
            serialize(query, Schema::default()),
            doc! {
                "age": { "$not": { "$gt": 30 } },
                "name": { "$regex": "^a", "$options": "i" },
                "tags": { "$size": 2_i64 },
                "$text": { "$search": "coffee" },
                "$where": "this.a > 1",
            }
        );
    }

    #[test]
    fn test_codec_errors_carry_the_field_path() {
        let mut query = DbQuery::is("child.owner", "nope");
        bind(&mut query, id_schema());

        let err = query.serialize().unwrap_err();
        assert!(matches!(err, MapperError::Field { ref path, .. } if path == "child.owner"));
    }

    #[test]
    fn test_binding_rules() {
        let mapper = Arc::new(Mapper::default());
        let schema = Arc::new(Schema::default());
        let binding = SchemaBinding::new(mapper.clone(), schema);
        let mut query = DbQuery::is("a", 1);

        assert!(matches!(query.serialize(), Err(MapperError::IllegalState(_))));

        query.initialize(binding.clone()).unwrap();
        query.initialize(binding).unwrap();
        assert!(matches!(
            query.initialize(SchemaBinding::new(mapper, Arc::new(Schema::default()))),
            Err(MapperError::IllegalState(_))
        ));

        assert_eq!(query.serialize().unwrap(), query.serialize().unwrap());
    }

    #[test]
    fn test_fluent_errors_surface_on_serialize() {
        let mut query = Query::new().is("$and", 1);
        bind(&mut query, Schema::default());

        assert!(matches!(query.serialize(), Err(MapperError::Configuration(_))));
    }

    #[test]
    fn test_merge_extends_groups_and_nested_conditions() {
        let mut query = Query::new()
            .greater_than("n", 1)
            .or([DbQuery::is("a", 1)])
            .unwrap();
        query
            .merge(
                Query::new()
                    .less_than("n", 9)
                    .or([DbQuery::is("b", 2)])
                    .unwrap(),
            )
            .unwrap();

        assert_eq!(
            serialize(query, Schema::default()),
            doc! { "n": { "$gt": 1, "$lt": 9 }, "$or": [{ "a": 1 }, { "b": 2 }] }
        );
    }
}
