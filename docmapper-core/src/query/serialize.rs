//! Serialization of deferred condition trees against a schema.

use bson::{Bson, Document};

use super::{Condition, Query, is_group_operator};
use crate::{
    codec::CodecShape,
    error::{MapperError, MapperResult},
    mapper::Mapper,
    schema::Schema,
};

/// Operators whose value has the type of the field they apply to.
const FIELD_VALUE_OPERATORS: &[&str] = &[
    "$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$all", "$each",
];

const ELEM_MATCH: &str = "$elemMatch";
const NOT: &str = "$not";

/// Writes condition trees as native documents.
pub(crate) struct ConditionWriter<'a> {
    mapper: &'a Mapper,
    schema: &'a Schema,
}

impl<'a> ConditionWriter<'a> {
    pub(crate) fn new(mapper: &'a Mapper, schema: &'a Schema) -> Self {
        Self { mapper, schema }
    }

    /// Writes a query.
    ///
    /// With a `context`, field keys are relative to the field `context` and
    /// operator keys apply to that field itself.
    pub(crate) fn query(&self, query: &Query, context: Option<&str>) -> MapperResult<Document> {
        let mut out = Document::new();

        for (key, condition) in query.conditions() {
            if is_group_operator(key) {
                out.insert(key, self.group(key, condition, context)?);
            } else if key.starts_with('$') {
                let value = match context {
                    Some(field) => self.operator(field, key, condition)?,
                    None => self.generic(condition)?,
                };
                out.insert(key, value);
            } else {
                let path = join(context, key);
                self.field(&mut out, key.to_owned(), &path, condition)?;
            }
        }

        Ok(out)
    }

    fn group(&self, operator: &str, condition: &Condition, context: Option<&str>) -> MapperResult<Bson> {
        let Condition::Collection { conditions, .. } = condition else {
            return Err(MapperError::Configuration(format!(
                "'{operator}' must hold a list of sub-queries"
            )));
        };

        conditions
            .iter()
            .map(|condition| match condition {
                Condition::Compound { query, .. } => self.query(query, context).map(Bson::Document),
                _ => Err(MapperError::Configuration(format!(
                    "'{operator}' must hold a list of sub-queries"
                ))),
            })
            .collect::<MapperResult<Vec<_>>>()
            .map(Bson::Array)
    }

    /// Writes the condition on one field.
    ///
    /// Operator keys of a compound nest under `key`; field keys flatten back to
    /// dotted keys after them.
    fn field(&self, out: &mut Document, key: String, path: &str, condition: &Condition) -> MapperResult<()> {
        let Condition::Compound { query, .. } = condition else {
            out.insert(key, self.leaf(path, condition)?);
            return Ok(());
        };

        let mut operators = Document::new();
        let mut nested = Vec::new();

        for (sub_key, sub_condition) in query.conditions() {
            if sub_key.starts_with('$') {
                operators.insert(sub_key, self.operator(path, sub_key, sub_condition)?);
            } else {
                nested.push((sub_key, sub_condition));
            }
        }

        if !operators.is_empty() || nested.is_empty() {
            out.insert(key.clone(), operators);
        }

        for (sub_key, sub_condition) in nested {
            self.field(
                out,
                format!("{key}.{sub_key}"),
                &format!("{path}.{sub_key}"),
                sub_condition,
            )?;
        }

        Ok(())
    }

    fn operator(&self, path: &str, operator: &str, condition: &Condition) -> MapperResult<Bson> {
        if FIELD_VALUE_OPERATORS.contains(&operator) {
            return self.leaf(path, condition);
        }

        match (operator, condition) {
            (ELEM_MATCH | NOT, Condition::Compound { query, .. }) => {
                self.query(query, Some(path)).map(Bson::Document)
            }
            _ => self.generic(condition),
        }
    }

    /// Writes a value of the field at `path`, through the field's codec.
    ///
    /// A value addressed to the elements of a collection goes through the
    /// codec as one element. Any other value of a collection field is the
    /// whole collection or, as in `{ tags: "a" }`, one element standing for
    /// it, and goes through the codec element by element. Values of other
    /// fields go through the codec whole.
    pub(crate) fn leaf(&self, path: &str, condition: &Condition) -> MapperResult<Bson> {
        match condition {
            Condition::Simple {
                value,
                target_is_collection,
            } => {
                let generic = value.to_bson(self.mapper).map_err(|e| e.at_path(path))?;
                self.encode(path, generic, *target_is_collection)
            }
            Condition::Collection { conditions, .. } => conditions
                .iter()
                .map(|condition| self.leaf(path, condition))
                .collect::<MapperResult<Vec<_>>>()
                .map(Bson::Array),
            Condition::Compound { query, .. } => self.query(query, Some(path)).map(Bson::Document),
        }
    }

    fn encode(&self, path: &str, value: Bson, element: bool) -> MapperResult<Bson> {
        let Some(field) = self.schema.resolve(path) else {
            return Ok(value);
        };
        let Some(name) = field.codec_name() else {
            return Ok(value);
        };

        let shape = if field.is_collection() && !element {
            CodecShape::Elements
        } else {
            CodecShape::Single
        };
        let codec = self.mapper.codec(name).map_err(|e| e.at_path(path))?;
        shape
            .encode(codec.as_ref(), value, &self.mapper.codec_context())
            .map_err(|e| e.at_path(path))
    }

    /// Writes a condition without any field codec.
    pub(crate) fn generic(&self, condition: &Condition) -> MapperResult<Bson> {
        match condition {
            Condition::Simple { value, .. } => value.to_bson(self.mapper),
            Condition::Collection { conditions, .. } => conditions
                .iter()
                .map(|condition| self.generic(condition))
                .collect::<MapperResult<Vec<_>>>()
                .map(Bson::Array),
            Condition::Compound { query, .. } => {
                let mut out = Document::new();
                for (key, condition) in query.conditions() {
                    out.insert(key, self.generic(condition)?);
                }
                Ok(Bson::Document(out))
            }
        }
    }
}

fn join(context: Option<&str>, key: &str) -> String {
    match context {
        Some(field) => format!("{field}.{key}"),
        None => key.to_owned(),
    }
}
