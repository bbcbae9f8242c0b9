//! Aggregation pipelines with deferred `$match` stages.

use bson::{Document, doc};

use super::{Projection, Query, SchemaBinding, SortSpec};
use crate::error::MapperResult;

/// One aggregation stage.
#[derive(Debug, Clone)]
pub enum Stage {
    /// A `$match` stage whose query is serialized against the collection's
    /// mapped type.
    Match(Query),
    /// A stage already in native form.
    Native(Document),
}

/// An ordered list of aggregation stages.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn match_query(mut self, query: Query) -> Self {
        self.stages.push(Stage::Match(query));
        self
    }

    pub fn sort(self, sort: SortSpec) -> Self {
        self.stage(doc! { "$sort": sort.to_document() })
    }

    pub fn skip(self, skip: u64) -> Self {
        let skip = i64::try_from(skip).unwrap_or(i64::MAX);
        self.stage(doc! { "$skip": skip })
    }

    pub fn limit(self, limit: i64) -> Self {
        self.stage(doc! { "$limit": limit })
    }

    pub fn project(self, projection: Projection) -> Self {
        self.stage(doc! { "$project": projection.to_document() })
    }

    /// Appends a native stage.
    pub fn stage(mut self, stage: Document) -> Self {
        self.stages.push(Stage::Native(stage));
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Serializes every stage, binding deferred `$match` queries to `binding`.
    ///
    /// # Errors
    ///
    /// Fails like [`Query::initialize`] and [`Query::serialize`].
    pub fn serialize(self, binding: &SchemaBinding) -> MapperResult<Vec<Document>> {
        self.stages
            .into_iter()
            .map(|stage| match stage {
                Stage::Match(mut query) => {
                    query.initialize(binding.clone())?;
                    Ok(doc! { "$match": query.serialize()? })
                }
                Stage::Native(document) => Ok(document),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        codec,
        mapper::Mapper,
        query::DbQuery,
        schema::{FieldSchema, Schema},
    };
    use bson::oid::ObjectId;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_match_stages_are_deferred() {
        let id = ObjectId::new();
        let schema = Schema::builder()
            .id(FieldSchema::new().codec(codec::object_id::MARKER))
            .build();
        let binding = SchemaBinding::new(Arc::new(Mapper::default()), Arc::new(schema));

        let stages = Pipeline::new()
            .match_query(DbQuery::is("_id", id.to_hex()))
            .sort(SortSpec::new().descending("n"))
            .skip(1)
            .limit(2)
            .stage(doc! { "$count": "total" })
            .serialize(&binding)
            .unwrap();

        assert_eq!(
            stages,
            vec![
                doc! { "$match": { "_id": id } },
                doc! { "$sort": { "n": -1 } },
                doc! { "$skip": 1_i64 },
                doc! { "$limit": 2_i64 },
                doc! { "$count": "total" },
            ]
        );
    }
}
