//! Sorting, projection and aggregation stages over in-memory documents.

use std::cmp::Ordering;

use bson::{Bson, Document};

use docmapper_core::{
    error::{MapperError, MapperResult},
    schema::ID_FIELD,
};

use crate::{
    evaluator::{self, truthy},
    path,
};

/// Sorts `documents` by the keys of `sort`, `1` ascending and `-1`
/// descending. Missing fields sort as null.
pub fn sort(documents: &mut [Document], sort: &Document) {
    documents.sort_by(|left, right| {
        for (field, direction) in sort {
            let left_value = path::get(left, field).unwrap_or(&Bson::Null);
            let right_value = path::get(right, field).unwrap_or(&Bson::Null);

            let mut ordering = evaluator::compare(left_value, right_value);
            if evaluator::as_f64(direction).is_some_and(|direction| direction < 0.0) {
                ordering = ordering.reverse();
            }
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Applies an inclusion or exclusion projection.
///
/// `_id` is kept unless it is excluded explicitly.
///
/// # Errors
///
/// Returns [`MapperError::Backend`] when inclusions and exclusions are mixed.
pub fn project(document: Document, projection: &Document) -> MapperResult<Document> {
    let mut include_id = true;
    let mut included = Vec::new();
    let mut excluded = Vec::new();

    for (field, flag) in projection {
        match (field.as_str(), truthy(flag)) {
            (ID_FIELD, flag) => include_id = flag,
            (_, true) => included.push(field.as_str()),
            (_, false) => excluded.push(field.as_str()),
        }
    }

    if !included.is_empty() && !excluded.is_empty() {
        return Err(MapperError::Backend(
            "a projection cannot mix inclusions and exclusions".into(),
        ));
    }

    if !included.is_empty() {
        let mut projected = Document::new();
        if include_id {
            if let Some(id) = document.get(ID_FIELD) {
                projected.insert(ID_FIELD, id.clone());
            }
        }
        for field in included {
            if let Some(value) = path::get(&document, field) {
                path::set(&mut projected, field, value.clone())?;
            }
        }
        return Ok(projected);
    }

    let mut projected = document;
    if !include_id {
        projected.remove(ID_FIELD);
    }
    for field in excluded {
        path::remove(&mut projected, field)?;
    }
    Ok(projected)
}

fn count_of(value: &Bson, stage: &str) -> MapperResult<usize> {
    evaluator::as_f64(value)
        .filter(|count| *count >= 0.0)
        .map(|count| count as usize)
        .ok_or_else(|| MapperError::Backend(format!("{stage} expects a non-negative number")))
}

/// Runs aggregation `stages` over `documents`.
///
/// # Errors
///
/// Returns [`MapperError::Backend`] for malformed stages and for stages other
/// than `$match`, `$sort`, `$skip`, `$limit`, `$project` and `$count`.
pub fn aggregate(mut documents: Vec<Document>, stages: &[Document]) -> MapperResult<Vec<Document>> {
    for stage in stages {
        let Some((name, spec)) = stage.iter().next().filter(|_| stage.len() == 1) else {
            return Err(MapperError::Backend("an aggregation stage must have exactly one key".into()));
        };

        documents = match (name.as_str(), spec) {
            ("$match", Bson::Document(filter)) => {
                let mut matched = Vec::with_capacity(documents.len());
                for document in documents {
                    if evaluator::matches(&document, filter)? {
                        matched.push(document);
                    }
                }
                matched
            }
            ("$sort", Bson::Document(keys)) => {
                sort(&mut documents, keys);
                documents
            }
            ("$skip", count) => documents.into_iter().skip(count_of(count, name)?).collect(),
            ("$limit", count) => documents.into_iter().take(count_of(count, name)?).collect(),
            ("$project", Bson::Document(projection)) => documents
                .into_iter()
                .map(|document| project(document, projection))
                .collect::<MapperResult<_>>()?,
            ("$count", Bson::String(field)) => {
                let mut counted = Document::new();
                counted.insert(field.as_str(), i64::try_from(documents.len()).unwrap_or(i64::MAX));
                vec![counted]
            }
            (name, _) => {
                return Err(MapperError::Backend(format!(
                    "aggregation stage {name} is not supported by the in-memory store"
                )));
            }
        };
    }

    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use pretty_assertions::assert_eq;

    fn people() -> Vec<Document> {
        vec![
            doc! { "_id": 1, "name": "c", "age": 30 },
            doc! { "_id": 2, "name": "a", "age": 25 },
            doc! { "_id": 3, "name": "b" },
        ]
    }

    #[test]
    fn test_sort_orders_missing_first() {
        let mut documents = people();
        sort(&mut documents, &doc! { "age": -1 });

        let ids: Vec<_> = documents.iter().map(|d| d.get_i32("_id").unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        sort(&mut documents, &doc! { "age": 1 });
        let ids: Vec<_> = documents.iter().map(|d| d.get_i32("_id").unwrap()).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn test_projection_modes() {
        let document = doc! { "_id": 1, "name": "a", "address": { "city": "Oslo", "zip": "1" } };

        assert_eq!(
            project(document.clone(), &doc! { "address.city": 1 }).unwrap(),
            doc! { "_id": 1, "address": { "city": "Oslo" } }
        );
        assert_eq!(
            project(document.clone(), &doc! { "_id": 0, "address": 0 }).unwrap(),
            doc! { "name": "a" }
        );
        assert!(project(document, &doc! { "name": 1, "address": 0 }).is_err());
    }

    #[test]
    fn test_aggregation_stages() {
        let stages = vec![
            doc! { "$match": { "age": { "$exists": true } } },
            doc! { "$sort": { "name": 1 } },
            doc! { "$project": { "name": 1, "_id": 0 } },
        ];
        assert_eq!(
            aggregate(people(), &stages).unwrap(),
            vec![doc! { "name": "a" }, doc! { "name": "c" }]
        );

        let counted = aggregate(people(), &[doc! { "$skip": 1 }, doc! { "$count": "total" }]).unwrap();
        assert_eq!(counted, vec![doc! { "total": 2_i64 }]);

        assert!(aggregate(people(), &[doc! { "$group": { "_id": "$name" } }]).is_err());
    }
}
