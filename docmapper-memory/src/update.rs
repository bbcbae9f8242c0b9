//! Update modifiers and upsert seeding for in-memory documents.

use bson::{Bson, DateTime, Document, Timestamp, oid::ObjectId};

use docmapper_core::{
    error::{MapperError, MapperResult},
    schema::ID_FIELD,
};

use crate::{
    evaluator::{self, as_f64, equals},
    path,
};

fn malformed(modifier: &str, field: &str) -> MapperError {
    MapperError::Backend(format!("malformed {modifier} for field '{field}'"))
}

fn fields<'a>(modifier: &str, operand: &'a Bson) -> MapperResult<&'a Document> {
    match operand {
        Bson::Document(fields) => Ok(fields),
        _ => Err(MapperError::Backend(format!("{modifier} expects a document of fields"))),
    }
}

/// Applies the modifiers of `update` to `document`.
///
/// `inserting` is set when the document is being created by an upsert, which
/// enables `$setOnInsert`.
///
/// # Errors
///
/// Returns [`MapperError::Backend`] for documents without modifiers, unknown
/// modifiers, modifiers applied to values of the wrong type, and attempts to
/// change `_id`.
pub fn apply(document: &mut Document, update: &Document, inserting: bool) -> MapperResult<()> {
    let original_id = document.get(ID_FIELD).cloned();

    for (modifier, operand) in update {
        let operand = fields(modifier, operand)?;

        for (field, value) in operand {
            match modifier.as_str() {
                "$set" => path::set(document, field, value.clone())?,
                "$setOnInsert" => {
                    if inserting {
                        path::set(document, field, value.clone())?;
                    }
                }
                "$unset" => {
                    path::remove(document, field)?;
                }
                "$inc" => arithmetic(document, field, value, modifier, |a, b| a.checked_add(b), |a, b| a + b)?,
                "$mul" => arithmetic(document, field, value, modifier, |a, b| a.checked_mul(b), |a, b| a * b)?,
                "$min" | "$max" => {
                    let replace = match path::get(document, field) {
                        Some(current) => {
                            let ordering = evaluator::compare(value, current);
                            if modifier == "$min" { ordering.is_lt() } else { ordering.is_gt() }
                        }
                        None => true,
                    };
                    if replace {
                        path::set(document, field, value.clone())?;
                    }
                }
                "$rename" => {
                    let Bson::String(target) = value else {
                        return Err(malformed(modifier, field));
                    };
                    if let Some(moved) = path::remove(document, field)? {
                        path::set(document, target, moved)?;
                    }
                }
                "$push" => push(document, field, value, false)?,
                "$addToSet" => push(document, field, value, true)?,
                "$pull" => pull(document, field, |item| pull_matches(item, value))?,
                "$pullAll" => {
                    let Bson::Array(values) = value else {
                        return Err(malformed(modifier, field));
                    };
                    pull(document, field, |item| Ok(values.iter().any(|value| equals(item, value))))?;
                }
                "$pop" => {
                    if let Some(items) = array_mut(document, field, false)? {
                        if as_f64(value).is_some_and(|direction| direction < 0.0) {
                            if !items.is_empty() {
                                items.remove(0);
                            }
                        } else {
                            items.pop();
                        }
                    }
                }
                "$bit" => bit(document, field, value)?,
                "$currentDate" => {
                    let now = match value {
                        Bson::Document(spec) if spec.get_str("$type").is_ok_and(|ty| ty == "timestamp") => {
                            Bson::Timestamp(Timestamp {
                                time: u32::try_from(DateTime::now().timestamp_millis() / 1000).unwrap_or(u32::MAX),
                                increment: 1,
                            })
                        }
                        _ => Bson::DateTime(DateTime::now()),
                    };
                    path::set(document, field, now)?;
                }
                other => {
                    return Err(MapperError::Backend(format!(
                        "update modifier {other} is not supported by the in-memory store"
                    )));
                }
            }
        }
    }

    if let Some(original_id) = original_id {
        if document.get(ID_FIELD).is_none_or(|id| !equals(id, &original_id)) {
            return Err(MapperError::Backend("the _id field cannot be modified".into()));
        }
    }

    Ok(())
}

/// Returns whether `update` is made of modifiers.
pub fn is_modifier_document(update: &Document) -> bool {
    !update.is_empty() && update.keys().all(|key| key.starts_with('$'))
}

fn arithmetic(
    document: &mut Document,
    field: &str,
    operand: &Bson,
    modifier: &str,
    integer: impl Fn(i64, i64) -> Option<i64>,
    float: impl Fn(f64, f64) -> f64,
) -> MapperResult<()> {
    if as_f64(operand).is_none() {
        return Err(malformed(modifier, field));
    }

    let current = match path::get(document, field) {
        Some(current) => current.clone(),
        None => match operand {
            Bson::Int32(_) => Bson::Int32(0),
            Bson::Int64(_) => Bson::Int64(0),
            _ => Bson::Double(0.0),
        },
    };

    let result = match (&current, operand) {
        (Bson::Int32(a), Bson::Int32(b)) => match integer(i64::from(*a), i64::from(*b)) {
            Some(value) => i32::try_from(value).map(Bson::Int32).unwrap_or(Bson::Int64(value)),
            None => return Err(MapperError::Backend(format!("integer overflow applying {modifier}"))),
        },
        (Bson::Int32(_) | Bson::Int64(_), Bson::Int32(_) | Bson::Int64(_)) => {
            let (Some(a), Some(b)) = (integer_of(&current), integer_of(operand)) else {
                return Err(malformed(modifier, field));
            };
            Bson::Int64(integer(a, b).ok_or_else(|| {
                MapperError::Backend(format!("integer overflow applying {modifier}"))
            })?)
        }
        _ => match (as_f64(&current), as_f64(operand)) {
            (Some(a), Some(b)) => Bson::Double(float(a, b)),
            _ => return Err(malformed(modifier, field)),
        },
    };

    path::set(document, field, result)
}

fn integer_of(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(value) => Some(i64::from(*value)),
        Bson::Int64(value) => Some(*value),
        _ => None,
    }
}

fn array_mut<'a>(document: &'a mut Document, field: &str, create: bool) -> MapperResult<Option<&'a mut Vec<Bson>>> {
    let Some(slot) = path::get_mut(document, field, create)? else {
        return Ok(None);
    };

    if create && matches!(slot, Bson::Null) {
        *slot = Bson::Array(Vec::new());
    }

    match slot {
        Bson::Array(items) => Ok(Some(items)),
        _ => Err(MapperError::Backend(format!("field '{field}' is not an array"))),
    }
}

fn push(document: &mut Document, field: &str, value: &Bson, unique: bool) -> MapperResult<()> {
    let values = match value {
        Bson::Document(modifiers) if modifiers.contains_key("$each") => match modifiers.get("$each") {
            Some(Bson::Array(values)) => values.clone(),
            _ => return Err(malformed("$each", field)),
        },
        value => vec![value.clone()],
    };

    let Some(items) = array_mut(document, field, true)? else {
        return Err(malformed("$push", field));
    };

    for value in values {
        if !unique || !items.iter().any(|item| equals(item, &value)) {
            items.push(value);
        }
    }
    Ok(())
}

fn pull(document: &mut Document, field: &str, matches: impl Fn(&Bson) -> MapperResult<bool>) -> MapperResult<()> {
    let Some(items) = array_mut(document, field, false)? else {
        return Ok(());
    };

    let mut kept = Vec::with_capacity(items.len());
    for item in items.drain(..) {
        if !matches(&item)? {
            kept.push(item);
        }
    }
    *items = kept;
    Ok(())
}

fn pull_matches(item: &Bson, condition: &Bson) -> MapperResult<bool> {
    match condition {
        Bson::Document(query) if !query.is_empty() && !equals(item, condition) => {
            evaluator::matches_element(item, query, condition)
        }
        condition => Ok(equals(item, condition)),
    }
}

fn bit(document: &mut Document, field: &str, operations: &Bson) -> MapperResult<()> {
    let operations = fields("$bit", operations)?;
    let mut current = match path::get(document, field) {
        Some(value) => value.clone(),
        None => Bson::Int32(0),
    };

    for (operation, operand) in operations {
        current = match (&current, operand) {
            (Bson::Int32(a), Bson::Int32(b)) => Bson::Int32(match operation.as_str() {
                "and" => a & b,
                "or" => a | b,
                "xor" => a ^ b,
                _ => return Err(malformed("$bit", field)),
            }),
            _ => {
                let (Some(a), Some(b)) = (integer_of(&current), integer_of(operand)) else {
                    return Err(malformed("$bit", field));
                };
                Bson::Int64(match operation.as_str() {
                    "and" => a & b,
                    "or" => a | b,
                    "xor" => a ^ b,
                    _ => return Err(malformed("$bit", field)),
                })
            }
        };
    }

    path::set(document, field, current)
}

/// Builds the document an upsert starts from: the equality conditions of
/// `filter`, including those nested in `$and`.
pub fn seed(filter: &Document) -> MapperResult<Document> {
    let mut document = Document::new();
    seed_into(&mut document, filter)?;
    Ok(document)
}

fn seed_into(document: &mut Document, filter: &Document) -> MapperResult<()> {
    for (key, condition) in filter {
        if key == "$and" {
            if let Bson::Array(clauses) = condition {
                for clause in clauses {
                    if let Bson::Document(clause) = clause {
                        seed_into(document, clause)?;
                    }
                }
            }
            continue;
        }
        if key.starts_with('$') {
            continue;
        }

        match condition {
            Bson::Document(operators) if operators.keys().next().is_some_and(|op| op.starts_with('$')) => {
                if let Some(value) = operators.get("$eq") {
                    path::set(document, key, value.clone())?;
                }
            }
            Bson::RegularExpression(_) => {}
            value => path::set(document, key, value.clone())?,
        }
    }
    Ok(())
}

/// Moves `_id` to the front of `document`, generating an object id when it is
/// missing.
pub fn with_id(mut document: Document) -> (Bson, Document) {
    let id = document
        .remove(ID_FIELD)
        .filter(|id| !matches!(id, Bson::Null))
        .unwrap_or_else(|| Bson::ObjectId(ObjectId::new()));

    let mut prepared = Document::new();
    prepared.insert(ID_FIELD, id.clone());
    prepared.extend(document);
    (id, prepared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use pretty_assertions::assert_eq;

    fn updated(mut document: Document, update: Document) -> Document {
        apply(&mut document, &update, false).unwrap();
        document
    }

    #[test]
    fn test_field_modifiers() {
        let document = updated(
            doc! { "_id": 1, "name": "a", "n": 1, "old": true, "gone": 1, "low": 5 },
            doc! {
                "$set": { "name": "b", "nested.x": 1 },
                "$inc": { "n": 2, "fresh": 1.5 },
                "$rename": { "old": "new" },
                "$unset": { "gone": 1 },
                "$min": { "low": 3 },
                "$max": { "high": 10 },
            },
        );

        assert_eq!(
            document,
            doc! {
                "_id": 1,
                "name": "b",
                "n": 3,
                "low": 3,
                "nested": { "x": 1 },
                "fresh": 1.5,
                "new": true,
                "high": 10,
            }
        );
    }

    #[test]
    fn test_array_modifiers() {
        let document = updated(
            doc! { "tags": ["a", "b"], "nums": [1, 2, 3, 4], "rest": [1, 2, 3] },
            doc! {
                "$push": { "tags": { "$each": ["c", "d"] } },
                "$addToSet": { "tags": "a", "fresh": "x" },
                "$pull": { "nums": { "$gte": 3 } },
                "$pop": { "rest": -1 },
            },
        );

        assert_eq!(
            document,
            doc! {
                "tags": ["a", "b", "c", "d"],
                "nums": [1, 2],
                "rest": [2, 3],
                "fresh": ["x"],
            }
        );
    }

    #[test]
    fn test_bit_and_set_on_insert() {
        let mut document = doc! { "flags": 0b1100 };
        apply(
            &mut document,
            &doc! { "$bit": { "flags": { "and": 0b0100, "or": 0b0001 } }, "$setOnInsert": { "created": true } },
            false,
        )
        .unwrap();
        assert_eq!(document, doc! { "flags": 0b0101 });

        let mut inserted = Document::new();
        apply(&mut inserted, &doc! { "$setOnInsert": { "created": true } }, true).unwrap();
        assert_eq!(inserted, doc! { "created": true });
    }

    #[test]
    fn test_id_is_immutable() {
        let mut document = doc! { "_id": 1 };
        assert!(apply(&mut document, &doc! { "$set": { "_id": 2 } }, false).is_err());
        assert!(apply(&mut document, &doc! { "$explode": { "a": 1 } }, false).is_err());
    }

    #[test]
    fn test_seed_takes_equalities() {
        let seeded = seed(&doc! {
            "name": "a",
            "age": { "$gt": 3 },
            "kind": { "$eq": "x" },
            "$and": [{ "address.city": "Oslo" }],
        })
        .unwrap();

        assert_eq!(seeded, doc! { "name": "a", "kind": "x", "address": { "city": "Oslo" } });
    }
}
