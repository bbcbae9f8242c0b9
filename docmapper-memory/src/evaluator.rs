//! Filter evaluation for in-memory documents.
//!
//! Filters are native query documents as produced by the mapping layer. Values
//! are compared with the BSON type ordering: numbers of different widths
//! compare by value, and values of different types order by type.

use std::cmp::Ordering;

use bson::{Bson, Document, spec::BinarySubtype};
use regex_lite::Regex;

use docmapper_core::error::{MapperError, MapperResult};

use crate::path;

fn unsupported(what: impl std::fmt::Display) -> MapperError {
    MapperError::Backend(format!("{what} is not supported by the in-memory store"))
}

fn malformed(operator: &str) -> MapperError {
    MapperError::Backend(format!("malformed operand for {operator}"))
}

/// Rank of a value's type in the BSON comparison order.
fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::MaxKey => 13,
        _ => 12,
    }
}

pub(crate) fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

/// Integer value of a number for `$mod`. Doubles are truncated toward zero as
/// the server does; NaN and infinities have no integer value.
fn truncated(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) if v.is_finite() => Some(v.trunc() as i64),
        _ => None,
    }
}

/// Total order over BSON values.
pub(crate) fn compare(left: &Bson, right: &Bson) -> Ordering {
    let rank = type_rank(left).cmp(&type_rank(right));
    if rank != Ordering::Equal {
        return rank;
    }

    match (left, right) {
        (Bson::Int32(a), Bson::Int32(b)) => a.cmp(b),
        (Bson::Int64(a), Bson::Int64(b)) => a.cmp(b),
        (Bson::String(a), Bson::String(b)) => a.cmp(b),
        (Bson::Symbol(a), Bson::Symbol(b)) => a.cmp(b),
        (Bson::Document(a), Bson::Document(b)) => {
            for ((left_key, left_value), (right_key, right_value)) in a.iter().zip(b.iter()) {
                let ordering = left_key
                    .cmp(right_key)
                    .then_with(|| compare(left_value, right_value));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.len().cmp(&b.len())
        }
        (Bson::Array(a), Bson::Array(b)) => {
            for (left, right) in a.iter().zip(b.iter()) {
                let ordering = compare(left, right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.len().cmp(&b.len())
        }
        (Bson::Binary(a), Bson::Binary(b)) => a
            .bytes
            .len()
            .cmp(&b.bytes.len())
            .then_with(|| u8::from(a.subtype).cmp(&u8::from(b.subtype)))
            .then_with(|| a.bytes.cmp(&b.bytes)),
        (Bson::ObjectId(a), Bson::ObjectId(b)) => a.bytes().cmp(&b.bytes()),
        (Bson::Boolean(a), Bson::Boolean(b)) => a.cmp(b),
        (Bson::DateTime(a), Bson::DateTime(b)) => a.cmp(b),
        (Bson::Timestamp(a), Bson::Timestamp(b)) => (a.time, a.increment).cmp(&(b.time, b.increment)),
        (Bson::RegularExpression(a), Bson::RegularExpression(b)) => {
            (a.pattern.as_str(), a.options.as_str()).cmp(&(b.pattern.as_str(), b.options.as_str()))
        }
        _ => match (as_f64(left), as_f64(right)) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
    }
}

pub(crate) fn equals(left: &Bson, right: &Bson) -> bool {
    compare(left, right) == Ordering::Equal
}

/// Compares values of the same type bracket only.
fn compare_same_type(left: &Bson, right: &Bson) -> Option<Ordering> {
    (type_rank(left) == type_rank(right)).then(|| compare(left, right))
}

/// Candidate values plus the elements of candidate arrays.
fn expanded<'a>(candidates: &[&'a Bson]) -> Vec<&'a Bson> {
    let mut values = Vec::with_capacity(candidates.len());
    for &candidate in candidates {
        values.push(candidate);
        if let Bson::Array(items) = candidate {
            values.extend(items.iter());
        }
    }
    values
}

fn is_operator_document(value: &Bson) -> bool {
    matches!(value, Bson::Document(document) if document.keys().next().is_some_and(|key| key.starts_with('$')))
}

fn compile_regex(pattern: &str, options: &str) -> MapperResult<Regex> {
    let flags: String = options.chars().filter(|flag| "imsx".contains(*flag)).collect();
    let pattern = if flags.is_empty() {
        pattern.to_owned()
    } else {
        format!("(?{flags}){pattern}")
    };

    Regex::new(&pattern).map_err(|e| MapperError::Backend(format!("invalid regular expression: {e}")))
}

/// Returns whether `document` matches the native `filter`.
///
/// # Errors
///
/// Returns [`MapperError::Backend`] for malformed operands and for operators
/// the in-memory store does not evaluate, such as `$where`.
pub fn matches(document: &Document, filter: &Document) -> MapperResult<bool> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => logical(document, key, condition)?.iter().all(|matched| *matched),
            "$or" => logical(document, key, condition)?.iter().any(|matched| *matched),
            "$nor" => !logical(document, key, condition)?.iter().any(|matched| *matched),
            "$comment" => true,
            "$where" => return Err(unsupported("$where")),
            operator if operator.starts_with('$') => return Err(unsupported(operator)),
            field => matches_condition(&path::values_at(document, field), condition)?,
        };

        if !matched {
            return Ok(false);
        }
    }

    Ok(true)
}

fn logical(document: &Document, operator: &str, clauses: &Bson) -> MapperResult<Vec<bool>> {
    let Bson::Array(clauses) = clauses else {
        return Err(malformed(operator));
    };

    clauses
        .iter()
        .map(|clause| match clause {
            Bson::Document(clause) => matches(document, clause),
            _ => Err(malformed(operator)),
        })
        .collect()
}

/// Returns whether the values found at a field path satisfy `condition`.
fn matches_condition(candidates: &[&Bson], condition: &Bson) -> MapperResult<bool> {
    match condition {
        Bson::Document(operators) if is_operator_document(condition) => {
            let options = operators.get_str("$options").unwrap_or_default();

            for (operator, operand) in operators {
                if operator == "$options" {
                    continue;
                }
                if !matches_operator(candidates, operator, operand, options)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Bson::RegularExpression(regex) => {
            matches_regex(candidates, regex.pattern.as_str(), regex.options.as_str())
        }
        _ => Ok(matches_equality(candidates, condition)),
    }
}

fn matches_equality(candidates: &[&Bson], value: &Bson) -> bool {
    if candidates.is_empty() {
        return matches!(value, Bson::Null);
    }
    expanded(candidates).iter().any(|candidate| equals(candidate, value))
}

fn matches_regex(candidates: &[&Bson], pattern: &str, options: &str) -> MapperResult<bool> {
    let regex = compile_regex(pattern, options)?;

    Ok(expanded(candidates).iter().any(|candidate| match candidate {
        Bson::String(value) | Bson::Symbol(value) => regex.is_match(value),
        _ => false,
    }))
}

fn matches_in(candidates: &[&Bson], operator: &str, operand: &Bson) -> MapperResult<bool> {
    let Bson::Array(values) = operand else {
        return Err(malformed(operator));
    };

    for value in values {
        let matched = match value {
            Bson::RegularExpression(regex) => {
                matches_regex(candidates, regex.pattern.as_str(), regex.options.as_str())?
            }
            value => matches_equality(candidates, value),
        };
        if matched {
            return Ok(true);
        }
    }
    Ok(false)
}

fn matches_operator(candidates: &[&Bson], operator: &str, operand: &Bson, options: &str) -> MapperResult<bool> {
    match operator {
        "$eq" => Ok(matches_equality(candidates, operand)),
        "$ne" => Ok(!matches_equality(candidates, operand)),
        "$gt" | "$gte" | "$lt" | "$lte" => Ok(expanded(candidates).iter().any(|candidate| {
            compare_same_type(candidate, operand).is_some_and(|ordering| match operator {
                "$gt" => ordering == Ordering::Greater,
                "$gte" => ordering != Ordering::Less,
                "$lt" => ordering == Ordering::Less,
                _ => ordering != Ordering::Greater,
            })
        })),
        "$in" => matches_in(candidates, operator, operand),
        "$nin" => Ok(!matches_in(candidates, operator, operand)?),
        "$all" => {
            let Bson::Array(required) = operand else {
                return Err(malformed(operator));
            };
            if required.is_empty() {
                return Ok(false);
            }
            for value in required {
                let matched = match value {
                    Bson::Document(element) if element.contains_key("$elemMatch") => {
                        matches_condition(candidates, value)?
                    }
                    value => matches_equality(candidates, value),
                };
                if !matched {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        "$size" => {
            let size = as_f64(operand).ok_or_else(|| malformed(operator))?;
            Ok(candidates
                .iter()
                .any(|candidate| matches!(candidate, Bson::Array(items) if items.len() as f64 == size)))
        }
        "$exists" => Ok(candidates.is_empty() != truthy(operand)),
        "$type" => match operand {
            Bson::Array(types) => Ok(types
                .iter()
                .any(|ty| expanded(candidates).iter().any(|candidate| has_type(candidate, ty)))),
            ty => Ok(expanded(candidates).iter().any(|candidate| has_type(candidate, ty))),
        },
        "$mod" => {
            let (divisor, remainder) = match operand {
                Bson::Array(parts) if parts.len() == 2 => (
                    truncated(&parts[0]).ok_or_else(|| malformed(operator))?,
                    truncated(&parts[1]).ok_or_else(|| malformed(operator))?,
                ),
                _ => return Err(malformed(operator)),
            };
            if divisor == 0 {
                return Err(malformed(operator));
            }
            Ok(expanded(candidates)
                .iter()
                .filter_map(|candidate| truncated(candidate))
                .any(|value| value.wrapping_rem(divisor) == remainder))
        }
        "$regex" => match operand {
            Bson::String(pattern) => matches_regex(candidates, pattern, options),
            Bson::RegularExpression(regex) => {
                let options = if options.is_empty() { regex.options.as_str() } else { options };
                matches_regex(candidates, regex.pattern.as_str(), options)
            }
            _ => Err(malformed(operator)),
        },
        "$elemMatch" => {
            let Bson::Document(condition) = operand else {
                return Err(malformed(operator));
            };
            for candidate in candidates {
                let Bson::Array(items) = candidate else {
                    continue;
                };
                for item in items {
                    if matches_element(item, condition, operand)? {
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        }
        "$not" => match operand {
            Bson::Document(_) | Bson::RegularExpression(_) => Ok(!matches_condition(candidates, operand)?),
            _ => Err(malformed(operator)),
        },
        "$where" | "$text" => Err(unsupported(operator)),
        other => Err(unsupported(other)),
    }
}

/// Matches one array element against an `$elemMatch` condition.
///
/// A condition of field names is evaluated against embedded documents; a
/// condition of operators applies to the element itself.
pub(crate) fn matches_element(item: &Bson, condition: &Document, raw: &Bson) -> MapperResult<bool> {
    let is_query = condition
        .keys()
        .next()
        .is_some_and(|key| !key.starts_with('$') || matches!(key.as_str(), "$and" | "$or" | "$nor"));

    if is_query {
        match item {
            Bson::Document(element) => matches(element, condition),
            _ => Ok(false),
        }
    } else {
        matches_condition(&[item], raw)
    }
}

pub(crate) fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(value) => *value,
        Bson::Null | Bson::Undefined => false,
        value => as_f64(value).is_none_or(|number| number != 0.0),
    }
}

fn has_type(value: &Bson, ty: &Bson) -> bool {
    let alias = match ty {
        Bson::String(alias) => alias.as_str(),
        ty => match as_f64(ty).map(|code| code as i64) {
            Some(1) => "double",
            Some(2) => "string",
            Some(3) => "object",
            Some(4) => "array",
            Some(5) => "binData",
            Some(7) => "objectId",
            Some(8) => "bool",
            Some(9) => "date",
            Some(10) => "null",
            Some(11) => "regex",
            Some(16) => "int",
            Some(17) => "timestamp",
            Some(18) => "long",
            Some(19) => "decimal",
            _ => return false,
        },
    };

    match (alias, value) {
        ("double", Bson::Double(_))
        | ("string", Bson::String(_))
        | ("object", Bson::Document(_))
        | ("array", Bson::Array(_))
        | ("binData", Bson::Binary(_))
        | ("objectId", Bson::ObjectId(_))
        | ("bool", Bson::Boolean(_))
        | ("date", Bson::DateTime(_))
        | ("null", Bson::Null)
        | ("regex", Bson::RegularExpression(_))
        | ("int", Bson::Int32(_))
        | ("timestamp", Bson::Timestamp(_))
        | ("long", Bson::Int64(_))
        | ("decimal", Bson::Decimal128(_)) => true,
        ("number", value) => type_rank(value) == 2,
        ("uuid", Bson::Binary(binary)) => binary.subtype == BinarySubtype::Uuid,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, oid::ObjectId};

    fn person() -> Document {
        doc! {
            "_id": ObjectId::new(),
            "name": "Alice",
            "age": 30,
            "tags": ["admin", "dev"],
            "address": { "city": "Oslo", "zip": "0150" },
            "orders": [
                { "sku": "a", "qty": 2 },
                { "sku": "b", "qty": 5 },
            ],
        }
    }

    fn check(filter: Document) -> bool {
        matches(&person(), &filter).unwrap()
    }

    #[test]
    fn test_equality_and_comparisons() {
        assert!(check(doc! { "name": "Alice" }));
        assert!(check(doc! { "age": 30.0 }));
        assert!(check(doc! { "age": { "$gt": 18_i64, "$lte": 30 } }));
        assert!(!check(doc! { "age": { "$gt": "18" } }));
        assert!(check(doc! { "age": { "$ne": 31 } }));
        assert!(check(doc! { "missing": Bson::Null }));
        assert!(!check(doc! { "name": "Bob" }));
    }

    #[test]
    fn test_arrays_and_dotted_paths() {
        assert!(check(doc! { "tags": "dev" }));
        assert!(check(doc! { "tags": { "$all": ["dev", "admin"] } }));
        assert!(check(doc! { "tags": { "$size": 2 } }));
        assert!(check(doc! { "tags": { "$in": ["ops", "dev"] } }));
        assert!(check(doc! { "tags": { "$nin": ["ops"] } }));
        assert!(check(doc! { "address.city": "Oslo" }));
        assert!(check(doc! { "orders.sku": "b" }));
        assert!(check(doc! { "orders.1.qty": 5 }));
        assert!(check(doc! { "orders": { "$elemMatch": { "sku": "a", "qty": { "$gte": 2 } } } }));
        assert!(!check(doc! { "orders": { "$elemMatch": { "sku": "a", "qty": 5 } } }));
    }

    #[test]
    fn test_element_operators() {
        assert!(check(doc! { "age": { "$exists": true } }));
        assert!(check(doc! { "nope": { "$exists": false } }));
        assert!(check(doc! { "age": { "$type": "int" } }));
        assert!(check(doc! { "age": { "$mod": [7, 2] } }));
        assert!(check(doc! { "age": { "$not": { "$lt": 18 } } }));
    }

    #[test]
    fn test_modulo_truncates_doubles() {
        assert!(check(doc! { "age": { "$mod": [7.9, 2.5] } }));
        assert!(check(doc! { "age": { "$mod": [-7, 2] } }));
        assert!(matches(&doc! { "n": 9.5 }, &doc! { "n": { "$mod": [4, 1] } }).unwrap());
        assert!(!check(doc! { "age": { "$mod": [7, 3] } }));

        for operand in [f64::NAN, f64::INFINITY] {
            let err = matches(&person(), &doc! { "age": { "$mod": [operand, 0] } }).unwrap_err();
            assert!(matches!(err, MapperError::Backend(_)), "{operand}");
        }
        assert!(matches!(
            matches(&person(), &doc! { "age": { "$mod": [0.5, 0] } }),
            Err(MapperError::Backend(_))
        ));
    }

    #[test]
    fn test_regex_and_logical_operators() {
        assert!(check(doc! { "name": { "$regex": "^al", "$options": "i" } }));
        assert!(check(doc! { "name": { "$regex": "ice$" } }));
        assert!(!check(doc! { "name": { "$regex": "^al" } }));
        assert!(check(doc! { "$or": [{ "name": "Bob" }, { "age": 30 }] }));
        assert!(!check(doc! { "$and": [{ "name": "Alice" }, { "age": 31 }] }));
        assert!(check(doc! { "$nor": [{ "name": "Bob" }] }));
    }

    #[test]
    fn test_unsupported_operators_fail() {
        assert!(matches(&person(), &doc! { "$where": "this.age > 1" }).is_err());
        assert!(matches(&person(), &doc! { "age": { "$near": 1 } }).is_err());
    }

    #[test]
    fn test_type_ordering() {
        assert_eq!(compare(&Bson::Null, &Bson::Int32(1)), Ordering::Less);
        assert_eq!(compare(&Bson::Int64(2), &Bson::Double(1.5)), Ordering::Greater);
        assert_eq!(compare(&Bson::String("a".into()), &Bson::Int32(5)), Ordering::Greater);
        assert!(equals(&Bson::Int32(3), &Bson::Int64(3)));
    }
}
