//! Dotted-path access into documents.

use bson::{Bson, Document};

use docmapper_core::error::{MapperError, MapperResult};

fn index_of(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

/// Collects every value reachable through `path`.
///
/// Arrays met on the way are traversed: a numeric segment indexes into the
/// array, any other segment is looked up in each embedded document.
pub(crate) fn values_at<'a>(document: &'a Document, path: &str) -> Vec<&'a Bson> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut found = Vec::new();

    if let Some((first, rest)) = segments.split_first() {
        if let Some(value) = document.get(*first) {
            collect(value, rest, &mut found);
        }
    }
    found
}

fn collect<'a>(value: &'a Bson, segments: &[&str], found: &mut Vec<&'a Bson>) {
    let Some((segment, rest)) = segments.split_first() else {
        found.push(value);
        return;
    };

    match value {
        Bson::Document(document) => {
            if let Some(value) = document.get(*segment) {
                collect(value, rest, found);
            }
        }
        Bson::Array(items) => {
            if let Some(item) = index_of(segment).and_then(|index| items.get(index)) {
                collect(item, rest, found);
            }
            for item in items.iter().filter(|item| matches!(item, Bson::Document(_))) {
                collect(item, segments, found);
            }
        }
        _ => {}
    }
}

/// Returns the single value at `path` without traversing arrays except by
/// index.
pub(crate) fn get<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;

    for segment in segments {
        current = match current {
            Bson::Document(document) => document.get(segment)?,
            Bson::Array(items) => items.get(index_of(segment)?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Returns a mutable reference to the value at `path`, creating missing
/// embedded documents on the way when `create` is set.
pub(crate) fn get_mut<'a>(document: &'a mut Document, path: &str, create: bool) -> MapperResult<Option<&'a mut Bson>> {
    let (parent, last) = match path.rsplit_once('.') {
        Some((parent, last)) => (Some(parent), last),
        None => (None, path),
    };

    let container = match parent {
        Some(parent) => match container_mut(document, parent, create)? {
            Some(container) => container,
            None => return Ok(None),
        },
        None => {
            if create && !document.contains_key(last) {
                document.insert(last, Bson::Null);
            }
            return Ok(document.get_mut(last));
        }
    };

    match container {
        Bson::Document(document) => {
            if create && !document.contains_key(last) {
                document.insert(last, Bson::Null);
            }
            Ok(document.get_mut(last))
        }
        Bson::Array(items) => match index_of(last) {
            Some(index) => {
                if create && index >= items.len() {
                    items.resize(index + 1, Bson::Null);
                }
                Ok(items.get_mut(index))
            }
            None => Err(cannot_traverse(path)),
        },
        _ => Err(cannot_traverse(path)),
    }
}

fn container_mut<'a>(document: &'a mut Document, path: &str, create: bool) -> MapperResult<Option<&'a mut Bson>> {
    let Some(value) = get_mut(document, path, create)? else {
        return Ok(None);
    };

    if create && matches!(value, Bson::Null) {
        *value = Bson::Document(Document::new());
    }
    Ok(Some(value))
}

/// Writes `value` at `path`, creating embedded documents as needed.
pub(crate) fn set(document: &mut Document, path: &str, value: Bson) -> MapperResult<()> {
    if path.split('.').any(|segment| segment.starts_with('$')) {
        return Err(MapperError::Backend(format!(
            "positional path '{path}' is not supported by the in-memory store"
        )));
    }

    match get_mut(document, path, true)? {
        Some(slot) => {
            *slot = value;
            Ok(())
        }
        None => Err(cannot_traverse(path)),
    }
}

/// Removes the value at `path`, returning it.
pub(crate) fn remove(document: &mut Document, path: &str) -> MapperResult<Option<Bson>> {
    let Some((parent, last)) = path.rsplit_once('.') else {
        return Ok(document.remove(path));
    };

    Ok(match get_mut(document, parent, false)? {
        Some(Bson::Document(parent)) => parent.remove(last),
        Some(Bson::Array(items)) => match index_of(last) {
            Some(index) if index < items.len() => {
                Some(std::mem::replace(&mut items[index], Bson::Null))
            }
            _ => None,
        },
        _ => None,
    })
}

fn cannot_traverse(path: &str) -> MapperError {
    MapperError::Backend(format!("cannot create field '{path}' inside a non-document value"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_values_traverse_arrays() {
        let document = doc! {
            "items": [{ "sku": "a" }, { "sku": "b" }, 3],
            "address": { "city": "Oslo" },
        };

        assert_eq!(
            values_at(&document, "items.sku"),
            vec![&Bson::String("a".into()), &Bson::String("b".into())]
        );
        assert_eq!(values_at(&document, "items.1.sku"), vec![&Bson::String("b".into())]);
        assert_eq!(values_at(&document, "address.city"), vec![&Bson::String("Oslo".into())]);
        assert!(values_at(&document, "address.zip").is_empty());
    }

    #[test]
    fn test_set_creates_embedded_documents() {
        let mut document = doc! { "a": 1 };

        set(&mut document, "b.c.d", Bson::Int32(2)).unwrap();
        set(&mut document, "a", Bson::Int32(3)).unwrap();

        assert_eq!(document, doc! { "a": 3, "b": { "c": { "d": 2 } } });
        assert!(set(&mut document, "a.x", Bson::Int32(1)).is_err());
    }

    #[test]
    fn test_remove_and_get() {
        let mut document = doc! { "a": { "b": 1, "c": 2 }, "list": [1, 2] };

        assert_eq!(remove(&mut document, "a.b").unwrap(), Some(Bson::Int32(1)));
        assert_eq!(remove(&mut document, "a.zzz").unwrap(), None);
        assert_eq!(get(&document, "list.1"), Some(&Bson::Int32(2)));
        assert_eq!(document, doc! { "a": { "c": 2 }, "list": [1, 2] });
    }
}
