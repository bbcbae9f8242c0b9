//! Sort and projection specifications.
//!
//! Both are plain field maps and never involve codecs.

use bson::Document;

/// An ordered list of sort keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortSpec {
    keys: Document,
}

impl SortSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ascending(mut self, field: &str) -> Self {
        self.keys.insert(field, 1);
        self
    }

    pub fn descending(mut self, field: &str) -> Self {
        self.keys.insert(field, -1);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn to_document(&self) -> Document {
        self.keys.clone()
    }
}

impl From<SortSpec> for Document {
    fn from(spec: SortSpec) -> Self {
        spec.keys
    }
}

/// Fields to include in or exclude from returned documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projection {
    fields: Document,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, field: &str) -> Self {
        self.fields.insert(field, 1);
        self
    }

    pub fn exclude(mut self, field: &str) -> Self {
        self.fields.insert(field, 0);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_document(&self) -> Document {
        self.fields.clone()
    }
}

impl From<Projection> for Document {
    fn from(projection: Projection) -> Self {
        projection.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_keys_keep_their_order() {
        let sort = SortSpec::new().descending("age").ascending("name");
        let keys: Vec<_> = sort.to_document().keys().cloned().collect();

        assert_eq!(keys, vec!["age".to_string(), "name".to_string()]);
        assert_eq!(sort.to_document(), doc! { "age": -1, "name": 1 });
    }

    #[test]
    fn test_projection() {
        let projection = Projection::new().include("name").exclude("_id");

        assert_eq!(Document::from(projection), doc! { "name": 1, "_id": 0 });
    }
}
