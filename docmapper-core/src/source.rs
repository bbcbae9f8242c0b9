//! Token-level reader over native BSON values.
//!
//! [`BsonSource`] walks an existing [`Bson`] tree and reports one token at a
//! time, following document key order and array index order. Values that have
//! no generic decomposition (object ids, dates, decimals, timestamps, UUID
//! binaries, ...) are reported as [`Token::Embedded`] and can be fetched as-is
//! with [`BsonSource::embedded_object`], which is how codecs intercept them
//! before any generic traversal happens.
//!
//! A source only ever borrows the tree, so any number of sources can read the
//! same document at once.

use std::sync::Arc;

use bson::{Binary, Bson, Document, spec::BinarySubtype};

use crate::error::{MapperError, MapperResult};

/// The kind of the token a source is positioned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    StartObject,
    EndObject,
    StartArray,
    EndArray,
    FieldName,
    String,
    Int32,
    Int64,
    Double,
    Boolean,
    Null,
    Binary,
    /// A native value without a generic decomposition.
    Embedded,
}

impl Token {
    /// Returns `true` for tokens that carry a complete value or open one.
    pub fn is_value(&self) -> bool {
        !matches!(self, Token::EndObject | Token::EndArray | Token::FieldName)
    }
}

/// A numeric value read from the current token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int32(i32),
    Int64(i64),
    Double(f64),
}

#[derive(Debug, Clone)]
enum Frame<'a> {
    Object {
        entries: Arc<[(&'a str, &'a Bson)]>,
        index: usize,
        value_pending: bool,
    },
    Array {
        values: &'a [Bson],
        index: usize,
    },
}

#[derive(Debug, Clone, Copy)]
enum Root<'a> {
    Value(&'a Bson),
    Document(&'a Document),
}

/// Read cursor over a borrowed BSON value.
#[derive(Debug, Clone)]
pub struct BsonSource<'a> {
    root: Root<'a>,
    started: bool,
    stack: Vec<Frame<'a>>,
    token: Option<Token>,
    current_name: Option<&'a str>,
    current_value: Option<&'a Bson>,
}

impl<'a> BsonSource<'a> {
    /// Creates a source positioned before the first token of `root`.
    pub fn new(root: &'a Bson) -> Self {
        Self::with_root(Root::Value(root))
    }

    /// Creates a source over a document that is not wrapped in a [`Bson`].
    ///
    /// The root of such a source has no [`current_value`](Self::current_value),
    /// so it can be walked token by token but not taken whole.
    pub fn from_document(root: &'a Document) -> Self {
        Self::with_root(Root::Document(root))
    }

    fn with_root(root: Root<'a>) -> Self {
        Self {
            root,
            started: false,
            stack: Vec::new(),
            token: None,
            current_name: None,
            current_value: None,
        }
    }

    /// Advances to the next token and returns its kind, or `None` once the
    /// root value has been fully consumed.
    pub fn next_token(&mut self) -> Option<Token> {
        let token = self.advance();
        self.token = token;
        token
    }

    /// Returns the kind of the next token without consuming it.
    pub fn peek_token(&self) -> Option<Token> {
        self.clone().advance()
    }

    /// Returns the value the next token opens or carries, without consuming it.
    pub fn peek_value(&self) -> Option<&'a Bson> {
        let mut ahead = self.clone();
        ahead.next_token()?;
        ahead.current_value()
    }

    /// The kind of the token the source is positioned on.
    pub fn current_token(&self) -> Option<Token> {
        self.token
    }

    /// The field name of the current field or value, `None` inside arrays and
    /// at the root.
    pub fn current_name(&self) -> Option<&'a str> {
        self.current_name
    }

    /// The value of the current token. For start tokens this is the whole
    /// container.
    pub fn current_value(&self) -> Option<&'a Bson> {
        match self.token {
            Some(token) if token.is_value() => self.current_value,
            _ => None,
        }
    }

    /// The current string value.
    pub fn text(&self) -> Option<&'a str> {
        match self.current_value()? {
            Bson::String(text) => Some(text.as_str()),
            _ => None,
        }
    }

    /// The current numeric value.
    pub fn number_value(&self) -> Option<Number> {
        match self.current_value()? {
            Bson::Int32(v) => Some(Number::Int32(*v)),
            Bson::Int64(v) => Some(Number::Int64(*v)),
            Bson::Double(v) => Some(Number::Double(*v)),
            _ => None,
        }
    }

    /// The current boolean value.
    pub fn bool_value(&self) -> Option<bool> {
        match self.current_value()? {
            Bson::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// The bytes of the current generic binary value.
    pub fn binary_value(&self) -> Option<&'a [u8]> {
        match self.current_value()? {
            Bson::Binary(binary) => Some(binary.bytes.as_slice()),
            _ => None,
        }
    }

    /// The current native value, when the current token is [`Token::Embedded`].
    pub fn embedded_object(&self) -> Option<&'a Bson> {
        match self.token {
            Some(Token::Embedded) => self.current_value,
            _ => None,
        }
    }

    /// Skips the contents of the container the source just entered.
    ///
    /// After the call the source is positioned on the matching end token. On
    /// any other token this is a no-op.
    pub fn skip_children(&mut self) {
        match self.token {
            Some(Token::StartObject) => {
                self.stack.pop();
                self.token = Some(Token::EndObject);
            }
            Some(Token::StartArray) => {
                self.stack.pop();
                self.token = Some(Token::EndArray);
            }
            _ => {}
        }
    }

    /// Returns an independent source scoped to the current value.
    ///
    /// # Errors
    ///
    /// Fails when the source is not positioned on a value.
    pub fn subtree(&self) -> MapperResult<BsonSource<'a>> {
        self.current_value()
            .map(BsonSource::new)
            .ok_or_else(|| MapperError::Structure("no current value to read as a subtree".into()))
    }

    /// Advances to the next value and consumes it whole, returning the value.
    ///
    /// # Errors
    ///
    /// Fails when the next token does not start a value.
    pub fn next_value(&mut self) -> MapperResult<&'a Bson> {
        match self.next_token() {
            Some(token) if token.is_value() => {
                let value = self
                    .current_value
                    .ok_or_else(|| MapperError::Structure("value token without a value".into()))?;
                self.skip_children();
                Ok(value)
            }
            Some(token) => Err(MapperError::Structure(format!(
                "expected a value, found {token:?}"
            ))),
            None => Err(MapperError::Structure("source is exhausted".into())),
        }
    }

    /// Advances past the next value, skipping its contents.
    ///
    /// # Errors
    ///
    /// Fails when the next token does not start a value.
    pub fn skip_value(&mut self) -> MapperResult<()> {
        match self.next_token() {
            Some(token) if token.is_value() => {
                self.skip_children();
                Ok(())
            }
            Some(token) => Err(MapperError::Structure(format!(
                "expected a value, found {token:?}"
            ))),
            None => Err(MapperError::Structure("source is exhausted".into())),
        }
    }

    fn advance(&mut self) -> Option<Token> {
        if !self.started {
            self.started = true;
            self.current_name = None;
            return Some(match self.root {
                Root::Value(value) => self.enter(value),
                Root::Document(document) => {
                    self.current_value = None;
                    self.open_object(document);
                    Token::StartObject
                }
            });
        }

        match self.stack.last_mut()? {
            Frame::Object {
                entries,
                index,
                value_pending,
            } => {
                if *value_pending {
                    let (_, value) = entries[*index];
                    *index += 1;
                    *value_pending = false;
                    Some(self.enter(value))
                } else if let Some((name, value)) = entries.get(*index).copied() {
                    *value_pending = true;
                    self.current_name = Some(name);
                    self.current_value = Some(value);
                    Some(Token::FieldName)
                } else {
                    self.stack.pop();
                    self.current_value = None;
                    self.current_name = self.parent_name();
                    Some(Token::EndObject)
                }
            }
            Frame::Array { values, index } => {
                let values: &'a [Bson] = *values;
                if let Some(value) = values.get(*index) {
                    *index += 1;
                    self.current_name = None;
                    Some(self.enter(value))
                } else {
                    self.stack.pop();
                    self.current_value = None;
                    self.current_name = self.parent_name();
                    Some(Token::EndArray)
                }
            }
        }
    }

    fn enter(&mut self, value: &'a Bson) -> Token {
        self.current_value = Some(value);

        match value {
            Bson::Document(document) => {
                self.open_object(document);
                Token::StartObject
            }
            Bson::Array(values) => {
                self.stack.push(Frame::Array {
                    values: values.as_slice(),
                    index: 0,
                });
                Token::StartArray
            }
            Bson::String(_) => Token::String,
            Bson::Int32(_) => Token::Int32,
            Bson::Int64(_) => Token::Int64,
            Bson::Double(_) => Token::Double,
            Bson::Boolean(_) => Token::Boolean,
            Bson::Null => Token::Null,
            Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                ..
            }) => Token::Binary,
            _ => Token::Embedded,
        }
    }

    fn open_object(&mut self, document: &'a Document) {
        self.stack.push(Frame::Object {
            entries: entries(document),
            index: 0,
            value_pending: false,
        });
    }

    /// Name of the field holding the innermost open object's pending value.
    fn parent_name(&self) -> Option<&'a str> {
        match self.stack.last()? {
            Frame::Object { entries, index, .. } => index
                .checked_sub(1)
                .and_then(|held| entries.get(held))
                .map(|(name, _)| *name),
            Frame::Array { .. } => None,
        }
    }
}

fn entries(document: &Document) -> Arc<[(&str, &Bson)]> {
    document
        .iter()
        .map(|(name, value)| {
            let name: &str = name;
            (name, value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{DateTime, doc, oid::ObjectId};
    use pretty_assertions::assert_eq;

    use crate::sink::BsonSink;

    /// Copies every token of `source` into `sink`.
    fn replay(source: &mut BsonSource<'_>, sink: &mut BsonSink) {
        while let Some(token) = source.next_token() {
            match token {
                Token::StartObject => sink.write_start_object().unwrap(),
                Token::EndObject => sink.write_end_object().unwrap(),
                Token::StartArray => sink.write_start_array().unwrap(),
                Token::EndArray => sink.write_end_array().unwrap(),
                Token::FieldName => sink.write_field_name(source.current_name().unwrap()).unwrap(),
                Token::String => sink.write_string(source.text().unwrap()).unwrap(),
                Token::Int32 | Token::Int64 | Token::Double => match source.number_value().unwrap() {
                    Number::Int32(v) => sink.write_i32(v).unwrap(),
                    Number::Int64(v) => sink.write_i64(v).unwrap(),
                    Number::Double(v) => sink.write_f64(v).unwrap(),
                },
                Token::Boolean => sink.write_bool(source.bool_value().unwrap()).unwrap(),
                Token::Null => sink.write_null().unwrap(),
                Token::Binary => sink.write_binary(source.binary_value().unwrap()).unwrap(),
                Token::Embedded => sink
                    .write_object(source.embedded_object().unwrap().clone())
                    .unwrap(),
            }
        }
    }

    #[test]
    fn test_replay_reproduces_the_document() {
        let original = Bson::Document(doc! {
            "_id": ObjectId::new(),
            "name": "Alice",
            "age": 30,
            "score": 1.5,
            "big": 5_i64,
            "active": true,
            "nothing": null,
            "when": DateTime::from_millis(7),
            "tags": ["a", { "deep": [1, 2] }, []],
            "empty": {},
        });

        let mut source = BsonSource::new(&original);
        let mut sink = BsonSink::new();
        replay(&mut source, &mut sink);

        assert_eq!(sink.into_value().unwrap(), original);
    }

    #[test]
    fn test_token_sequence_and_names() {
        let value = Bson::Document(doc! { "a": 1, "b": ["x"] });
        let mut source = BsonSource::new(&value);

        let mut seen = Vec::new();
        while let Some(token) = source.next_token() {
            seen.push((token, source.current_name()));
        }

        assert_eq!(
            seen,
            vec![
                (Token::StartObject, None),
                (Token::FieldName, Some("a")),
                (Token::Int32, Some("a")),
                (Token::FieldName, Some("b")),
                (Token::StartArray, Some("b")),
                (Token::String, None),
                (Token::EndArray, Some("b")),
                (Token::EndObject, None),
            ]
        );
    }

    #[test]
    fn test_peek_does_not_consume() {
        let value = Bson::Document(doc! { "a": 1 });
        let mut source = BsonSource::new(&value);

        assert_eq!(source.peek_token(), Some(Token::StartObject));
        assert_eq!(source.next_token(), Some(Token::StartObject));
        assert_eq!(source.peek_token(), Some(Token::FieldName));
        assert_eq!(source.peek_token(), Some(Token::FieldName));
    }

    #[test]
    fn test_embedded_and_subtree() {
        let id = ObjectId::new();
        let value = Bson::Document(doc! { "id": id, "child": { "x": 1 } });
        let mut source = BsonSource::new(&value);

        source.next_token();
        source.next_token();
        assert_eq!(source.next_token(), Some(Token::Embedded));
        assert_eq!(source.embedded_object(), Some(&Bson::ObjectId(id)));

        source.next_token();
        assert_eq!(source.next_token(), Some(Token::StartObject));
        let mut child = source.subtree().unwrap();
        assert_eq!(child.next_value().unwrap(), &Bson::Document(doc! { "x": 1 }));

        source.skip_children();
        assert_eq!(source.next_token(), Some(Token::EndObject));
        assert_eq!(source.next_token(), None);
    }

    #[test]
    fn test_document_root_is_walked_without_a_copy() {
        let document = doc! { "a": 1, "b": { "c": "x" } };
        let mut source = BsonSource::from_document(&document);

        assert_eq!(source.next_token(), Some(Token::StartObject));
        assert_eq!(source.current_value(), None);
        assert_eq!(source.next_token(), Some(Token::FieldName));
        assert_eq!(source.peek_value(), Some(&Bson::Int32(1)));
        source.skip_value().unwrap();
        assert_eq!(source.next_token(), Some(Token::FieldName));
        source.skip_value().unwrap();
        assert_eq!(source.next_token(), Some(Token::EndObject));
        assert_eq!(source.next_token(), None);
    }

    #[test]
    fn test_scalar_root() {
        let value = Bson::Int64(9);
        let mut source = BsonSource::new(&value);

        assert_eq!(source.next_value().unwrap(), &Bson::Int64(9));
        assert_eq!(source.next_token(), None);
    }
}
