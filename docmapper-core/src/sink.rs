//! Token-level writer that builds native BSON values in memory.
//!
//! [`BsonSink`] accepts the same call sequence a streaming JSON generator would
//! (start/end object, field name, scalar writes, ...) but assembles a
//! [`Bson`] tree directly, so no textual intermediate is ever produced and
//! driver-native values (object ids, dates, decimals, binaries) keep their
//! exact representation.
//!
//! # Example
//!
//! ```ignore
//! use docmapper_core::sink::BsonSink;
//!
//! let mut sink = BsonSink::new();
//! sink.write_start_object()?;
//! sink.write_field_name("name")?;
//! sink.write_string("Alice")?;
//! sink.write_end_object()?;
//!
//! let document = sink.into_document()?;
//! ```

use bson::{Binary, Bson, Document, spec::BinarySubtype};

use crate::error::{MapperError, MapperResult};

/// An in-progress container on the sink's stack.
#[derive(Debug)]
enum Frame {
    Object {
        document: Document,
        pending: Option<String>,
    },
    Array(Vec<Bson>),
}

impl Frame {
    fn kind(&self) -> &'static str {
        match self {
            Frame::Object { .. } => "object",
            Frame::Array(_) => "array",
        }
    }
}

/// Single-pass write cursor over a document under construction.
///
/// The sink owns its frames exclusively. Nested containers are attached to
/// their parent frame when they are closed, so only the outermost value is
/// ever materialized as a standalone root.
#[derive(Debug, Default)]
pub struct BsonSink {
    stack: Vec<Frame>,
    root: Option<Bson>,
}

impl BsonSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once a complete root value has been written.
    pub fn is_complete(&self) -> bool {
        self.stack.is_empty() && self.root.is_some()
    }

    /// Returns the current nesting depth.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Opens a new object frame.
    ///
    /// # Errors
    ///
    /// Fails when the current frame has no slot for a value.
    pub fn write_start_object(&mut self) -> MapperResult<()> {
        self.ensure_slot()?;
        self.stack.push(Frame::Object {
            document: Document::new(),
            pending: None,
        });
        Ok(())
    }

    /// Closes the current object frame and attaches it to its parent.
    ///
    /// # Errors
    ///
    /// Fails when no frame is open, when the open frame is an array, or when a
    /// field name was written without a value.
    pub fn write_end_object(&mut self) -> MapperResult<()> {
        self.write_end_object_with(|document| Ok(Bson::Document(document)))
    }

    /// Closes the current object frame and attaches whatever `finish` builds from it.
    ///
    /// Used by serializers that collect a structured representation first and
    /// replace it with a native value (for example an extended JSON `$oid`
    /// document turned back into an object id).
    pub fn write_end_object_with<F>(&mut self, finish: F) -> MapperResult<()>
    where
        F: FnOnce(Document) -> MapperResult<Bson>,
    {
        match self.stack.pop() {
            Some(Frame::Object { document, pending: None }) => {
                let value = finish(document)?;
                self.attach(value)
            }
            Some(Frame::Object { pending: Some(name), .. }) => Err(MapperError::Structure(format!(
                "field '{name}' has no value at the end of its object"
            ))),
            Some(frame) => Err(MapperError::Structure(format!(
                "cannot close an object while an {} is open",
                frame.kind()
            ))),
            None => Err(MapperError::Structure("no open object to close".into())),
        }
    }

    /// Opens a new array frame.
    ///
    /// # Errors
    ///
    /// Fails when the current frame has no slot for a value.
    pub fn write_start_array(&mut self) -> MapperResult<()> {
        self.ensure_slot()?;
        self.stack.push(Frame::Array(Vec::new()));
        Ok(())
    }

    /// Closes the current array frame and attaches it to its parent.
    ///
    /// # Errors
    ///
    /// Fails when no frame is open or when the open frame is an object.
    pub fn write_end_array(&mut self) -> MapperResult<()> {
        match self.stack.pop() {
            Some(Frame::Array(values)) => self.attach(Bson::Array(values)),
            Some(frame) => Err(MapperError::Structure(format!(
                "cannot close an array while an {} is open",
                frame.kind()
            ))),
            None => Err(MapperError::Structure("no open array to close".into())),
        }
    }

    /// Remembers the key of the next value written into the current object.
    ///
    /// # Errors
    ///
    /// Fails when the current frame is an array, when no frame is open, or when
    /// the previous field name is still waiting for its value.
    pub fn write_field_name(&mut self, name: impl Into<String>) -> MapperResult<()> {
        let name = name.into();

        match self.stack.last_mut() {
            Some(Frame::Object { pending: pending @ None, .. }) => {
                *pending = Some(name);
                Ok(())
            }
            Some(Frame::Object { pending: Some(previous), .. }) => Err(MapperError::Structure(format!(
                "field name '{name}' written while '{previous}' still has no value"
            ))),
            Some(Frame::Array(_)) => Err(MapperError::Structure(format!(
                "field name '{name}' written inside an array"
            ))),
            None => Err(MapperError::Structure(format!(
                "field name '{name}' written outside of an object"
            ))),
        }
    }

    pub fn write_string(&mut self, value: impl Into<String>) -> MapperResult<()> {
        self.attach(Bson::String(value.into()))
    }

    pub fn write_i32(&mut self, value: i32) -> MapperResult<()> {
        self.attach(Bson::Int32(value))
    }

    pub fn write_i64(&mut self, value: i64) -> MapperResult<()> {
        self.attach(Bson::Int64(value))
    }

    pub fn write_f64(&mut self, value: f64) -> MapperResult<()> {
        self.attach(Bson::Double(value))
    }

    pub fn write_bool(&mut self, value: bool) -> MapperResult<()> {
        self.attach(Bson::Boolean(value))
    }

    pub fn write_null(&mut self) -> MapperResult<()> {
        self.attach(Bson::Null)
    }

    /// Writes a generic binary value.
    pub fn write_binary(&mut self, bytes: &[u8]) -> MapperResult<()> {
        self.attach(Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: bytes.to_vec(),
        }))
    }

    /// Writes a value verbatim, whatever its shape.
    pub fn write_raw(&mut self, value: Bson) -> MapperResult<()> {
        self.attach(value)
    }

    /// Writes an embedded native value that bypasses generic mapping.
    ///
    /// Codecs that already hold a driver-native value (an object id, a date, a
    /// reference document) hand it to the sink through this method.
    pub fn write_object(&mut self, value: Bson) -> MapperResult<()> {
        self.attach(value)
    }

    /// Returns the finished root value.
    ///
    /// # Errors
    ///
    /// Fails when frames are still open or nothing has been written.
    pub fn into_value(self) -> MapperResult<Bson> {
        if let Some(frame) = self.stack.last() {
            return Err(MapperError::Structure(format!(
                "{} frame(s) still open, innermost is an {}",
                self.stack.len(),
                frame.kind()
            )));
        }

        self.root
            .ok_or_else(|| MapperError::Structure("nothing has been written".into()))
    }

    /// Returns the finished root value, which must be a document.
    pub fn into_document(self) -> MapperResult<Document> {
        match self.into_value()? {
            Bson::Document(document) => Ok(document),
            other => Err(MapperError::mapping(&other, "expected a document at the root")),
        }
    }

    fn ensure_slot(&self) -> MapperResult<()> {
        match self.stack.last() {
            Some(Frame::Object { pending: None, .. }) => Err(MapperError::Structure(
                "value written into an object without a field name".into(),
            )),
            None if self.root.is_some() => Err(MapperError::Structure(
                "a root value has already been written".into(),
            )),
            _ => Ok(()),
        }
    }

    fn attach(&mut self, value: Bson) -> MapperResult<()> {
        match self.stack.last_mut() {
            Some(Frame::Object { document, pending }) => match pending.take() {
                Some(name) => {
                    document.insert(name, value);
                    Ok(())
                }
                None => Err(MapperError::Structure(
                    "value written into an object without a field name".into(),
                )),
            },
            Some(Frame::Array(values)) => {
                values.push(value);
                Ok(())
            }
            None if self.root.is_some() => Err(MapperError::Structure(
                "a root value has already been written".into(),
            )),
            None => {
                self.root = Some(value);
                Ok(())
            }
        }
    }
}
