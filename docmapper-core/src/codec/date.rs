//! Date and time codecs.
//!
//! * [`date`](self) maps `chrono::DateTime<Utc>` to a BSON date.
//! * [`calendar`] maps `chrono::DateTime<FixedOffset>` to a BSON date. The
//!   offset is not stored, values read back are expressed in UTC.
//! * [`instant`] maps `std::time::SystemTime` to a BSON date, or to an `Int64`
//!   count of nanoseconds since the epoch when the mapper is built with
//!   `instants_as_numbers`.
//!
//! BSON dates have millisecond precision; anything finer is truncated on write.

use bson::{Bson, DateTime};
use chrono::{SecondsFormat, TimeZone, Utc};

use super::{CodecContext, FieldCodec, with_module};
use crate::error::{MapperError, MapperResult};

pub const NAME: &str = "date";
with_module!("date");

/// RFC 3339 text ⇄ BSON date.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateCodec;

impl FieldCodec for DateCodec {
    fn name(&self) -> &'static str {
        NAME
    }

    fn to_native(&self, value: Bson, _context: &CodecContext) -> MapperResult<Bson> {
        native_date(value, "expected a date")
    }

    fn from_native(&self, value: &Bson, _context: &CodecContext) -> MapperResult<Bson> {
        match value {
            Bson::DateTime(date) => rfc3339(*date, value),
            Bson::String(_) => Ok(value.clone()),
            other => Err(MapperError::mapping(other, "expected a date")),
        }
    }
}

/// Offset-carrying date ⇄ BSON date.
pub mod calendar {
    use bson::Bson;

    use super::super::{CodecContext, FieldCodec, with_module};
    use super::{native_date, rfc3339};
    use crate::error::{MapperError, MapperResult};

    pub const NAME: &str = "calendar";
    with_module!("calendar");

    #[derive(Debug, Clone, Copy, Default)]
    pub struct CalendarCodec;

    impl FieldCodec for CalendarCodec {
        fn name(&self) -> &'static str {
            NAME
        }

        fn to_native(&self, value: Bson, _context: &CodecContext) -> MapperResult<Bson> {
            native_date(value, "expected a calendar date")
        }

        fn from_native(&self, value: &Bson, _context: &CodecContext) -> MapperResult<Bson> {
            match value {
                Bson::DateTime(date) => rfc3339(*date, value),
                Bson::String(_) => Ok(value.clone()),
                other => Err(MapperError::mapping(other, "expected a calendar date")),
            }
        }
    }
}

/// `SystemTime` ⇄ BSON date or nanosecond count.
pub mod instant {
    use bson::{Bson, DateTime, Document};

    use super::super::{CodecContext, FieldCodec, with_module};
    use crate::error::{MapperError, MapperResult};

    pub const NAME: &str = "instant";

    const SECS: &str = "secs_since_epoch";
    const NANOS: &str = "nanos_since_epoch";

    with_module!("instant");

    #[derive(Debug, Clone, Copy, Default)]
    pub struct InstantCodec;

    impl FieldCodec for InstantCodec {
        fn name(&self) -> &'static str {
            NAME
        }

        fn to_native(&self, value: Bson, context: &CodecContext) -> MapperResult<Bson> {
            let nanos = match &value {
                Bson::Document(parts) => nanos_from_parts(parts)
                    .ok_or_else(|| MapperError::mapping(&value, "expected an instant"))?,
                Bson::DateTime(date) => i128::from(date.timestamp_millis()) * 1_000_000,
                Bson::Int64(nanos) => i128::from(*nanos),
                other => return Err(MapperError::mapping(other, "expected an instant")),
            };

            if context.instants_as_numbers() {
                i64::try_from(nanos)
                    .map(Bson::Int64)
                    .map_err(|_| MapperError::mapping(&value, "instant out of range for nanoseconds"))
            } else {
                i64::try_from(nanos.div_euclid(1_000_000))
                    .map(|millis| Bson::DateTime(DateTime::from_millis(millis)))
                    .map_err(|_| MapperError::mapping(&value, "instant out of range for a date"))
            }
        }

        fn from_native(&self, value: &Bson, _context: &CodecContext) -> MapperResult<Bson> {
            let nanos = match value {
                Bson::DateTime(date) => i128::from(date.timestamp_millis()) * 1_000_000,
                Bson::Int64(nanos) => i128::from(*nanos),
                Bson::Document(_) => return Ok(value.clone()),
                other => return Err(MapperError::mapping(other, "expected an instant")),
            };

            if nanos < 0 {
                return Err(MapperError::mapping(value, "instants before the epoch are not supported"));
            }

            let secs = i64::try_from(nanos / 1_000_000_000)
                .map_err(|_| MapperError::mapping(value, "instant out of range"))?;
            let subsec = (nanos % 1_000_000_000) as i64;

            let mut parts = Document::new();
            parts.insert(SECS, secs);
            parts.insert(NANOS, subsec);

            Ok(Bson::Document(parts))
        }
    }

    fn nanos_from_parts(parts: &Document) -> Option<i128> {
        let secs = integer(parts.get(SECS)?)?;
        let nanos = integer(parts.get(NANOS)?)?;

        Some(secs * 1_000_000_000 + nanos)
    }

    fn integer(value: &Bson) -> Option<i128> {
        match value {
            Bson::Int32(v) => Some(i128::from(*v)),
            Bson::Int64(v) => Some(i128::from(*v)),
            _ => None,
        }
    }
}

/// Converts RFC 3339 text, epoch milliseconds or an extended JSON `$date`
/// literal into a native date.
fn native_date(value: Bson, expected: &str) -> MapperResult<Bson> {
    match value {
        Bson::DateTime(_) => Ok(value),
        Bson::String(ref text) => chrono::DateTime::parse_from_rfc3339(text)
            .map(|parsed| Bson::DateTime(DateTime::from_millis(parsed.timestamp_millis())))
            .map_err(|e| MapperError::Mapping {
                type_name: "String".into(),
                message: format!("'{text}' is not an RFC 3339 date: {e}"),
            }),
        Bson::Int64(millis) => Ok(Bson::DateTime(DateTime::from_millis(millis))),
        Bson::Document(ref literal) => match literal.get("$date") {
            Some(Bson::Int64(millis)) => Ok(Bson::DateTime(DateTime::from_millis(*millis))),
            Some(Bson::String(text)) => native_date(Bson::String(text.clone()), expected),
            Some(Bson::Document(long)) => match long.get("$numberLong") {
                Some(Bson::String(millis)) => millis
                    .parse::<i64>()
                    .map(|millis| Bson::DateTime(DateTime::from_millis(millis)))
                    .map_err(|_| MapperError::mapping(&value, expected.to_string())),
                _ => Err(MapperError::mapping(&value, expected.to_string())),
            },
            _ => Err(MapperError::mapping(&value, expected.to_string())),
        },
        other => Err(MapperError::mapping(&other, expected.to_string())),
    }
}

/// Formats a native date as RFC 3339 text in UTC.
fn rfc3339(date: DateTime, original: &Bson) -> MapperResult<Bson> {
    Utc.timestamp_millis_opt(date.timestamp_millis())
        .single()
        .map(|date| Bson::String(date.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
        .ok_or_else(|| MapperError::mapping(original, "date out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_date_round_trip() {
        let context = CodecContext::default();
        let text = Bson::String("2024-03-01T12:30:45.123Z".into());

        let native = DateCodec.to_native(text.clone(), &context).unwrap();
        assert_eq!(native, Bson::DateTime(DateTime::from_millis(1_709_296_245_123)));
        assert_eq!(DateCodec.from_native(&native, &context).unwrap(), text);
        assert_eq!(DateCodec.to_native(native.clone(), &context).unwrap(), native);
    }

    #[test]
    fn test_calendar_keeps_the_instant() {
        let context = CodecContext::default();
        let native = calendar::CalendarCodec
            .to_native(Bson::String("2024-03-01T14:30:45.123+02:00".into()), &context)
            .unwrap();

        assert_eq!(native, Bson::DateTime(DateTime::from_millis(1_709_296_245_123)));
        assert_eq!(
            calendar::CalendarCodec.from_native(&native, &context).unwrap(),
            Bson::String("2024-03-01T12:30:45.123Z".into())
        );
    }

    #[test]
    fn test_instant_honours_the_numeric_flag() {
        let parts = Bson::Document(doc! { "secs_since_epoch": 10_i64, "nanos_since_epoch": 5_i64 });

        let as_date = instant::InstantCodec
            .to_native(parts.clone(), &CodecContext::new(false))
            .unwrap();
        assert_eq!(as_date, Bson::DateTime(DateTime::from_millis(10_000)));

        let as_number = instant::InstantCodec
            .to_native(parts.clone(), &CodecContext::new(true))
            .unwrap();
        assert_eq!(as_number, Bson::Int64(10_000_000_005));
        assert_eq!(
            instant::InstantCodec
                .from_native(&as_number, &CodecContext::new(true))
                .unwrap(),
            parts
        );
    }

    #[test]
    fn test_unparseable_text_is_a_mapping_error() {
        let err = DateCodec
            .to_native(Bson::String("yesterday".into()), &CodecContext::default())
            .unwrap_err();

        assert!(matches!(err, MapperError::Mapping { .. }));
    }
}
