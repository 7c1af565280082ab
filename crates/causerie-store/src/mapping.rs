//! Shared row-decoding helpers.
//!
//! SQLite hands back TEXT columns; these convert them into the typed model
//! fields, reporting failures as column-level conversion errors so the
//! offending row is identifiable in logs.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use uuid::Uuid;

pub(crate) fn uuid_col(idx: usize, s: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn opt_uuid_col(idx: usize, s: Option<String>) -> rusqlite::Result<Option<Uuid>> {
    s.map(|s| uuid_col(idx, s)).transpose()
}

pub(crate) fn ts_col(idx: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn opt_ts_col(
    idx: usize,
    s: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| ts_col(idx, s)).transpose()
}

pub(crate) fn enum_col<T>(
    idx: usize,
    s: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    parse(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unrecognized enum value: {s}").into(),
        )
    })
}
