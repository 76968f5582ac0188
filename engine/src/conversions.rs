//! Conversions from source rows and loosely formatted text into typed values.

use std::collections::BTreeMap;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Number, Value as JsonValue};
use sqlx::postgres::PgRow;
use sqlx::{Column, Row, TypeInfo};

use tracing::warn;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::store::SourceBatch;
use crate::types::{DATE_FORMAT, ID_FIELD, RawRecord, RecordId, TIMESTAMP_FORMAT, Value};

/// Date formats accepted when a date column is stored as text.
const DATE_INPUT_FORMATS: &[&str] = &[DATE_FORMAT, "%Y/%m/%d", "%Y%m%d", "%Y.%m.%d"];

/// Timestamp formats accepted when a timestamp column is stored as text.
const TIMESTAMP_INPUT_FORMATS: &[&str] = &[
    TIMESTAMP_FORMAT,
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
];

/// Decodes a source row into a [`RawRecord`].
///
/// The row must carry an integer `id` column. Columns of unsupported types are decoded as
/// text when possible and as null otherwise.
pub fn pg_row_to_record(row: &PgRow) -> SyncResult<RawRecord> {
    let fields = pg_row_to_fields(row)?;

    let id = match fields.get(ID_FIELD) {
        Some(Value::Int(id)) => *id,
        Some(other) => bail!(
            ErrorKind::ConversionError,
            "Source row has a non-integer id",
            format!("{other:?}")
        ),
        None => bail!(ErrorKind::InvalidData, "Source row has no id column"),
    };

    Ok(RawRecord::from_fields(id, fields))
}

/// Decodes every column of a row by name.
pub fn pg_row_to_fields(row: &PgRow) -> SyncResult<BTreeMap<String, Value>> {
    let mut fields: BTreeMap<String, Value> = BTreeMap::new();

    for column in row.columns() {
        let name = column.name();
        let index = column.ordinal();
        let value: Value = match column.type_info().name() {
            "INT2" => row.try_get::<Option<i16>, _>(index)?.map(i64::from).into(),
            "INT4" => row.try_get::<Option<i32>, _>(index)?.map(i64::from).into(),
            "INT8" => row.try_get::<Option<i64>, _>(index)?.into(),
            "FLOAT4" => row.try_get::<Option<f32>, _>(index)?.map(f64::from).into(),
            "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.into(),
            "NUMERIC" => row.try_get::<Option<BigDecimal>, _>(index)?.into(),
            "BOOL" => row.try_get::<Option<bool>, _>(index)?.into(),
            "DATE" => row.try_get::<Option<NaiveDate>, _>(index)?.into(),
            "TIMESTAMP" => row.try_get::<Option<NaiveDateTime>, _>(index)?.into(),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(index)?
                .map(|timestamp| timestamp.naive_utc())
                .into(),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
                row.try_get::<Option<String>, _>(index)?.into()
            }
            _ => row
                .try_get::<Option<String>, _>(index)
                .ok()
                .flatten()
                .into(),
        };

        fields.insert(name.to_string(), value);
    }

    Ok(fields)
}

/// Decodes rows one by one. Rows that fail are logged and reported as malformed, with their id
/// when it can still be read.
pub fn pg_rows_to_batch(rows: &[PgRow]) -> SourceBatch {
    let mut batch = SourceBatch::default();

    for row in rows {
        match pg_row_to_record(row) {
            Ok(record) => batch.records.push(record),
            Err(err) => {
                let id = pg_row_id(row);
                warn!(record_id = ?id, error = %err, "skipping source row that cannot be decoded");
                batch.malformed.push(id);
            }
        }
    }

    batch
}

/// Reads the integer `id` of a row, whatever its integer width.
fn pg_row_id(row: &PgRow) -> Option<RecordId> {
    if let Ok(id) = row.try_get::<Option<i64>, _>(ID_FIELD) {
        return id;
    }
    if let Ok(id) = row.try_get::<Option<i32>, _>(ID_FIELD) {
        return id.map(i64::from);
    }

    row.try_get::<Option<i16>, _>(ID_FIELD)
        .ok()
        .flatten()
        .map(i64::from)
}

/// Converts a value to JSON for writing through `jsonb_populate_record`.
///
/// Decimals, dates and timestamps become strings in the Postgres input format, so the target
/// column type decides how they are parsed. Non-finite floats become null.
pub fn value_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Bool(value) => JsonValue::Bool(*value),
        Value::Int(value) => JsonValue::Number((*value).into()),
        Value::Float(value) => Number::from_f64(*value)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::Text(value) => JsonValue::String(value.clone()),
        other => JsonValue::String(other.to_string()),
    }
}

/// Converts named values to a JSON object.
pub fn fields_to_json<'a>(
    fields: impl IntoIterator<Item = (&'a String, &'a Value)>,
) -> Map<String, JsonValue> {
    fields
        .into_iter()
        .map(|(name, value)| (name.clone(), value_to_json(value)))
        .collect()
}

/// Parses a date written in one of the accepted formats. A trailing time part is ignored.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if let Some(timestamp) = parse_timestamp(text) {
        return Some(timestamp.date());
    }

    DATE_INPUT_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
}

/// Parses a timestamp written in one of the accepted formats.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    TIMESTAMP_INPUT_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
}

/// Reads a value as a timestamp. Dates get a midnight time; text must parse.
pub fn value_to_timestamp(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::Timestamp(timestamp) => Some(*timestamp),
        Value::Date(date) => date.and_hms_opt(0, 0, 0),
        Value::Text(text) => parse_timestamp(text),
        _ => None,
    }
}

/// Formats a value stored in a date field.
///
/// Text that does not parse falls back to its first 10 characters.
pub fn format_date(value: &Value) -> String {
    match value {
        Value::Date(date) => date.format(DATE_FORMAT).to_string(),
        Value::Timestamp(timestamp) => timestamp.format(DATE_FORMAT).to_string(),
        Value::Text(text) => match parse_date(text) {
            Some(date) => date.format(DATE_FORMAT).to_string(),
            None => text.trim().chars().take(10).collect(),
        },
        other => other.render(),
    }
}

/// Formats a value stored in a timestamp field.
///
/// Dates get a midnight time; unparseable text is passed through trimmed.
pub fn format_timestamp(value: &Value) -> String {
    match value {
        Value::Timestamp(timestamp) => timestamp.format(TIMESTAMP_FORMAT).to_string(),
        Value::Date(date) => date
            .and_hms_opt(0, 0, 0)
            .map(|timestamp| timestamp.format(TIMESTAMP_FORMAT).to_string())
            .unwrap_or_default(),
        Value::Text(text) => match parse_timestamp(text) {
            Some(timestamp) => timestamp.format(TIMESTAMP_FORMAT).to_string(),
            None => text.trim().to_string(),
        },
        other => other.render(),
    }
}
