//! Conversions between SQLite rows and typed queue values.
//!
//! This is the only place that knows how a [`Job`] or [`DeadLetter`] is laid
//! out on disk.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::queue::dead_letter::DeadLetter;
use crate::queue::job::Job;

pub(crate) const JOB_COLUMNS: &str = "id, command, payload, mode, state, attempts, max_retries, \
     created_at, updated_at, last_error, result";

pub(crate) const DEAD_LETTER_COLUMNS: &str =
    "id, command, payload, mode, attempts, max_retries, created_at, updated_at, last_error";

/// Fixed-width RFC 3339 so that text order equals time order.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| QueueError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

pub(crate) fn encode_payload(payload: &Option<Map<String, Value>>) -> Result<Option<String>> {
    payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(QueueError::from)
}

fn decode_payload(raw: Option<String>) -> Result<Option<Map<String, Value>>> {
    match raw {
        None => Ok(None),
        Some(text) => match serde_json::from_str::<Value>(&text)? {
            Value::Object(map) => Ok(Some(map)),
            Value::Null => Ok(None),
            other => Err(QueueError::Corrupt(format!(
                "payload is not an object: {other}"
            ))),
        },
    }
}

pub(crate) fn encode_result(result: &Option<Value>) -> Result<Option<String>> {
    result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(QueueError::from)
}

fn decode_result(raw: Option<String>) -> Result<Option<Value>> {
    raw.map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(QueueError::from)
}

fn decode_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| QueueError::Corrupt(format!("bad job id {raw:?}: {e}")))
}

fn decode_count(row: &SqliteRow, column: &str) -> Result<u32> {
    let value: i64 = row.try_get(column)?;
    u32::try_from(value).map_err(|_| QueueError::Corrupt(format!("{column} out of range: {value}")))
}

pub(crate) fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let payload = decode_payload(row.try_get("payload")?)?;
    let result = decode_result(row.try_get("result")?)?;
    job_with(row, payload, result)
}

/// Decode a claimed row, dropping a payload or result that cannot be decoded
/// instead of failing. The second value describes what was dropped.
pub(crate) fn salvage_job_from_row(row: &SqliteRow) -> Result<(Job, Option<String>)> {
    let mut defects = Vec::new();
    let payload = decode_payload(row.try_get("payload")?).unwrap_or_else(|e| {
        defects.push(format!("payload: {e}"));
        None
    });
    let result = decode_result(row.try_get("result")?).unwrap_or_else(|e| {
        defects.push(format!("result: {e}"));
        None
    });
    let job = job_with(row, payload, result)?;
    let defect = (!defects.is_empty()).then(|| defects.join("; "));
    Ok((job, defect))
}

fn job_with(
    row: &SqliteRow,
    payload: Option<Map<String, Value>>,
    result: Option<Value>,
) -> Result<Job> {
    let id: String = row.try_get("id")?;
    let mode: String = row.try_get("mode")?;
    let state: String = row.try_get("state")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Job {
        id: decode_id(&id)?,
        command: row.try_get("command")?,
        payload,
        mode: mode.parse()?,
        state: state.parse()?,
        attempts: decode_count(row, "attempts")?,
        max_retries: decode_count(row, "max_retries")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        last_error: row.try_get("last_error")?,
        result,
    })
}

pub(crate) fn dead_letter_from_row(row: &SqliteRow) -> Result<DeadLetter> {
    let id: String = row.try_get("id")?;
    let mode: String = row.try_get("mode")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(DeadLetter {
        id: decode_id(&id)?,
        command: row.try_get("command")?,
        payload: decode_payload(row.try_get("payload")?)?,
        mode: mode.parse()?,
        attempts: decode_count(row, "attempts")?,
        max_retries: decode_count(row, "max_retries")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        last_error: row.try_get("last_error")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_are_fixed_width() {
        let whole = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let fractional = whole + chrono::Duration::microseconds(1500);
        let a = format_timestamp(&whole);
        let b = format_timestamp(&fractional);
        assert_eq!(a, "2024-05-01T12:00:00.000000Z");
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_timestamp(&b).unwrap(), fractional);
    }

    #[test]
    fn payload_must_be_an_object() {
        assert!(decode_payload(Some("[1, 2]".to_string())).is_err());
        assert!(decode_payload(Some("{\"a\": 1}".to_string()))
            .unwrap()
            .is_some());
        assert!(decode_payload(Some("null".to_string())).unwrap().is_none());
        assert!(decode_payload(None).unwrap().is_none());
    }
}
