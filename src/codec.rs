//! Mapping between [`JobRecord`] and the flat field set stored under each job key.
//!
//! Integers are decimal strings and timestamps are whole epoch seconds. An absent
//! timestamp and a stored `0` both read back as unset.

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::backend::FieldMap;
use crate::types::{JobId, JobRecord};

/// Stored field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Id,
    Priority,
    RunAt,
    Queue,
    Payload,
    FailedAt,
    LockedAt,
    LockedBy,
    Attempts,
    LastError,
}

impl Field {
    pub fn as_str(self) -> &'static str {
        match self {
            Field::Id => "id",
            Field::Priority => "priority",
            Field::RunAt => "run_at",
            Field::Queue => "queue",
            Field::Payload => "payload_object",
            Field::FailedAt => "failed_at",
            Field::LockedAt => "locked_at",
            Field::LockedBy => "locked_by",
            Field::Attempts => "attempts",
            Field::LastError => "last_error",
        }
    }
}

pub(crate) fn field_names(fields: &[Field]) -> Vec<&'static str> {
    fields.iter().map(|f| f.as_str()).collect()
}

/// Drops sub-second precision so in-memory timestamps match what a reload returns.
pub(crate) fn whole_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or(t)
}

pub(crate) fn encode_int(v: i64) -> Vec<u8> {
    v.to_string().into_bytes()
}

pub(crate) fn encode_time(t: DateTime<Utc>) -> Vec<u8> {
    encode_int(t.timestamp())
}

/// Field/value pairs for every field that is set on `record`.
///
/// Unset optional fields are left out rather than written as empty, so a save
/// never removes anything already stored.
pub fn encode(record: &JobRecord) -> Vec<(&'static str, Vec<u8>)> {
    let mut pairs = vec![
        (Field::Id.as_str(), record.id.as_str().as_bytes().to_vec()),
        (Field::Priority.as_str(), encode_int(record.priority)),
        (Field::Attempts.as_str(), encode_int(record.attempts.into())),
        (Field::Payload.as_str(), record.payload.to_vec()),
    ];
    let times = [
        (Field::RunAt, record.run_at),
        (Field::FailedAt, record.failed_at),
        (Field::LockedAt, record.locked_at),
    ];
    for (field, value) in times {
        if let Some(t) = value {
            pairs.push((field.as_str(), encode_time(t)));
        }
    }
    let strings = [
        (Field::Queue, &record.queue),
        (Field::LockedBy, &record.locked_by),
        (Field::LastError, &record.last_error),
    ];
    for (field, value) in strings {
        if let Some(s) = value {
            pairs.push((field.as_str(), s.as_bytes().to_vec()));
        }
    }
    pairs
}

/// Builds a record from a full field map. Missing fields take their defaults.
pub fn decode(id: JobId, fields: &FieldMap) -> JobRecord {
    let get = |f: Field| fields.get(f.as_str()).map(Vec::as_slice);
    JobRecord {
        id,
        priority: decode_int(Field::Priority, get(Field::Priority)),
        run_at: decode_time(Field::RunAt, get(Field::RunAt)),
        queue: decode_string(get(Field::Queue)),
        payload: get(Field::Payload)
            .map(Bytes::copy_from_slice)
            .unwrap_or_default(),
        failed_at: decode_time(Field::FailedAt, get(Field::FailedAt)),
        locked_at: decode_time(Field::LockedAt, get(Field::LockedAt)),
        locked_by: decode_string(get(Field::LockedBy)),
        attempts: u32::try_from(decode_int(Field::Attempts, get(Field::Attempts))).unwrap_or(0),
        last_error: decode_string(get(Field::LastError)),
    }
}

pub(crate) fn decode_int(field: Field, raw: Option<&[u8]>) -> i64 {
    let Some(raw) = raw else { return 0 };
    match std::str::from_utf8(raw).ok().and_then(|s| s.trim().parse().ok()) {
        Some(v) => v,
        None => {
            tracing::warn!(field = field.as_str(), "unparsable integer field, reading as 0");
            0
        }
    }
}

pub(crate) fn decode_time(field: Field, raw: Option<&[u8]>) -> Option<DateTime<Utc>> {
    match decode_int(field, raw) {
        0 => None,
        secs => DateTime::from_timestamp(secs, 0),
    }
}

pub(crate) fn decode_string(raw: Option<&[u8]>) -> Option<String> {
    raw.map(|v| String::from_utf8_lossy(v).into_owned())
}
