//! Opaque keyset cursors for paginated listings.
//!
//! A cursor encodes the `(created_at, id)` ordering key of the last row a
//! client has seen. The id breaks ties between rows created in the same
//! microsecond. Clients treat the string as opaque.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::NaiveDateTime;
use uuid::Uuid;

use crate::error::ServiceError;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub created_at: NaiveDateTime,
    pub id: Uuid,
}

impl Cursor {
    pub fn new(created_at: NaiveDateTime, id: Uuid) -> Self {
        Self { created_at, id }
    }

    pub fn encode(&self) -> String {
        let raw = format!("{}|{}", self.created_at.format(TIMESTAMP_FORMAT), self.id);
        URL_SAFE_NO_PAD.encode(raw)
    }

    pub fn decode(value: &str) -> Result<Self, ServiceError> {
        let invalid = || ServiceError::Validation("invalid cursor".to_string());
        let bytes = URL_SAFE_NO_PAD.decode(value).map_err(|_| invalid())?;
        let raw = String::from_utf8(bytes).map_err(|_| invalid())?;
        let (timestamp, id) = raw.split_once('|').ok_or_else(invalid)?;
        let created_at =
            NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).map_err(|_| invalid())?;
        let id = Uuid::parse_str(id).map_err(|_| invalid())?;
        Ok(Self { created_at, id })
    }

    /// Decodes an optional query parameter; empty strings mean "from the start".
    pub fn parse_optional(value: Option<&str>) -> Result<Option<Self>, ServiceError> {
        match value.map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => Self::decode(raw).map(Some),
        }
    }
}

/// Splits an over-fetched page (`limit + 1` rows) into the page and the cursor
/// that resumes after it.
pub fn paginate<T>(
    mut rows: Vec<T>,
    limit: usize,
    key: impl Fn(&T) -> Cursor,
) -> (Vec<T>, Option<String>) {
    if rows.len() > limit {
        rows.truncate(limit);
        let next = rows.last().map(|row| key(row).encode());
        (rows, next)
    } else {
        (rows, None)
    }
}
