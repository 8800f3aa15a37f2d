//! Session documents and ids.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Longest id, in bytes, accepted as a cache key.
///
/// Fits the backing store's `VARCHAR(128)` key column and keeps the cache
/// file name (and its temp sibling) well under the 255-byte name limit of
/// common filesystems.
pub const MAX_ID_LEN: usize = 128;

/// Field holding the cookie substructure.
pub const COOKIE_FIELD: &str = "cookie";

/// Check that `id` can be used as a cache key.
///
/// Ids name files in the cache directory. A leading `.` is reserved for the
/// ledger and for temp files, so no session can ever alias them.
pub fn validate_id(id: &str) -> Result<()> {
    let reason = if id.is_empty() {
        "empty"
    } else if id.len() > MAX_ID_LEN {
        "longer than 128 bytes"
    } else if id.starts_with('.') {
        "leading '.' is reserved"
    } else if id.contains(['/', '\\', '\0']) {
        "contains a path separator or NUL"
    } else {
        return Ok(());
    };
    Err(Error::InvalidId {
        id: id.to_string(),
        reason,
    })
}

/// JSON state for one session.
///
/// Serializes as a bare JSON object. The snapshot taken at read time rides
/// along in memory so a later write can be diffed against it, but it is
/// skipped by serde and never reaches a cache file or backing-store row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDocument {
    fields: Map<String, Value>,

    #[serde(skip)]
    snapshot: Option<Arc<Map<String, Value>>>,
}

impl PartialEq for SessionDocument {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl From<Map<String, Value>> for SessionDocument {
    fn from(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            snapshot: None,
        }
    }
}

impl SessionDocument {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a document from a JSON value. Returns `None` unless it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(fields.into()),
            _ => None,
        }
    }

    /// Top-level fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Mutable top-level fields.
    pub fn fields_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.fields
    }

    /// Consume the document, dropping any snapshot.
    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }

    /// Get a top-level field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Set a top-level field.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.fields.insert(key.into(), value)
    }

    /// Remove a top-level field.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// State as the caller last read it, if this document came from `get`.
    pub fn snapshot(&self) -> Option<&Map<String, Value>> {
        self.snapshot.as_deref()
    }

    /// Attach a copy of the current fields as the read-time snapshot.
    pub(crate) fn with_snapshot(mut self) -> Self {
        self.snapshot = Some(Arc::new(self.fields.clone()));
        self
    }

    /// Drop the read-time snapshot.
    pub fn clear_snapshot(&mut self) {
        self.snapshot = None;
    }

    /// `cookie.expires` as an instant.
    ///
    /// Accepts an RFC 3339 string or epoch milliseconds.
    pub fn cookie_expires(&self) -> Option<DateTime<Utc>> {
        match self.cookie()?.get("expires")? {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            Value::Number(n) => n
                .as_i64()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            _ => None,
        }
    }

    /// `cookie.originalMaxAge` in milliseconds.
    pub fn cookie_original_max_age(&self) -> Option<i64> {
        let value = self.cookie()?.get("originalMaxAge")?;
        value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
    }

    /// Write `cookie.expires`, creating the cookie object if needed.
    pub fn set_cookie_expires(&mut self, expires: DateTime<Utc>) {
        let cookie = self
            .fields
            .entry(COOKIE_FIELD)
            .or_insert_with(|| Value::Object(Map::new()));
        if !cookie.is_object() {
            *cookie = Value::Object(Map::new());
        }
        if let Value::Object(cookie) = cookie {
            cookie.insert(
                "expires".to_string(),
                Value::String(expires.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
    }

    /// Expiry as epoch seconds for the backing-store row. `0` when unset.
    pub fn expires_epoch_secs(&self) -> u64 {
        self.cookie_expires()
            .map(|dt| dt.timestamp().max(0) as u64)
            .unwrap_or(0)
    }

    fn cookie(&self) -> Option<&Map<String, Value>> {
        self.fields.get(COOKIE_FIELD)?.as_object()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> SessionDocument {
        SessionDocument::from_value(value).unwrap()
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("abc-DEF_123").is_ok());
        assert!(validate_id(&"x".repeat(128)).is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id(&"x".repeat(129)).is_err());
        assert!(validate_id(&"\u{1F600}".repeat(32)).is_ok());
        assert!(validate_id(&"\u{1F600}".repeat(33)).is_err());
        assert!(validate_id(&"\u{1F600}".repeat(128)).is_err());
        assert!(validate_id(".ledger").is_err());
        assert!(validate_id("../etc/passwd").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("a\\b").is_err());
    }

    #[test]
    fn test_snapshot_not_serialized() {
        let d = doc(json!({"user": "ada"})).with_snapshot();
        assert!(d.snapshot().is_some());
        let bytes = serde_json::to_string(&d).unwrap();
        assert_eq!(bytes, r#"{"user":"ada"}"#);
    }

    #[test]
    fn test_equality_ignores_snapshot() {
        let plain = doc(json!({"n": 1}));
        let snapped = plain.clone().with_snapshot();
        assert_eq!(plain, snapped);
    }

    #[test]
    fn test_cookie_expires_rfc3339() {
        let d = doc(json!({"cookie": {"expires": "2030-01-01T00:00:00.000Z"}}));
        assert_eq!(d.expires_epoch_secs(), 1_893_456_000);
    }

    #[test]
    fn test_cookie_expires_millis() {
        let d = doc(json!({"cookie": {"expires": 1_893_456_000_500_i64}}));
        assert_eq!(d.expires_epoch_secs(), 1_893_456_000);
    }

    #[test]
    fn test_missing_expires_is_zero() {
        assert_eq!(doc(json!({"cookie": {"expires": null}})).expires_epoch_secs(), 0);
        assert_eq!(doc(json!({})).expires_epoch_secs(), 0);
        assert_eq!(doc(json!({"cookie": {"expires": "soon"}})).expires_epoch_secs(), 0);
    }

    #[test]
    fn test_set_cookie_expires_format() {
        let mut d = doc(json!({"cookie": {"originalMaxAge": 1000}}));
        let at = Utc.timestamp_millis_opt(1_893_456_000_250).unwrap();
        d.set_cookie_expires(at);
        assert_eq!(
            d.get("cookie").unwrap()["expires"],
            json!("2030-01-01T00:00:00.250Z")
        );
        assert_eq!(d.cookie_original_max_age(), Some(1000));
    }

    #[test]
    fn test_from_value_rejects_non_objects() {
        assert!(SessionDocument::from_value(json!([1, 2])).is_none());
        assert!(SessionDocument::from_value(json!("x")).is_none());
    }
}
