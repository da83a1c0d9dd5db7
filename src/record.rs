use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{DecodeError, RecordError};

/// Severity of a shipped log record.
///
/// Parsing is case-insensitive; the canonical form is uppercase on the wire
/// and lowercase inside routing keys and queue names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Level {
    Info,
    Warning,
    Error,
    Critical,
}

impl Level {
    pub const ALL: [Level; 4] = [Level::Info, Level::Warning, Level::Error, Level::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
        }
    }

    pub fn as_lower(&self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Critical => "critical",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log level {0:?}")]
pub struct ParseLevelError(pub String);

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INFO" => Ok(Level::Info),
            "WARNING" => Ok(Level::Warning),
            "ERROR" => Ok(Level::Error),
            "CRITICAL" => Ok(Level::Critical),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

impl Serialize for Level {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// JSON-compatible metadata value.
///
/// A closed set of variants instead of an arbitrary `serde_json::Value` so
/// that the same metadata always serializes to the same bytes (maps are
/// ordered).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<MetaValue>),
    Map(BTreeMap<String, MetaValue>),
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::String(v.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        MetaValue::String(v)
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Bool(v)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Number(v.into())
    }
}

impl From<u64> for MetaValue {
    fn from(v: u64) -> Self {
        MetaValue::Number(v.into())
    }
}

impl From<f64> for MetaValue {
    /// Non-finite floats have no JSON representation and become `Null`.
    fn from(v: f64) -> Self {
        serde_json::Number::from_f64(v)
            .map(MetaValue::Number)
            .unwrap_or(MetaValue::Null)
    }
}

pub type Metadata = BTreeMap<String, MetaValue>;

/// The unit flowing through the whole pipeline.
///
/// Fields are private: a record is immutable once built. The timestamp is
/// taken by the producer when the record is created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    service: String,
    level: Level,
    message: String,
    metadata: Metadata,
    timestamp: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(
        service: impl Into<String>,
        level: Level,
        message: impl Into<String>,
        metadata: Option<Metadata>,
    ) -> Result<Self, RecordError> {
        Self::with_timestamp(service, level, message, metadata, Utc::now())
    }

    pub fn with_timestamp(
        service: impl Into<String>,
        level: Level,
        message: impl Into<String>,
        metadata: Option<Metadata>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, RecordError> {
        let service = service.into();
        if service.trim().is_empty() {
            return Err(RecordError::EmptyService);
        }
        Ok(LogRecord {
            service,
            level,
            message: message.into(),
            metadata: metadata.unwrap_or_default(),
            timestamp,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Serialize into the JSON message body published to the broker.
    pub fn to_body(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a broker message body.
    ///
    /// Older producers sent the metadata map under `extra` or `information`;
    /// both are accepted.
    pub fn from_body(body: &[u8]) -> Result<Self, DecodeError> {
        let wire: WireRecord = serde_json::from_slice(body)?;
        if wire.service.trim().is_empty() {
            return Err(DecodeError::EmptyService);
        }
        Ok(LogRecord {
            service: wire.service,
            level: wire.level,
            message: wire.message,
            metadata: wire.metadata.unwrap_or_default(),
            timestamp: wire.timestamp,
        })
    }
}

#[derive(Deserialize)]
struct WireRecord {
    service: String,
    level: Level,
    message: String,
    #[serde(default, alias = "extra", alias = "information")]
    metadata: Option<Metadata>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    timestamp: DateTime<Utc>,
}

/// RFC 3339, or a naive `YYYY-MM-DD HH:MM:SS[.ffffff]` taken as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|pattern| NaiveDateTime::parse_from_str(raw, pattern).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parsing_ignores_case() {
        assert_eq!("info".parse::<Level>().unwrap(), Level::Info);
        assert_eq!("Warning".parse::<Level>().unwrap(), Level::Warning);
        assert_eq!(" CRITICAL ".parse::<Level>().unwrap(), Level::Critical);
        assert!("debug".parse::<Level>().is_err());
    }

    #[test]
    fn empty_service_is_rejected() {
        let err = LogRecord::new("  ", Level::Info, "hi", None).unwrap_err();
        assert_eq!(err, RecordError::EmptyService);
    }

    #[test]
    fn body_uses_uppercase_level_and_metadata_key() {
        let mut meta = Metadata::new();
        meta.insert("user_count".into(), 3i64.into());
        let record = LogRecord::new("flask_service", Level::Warning, "users", Some(meta)).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&record.to_body().unwrap()).unwrap();
        assert_eq!(value["service"], "flask_service");
        assert_eq!(value["level"], "WARNING");
        assert_eq!(value["metadata"]["user_count"], 3);
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn decodes_legacy_metadata_keys_and_lowercase_level() {
        let body = br#"{"service":"svc","level":"error","message":"boom",
            "extra":{"error":"division by zero","nested":{"a":[1,null,true]}},
            "timestamp":"2024-12-08T21:59:02Z"}"#;
        let record = LogRecord::from_body(body).unwrap();
        assert_eq!(record.level(), Level::Error);
        assert_eq!(
            record.metadata().get("error"),
            Some(&MetaValue::String("division by zero".into()))
        );
        assert!(matches!(record.metadata().get("nested"), Some(MetaValue::Map(_))));
    }

    #[test]
    fn decodes_naive_local_timestamp_from_older_producers() {
        let body = br#"{"service":"flask_service","level":"INFO","message":"User created","extra":{"user_id":1},"timestamp":"2024-12-08 21:59:02.182315"}"#;
        let record = LogRecord::from_body(body).unwrap();
        assert_eq!(record.service(), "flask_service");
        assert_eq!(record.metadata().get("user_id"), Some(&MetaValue::Number(1.into())));
        assert_eq!(
            record.timestamp(),
            Utc.with_ymd_and_hms(2024, 12, 8, 21, 59, 2).unwrap()
                + chrono::Duration::microseconds(182_315)
        );

        let body = br#"{"service":"svc","level":"INFO","message":"m","timestamp":"2024-12-08 21:59:02"}"#;
        assert_eq!(
            LogRecord::from_body(body).unwrap().timestamp(),
            Utc.with_ymd_and_hms(2024, 12, 8, 21, 59, 2).unwrap()
        );

        let body = br#"{"service":"svc","level":"INFO","message":"m","timestamp":"yesterday"}"#;
        assert!(matches!(LogRecord::from_body(body), Err(DecodeError::Json(_))));
    }

    #[test]
    fn missing_metadata_defaults_to_empty() {
        let body = br#"{"service":"svc","level":"INFO","message":"m","timestamp":"2024-12-08T21:59:02Z"}"#;
        assert!(LogRecord::from_body(body).unwrap().metadata().is_empty());
    }

    #[test]
    fn malformed_bodies_fail_to_decode() {
        assert!(matches!(LogRecord::from_body(b"not json"), Err(DecodeError::Json(_))));
        let body = br#"{"service":"","level":"INFO","message":"m","timestamp":"2024-12-08T21:59:02Z"}"#;
        assert!(matches!(LogRecord::from_body(body), Err(DecodeError::EmptyService)));
    }
}
