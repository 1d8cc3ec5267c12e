//! JSON wire contract shared by bridges and command senders.
//!
//! Timestamps on commands are integer milliseconds since the Unix epoch;
//! state payloads carry RFC 3339 `last_update` strings.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString, IntoStaticStr};

/// Field name → value map used by commands, results and state.
pub type Values = Map<String, Value>;

// ── Command ─────────────────────────────────────────────────────────

/// Inbound command, published non-retained on a device's `cmd` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub id: String,
    /// Issue time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub values: Values,
    /// Advisory deadline in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl CommandPayload {
    pub fn new(id: impl Into<String>, issued_at: DateTime<Utc>, values: Values) -> Self {
        Self {
            id: id.into(),
            timestamp: issued_at.timestamp_millis(),
            values,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    /// Issue time as a UTC datetime. Out-of-range timestamps clamp to the
    /// epoch so they always order before any real command.
    pub fn issued_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp).unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// Best-effort extraction of the `id` field from a payload that failed
    /// to decode, so a `malformed_payload` response can still be correlated.
    pub fn salvage_id(raw: &[u8]) -> Option<String> {
        let value: Value = serde_json::from_slice(raw).ok()?;
        match value.get("id")? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }
}

// ── Errors on the wire ──────────────────────────────────────────────

/// Wire error codes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCode {
    ConnectionError,
    StaleCommand,
    InvalidField,
    ProviderError,
    Timeout,
    DiscoveryGenerationError,
    MalformedPayload,
    UnknownDevice,
    DeviceDisabled,
    Overloaded,
}

/// Error descriptor carried by failed responses and offline state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub retriable: bool,
    /// Offending field names, for `invalid_field`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

impl ErrorObject {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retriable: false,
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn retriable(mut self, retriable: bool) -> Self {
        self.retriable = retriable;
        self
    }

    #[must_use]
    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if !self.fields.is_empty() {
            write!(f, " ({})", self.fields.join(", "))?;
        }
        Ok(())
    }
}

// ── Response ────────────────────────────────────────────────────────

/// Outcome of one command, published on the device's `cmd/response` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Values>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl ResponsePayload {
    pub fn success(id: impl Into<String>, result: Values) -> Self {
        Self {
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: ErrorObject) -> Self {
        Self {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(error),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

// ── State ───────────────────────────────────────────────────────────

/// Retained device snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatePayload {
    pub online: bool,
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub values: Values,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

// ── Availability ────────────────────────────────────────────────────

/// Instance-level liveness marker; the payload is the bare string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Availability {
    Online,
    Offline,
}

impl Availability {
    pub fn payload(self) -> &'static [u8] {
        let s: &'static str = self.into();
        s.as_bytes()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn command_wire_format() {
        let issued = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let mut values = Values::new();
        values.insert("power".into(), json!(true));
        let cmd = CommandPayload::new("c-1", issued, values).with_timeout(5000);

        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"id": "c-1", "timestamp": 1_700_000_000_123_i64, "values": {"power": true}, "timeout": 5000})
        );
        assert_eq!(cmd.issued_at(), issued);
    }

    #[test]
    fn command_timeout_is_optional() {
        let cmd: CommandPayload =
            serde_json::from_value(json!({"id": "x", "timestamp": 5, "values": {}})).unwrap();
        assert_eq!(cmd.timeout, None);
        assert!(!serde_json::to_string(&cmd).unwrap().contains("timeout"));
    }

    #[test]
    fn salvages_id_from_partial_payloads() {
        assert_eq!(
            CommandPayload::salvage_id(br#"{"id":"abc","timestamp":"soon"}"#),
            Some("abc".into())
        );
        assert_eq!(CommandPayload::salvage_id(b"not json"), None);
        assert_eq!(CommandPayload::salvage_id(br#"{"id":7}"#), None);
    }

    #[test]
    fn failure_response_shape() {
        let resp = ResponsePayload::failure(
            "c-2",
            ErrorObject::new(ErrorCode::InvalidField, "bad fields")
                .with_fields(vec!["colour".into(), "volume".into()]),
        );
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({
                "id": "c-2",
                "ok": false,
                "error": {
                    "code": "invalid_field",
                    "message": "bad fields",
                    "retriable": false,
                    "fields": ["colour", "volume"]
                }
            })
        );
        assert_eq!(resp.error_code(), Some(ErrorCode::InvalidField));
    }

    #[test]
    fn error_codes_render_snake_case() {
        assert_eq!(ErrorCode::DiscoveryGenerationError.to_string(), "discovery_generation_error");
        assert_eq!(
            "stale_command".parse::<ErrorCode>().unwrap(),
            ErrorCode::StaleCommand
        );
    }

    #[test]
    fn availability_payloads() {
        assert_eq!(Availability::Online.payload(), b"online");
        assert_eq!(Availability::Offline.payload(), b"offline");
    }

    #[test]
    fn state_omits_absent_error() {
        let state = StatePayload {
            online: true,
            last_update: DateTime::from_timestamp(0, 0).unwrap(),
            values: Values::new(),
            error: None,
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json.get("error"), None);
        assert_eq!(json["last_update"], json!("1970-01-01T00:00:00Z"));
    }
}
