//! Shared data models carried inside frames.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::protocol::{Envelope, TYPE_NOTIFICATION};

// --- Notifications ---

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    #[default]
    Info,
    Warning,
    Success,
    Error,
}

/// A user-facing event record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Notification as pushed by the server. Everything but the message text is
/// optional and tolerant of `null`; `read` is accepted on the wire but never
/// trusted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub kind: NotificationKind,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    pub message: String,
    /// Unparseable timestamps are treated as absent.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read: Option<bool>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Ids arrive as strings or, from database-backed servers, as numbers.
fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) => Ok(Some(id)),
        Some(Value::Number(id)) => Ok(Some(id.to_string())),
        Some(other) => Err(de::Error::invalid_type(
            unexpected(&other),
            &"a string or number id",
        )),
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Value>::deserialize(deserializer)?.and_then(|value| parse_timestamp(&value)))
}

/// Accepts RFC 3339, ISO-8601 without an offset (read as UTC), a bare date,
/// or Unix epoch milliseconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => {
            let text = text.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
                return Some(ts.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(ts) = NaiveDateTime::parse_from_str(text, format) {
                    return Some(ts.and_utc());
                }
            }
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|ts| ts.and_utc())
        }
        Value::Number(millis) => millis
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}

fn unexpected(value: &Value) -> de::Unexpected<'_> {
    match value {
        Value::Bool(b) => de::Unexpected::Bool(*b),
        Value::Array(_) => de::Unexpected::Seq,
        Value::Object(_) => de::Unexpected::Map,
        _ => de::Unexpected::Other("value"),
    }
}

impl NotificationPayload {
    /// Extract the payload of a `notification` envelope.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        serde_json::from_value(envelope.payload.clone())
            .map_err(|e| ProtocolError::invalid_payload(TYPE_NOTIFICATION, e))
    }

    /// Build the local record: fills in a fresh id and `now` when absent and
    /// always starts unread.
    pub fn into_notification(self, now: DateTime<Utc>) -> Notification {
        Notification {
            id: self
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            kind: self.kind,
            title: self.title,
            message: self.message,
            timestamp: self.timestamp.unwrap_or(now),
            read: false,
            link: self.link,
            data: self.data,
        }
    }
}

impl Notification {
    /// Wrap as a server-pushed frame, the way a server would send it.
    pub fn to_envelope(&self) -> Envelope {
        let payload = serde_json::to_value(self).unwrap_or(Value::Null);
        Envelope::new(TYPE_NOTIFICATION, payload)
    }
}
