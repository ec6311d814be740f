//! Provider settings, payload parsing and call-event normalization

use std::time::Duration;

use axum::http::{header::CONTENT_TYPE, HeaderMap};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::rate_limit::RateLimit;
use super::signature::SignatureScheme;
use super::WebhookError;

/// Id fields tried in order when no provider override is set.
const DEFAULT_ID_FIELDS: &[&str] = &["call_id", "pbx_call_id", "uuid", "event_id"];

fn event_type(payload: &Payload) -> String {
    payload
        .first(&["event", "event_type", "type"])
        .unwrap_or_else(|| "unknown".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Zadarma,
    #[serde(rename = "onlinepbx")]
    OnlinePbx,
    /// Any provider signing with `X-Hub-Signature-256`-style HMAC.
    Generic,
}

impl ProviderKind {
    /// Requests per minute per client address.
    fn default_rate_limit(&self) -> u32 {
        match self {
            ProviderKind::OnlinePbx => 200,
            ProviderKind::Zadarma | ProviderKind::Generic => 100,
        }
    }
}

/// Everything the pipeline needs to know about one provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub secret: Option<SecretString>,
    /// Empty or `*` admits any address.
    pub allowed_ips: Vec<String>,
    pub rate_limit: RateLimit,
    /// Overrides the kind's default scheme.
    pub scheme: Option<SignatureScheme>,
    /// Overrides [`DEFAULT_ID_FIELDS`].
    pub id_fields: Vec<String>,
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            secret: None,
            allowed_ips: Vec::new(),
            rate_limit: RateLimit::new(kind.default_rate_limit(), Duration::from_secs(60)),
            scheme: None,
            id_fields: Vec::new(),
        }
    }

    pub fn rate_limit(&self) -> RateLimit {
        self.rate_limit
    }

    pub fn scheme(&self) -> SignatureScheme {
        if let Some(scheme) = &self.scheme {
            return scheme.clone();
        }
        match self.kind {
            ProviderKind::Zadarma => SignatureScheme::zadarma(),
            ProviderKind::OnlinePbx => SignatureScheme::onlinepbx(),
            ProviderKind::Generic => SignatureScheme::github_style(),
        }
    }

    /// First non-empty id field of the payload.
    pub fn event_id(&self, payload: &Payload) -> Option<String> {
        if self
            .id_fields
            .is_empty()
        {
            DEFAULT_ID_FIELDS
                .iter()
                .find_map(|f| payload.get(f))
        } else {
            self.id_fields
                .iter()
                .find_map(|f| payload.get(f))
        }
    }

    /// Key under which a delivery is deduplicated. Providers send several
    /// notifications per call with the same call id, so the event type is
    /// part of the key.
    pub fn dedup_key(&self, payload: &Payload) -> Option<String> {
        let id = self.event_id(payload)?;
        Some(format!("{}:{}", event_type(payload), id))
    }

    pub fn normalize(&self, provider: &str, payload: &Payload, received_at: DateTime<Utc>) -> NormalizedCallEvent {
        let event_type = event_type(payload);

        let (direction, caller, callee) = match self.kind {
            ProviderKind::Zadarma => match event_type.as_str() {
                "NOTIFY_OUT_START" | "NOTIFY_OUT_END" => (
                    Some(CallDirection::Outbound),
                    payload.get("internal"),
                    payload.get("destination"),
                ),
                "NOTIFY_ANSWER" => (
                    Some(CallDirection::Inbound),
                    payload.get("caller_id"),
                    payload.get("destination"),
                ),
                "NOTIFY_START" | "NOTIFY_INTERNAL" | "NOTIFY_END" => (
                    Some(CallDirection::Inbound),
                    payload.get("caller_id"),
                    payload.get("called_did"),
                ),
                _ => (None, payload.get("caller_id"), payload.get("destination")),
            },
            ProviderKind::OnlinePbx | ProviderKind::Generic => (
                payload
                    .get("direction")
                    .and_then(|d| CallDirection::parse(&d)),
                payload.first(&["caller_id_number", "caller_id", "from", "src", "caller", "phone"]),
                payload.first(&["destination_number", "to", "dst", "extension", "uid", "called_did"]),
            ),
        };

        NormalizedCallEvent {
            provider: provider.to_string(),
            call_id: self.event_id(payload),
            event_type,
            direction,
            caller,
            callee,
            started_at: payload.first(&["call_start", "start_time", "timestamp"]),
            duration_seconds: payload
                .get("duration")
                .and_then(|d| {
                    d.trim()
                        .parse()
                        .ok()
                }),
            disposition: payload.first(&["disposition", "status"]),
            received_at,
            raw: payload.to_json(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl CallDirection {
    fn parse(value: &str) -> Option<Self> {
        match value
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "in" | "inbound" | "incoming" => Some(CallDirection::Inbound),
            "out" | "outbound" | "outgoing" => Some(CallDirection::Outbound),
            _ => None,
        }
    }
}

/// Provider-independent view of a call notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedCallEvent {
    pub provider: String,
    pub call_id: Option<String>,
    pub event_type: String,
    pub direction: Option<CallDirection>,
    pub caller: Option<String>,
    pub callee: Option<String>,
    /// As sent by the provider.
    pub started_at: Option<String>,
    pub duration_seconds: Option<u64>,
    pub disposition: Option<String>,
    pub received_at: DateTime<Utc>,
    pub raw: Value,
}

/// Flat key/value view of a JSON or form-encoded body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    fields: Map<String, Value>,
}

impl Payload {
    /// Parse by content type; form encoding is assumed when none is given
    /// and the body isn't a JSON object.
    pub fn parse(headers: &HeaderMap, body: &[u8]) -> Result<Self, WebhookError> {
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| {
                v.to_str()
                    .ok()
            })
            .unwrap_or("")
            .to_ascii_lowercase();
        let Some(start) = body
            .iter()
            .position(|b| !b.is_ascii_whitespace())
        else {
            return Ok(Payload::default());
        };
        let trimmed = &body[start..];
        if content_type.contains("json") || (content_type.is_empty() && trimmed.starts_with(b"{")) {
            return Self::parse_json(body);
        }
        Self::parse_form(trimmed)
    }

    fn parse_json(body: &[u8]) -> Result<Self, WebhookError> {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(fields)) => Ok(Self { fields }),
            Ok(_) => Err(WebhookError::malformed("expected a JSON object")),
            Err(e) => Err(WebhookError::malformed(format!("invalid JSON: {}", e))),
        }
    }

    fn parse_form(body: &[u8]) -> Result<Self, WebhookError> {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(body)
            .map_err(|e| WebhookError::malformed(format!("invalid form body: {}", e)))?;
        Ok(Self::from_pairs(pairs))
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), Value::String(v.into())))
                .collect(),
        }
    }

    /// Field as a string; numbers and booleans are rendered, empty strings
    /// and other types count as absent.
    pub fn get(&self, key: &str) -> Option<String> {
        match self
            .fields
            .get(key)?
        {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// First present field among `keys`.
    pub fn first(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .find_map(|k| self.get(k))
    }

    pub fn len(&self) -> usize {
        self.fields
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields
            .is_empty()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.fields
                .clone(),
        )
    }
}
