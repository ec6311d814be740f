//! Webhook authentication: HMAC signatures, shared tokens, IP allow-lists

use std::net::IpAddr;
use std::time::Duration;

use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::provider::Payload;
use super::WebhookError;

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

/// How a provider proves a request is genuine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureScheme {
    /// Hex HMAC-SHA256 of the raw body in `header`, after `prefix`.
    ///
    /// With a `timestamp_header`, the signed material is
    /// `"{timestamp}.{body}"` and the timestamp (unix seconds) must be
    /// within `tolerance` of now.
    HmacSha256 {
        header: String,
        prefix: String,
        timestamp_header: Option<String>,
        tolerance: Duration,
    },
    /// Zadarma: base64 HMAC-SHA1 over selected payload fields.
    ZadarmaHmacSha1 { header: String },
    /// Shared token in the first present header. Not enforced when no
    /// secret is configured.
    Token { headers: Vec<String> },
}

impl SignatureScheme {
    /// `X-Hub-Signature-256: sha256=<hex>`
    pub fn github_style() -> Self {
        SignatureScheme::HmacSha256 {
            header: "X-Hub-Signature-256".to_string(),
            prefix: "sha256=".to_string(),
            timestamp_header: None,
            tolerance: Duration::from_secs(300),
        }
    }

    pub fn zadarma() -> Self {
        SignatureScheme::ZadarmaHmacSha1 {
            header: "Signature".to_string(),
        }
    }

    pub fn onlinepbx() -> Self {
        SignatureScheme::Token {
            headers: vec!["X-OnlinePBX-Token".to_string(), "X-Obx-Token".to_string()],
        }
    }

    /// Check a request. `payload` is `None` when the body didn't parse.
    pub fn verify(
        &self,
        secret: Option<&SecretString>,
        headers: &HeaderMap,
        body: &[u8],
        payload: Option<&Payload>,
        now: DateTime<Utc>,
    ) -> Result<(), WebhookError> {
        match self {
            SignatureScheme::HmacSha256 {
                header,
                prefix,
                timestamp_header,
                tolerance,
            } => {
                let secret = secret.ok_or_else(|| WebhookError::invalid_signature("no secret configured"))?;
                let provided = header_value(headers, header)
                    .ok_or_else(|| WebhookError::invalid_signature(format!("missing {} header", header)))?;
                let digest_hex = provided
                    .strip_prefix(prefix.as_str())
                    .ok_or_else(|| {
                        WebhookError::invalid_signature(format!("expected {}<hex> format", prefix))
                    })?;
                let digest = hex::decode(digest_hex.trim())
                    .map_err(|_| WebhookError::invalid_signature("digest is not hex"))?;

                let mut mac = HmacSha256::new_from_slice(
                    secret
                        .expose_secret()
                        .as_bytes(),
                )
                .map_err(|_| WebhookError::invalid_signature("unusable secret"))?;
                if let Some(ts_header) = timestamp_header {
                    let timestamp = header_value(headers, ts_header)
                        .ok_or_else(|| {
                            WebhookError::invalid_signature(format!("missing {} header", ts_header))
                        })?;
                    check_timestamp(timestamp, *tolerance, now)?;
                    mac.update(timestamp.as_bytes());
                    mac.update(b".");
                }
                mac.update(body);
                mac.verify_slice(&digest)
                    .map_err(|_| WebhookError::invalid_signature("signature mismatch"))
            }
            SignatureScheme::ZadarmaHmacSha1 { header } => {
                let secret = secret.ok_or_else(|| WebhookError::invalid_signature("no secret configured"))?;
                let provided = header_value(headers, header)
                    .ok_or_else(|| WebhookError::invalid_signature(format!("missing {} header", header)))?;
                let digest = BASE64
                    .decode(provided.trim())
                    .map_err(|_| WebhookError::invalid_signature("signature is not base64"))?;
                let data = payload
                    .and_then(zadarma_signed_data)
                    .ok_or_else(|| WebhookError::invalid_signature("no signed fields for this event"))?;

                let mut mac = HmacSha1::new_from_slice(
                    secret
                        .expose_secret()
                        .as_bytes(),
                )
                .map_err(|_| WebhookError::invalid_signature("unusable secret"))?;
                mac.update(data.as_bytes());
                mac.verify_slice(&digest)
                    .map_err(|_| WebhookError::invalid_signature("signature mismatch"))
            }
            SignatureScheme::Token { headers: names } => {
                let Some(secret) = secret else {
                    return Ok(());
                };
                let received = names
                    .iter()
                    .find_map(|name| header_value(headers, name))
                    .ok_or_else(|| WebhookError::invalid_signature("missing token"))?;
                let matches: bool = received
                    .as_bytes()
                    .ct_eq(
                        secret
                            .expose_secret()
                            .as_bytes(),
                    )
                    .into();
                if matches {
                    Ok(())
                } else {
                    Err(WebhookError::invalid_signature("token mismatch"))
                }
            }
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| {
            v.to_str()
                .ok()
        })
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn check_timestamp(raw: &str, tolerance: Duration, now: DateTime<Utc>) -> Result<(), WebhookError> {
    let timestamp: i64 = raw
        .parse()
        .map_err(|_| WebhookError::invalid_signature("timestamp is not a number"))?;
    let skew = now
        .timestamp()
        .abs_diff(timestamp);
    if skew > tolerance.as_secs() {
        return Err(WebhookError::StaleTimestamp);
    }
    Ok(())
}

/// Concatenated fields Zadarma signs for each notification type.
pub fn zadarma_signed_data(payload: &Payload) -> Option<String> {
    let fields: &[&str] = match payload
        .get("event")?
        .as_str()
    {
        "NOTIFY_START" | "NOTIFY_INTERNAL" | "NOTIFY_END" => &["caller_id", "called_did", "call_start"],
        "NOTIFY_ANSWER" => &["caller_id", "destination", "call_start"],
        "NOTIFY_OUT_START" | "NOTIFY_OUT_END" => &["internal", "destination", "call_start"],
        "NOTIFY_RECORD" => &["pbx_call_id", "call_id_with_rec"],
        _ => return None,
    };
    let mut data = String::new();
    for field in fields {
        data.push_str(&payload.get(field)?);
    }
    Some(data)
}

/// Allow-list check: empty list or `*` admits everyone.
pub fn ip_allowed(allowed: &[String], client_ip: &str) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let client: Option<IpAddr> = client_ip
        .trim()
        .parse()
        .ok();
    allowed
        .iter()
        .map(|entry| entry.trim())
        .any(|entry| {
            entry == "*"
                || entry == client_ip.trim()
                || matches!(
                    (entry.parse::<IpAddr>(), client),
                    (Ok(a), Some(b)) if a == b
                )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign_sha256(secret: &str, material: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(material);
        hex::encode(
            mac.finalize()
                .into_bytes(),
        )
    }

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn timed_scheme() -> SignatureScheme {
        SignatureScheme::HmacSha256 {
            header: "X-Signature".into(),
            prefix: "sha256=".into(),
            timestamp_header: Some("X-Timestamp".into()),
            tolerance: Duration::from_secs(300),
        }
    }

    #[test]
    fn github_style_signature() {
        let body = br#"{"call_id":"1"}"#;
        let mut headers = HeaderMap::new();
        let sig = format!("sha256={}", sign_sha256("right", body));
        headers.insert("x-hub-signature-256", sig.parse().unwrap());

        let scheme = SignatureScheme::github_style();
        assert!(scheme
            .verify(Some(&secret("right")), &headers, body, None, now())
            .is_ok());
        let err = scheme
            .verify(Some(&secret("wrong")), &headers, body, None, now())
            .unwrap_err();
        assert!(matches!(err, WebhookError::InvalidSignature { .. }));
        assert!(scheme
            .verify(None, &headers, body, None, now())
            .is_err());
    }

    #[test]
    fn prefix_required() {
        let body = b"{}";
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-hub-signature-256",
            sign_sha256("k", body)
                .parse()
                .unwrap(),
        );
        assert!(SignatureScheme::github_style()
            .verify(Some(&secret("k")), &headers, body, None, now())
            .is_err());
    }

    #[test]
    fn timestamped_signature_fresh_and_stale() {
        let body = b"payload";
        let ts = now().timestamp();
        let sig = sign_sha256("k", format!("{}.payload", ts).as_bytes());
        let mut headers = HeaderMap::new();
        headers.insert("x-signature", format!("sha256={}", sig).parse().unwrap());
        headers.insert("x-timestamp", ts.to_string().parse().unwrap());

        let scheme = timed_scheme();
        assert!(scheme
            .verify(Some(&secret("k")), &headers, body, None, now())
            .is_ok());
        assert!(scheme
            .verify(Some(&secret("other")), &headers, body, None, now())
            .is_err());

        let later = now() + chrono::Duration::seconds(301);
        let err = scheme
            .verify(Some(&secret("k")), &headers, body, None, later)
            .unwrap_err();
        assert!(matches!(err, WebhookError::StaleTimestamp));
    }

    #[test]
    fn zadarma_signature() {
        let payload = Payload::from_pairs([
            ("event", "NOTIFY_OUT_END"),
            ("internal", "101"),
            ("destination", "+15550002"),
            ("call_start", "2024-03-01 10:00:00"),
        ]);
        assert_eq!(
            zadarma_signed_data(&payload).as_deref(),
            Some("101+155500022024-03-01 10:00:00")
        );

        let mut mac = HmacSha1::new_from_slice(b"zd-secret").unwrap();
        mac.update(b"101+155500022024-03-01 10:00:00");
        let sig = BASE64.encode(
            mac.finalize()
                .into_bytes(),
        );
        let mut headers = HeaderMap::new();
        headers.insert("signature", sig.parse().unwrap());

        let scheme = SignatureScheme::zadarma();
        assert!(scheme
            .verify(Some(&secret("zd-secret")), &headers, b"", Some(&payload), now())
            .is_ok());
        assert!(scheme
            .verify(Some(&secret("nope")), &headers, b"", Some(&payload), now())
            .is_err());
        assert!(scheme
            .verify(Some(&secret("zd-secret")), &headers, b"", None, now())
            .is_err());
    }

    #[test]
    fn zadarma_incoming_fields() {
        let payload = Payload::from_pairs([
            ("event", "NOTIFY_END"),
            ("caller_id", "+15550001"),
            ("called_did", "+15559999"),
            ("call_start", "2024-03-01 10:00:00"),
        ]);
        assert_eq!(
            zadarma_signed_data(&payload).as_deref(),
            Some("+15550001+155599992024-03-01 10:00:00")
        );
        let unknown = Payload::from_pairs([("event", "NOTIFY_SOMETHING")]);
        assert!(zadarma_signed_data(&unknown).is_none());
    }

    #[test]
    fn token_headers() {
        let scheme = SignatureScheme::onlinepbx();
        let mut headers = HeaderMap::new();
        assert!(scheme
            .verify(None, &headers, b"", None, now())
            .is_ok());
        assert!(scheme
            .verify(Some(&secret("t")), &headers, b"", None, now())
            .is_err());
        headers.insert("x-obx-token", "t".parse().unwrap());
        assert!(scheme
            .verify(Some(&secret("t")), &headers, b"", None, now())
            .is_ok());
        assert!(scheme
            .verify(Some(&secret("tt")), &headers, b"", None, now())
            .is_err());
    }

    #[test]
    fn allow_list() {
        assert!(ip_allowed(&[], "10.0.0.1"));
        assert!(ip_allowed(&["*".into()], "10.0.0.1"));
        assert!(ip_allowed(&["185.45.152.42".into()], "185.45.152.42"));
        assert!(!ip_allowed(&["185.45.152.42".into()], "10.0.0.1"));
        assert!(ip_allowed(&["::1".into()], "0:0:0:0:0:0:0:1"));
    }
}
