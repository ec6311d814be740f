//! Provider webhook ingress
//!
//! Every request walks the same stages and stops at the first failure:
//! rate limit, IP allow-list, signature, deduplication, dispatch to the
//! [`CrmSink`]. [`http::router`] exposes the pipeline over axum.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod http;
pub mod idempotency;
pub mod provider;
pub mod rate_limit;
pub mod signature;

pub use idempotency::{IdempotencyStore, InMemoryIdempotencyStore, SqliteIdempotencyStore};
pub use provider::{CallDirection, NormalizedCallEvent, Payload, ProviderConfig, ProviderKind};
pub use rate_limit::{InMemoryRateLimiter, RateDecision, RateLimit, RateLimiter};
pub use signature::SignatureScheme;

/// Webhook rejection reasons, each mapped to one HTTP status.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Invalid signature: {reason}")]
    InvalidSignature { reason: String },

    #[error("Signature timestamp outside the accepted window")]
    StaleTimestamp,

    #[error("Client address {ip} not allowed")]
    IpNotAllowed { ip: String },

    #[error("Unknown provider: {provider}")]
    UnknownProvider { provider: String },

    #[error("Malformed payload: {reason}")]
    MalformedPayload { reason: String },

    #[error("CRM dispatch failed: {reason}")]
    Dispatch { reason: String },

    #[error("Idempotency store unavailable: {reason}")]
    Store { reason: String },
}

impl WebhookError {
    pub fn invalid_signature(reason: impl Into<String>) -> Self {
        WebhookError::InvalidSignature {
            reason: reason.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        WebhookError::MalformedPayload {
            reason: reason.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            WebhookError::InvalidSignature { .. } | WebhookError::StaleTimestamp => {
                StatusCode::UNAUTHORIZED
            }
            WebhookError::IpNotAllowed { .. } => StatusCode::FORBIDDEN,
            WebhookError::UnknownProvider { .. } => StatusCode::NOT_FOUND,
            WebhookError::MalformedPayload { .. } => StatusCode::BAD_REQUEST,
            WebhookError::Dispatch { .. } => StatusCode::BAD_GATEWAY,
            WebhookError::Store { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable machine-readable code for response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            WebhookError::RateLimited { .. } => "rate_limited",
            WebhookError::InvalidSignature { .. } => "invalid_signature",
            WebhookError::StaleTimestamp => "stale_timestamp",
            WebhookError::IpNotAllowed { .. } => "ip_not_allowed",
            WebhookError::UnknownProvider { .. } => "unknown_provider",
            WebhookError::MalformedPayload { .. } => "malformed_payload",
            WebhookError::Dispatch { .. } => "dispatch_failed",
            WebhookError::Store { .. } => "store_unavailable",
        }
    }
}

/// Error returned by a [`CrmSink`].
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// CRM side of the bridge: receives each accepted call event once.
#[async_trait]
pub trait CrmSink: Send + Sync {
    async fn handle(&self, event: NormalizedCallEvent) -> Result<(), SinkError>;
}

/// Sink that only logs; used when no CRM backend is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCrmSink;

#[async_trait]
impl CrmSink for LogCrmSink {
    async fn handle(&self, event: NormalizedCallEvent) -> Result<(), SinkError> {
        info!(
            "[WEBHOOK] {} {} call {} from {} to {}",
            event.provider,
            event.event_type,
            event
                .call_id
                .as_deref()
                .unwrap_or("-"),
            event
                .caller
                .as_deref()
                .unwrap_or("-"),
            event
                .callee
                .as_deref()
                .unwrap_or("-"),
        );
        Ok(())
    }
}

/// Result of an accepted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Dispatched { event_id: Option<String> },
    /// Already processed; acknowledged without side effects.
    Duplicate { event_id: String },
}

/// One inbound webhook, transport-independent.
#[derive(Debug, Clone, Copy)]
pub struct WebhookRequest<'a> {
    pub provider: &'a str,
    pub client_ip: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

/// The webhook pipeline shared by all request workers.
pub struct WebhookIngress {
    providers: HashMap<String, ProviderConfig>,
    rate_limiter: Arc<dyn RateLimiter>,
    dedup: Arc<dyn IdempotencyStore>,
    sink: Arc<dyn CrmSink>,
}

impl std::fmt::Debug for WebhookIngress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut providers: Vec<_> = self
            .providers
            .keys()
            .collect();
        providers.sort();
        f.debug_struct("WebhookIngress")
            .field("providers", &providers)
            .finish()
    }
}

impl WebhookIngress {
    pub fn new(
        providers: HashMap<String, ProviderConfig>,
        rate_limiter: Arc<dyn RateLimiter>,
        dedup: Arc<dyn IdempotencyStore>,
        sink: Arc<dyn CrmSink>,
    ) -> Self {
        let providers = providers
            .into_iter()
            .map(|(name, config)| (name.to_ascii_lowercase(), config))
            .collect();
        Self {
            providers,
            rate_limiter,
            dedup,
            sink,
        }
    }

    /// In-memory rate limiter and dedup store.
    pub fn in_memory(
        providers: HashMap<String, ProviderConfig>,
        sink: Arc<dyn CrmSink>,
        retention: std::time::Duration,
    ) -> Self {
        Self::new(
            providers,
            Arc::new(InMemoryRateLimiter::new()),
            Arc::new(InMemoryIdempotencyStore::new(retention)),
            sink,
        )
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers
            .get(&name.to_ascii_lowercase())
    }

    /// Run one request through every stage.
    pub async fn handle(&self, request: WebhookRequest<'_>) -> Result<Outcome, WebhookError> {
        self.handle_at(request, Utc::now())
            .await
    }

    pub(crate) async fn handle_at(
        &self,
        request: WebhookRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<Outcome, WebhookError> {
        let provider_name = request
            .provider
            .to_ascii_lowercase();
        let Some(config) = self
            .providers
            .get(&provider_name)
        else {
            debug!("[WEBHOOK] Unknown provider {}", request.provider);
            return Err(WebhookError::UnknownProvider {
                provider: request
                    .provider
                    .to_string(),
            });
        };

        if let RateDecision::Limited { retry_after } = self
            .rate_limiter
            .check(&provider_name, request.client_ip, config.rate_limit())
            .await
        {
            warn!("[WEBHOOK] {} rate limited for {}", provider_name, request.client_ip);
            return Err(WebhookError::RateLimited {
                retry_after_secs: retry_after
                    .as_secs()
                    .max(1),
            });
        }

        if !signature::ip_allowed(&config.allowed_ips, request.client_ip) {
            warn!("[WEBHOOK] {} rejected client {}", provider_name, request.client_ip);
            return Err(WebhookError::IpNotAllowed {
                ip: request
                    .client_ip
                    .to_string(),
            });
        }

        let payload = Payload::parse(request.headers, request.body);
        if let Err(e) = config
            .scheme()
            .verify(
                config
                    .secret
                    .as_ref(),
                request.headers,
                request.body,
                payload
                    .as_ref()
                    .ok(),
                now,
            )
        {
            warn!("[WEBHOOK] {} signature check failed: {}", provider_name, e);
            return Err(e);
        }
        let payload = payload?;

        let event_id = config.event_id(&payload);
        let dedup_key = config.dedup_key(&payload);
        match (&dedup_key, &event_id) {
            (Some(key), Some(id)) => {
                let inserted = self
                    .dedup
                    .insert_if_absent(&provider_name, key)
                    .await?;
                if !inserted {
                    info!("[WEBHOOK] {} event {} already processed", provider_name, key);
                    return Ok(Outcome::Duplicate {
                        event_id: id.clone(),
                    });
                }
            }
            _ => debug!("[WEBHOOK] {} payload has no event id, skipping dedup", provider_name),
        }

        let event = config.normalize(&provider_name, &payload, now);
        if let Err(e) = self
            .sink
            .handle(event)
            .await
        {
            warn!("[WEBHOOK] {} dispatch failed: {}", provider_name, e);
            if let Some(key) = &dedup_key {
                self.dedup
                    .release(&provider_name, key)
                    .await;
            }
            return Err(WebhookError::Dispatch {
                reason: e.to_string(),
            });
        }
        debug!("[WEBHOOK] {} event {:?} dispatched", provider_name, event_id);
        Ok(Outcome::Dispatched { event_id })
    }
}
