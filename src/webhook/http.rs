//! axum surface: webhook receiver and read-only health route

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::to_bytes;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{header::RETRY_AFTER, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;

use super::{Outcome, WebhookError, WebhookIngress, WebhookRequest};
use crate::health::{HealthReport, HealthStatus};

/// Largest accepted webhook body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub ingress: Arc<WebhookIngress>,
    /// Latest report from [`HealthMonitor::spawn`](crate::health::HealthMonitor::spawn).
    pub health: Option<watch::Receiver<Option<HealthReport>>>,
    /// Peers allowed to set the client address through forwarding headers.
    pub trusted_proxies: Arc<[IpAddr]>,
}

impl AppState {
    pub fn new(ingress: Arc<WebhookIngress>) -> Self {
        Self {
            ingress,
            health: None,
            trusted_proxies: Arc::from(Vec::new()),
        }
    }

    pub fn with_trusted_proxies(mut self, proxies: impl Into<Vec<IpAddr>>) -> Self {
        self.trusted_proxies = Arc::from(proxies.into());
        self
    }

    pub fn with_health(mut self, health: watch::Receiver<Option<HealthReport>>) -> Self {
        self.health = Some(health);
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/webhooks/{provider}",
            post(receive_webhook).get(verify_webhook),
        )
        .route("/health", get(health_handler))
        .with_state(state)
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = match &self {
            WebhookError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        let mut response = (
            status,
            Json(json!({"error": {"code": self.code(), "message": self.to_string()}})),
        )
            .into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[derive(Serialize)]
struct Accepted {
    status: &'static str,
    #[serde(flatten)]
    outcome: Outcome,
}

/// Client address: the socket peer, unless the peer is a trusted proxy, in
/// which case the `X-Forwarded-For` first hop, then `X-Real-IP`, is used.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trusted_proxies: &[IpAddr]) -> String {
    let Some(peer) = peer.map(|p| p.ip()) else {
        return "unknown".to_string();
    };
    if !trusted_proxies.contains(&peer) {
        return peer.to_string();
    }
    for name in ["x-forwarded-for", "x-real-ip"] {
        let first_hop = headers
            .get(name)
            .and_then(|v| {
                v.to_str()
                    .ok()
            })
            .and_then(|v| {
                v.split(',')
                    .next()
            })
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = first_hop {
            return ip.to_string();
        }
    }
    peer.to_string()
}

async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    request: Request,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0);
    let ip = client_ip(request.headers(), peer, &state.trusted_proxies);
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(_) => return WebhookError::malformed("body unreadable or too large").into_response(),
    };

    let result = state
        .ingress
        .handle(WebhookRequest {
            provider: &provider,
            client_ip: &ip,
            headers: &parts.headers,
            body: &body,
        })
        .await;
    match result {
        Ok(outcome) => (
            StatusCode::OK,
            Json(Accepted {
                status: "ok",
                outcome,
            }),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Zadarma checks a webhook URL by sending `?zd_echo=<value>` and expecting
/// the value back verbatim.
async fn verify_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if state
        .ingress
        .provider(&provider)
        .is_none()
    {
        return WebhookError::UnknownProvider { provider }.into_response();
    }
    let echo = query
        .get("zd_echo")
        .cloned()
        .unwrap_or_default();
    (StatusCode::OK, echo).into_response()
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let report = state
        .health
        .as_ref()
        .and_then(|rx| {
            rx.borrow()
                .clone()
        });
    match report {
        Some(report) => {
            let status = if report.status == HealthStatus::Unhealthy {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            (status, Json(report)).into_response()
        }
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unknown", "message": "no health report yet"})),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_precedence() {
        let peer: SocketAddr = "192.0.2.10:5555".parse().unwrap();
        let trusted: Vec<IpAddr> = vec![peer.ip()];
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some(peer), &trusted), "192.0.2.10");
        assert_eq!(client_ip(&headers, None, &trusted), "unknown");

        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        assert_eq!(client_ip(&headers, Some(peer), &trusted), "198.51.100.2");

        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers, Some(peer), &trusted), "203.0.113.9");
    }

    #[test]
    fn forwarding_headers_ignored_from_untrusted_peer() {
        let peer: SocketAddr = "192.0.2.10:5555".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9".parse().unwrap());
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        assert_eq!(client_ip(&headers, Some(peer), &[]), "192.0.2.10");

        let other_proxy: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap()];
        assert_eq!(client_ip(&headers, Some(peer), &other_proxy), "192.0.2.10");
        assert_eq!(client_ip(&headers, None, &[]), "unknown");
    }

    #[test]
    fn error_responses_carry_status() {
        let response = WebhookError::RateLimited {
            retry_after_secs: 30,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get(RETRY_AFTER)
                .unwrap(),
            "30"
        );
        assert_eq!(
            WebhookError::StaleTimestamp
                .into_response()
                .status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
