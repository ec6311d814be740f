//! Bridge configuration
//!
//! Layered with figment: built-in defaults, then a TOML file, then
//! `PBX_BRIDGE_`-prefixed environment variables (`__` separates sections,
//! e.g. `PBX_BRIDGE_AMI__SECRET`). Secrets are read as plain strings and
//! wrapped in [`SecretString`] when the runtime options are built.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::AmiConnectOptions;
use crate::constants::{
    DEFAULT_AMI_PORT, DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_EVENT_MASK, DEFAULT_LOGIN_TIMEOUT_MS,
    DEFAULT_RECONNECT_INITIAL_MS, DEFAULT_RECONNECT_MAX_MS, DEFAULT_TIMEOUT_MS, MAX_EVENT_QUEUE_SIZE,
};
use crate::health::{HealthConfig, PeerListing};
use crate::queue::QueueMonitorConfig;
use crate::webhook::{signature::SignatureScheme, ProviderConfig, ProviderKind, RateLimit};

pub const ENV_PREFIX: &str = "PBX_BRIDGE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub ami: AmiSettings,
    #[serde(default)]
    pub queues: QueueSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub webhooks: WebhookSettings,
}

#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AmiSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
    pub tls: bool,
    pub tls_server_name: Option<String>,
    pub connect_timeout_ms: u64,
    pub login_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub events: String,
    pub event_queue_size: usize,
    pub liveness_timeout_ms: Option<u64>,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl std::fmt::Debug for AmiSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .field("tls", &self.tls)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl Default for AmiSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: DEFAULT_AMI_PORT,
            username: String::new(),
            secret: String::new(),
            tls: false,
            tls_server_name: None,
            connect_timeout_ms: DEFAULT_TIMEOUT_MS,
            login_timeout_ms: DEFAULT_LOGIN_TIMEOUT_MS,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            events: DEFAULT_EVENT_MASK.into(),
            event_queue_size: MAX_EVENT_QUEUE_SIZE,
            liveness_timeout_ms: None,
            reconnect_initial_ms: DEFAULT_RECONNECT_INITIAL_MS,
            reconnect_max_ms: DEFAULT_RECONNECT_MAX_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueSettings {
    pub enabled: bool,
    pub freshness_secs: u64,
    pub long_wait_secs: u64,
    pub alert_interval_secs: u64,
    /// Empty tracks every queue.
    pub queues: Vec<String>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            freshness_secs: 60,
            long_wait_secs: 120,
            alert_interval_secs: 15,
            queues: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub ping_timeout_ms: u64,
    pub peer_listing: PeerListing,
    pub healthy_ratio: f64,
    pub degraded_ratio: f64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            ping_timeout_ms: 5000,
            peer_listing: PeerListing::Sip,
            healthy_ratio: 0.9,
            degraded_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebhookSettings {
    pub enabled: bool,
    pub listen: String,
    pub dedup_retention_secs: u64,
    /// RocksDB directory for processed-event records. Unset keeps them in
    /// memory only.
    pub dedup_path: Option<PathBuf>,
    /// Reverse proxies whose `X-Forwarded-For`/`X-Real-IP` are believed.
    pub trusted_proxies: Vec<IpAddr>,
    /// Keyed by the `{provider}` path segment.
    pub providers: HashMap<String, ProviderSettings>,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "0.0.0.0:8080".into(),
            dedup_retention_secs: 86_400,
            dedup_path: None,
            trusted_proxies: Vec::new(),
            providers: HashMap::new(),
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Per client address per window; defaults by kind.
    #[serde(default)]
    pub max_requests: Option<u32>,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// HMAC header override (generic providers).
    #[serde(default)]
    pub signature_header: Option<String>,
    #[serde(default)]
    pub signature_prefix: Option<String>,
    #[serde(default)]
    pub timestamp_header: Option<String>,
    #[serde(default = "default_tolerance_secs")]
    pub timestamp_tolerance_secs: u64,
    #[serde(default)]
    pub id_fields: Vec<String>,
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("kind", &self.kind)
            .field(
                "secret",
                &self
                    .secret
                    .as_ref()
                    .map(|_| "[REDACTED]"),
            )
            .field("allowed_ips", &self.allowed_ips)
            .field("max_requests", &self.max_requests)
            .finish_non_exhaustive()
    }
}

fn default_window_secs() -> u64 {
    60
}
fn default_tolerance_secs() -> u64 {
    300
}

impl ProviderSettings {
    fn to_provider_config(&self) -> ProviderConfig {
        let mut config = ProviderConfig::new(self.kind);
        config.secret = self
            .secret
            .clone()
            .filter(|s| !s.is_empty())
            .map(SecretString::from);
        config.allowed_ips = self
            .allowed_ips
            .clone();
        config.rate_limit = RateLimit::new(
            self.max_requests
                .unwrap_or(
                    config
                        .rate_limit
                        .max_requests,
                ),
            Duration::from_secs(self.window_secs),
        );
        if self.kind == ProviderKind::Generic
            && (self
                .signature_header
                .is_some()
                || self
                    .signature_prefix
                    .is_some()
                || self
                    .timestamp_header
                    .is_some())
        {
            config.scheme = Some(SignatureScheme::HmacSha256 {
                header: self
                    .signature_header
                    .clone()
                    .unwrap_or_else(|| "X-Hub-Signature-256".into()),
                prefix: self
                    .signature_prefix
                    .clone()
                    .unwrap_or_else(|| "sha256=".into()),
                timestamp_header: self
                    .timestamp_header
                    .clone(),
                tolerance: Duration::from_secs(self.timestamp_tolerance_secs),
            });
        }
        config.id_fields = self
            .id_fields
            .clone();
        config
    }
}

impl BridgeConfig {
    /// Defaults, then `path` (when given), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(BridgeConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: BridgeConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self
            .ami
            .host
            .trim()
            .is_empty()
        {
            return Err(invalid("ami.host", "must not be empty"));
        }
        if self.ami.port == 0 {
            return Err(invalid("ami.port", "must not be 0"));
        }
        if self
            .ami
            .username
            .trim()
            .is_empty()
        {
            return Err(invalid("ami.username", "must not be empty"));
        }
        if self.ami.event_queue_size == 0 {
            return Err(invalid("ami.event_queue_size", "must be at least 1"));
        }
        if self.ami.reconnect_initial_ms == 0 {
            return Err(invalid("ami.reconnect_initial_ms", "must be at least 1"));
        }
        if self.ami.reconnect_max_ms < self.ami.reconnect_initial_ms {
            return Err(invalid(
                "ami.reconnect_max_ms",
                "must not be below reconnect_initial_ms",
            ));
        }
        if self.queues.alert_interval_secs == 0 {
            return Err(invalid("queues.alert_interval_secs", "must be at least 1"));
        }
        let h = &self.health;
        if !(0.0..=1.0).contains(&h.degraded_ratio)
            || !(0.0..=1.0).contains(&h.healthy_ratio)
            || h.degraded_ratio > h.healthy_ratio
        {
            return Err(invalid(
                "health",
                "ratios must satisfy 0 <= degraded_ratio <= healthy_ratio <= 1",
            ));
        }
        if h.interval_secs == 0 {
            return Err(invalid("health.interval_secs", "must be at least 1"));
        }
        for (name, provider) in &self.webhooks.providers {
            let has_secret = provider
                .secret
                .as_deref()
                .is_some_and(|s| !s.is_empty());
            let needs_secret = matches!(provider.kind, ProviderKind::Zadarma | ProviderKind::Generic);
            if needs_secret && !has_secret {
                return Err(invalid(
                    format!("webhooks.providers.{}.secret", name),
                    "required for signed providers",
                ));
            }
            if provider.window_secs == 0 {
                return Err(invalid(
                    format!("webhooks.providers.{}.window_secs", name),
                    "must be at least 1",
                ));
            }
        }
        Ok(())
    }

    pub fn ami_options(&self) -> AmiConnectOptions {
        let ami = &self.ami;
        AmiConnectOptions {
            tls: ami.tls,
            tls_server_name: ami
                .tls_server_name
                .clone(),
            connect_timeout: Duration::from_millis(ami.connect_timeout_ms),
            login_timeout: Duration::from_millis(ami.login_timeout_ms),
            command_timeout: Duration::from_millis(ami.command_timeout_ms),
            events: ami
                .events
                .clone(),
            event_queue_size: ami.event_queue_size,
            liveness_timeout: ami
                .liveness_timeout_ms
                .map(Duration::from_millis),
            reconnect_initial_delay: Duration::from_millis(ami.reconnect_initial_ms),
            reconnect_max_delay: Duration::from_millis(ami.reconnect_max_ms),
            ..AmiConnectOptions::new(
                ami.host
                    .clone(),
                ami.port,
                ami.username
                    .clone(),
                ami.secret
                    .clone(),
            )
        }
    }

    pub fn queue_config(&self) -> QueueMonitorConfig {
        QueueMonitorConfig {
            freshness: Duration::from_secs(self.queues.freshness_secs),
            long_wait_threshold: Duration::from_secs(self.queues.long_wait_secs),
            alert_interval: Duration::from_secs(self.queues.alert_interval_secs),
            queues: self
                .queues
                .queues
                .clone(),
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            ping_timeout: Duration::from_millis(self.health.ping_timeout_ms),
            peer_listing: self.health.peer_listing,
            healthy_ratio: self.health.healthy_ratio,
            degraded_ratio: self.health.degraded_ratio,
        }
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health.interval_secs)
    }

    pub fn providers(&self) -> HashMap<String, ProviderConfig> {
        self.webhooks
            .providers
            .iter()
            .map(|(name, settings)| (name.clone(), settings.to_provider_config()))
            .collect()
    }

    pub fn dedup_retention(&self) -> Duration {
        Duration::from_secs(self.webhooks.dedup_retention_secs)
    }

    pub fn trusted_proxies(&self) -> Vec<IpAddr> {
        self.webhooks
            .trusted_proxies
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn from_toml(toml: &str) -> Result<BridgeConfig, ConfigError> {
        BridgeConfig::from_figment(
            Figment::new()
                .merge(Serialized::defaults(BridgeConfig::default()))
                .merge(Toml::string(toml)),
        )
    }

    const SAMPLE: &str = r#"
        [ami]
        host = "pbx.example.net"
        username = "crm"
        secret = "s3cret"
        tls = true
        command_timeout_ms = 4000

        [queues]
        long_wait_secs = 90
        queues = ["support", "sales"]

        [health]
        peer_listing = "pjsip"

        [webhooks.providers.zadarma]
        kind = "zadarma"
        secret = "zd"
        allowed_ips = ["185.45.152.42"]

        [webhooks.providers.onlinepbx]
        kind = "onlinepbx"

        [webhooks.providers.github]
        kind = "generic"
        secret = "gh"
        timestamp_header = "X-Timestamp"
        max_requests = 10
    "#;

    #[test]
    fn sample_config_loads() {
        let config = from_toml(SAMPLE).unwrap();
        let options = config.ami_options();
        assert_eq!(options.host, "pbx.example.net");
        assert_eq!(options.port, 5038);
        assert!(options.tls);
        assert_eq!(options.secret.expose_secret(), "s3cret");
        assert_eq!(options.command_timeout, Duration::from_secs(4));
        assert_eq!(options.login_timeout, Duration::from_millis(DEFAULT_LOGIN_TIMEOUT_MS));

        let queues = config.queue_config();
        assert_eq!(queues.long_wait_threshold, Duration::from_secs(90));
        assert_eq!(queues.freshness, Duration::from_secs(60));
        assert_eq!(queues.queues, vec!["support", "sales"]);
        assert_eq!(config.health_config().peer_listing, PeerListing::Pjsip);

        let providers = config.providers();
        assert_eq!(providers.len(), 3);
        assert_eq!(
            providers["onlinepbx"]
                .rate_limit()
                .max_requests,
            200
        );
        assert_eq!(
            providers["github"]
                .rate_limit()
                .max_requests,
            10
        );
        assert!(matches!(
            providers["github"].scheme(),
            SignatureScheme::HmacSha256 {
                timestamp_header: Some(_),
                ..
            }
        ));
        assert_eq!(providers["zadarma"].scheme(), SignatureScheme::zadarma());
    }

    #[test]
    fn missing_username_rejected() {
        let err = from_toml("[ami]\nhost = \"pbx\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "ami.username"));
    }

    #[test]
    fn signed_provider_needs_secret() {
        let toml = r#"
            [ami]
            username = "crm"
            [webhooks.providers.zd]
            kind = "zadarma"
        "#;
        let err = from_toml(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn bad_ratios_rejected() {
        let toml = r#"
            [ami]
            username = "crm"
            [health]
            healthy_ratio = 0.4
            degraded_ratio = 0.6
        "#;
        assert!(from_toml(toml).is_err());
    }

    #[test]
    fn zero_intervals_rejected() {
        let cases = [
            ("[ami]\nusername = \"crm\"\nreconnect_initial_ms = 0\n", "ami.reconnect_initial_ms"),
            (
                "[ami]\nusername = \"crm\"\nreconnect_initial_ms = 5000\nreconnect_max_ms = 1000\n",
                "ami.reconnect_max_ms",
            ),
            (
                "[ami]\nusername = \"crm\"\n[queues]\nalert_interval_secs = 0\n",
                "queues.alert_interval_secs",
            ),
        ];
        for (toml, expected) in cases {
            let err = from_toml(toml).unwrap_err();
            assert!(
                matches!(err, ConfigError::Validation { ref field, .. } if field == expected),
                "{}: {}",
                expected,
                err
            );
        }
    }

    #[test]
    fn webhook_proxy_and_store_settings() {
        let toml = r#"
            [ami]
            username = "crm"
            [webhooks]
            dedup_path = "/var/lib/pbx-bridge/dedup"
            trusted_proxies = ["10.0.0.1", "::1"]
        "#;
        let config = from_toml(toml).unwrap();
        assert_eq!(
            config
                .webhooks
                .dedup_path
                .as_deref(),
            Some(Path::new("/var/lib/pbx-bridge/dedup"))
        );
        let expected: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "::1".parse().unwrap()];
        assert_eq!(config.trusted_proxies(), expected);
        assert!(BridgeConfig::default()
            .webhooks
            .trusted_proxies
            .is_empty());
    }

    #[test]
    fn settings_debug_redacts_secrets() {
        let config = from_toml(SAMPLE).unwrap();
        let dump = format!("{:?}", config);
        assert!(!dump.contains("s3cret"));
        assert!(!dump.contains("\"zd\""));
        assert!(dump.contains("[REDACTED]"));
    }
}
