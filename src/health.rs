//! PBX health checks
//!
//! Each check classifies one facet as [`HealthStatus`]; a failing query
//! marks its facet unhealthy with the error message instead of returning
//! an error. [`HealthReport`] carries the worst facet as its overall status.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::{
    action::{AmiAction, AmiResponse},
    commands::{AmiCommand, CoreShowChannels},
    connection::{AmiClient, ConnectionState},
    error::AmiResult,
    event::AmiEvent,
    headers::AmiHeader,
    queue::{QueueAlert, QueueMonitor},
};

/// Floor for the report timer; `tokio::time::interval` rejects zero.
const MIN_REPORT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// The more severe of the two.
    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        self.max(other)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Which peer listing the channel check runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerListing {
    /// `SIPpeers` (chan_sip), `PeerEntry` records.
    #[default]
    Sip,
    /// `PJSIPShowEndpoints`, `EndpointList` records.
    Pjsip,
    /// Skip the peer check.
    None,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub ping_timeout: Duration,
    pub peer_listing: PeerListing,
    /// Online share at or above which peers are healthy.
    pub healthy_ratio: f64,
    /// Online share at or above which peers are degraded.
    pub degraded_ratio: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(5),
            peer_listing: PeerListing::Sip,
            healthy_ratio: 0.9,
            degraded_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionCheck {
    pub status: HealthStatus,
    pub state: String,
    pub response_time_ms: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PeerCounts {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub unmonitored: usize,
}

impl PeerCounts {
    pub fn from_records(records: &[AmiEvent]) -> Self {
        let mut counts = PeerCounts::default();
        for record in records {
            counts.total += 1;
            match peer_state(record) {
                PeerState::Online => counts.online += 1,
                PeerState::Offline => counts.offline += 1,
                PeerState::Unmonitored => counts.unmonitored += 1,
            }
        }
        counts
    }

    /// Classify by online share; `None` when there are no peers.
    pub fn status(&self, healthy_ratio: f64, degraded_ratio: f64) -> Option<HealthStatus> {
        if self.total == 0 {
            return None;
        }
        let ratio = self.online as f64 / self.total as f64;
        Some(if ratio >= healthy_ratio {
            HealthStatus::Healthy
        } else if ratio >= degraded_ratio {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        })
    }
}

enum PeerState {
    Online,
    Offline,
    Unmonitored,
}

/// chan_sip reports `Status` (`OK (12 ms)`, `UNREACHABLE`, `LAGGED`,
/// `Unmonitored`); PJSIP endpoints report `DeviceState`.
fn peer_state(record: &AmiEvent) -> PeerState {
    if let Some(status) = record.header(AmiHeader::Status) {
        let status = status.to_ascii_lowercase();
        if status.contains("unreachable") || status.contains("lagged") {
            PeerState::Offline
        } else if status.starts_with("ok") || status.contains("reachable") {
            PeerState::Online
        } else {
            PeerState::Unmonitored
        }
    } else if let Some(state) = record.header(AmiHeader::DeviceState) {
        match state
            .to_ascii_lowercase()
            .as_str()
        {
            "unavailable" | "invalid" => PeerState::Offline,
            "unknown" | "" => PeerState::Unmonitored,
            _ => PeerState::Online,
        }
    } else {
        PeerState::Unmonitored
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelsCheck {
    pub status: HealthStatus,
    pub active_channels: usize,
    pub peers: PeerCounts,
    pub note: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuesCheck {
    pub status: HealthStatus,
    pub queues: usize,
    pub calls_waiting: usize,
    pub alerts: Vec<QueueAlert>,
}

/// `CoreSettings` and `CoreStatus` fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SystemInfo {
    pub version: Option<String>,
    pub ami_version: Option<String>,
    pub system_name: Option<String>,
    /// PBX-local `date time` of the last start.
    pub startup: Option<String>,
    pub last_reload: Option<String>,
    pub current_calls: u64,
}

impl SystemInfo {
    pub fn from_responses(settings: &AmiResponse, status: &AmiResponse) -> Self {
        let owned = |r: &AmiResponse, h: AmiHeader| {
            r.header(h)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let joined = |r: &AmiResponse, date: &str, time: AmiHeader| {
            match (r.header(date), r.header(time)) {
                (Some(d), Some(t)) if !d.is_empty() => Some(format!("{} {}", d, t)),
                (_, Some(t)) if !t.is_empty() => Some(t.to_string()),
                _ => None,
            }
        };
        Self {
            version: owned(settings, AmiHeader::AsteriskVersion),
            ami_version: settings
                .header("AMIversion")
                .map(str::to_string),
            system_name: owned(settings, AmiHeader::SystemName),
            startup: joined(status, "CoreStartupDate", AmiHeader::CoreStartupTime),
            last_reload: joined(status, "CoreReloadDate", AmiHeader::CoreReloadTime),
            current_calls: status
                .header(AmiHeader::CoreCurrentCalls)
                .and_then(|v| {
                    v.trim()
                        .parse()
                        .ok()
                })
                .unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub connection: ConnectionCheck,
    pub channels: Option<ChannelsCheck>,
    pub queues: Option<QueuesCheck>,
    pub system: Option<SystemInfo>,
    pub checked_at: DateTime<Utc>,
}

/// Runs health checks over a shared client.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    client: AmiClient,
    queues: Option<Arc<QueueMonitor>>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(client: AmiClient, config: HealthConfig) -> Self {
        Self {
            client,
            queues: None,
            config,
        }
    }

    /// Include queue alerts in reports.
    pub fn with_queue_monitor(mut self, queues: Arc<QueueMonitor>) -> Self {
        self.queues = Some(queues);
        self
    }

    /// `Ping` round trip under the ping timeout.
    pub async fn check_connection(&self) -> ConnectionCheck {
        let state = self
            .client
            .state();
        let started = Instant::now();
        let ping = AmiAction::new("Ping").timeout(self.config.ping_timeout);
        match self
            .client
            .execute_ok(ping)
            .await
        {
            Ok(_) => {
                let elapsed = started.elapsed();
                ConnectionCheck {
                    status: HealthStatus::Healthy,
                    state: state.to_string(),
                    response_time_ms: Some((elapsed.as_secs_f64() * 100_000.0).round() / 100.0),
                    error: None,
                }
            }
            Err(e) => {
                warn!("[HEALTH] Ping failed: {}", e);
                ConnectionCheck {
                    status: HealthStatus::Unhealthy,
                    state: state.to_string(),
                    response_time_ms: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn list_peers(&self) -> AmiResult<Option<Vec<AmiEvent>>> {
        let (action, record) = match self.config.peer_listing {
            PeerListing::Sip => ("SIPpeers", "PeerEntry"),
            PeerListing::Pjsip => ("PJSIPShowEndpoints", "EndpointList"),
            PeerListing::None => return Ok(None),
        };
        let response = self
            .client
            .execute_ok(AmiAction::new(action))
            .await?;
        Ok(Some(
            response
                .events_named(record)
                .cloned()
                .collect(),
        ))
    }

    /// Active channel count and peer reachability.
    pub async fn check_channels(&self) -> ChannelsCheck {
        let channels = match CoreShowChannels.to_action() {
            Ok(action) => self
                .client
                .execute_ok(action)
                .await,
            Err(e) => Err(e),
        };
        let active_channels = match channels {
            Ok(response) => response
                .events_named("CoreShowChannel")
                .count(),
            Err(e) => return failed_channels_check(e.to_string()),
        };

        let peers = match self
            .list_peers()
            .await
        {
            Ok(peers) => peers,
            Err(e) => return failed_channels_check(e.to_string()),
        };
        let counts = peers
            .as_deref()
            .map(PeerCounts::from_records)
            .unwrap_or_default();
        let (status, note) = match counts.status(self.config.healthy_ratio, self.config.degraded_ratio) {
            Some(status) => (status, None),
            None if peers.is_none() => (HealthStatus::Healthy, Some("peer check disabled".to_string())),
            None => (HealthStatus::Healthy, Some("no peers configured".to_string())),
        };
        debug!(
            "[HEALTH] {} channels, peers {}/{} online",
            active_channels, counts.online, counts.total
        );
        ChannelsCheck {
            status,
            active_channels,
            peers: counts,
            note,
            error: None,
        }
    }

    /// Queue alerts from the queue monitor; any alert degrades.
    pub fn check_queues(&self) -> Option<QueuesCheck> {
        let monitor = self
            .queues
            .as_ref()?;
        let summaries = monitor.summaries();
        let alerts = monitor.alerts();
        Some(QueuesCheck {
            status: if alerts.is_empty() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            queues: summaries.len(),
            calls_waiting: summaries
                .iter()
                .map(|s| s.calls_waiting)
                .sum(),
            alerts,
        })
    }

    /// PBX version, name, start time and current calls.
    pub async fn system_info(&self) -> AmiResult<SystemInfo> {
        let settings = self
            .client
            .execute_ok(AmiAction::new("CoreSettings"))
            .await?;
        let status = self
            .client
            .execute_ok(AmiAction::new("CoreStatus"))
            .await?;
        Ok(SystemInfo::from_responses(&settings, &status))
    }

    /// Run every check. Without a working connection the remaining checks
    /// are skipped and the report is unhealthy.
    pub async fn full_report(&self) -> HealthReport {
        let connection = self
            .check_connection()
            .await;
        if connection.status == HealthStatus::Unhealthy {
            return HealthReport {
                status: HealthStatus::Unhealthy,
                connection,
                channels: None,
                queues: self.check_queues(),
                system: None,
                checked_at: Utc::now(),
            };
        }

        let (channels, system) = tokio::join!(self.check_channels(), self.system_info());
        let system = system
            .map_err(|e| debug!("[HEALTH] System info unavailable: {}", e))
            .ok();
        let queues = self.check_queues();

        let mut status = connection
            .status
            .worst(channels.status);
        if let Some(queues) = &queues {
            status = status.worst(queues.status);
        }
        HealthReport {
            status,
            connection,
            channels: Some(channels),
            queues,
            system,
            checked_at: Utc::now(),
        }
    }

    /// Produce a report every `interval`, published through a watch
    /// channel. Stops when every receiver is gone or the client shuts down.
    pub fn spawn(
        self: &Arc<Self>,
        interval: Duration,
    ) -> (watch::Receiver<Option<HealthReport>>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(None);
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_REPORT_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut state_rx = monitor
                .client
                .state_watch();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = state_rx.wait_for(|s| *s == ConnectionState::Closed) => break,
                    _ = tx.closed() => break,
                }
                if monitor
                    .client
                    .is_shutdown()
                {
                    break;
                }
                let report = monitor
                    .full_report()
                    .await;
                if report.status != HealthStatus::Healthy {
                    warn!("[HEALTH] PBX is {}", report.status);
                }
                tx.send_replace(Some(report));
            }
            debug!("[HEALTH] Monitor stopped");
        });
        (rx, handle)
    }
}

fn failed_channels_check(error: String) -> ChannelsCheck {
    warn!("[HEALTH] Channel check failed: {}", error);
    ChannelsCheck {
        status: HealthStatus::Unhealthy,
        active_channels: 0,
        peers: PeerCounts::default(),
        note: None,
        error: Some(error),
    }
}
