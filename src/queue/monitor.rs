use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::snapshot::{
    build_snapshots, compute_alerts, is_queue_event, summarize, QueueAlert, QueueAlertKind,
    QueueSnapshot, QueueSummary,
};
use crate::{
    action::AmiResponse,
    commands::{AmiCommand, QueueAdd, QueuePause, QueuePenalty, QueueReload, QueueRemove, QueueStatus},
    connection::{AmiClient, ConnectionState},
    error::AmiResult,
    event::{AmiEvent, EventFilter},
};

/// Floor for the alert timer; `tokio::time::interval` rejects zero.
const MIN_ALERT_INTERVAL: Duration = Duration::from_millis(100);

/// Tuning for [`QueueMonitor`].
#[derive(Debug, Clone)]
pub struct QueueMonitorConfig {
    /// A snapshot untouched for longer than this is stale.
    pub freshness: Duration,
    /// Callers waiting longer than this raise a `long_wait` alert.
    pub long_wait_threshold: Duration,
    /// How often alerts are re-evaluated without new events.
    pub alert_interval: Duration,
    /// Queues to track. Empty tracks every queue.
    pub queues: Vec<String>,
}

impl Default for QueueMonitorConfig {
    fn default() -> Self {
        Self {
            freshness: Duration::from_secs(60),
            long_wait_threshold: Duration::from_secs(120),
            alert_interval: Duration::from_secs(15),
            queues: Vec::new(),
        }
    }
}

/// Receives queue alerts when they become active and when they clear.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: &QueueAlert);

    async fn clear(&self, _queue: &str, _kind: QueueAlertKind) {}
}

/// Sink that logs alerts through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn raise(&self, alert: &QueueAlert) {
        warn!("[QUEUE] {:?} alert: {}", alert.kind, alert.message);
    }

    async fn clear(&self, queue: &str, kind: QueueAlertKind) {
        info!("[QUEUE] {:?} alert cleared for {}", kind, queue);
    }
}

/// Live per-queue state: rebuilt by `QueueStatus`, patched by events.
///
/// Snapshots sit behind one `RwLock`; a refresh replaces every affected
/// queue under a single write lock so readers never see a half-rebuilt
/// queue. The lock is never held across an `.await`.
pub struct QueueMonitor {
    client: AmiClient,
    config: QueueMonitorConfig,
    snapshots: RwLock<HashMap<String, QueueSnapshot>>,
    sink: Option<Arc<dyn AlertSink>>,
    active_alerts: Mutex<HashSet<(String, QueueAlertKind)>>,
}

impl std::fmt::Debug for QueueMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMonitor")
            .field("config", &self.config)
            .field("queues", &self.read().len())
            .finish()
    }
}

impl QueueMonitor {
    pub fn new(client: AmiClient, config: QueueMonitorConfig) -> Self {
        Self {
            client,
            config,
            snapshots: RwLock::new(HashMap::new()),
            sink: None,
            active_alerts: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &QueueMonitorConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, QueueSnapshot>> {
        self.snapshots
            .read()
            .unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, QueueSnapshot>> {
        self.snapshots
            .write()
            .unwrap_or_else(|p| p.into_inner())
    }

    fn is_tracked(&self, queue: &str) -> bool {
        self.config
            .queues
            .is_empty()
            || self
                .config
                .queues
                .iter()
                .any(|q| q == queue)
    }

    async fn run(&self, command: &impl AmiCommand) -> AmiResult<AmiResponse> {
        let action = command.to_action()?;
        self.client
            .execute_ok(action)
            .await
    }

    /// Rebuild snapshots from a `QueueStatus` query.
    ///
    /// With `Some(queue)` only that queue is replaced (and dropped if the
    /// PBX no longer reports it); with `None` the whole map is replaced.
    pub async fn refresh(&self, queue: Option<&str>) -> AmiResult<Vec<QueueSnapshot>> {
        let command = QueueStatus {
            queue: queue.map(str::to_string),
            member: None,
        };
        let response = self
            .run(&command)
            .await?;
        let mut fresh = build_snapshots(response.events(), Utc::now());
        fresh.retain(|s| self.is_tracked(&s.name));

        {
            let mut snapshots = self.write();
            match queue {
                Some(name) => {
                    snapshots.remove(name);
                }
                None => snapshots.clear(),
            }
            for snapshot in &fresh {
                snapshots.insert(
                    snapshot
                        .name
                        .clone(),
                    snapshot.clone(),
                );
            }
        }
        debug!(
            "[QUEUE] Refreshed {} ({} queue(s))",
            queue.unwrap_or("all queues"),
            fresh.len()
        );
        Ok(fresh)
    }

    /// Apply one event. Returns whether any snapshot changed.
    ///
    /// An event for a queue with no snapshot triggers a refresh of that
    /// queue first.
    pub async fn on_event(&self, event: &AmiEvent) -> AmiResult<bool> {
        if !is_queue_event(event) {
            return Ok(false);
        }
        let Some(queue) = event.queue() else {
            return Ok(false);
        };
        if !self.is_tracked(queue) {
            return Ok(false);
        }

        let known = self
            .read()
            .contains_key(queue);
        if !known {
            debug!("[QUEUE] {} event for unknown queue {}, refreshing", event.name(), queue);
            self.refresh(Some(queue))
                .await?;
        }

        let now = Utc::now();
        let applied = self
            .write()
            .entry(queue.to_string())
            .or_insert_with(|| QueueSnapshot::new(queue, now))
            .apply_event(event, now);
        if applied {
            self.evaluate_alerts(Some(queue))
                .await;
        }
        Ok(applied)
    }

    /// Cached snapshot, possibly stale.
    pub fn snapshot(&self, queue: &str) -> Option<QueueSnapshot> {
        self.read()
            .get(queue)
            .cloned()
    }

    /// Snapshot, refreshed first when stale or missing.
    pub async fn snapshot_fresh(&self, queue: &str) -> AmiResult<Option<QueueSnapshot>> {
        if self.is_stale(queue) {
            self.refresh(Some(queue))
                .await?;
        }
        Ok(self.snapshot(queue))
    }

    /// All cached snapshots, ordered by queue name.
    pub fn snapshots(&self) -> Vec<QueueSnapshot> {
        let mut all: Vec<_> = self
            .read()
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
        });
        all
    }

    /// `true` when the queue is unknown or older than the freshness window.
    pub fn is_stale(&self, queue: &str) -> bool {
        self.read()
            .get(queue)
            .map_or(true, |s| s.is_stale(self.config.freshness, Utc::now()))
    }

    pub fn summary(&self, queue: &str) -> Option<QueueSummary> {
        self.read()
            .get(queue)
            .map(summarize)
    }

    pub fn summaries(&self) -> Vec<QueueSummary> {
        self.snapshots()
            .iter()
            .map(summarize)
            .collect()
    }

    /// Currently applicable alerts across all tracked queues.
    pub fn alerts(&self) -> Vec<QueueAlert> {
        self.summaries()
            .iter()
            .flat_map(|s| compute_alerts(s, self.config.long_wait_threshold))
            .collect()
    }

    /// Compare current alerts to the active set and notify the sink about
    /// transitions only.
    async fn evaluate_alerts(&self, queue: Option<&str>) {
        let current: Vec<QueueAlert> = match queue {
            Some(name) => self
                .summary(name)
                .map(|s| compute_alerts(&s, self.config.long_wait_threshold))
                .unwrap_or_default(),
            None => self.alerts(),
        };
        let current_keys: HashSet<(String, QueueAlertKind)> = current
            .iter()
            .map(|a| (a.queue.clone(), a.kind))
            .collect();

        let (raised, cleared) = {
            let mut active = self
                .active_alerts
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            let in_scope = |key: &(String, QueueAlertKind)| queue.map_or(true, |q| key.0 == q);
            let cleared: Vec<_> = active
                .iter()
                .filter(|k| in_scope(k) && !current_keys.contains(*k))
                .cloned()
                .collect();
            for key in &cleared {
                active.remove(key);
            }
            let raised: Vec<_> = current
                .into_iter()
                .filter(|a| active.insert((a.queue.clone(), a.kind)))
                .collect();
            (raised, cleared)
        };

        let Some(sink) = &self.sink else {
            return;
        };
        for alert in &raised {
            sink.raise(alert)
                .await;
        }
        for (queue, kind) in &cleared {
            sink.clear(queue, *kind)
                .await;
        }
    }

    pub async fn add_member(
        &self,
        queue: &str,
        interface: &str,
        member_name: Option<&str>,
        penalty: u32,
    ) -> AmiResult<()> {
        let mut command = QueueAdd::new(queue, interface).penalty(penalty);
        if let Some(name) = member_name {
            command = command.member_name(name);
        }
        self.run(&command)
            .await?;
        info!("[QUEUE] Added {} to {}", interface, queue);
        Ok(())
    }

    pub async fn remove_member(&self, queue: &str, interface: &str) -> AmiResult<()> {
        self.run(&QueueRemove {
            queue: queue.to_string(),
            interface: interface.to_string(),
        })
        .await?;
        info!("[QUEUE] Removed {} from {}", interface, queue);
        Ok(())
    }

    /// Pause or unpause a member; `queue: None` applies to every queue.
    pub async fn pause_member(
        &self,
        queue: Option<&str>,
        interface: &str,
        paused: bool,
        reason: Option<&str>,
    ) -> AmiResult<()> {
        self.run(&QueuePause {
            queue: queue.map(str::to_string),
            interface: interface.to_string(),
            paused,
            reason: reason.map(str::to_string),
        })
        .await?;
        Ok(())
    }

    pub async fn set_penalty(&self, queue: Option<&str>, interface: &str, penalty: u32) -> AmiResult<()> {
        self.run(&QueuePenalty {
            queue: queue.map(str::to_string),
            interface: interface.to_string(),
            penalty,
        })
        .await?;
        Ok(())
    }

    /// Reload queue configuration (members, rules and parameters).
    pub async fn reload_queue(&self, queue: Option<&str>) -> AmiResult<()> {
        self.run(&QueueReload {
            queue: queue.map(str::to_string),
            members: true,
            rules: true,
            parameters: true,
        })
        .await?;
        Ok(())
    }

    async fn refresh_logged(&self, queue: Option<&str>) {
        if let Err(e) = self
            .refresh(queue)
            .await
        {
            warn!("[QUEUE] Refresh failed: {}", e);
        }
    }

    /// Drive the monitor in the background.
    ///
    /// Applies queue events as they arrive, re-runs a full refresh every
    /// time the connection becomes Ready (initial connect and reconnects)
    /// or events were dropped, and re-evaluates alerts on a timer. Ends
    /// when the client shuts down.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            monitor
                .drive()
                .await
        })
    }

    async fn drive(&self) {
        let mut events = self
            .client
            .event_stream(EventFilter::All);
        let mut state_rx = self
            .client
            .state_watch();
        let mut ticker = tokio::time::interval(
            self.config
                .alert_interval
                .max(MIN_ALERT_INTERVAL),
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if self
            .client
            .is_shutdown()
        {
            debug!("[QUEUE] Client already shut down");
            return;
        }
        if self
            .client
            .is_ready()
        {
            self.refresh_logged(None)
                .await;
        }

        loop {
            tokio::select! {
                item = events.recv() => match item {
                    Some(Ok(event)) => {
                        if let Err(e) = self.on_event(&event).await {
                            warn!("[QUEUE] Failed to apply {}: {}", event.name(), e);
                        }
                    }
                    Some(Err(e)) => {
                        warn!("[QUEUE] {}, resynchronising", e);
                        self.refresh_logged(None).await;
                    }
                    None => break,
                },
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *state_rx.borrow_and_update();
                    match state {
                        ConnectionState::Ready => {
                            info!("[QUEUE] Connection ready, full refresh");
                            self.refresh_logged(None).await;
                        }
                        ConnectionState::Closing | ConnectionState::Closed => break,
                        _ => {}
                    }
                }
                _ = ticker.tick() => self.evaluate_alerts(None).await,
            }
        }
        debug!("[QUEUE] Monitor stopped");
    }
}
