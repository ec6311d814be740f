//! Queue state aggregation
//!
//! [`QueueMonitor`] keeps one [`QueueSnapshot`] per queue, rebuilt from
//! `QueueStatus` and patched by queue events in between. [`summarize`] and
//! [`compute_alerts`] are pure functions over a snapshot.

mod monitor;
mod snapshot;

pub use monitor::{AlertSink, LogAlertSink, QueueMonitor, QueueMonitorConfig};
pub use snapshot::{
    build_snapshots, compute_alerts, is_queue_event, summarize, summarize_at, MemberStatus,
    QueueAlert, QueueAlertKind, QueueCaller, QueueMember, QueueSnapshot, QueueSummary,
};
