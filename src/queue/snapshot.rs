//! Per-queue state model, event patching, summaries and alert rules

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::event::{AmiEvent, AmiEventType};
use crate::headers::AmiHeader;

/// Device state of a queue member (`Status` header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Unknown,
    /// Idle and reachable.
    NotInUse,
    InUse,
    Busy,
    Invalid,
    Unavailable,
    Ringing,
    RingInUse,
    OnHold,
    Other(u8),
}

impl MemberStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => MemberStatus::Unknown,
            1 => MemberStatus::NotInUse,
            2 => MemberStatus::InUse,
            3 => MemberStatus::Busy,
            4 => MemberStatus::Invalid,
            5 => MemberStatus::Unavailable,
            6 => MemberStatus::Ringing,
            7 => MemberStatus::RingInUse,
            8 => MemberStatus::OnHold,
            other => MemberStatus::Other(other),
        }
    }

    pub fn is_available(&self) -> bool {
        *self == MemberStatus::NotInUse
    }

    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            MemberStatus::InUse
                | MemberStatus::Busy
                | MemberStatus::Ringing
                | MemberStatus::RingInUse
                | MemberStatus::OnHold
        )
    }
}

/// An agent logged into a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueMember {
    /// Dialable interface, the member key (`PJSIP/101`, `Local/101@agents`).
    pub interface: String,
    pub name: String,
    pub state_interface: Option<String>,
    pub status: MemberStatus,
    pub paused: bool,
    pub paused_reason: Option<String>,
    pub in_call: bool,
    pub calls_taken: u64,
    pub penalty: u32,
    /// Unix time of the last completed call, 0 if none.
    pub last_call: i64,
}

impl QueueMember {
    pub fn new(interface: impl Into<String>) -> Self {
        let interface = interface.into();
        Self {
            name: interface.clone(),
            interface,
            state_interface: None,
            status: MemberStatus::Unknown,
            paused: false,
            paused_reason: None,
            in_call: false,
            calls_taken: 0,
            penalty: 0,
            last_call: 0,
        }
    }

    /// Available: logged in, idle, not paused, not in a call.
    pub fn is_available(&self) -> bool {
        !self.paused && !self.in_call && self.status.is_available()
    }

    pub fn is_busy(&self) -> bool {
        self.in_call || self.status.is_busy()
    }

    /// Overwrite the fields present in a `QueueMember` record or member event.
    fn update_from(&mut self, event: &AmiEvent) {
        if let Some(name) = event
            .header(AmiHeader::MemberName)
            .or_else(|| event.header(AmiHeader::Name))
            .filter(|n| !n.is_empty())
        {
            self.name = name.to_string();
        }
        if let Some(si) = event.header(AmiHeader::StateInterface) {
            self.state_interface = Some(si.to_string());
        }
        if let Some(code) = event.header_as::<u8>(AmiHeader::Status) {
            self.status = MemberStatus::from_code(code);
        }
        if let Some(paused) = event.header(AmiHeader::Paused) {
            self.paused = parse_flag(paused);
        }
        if let Some(reason) = event.header(AmiHeader::PausedReason) {
            self.paused_reason = Some(reason.to_string()).filter(|r| !r.is_empty());
        }
        if let Some(in_call) = event.header(AmiHeader::InCall) {
            self.in_call = parse_flag(in_call);
        }
        if let Some(calls) = event.header_as(AmiHeader::CallsTaken) {
            self.calls_taken = calls;
        }
        if let Some(penalty) = event.header_as(AmiHeader::Penalty) {
            self.penalty = penalty;
        }
        if let Some(last_call) = event.header_as(AmiHeader::LastCall) {
            self.last_call = last_call;
        }
    }
}

/// A caller waiting in a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueCaller {
    pub position: u32,
    pub channel: String,
    pub unique_id: Option<String>,
    pub caller_id_num: Option<String>,
    pub caller_id_name: Option<String>,
    /// Wait reported by the PBX at `observed_at`.
    pub wait_seconds: u64,
    pub observed_at: DateTime<Utc>,
}

impl QueueCaller {
    /// Wait as of `now`, extrapolated from the last observation.
    pub fn wait_at(&self, now: DateTime<Utc>) -> u64 {
        let elapsed = (now - self.observed_at)
            .num_seconds()
            .max(0) as u64;
        self.wait_seconds + elapsed
    }

    fn from_event(event: &AmiEvent, now: DateTime<Utc>) -> Option<Self> {
        let non_empty = |h: AmiHeader| {
            event
                .header(h)
                .filter(|v| !v.is_empty() && *v != "<unknown>")
                .map(str::to_string)
        };
        Some(Self {
            position: event
                .header_as(AmiHeader::Position)
                .unwrap_or(0),
            channel: non_empty(AmiHeader::Channel)?,
            unique_id: non_empty(AmiHeader::Uniqueid),
            caller_id_num: non_empty(AmiHeader::CallerIdNum),
            caller_id_name: non_empty(AmiHeader::CallerIdName),
            wait_seconds: event
                .header_as(AmiHeader::Wait)
                .unwrap_or(0),
            observed_at: now,
        })
    }
}

/// Live state of one queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub name: String,
    pub strategy: Option<String>,
    pub max: u32,
    /// Average hold time in seconds, as computed by the PBX.
    pub hold_time: u64,
    pub talk_time: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub service_level: u64,
    pub service_level_perf: f64,
    pub weight: u32,
    pub members: Vec<QueueMember>,
    /// Ordered by position.
    pub callers: Vec<QueueCaller>,
    /// Last full `QueueStatus` rebuild.
    pub refreshed_at: DateTime<Utc>,
    /// Last refresh or applied event.
    pub updated_at: DateTime<Utc>,
}

impl QueueSnapshot {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            strategy: None,
            max: 0,
            hold_time: 0,
            talk_time: 0,
            completed: 0,
            abandoned: 0,
            service_level: 0,
            service_level_perf: 0.0,
            weight: 0,
            members: Vec::new(),
            callers: Vec::new(),
            refreshed_at: now,
            updated_at: now,
        }
    }

    pub fn calls_waiting(&self) -> usize {
        self.callers
            .len()
    }

    pub fn member(&self, interface: &str) -> Option<&QueueMember> {
        self.members
            .iter()
            .find(|m| m.interface == interface)
    }

    /// `true` when nothing touched this snapshot within `window`.
    pub fn is_stale(&self, window: Duration, now: DateTime<Utc>) -> bool {
        let age = (now - self.updated_at)
            .to_std()
            .unwrap_or_default();
        age > window
    }

    fn apply_params(&mut self, event: &AmiEvent) {
        self.strategy = event
            .header(AmiHeader::Strategy)
            .map(str::to_string);
        self.max = event
            .header_as(AmiHeader::Max)
            .unwrap_or(0);
        self.hold_time = event
            .header_as(AmiHeader::HoldTime)
            .unwrap_or(0);
        self.talk_time = event
            .header_as(AmiHeader::TalkTime)
            .unwrap_or(0);
        self.completed = event
            .header_as(AmiHeader::Completed)
            .unwrap_or(0);
        self.abandoned = event
            .header_as(AmiHeader::Abandoned)
            .unwrap_or(0);
        self.service_level = event
            .header_as(AmiHeader::ServiceLevel)
            .unwrap_or(0);
        self.service_level_perf = event
            .header_as(AmiHeader::ServiceLevelPerf)
            .unwrap_or(0.0);
        self.weight = event
            .header_as(AmiHeader::Weight)
            .unwrap_or(0);
    }

    fn member_mut_or_insert(&mut self, interface: &str) -> &mut QueueMember {
        let index = match self
            .members
            .iter()
            .position(|m| m.interface == interface)
        {
            Some(i) => i,
            None => {
                self.members
                    .push(QueueMember::new(interface));
                self.members
                    .len()
                    - 1
            }
        };
        &mut self.members[index]
    }

    fn remove_caller(&mut self, event: &AmiEvent) -> bool {
        let unique_id = event.unique_id();
        let channel = event.channel();
        let before = self
            .callers
            .len();
        self.callers
            .retain(|c| {
                let same_uid = unique_id.is_some() && c.unique_id.as_deref() == unique_id;
                let same_channel = channel == Some(c.channel.as_str());
                !(same_uid || same_channel)
            });
        self.renumber();
        self.callers
            .len()
            != before
    }

    fn renumber(&mut self) {
        for (i, caller) in self
            .callers
            .iter_mut()
            .enumerate()
        {
            caller.position = i as u32 + 1;
        }
    }

    /// Patch the snapshot with one queue event. Returns `false` for events
    /// that don't affect queue state.
    pub fn apply_event(&mut self, event: &AmiEvent, now: DateTime<Utc>) -> bool {
        let Some(kind) = event.event_type() else {
            return false;
        };
        match kind {
            AmiEventType::QueueCallerJoin => {
                let Some(caller) = QueueCaller::from_event(event, now) else {
                    return false;
                };
                self.callers
                    .retain(|c| c.channel != caller.channel);
                let index = (caller.position as usize)
                    .saturating_sub(1)
                    .min(
                        self.callers
                            .len(),
                    );
                self.callers
                    .insert(index, caller);
                self.renumber();
            }
            AmiEventType::QueueCallerLeave => {
                self.remove_caller(event);
            }
            AmiEventType::QueueCallerAbandon => {
                self.remove_caller(event);
                self.abandoned += 1;
            }
            AmiEventType::QueueMemberStatus
            | AmiEventType::QueueMemberAdded
            | AmiEventType::QueueMemberPause
            | AmiEventType::QueueMemberPaused
            | AmiEventType::QueueMemberPenalty => {
                let Some(interface) = member_interface(event) else {
                    return false;
                };
                self.member_mut_or_insert(&interface)
                    .update_from(event);
            }
            AmiEventType::QueueMemberRemoved => {
                let Some(interface) = member_interface(event) else {
                    return false;
                };
                self.members
                    .retain(|m| m.interface != interface);
            }
            AmiEventType::AgentConnect => {
                if let Some(interface) = member_interface(event) {
                    let member = self.member_mut_or_insert(&interface);
                    member.in_call = true;
                    if !member
                        .status
                        .is_busy()
                    {
                        member.status = MemberStatus::InUse;
                    }
                }
                self.remove_caller(event);
            }
            AmiEventType::AgentComplete => {
                if let Some(interface) = member_interface(event) {
                    let member = self.member_mut_or_insert(&interface);
                    member.in_call = false;
                    member.calls_taken += 1;
                    member.last_call = now.timestamp();
                }
                self.completed += 1;
            }
            _ => return false,
        }
        self.updated_at = now;
        true
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes"
    )
}

/// Member key of a member-related event.
///
/// Asterisk 12+ sends `Interface`; 1.8/11 send `Location` (status records)
/// or `Member` (agent events).
fn member_interface(event: &AmiEvent) -> Option<String> {
    event
        .header(AmiHeader::Interface)
        .or_else(|| event.header(AmiHeader::Location))
        .or_else(|| event.header(AmiHeader::Member))
        .filter(|i| !i.is_empty())
        .map(str::to_string)
}

/// `true` for events the queue aggregator consumes.
pub fn is_queue_event(event: &AmiEvent) -> bool {
    matches!(
        event.event_type(),
        Some(
            AmiEventType::QueueCallerJoin
                | AmiEventType::QueueCallerLeave
                | AmiEventType::QueueCallerAbandon
                | AmiEventType::QueueMemberStatus
                | AmiEventType::QueueMemberAdded
                | AmiEventType::QueueMemberRemoved
                | AmiEventType::QueueMemberPause
                | AmiEventType::QueueMemberPaused
                | AmiEventType::QueueMemberPenalty
                | AmiEventType::AgentConnect
                | AmiEventType::AgentComplete
        )
    )
}

/// Rebuild snapshots from the records of one `QueueStatus` response.
///
/// Records are grouped by their `Queue` header; members and callers that
/// arrive before their `QueueParams` record still land in the right queue.
pub fn build_snapshots(records: &[AmiEvent], now: DateTime<Utc>) -> Vec<QueueSnapshot> {
    let mut queues: BTreeMap<String, QueueSnapshot> = BTreeMap::new();
    for record in records {
        let Some(name) = record.queue() else {
            continue;
        };
        let snapshot = queues
            .entry(name.to_string())
            .or_insert_with(|| QueueSnapshot::new(name, now));
        match record.event_type() {
            Some(AmiEventType::QueueParams) => snapshot.apply_params(record),
            Some(AmiEventType::QueueMember) => {
                if let Some(interface) = member_interface(record) {
                    snapshot
                        .member_mut_or_insert(&interface)
                        .update_from(record);
                }
            }
            Some(AmiEventType::QueueEntry) => {
                if let Some(caller) = QueueCaller::from_event(record, now) {
                    snapshot
                        .callers
                        .push(caller);
                }
            }
            _ => {}
        }
    }
    queues
        .into_values()
        .map(|mut snapshot| {
            snapshot
                .callers
                .sort_by_key(|c| c.position);
            snapshot
        })
        .collect()
}

/// Derived counters for one queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSummary {
    pub queue: String,
    pub calls_waiting: usize,
    pub available_agents: usize,
    pub busy_agents: usize,
    pub paused_agents: usize,
    pub total_agents: usize,
    /// Seconds.
    pub longest_wait: u64,
    pub avg_wait: u64,
    pub avg_hold_time: u64,
    pub avg_talk_time: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub service_level_perf: f64,
}

/// Summarize a snapshot as of now.
pub fn summarize(snapshot: &QueueSnapshot) -> QueueSummary {
    summarize_at(snapshot, Utc::now())
}

/// Summarize a snapshot with caller waits extrapolated to `now`.
pub fn summarize_at(snapshot: &QueueSnapshot, now: DateTime<Utc>) -> QueueSummary {
    let members = &snapshot.members;
    let waits: Vec<u64> = snapshot
        .callers
        .iter()
        .map(|c| c.wait_at(now))
        .collect();
    let longest_wait = waits
        .iter()
        .copied()
        .max()
        .unwrap_or(0);
    let avg_wait = if waits.is_empty() {
        0
    } else {
        waits
            .iter()
            .sum::<u64>()
            / waits.len() as u64
    };

    QueueSummary {
        queue: snapshot
            .name
            .clone(),
        calls_waiting: snapshot.calls_waiting(),
        available_agents: members
            .iter()
            .filter(|m| m.is_available())
            .count(),
        busy_agents: members
            .iter()
            .filter(|m| m.is_busy())
            .count(),
        paused_agents: members
            .iter()
            .filter(|m| m.paused)
            .count(),
        total_agents: members.len(),
        longest_wait,
        avg_wait,
        avg_hold_time: snapshot.hold_time,
        avg_talk_time: snapshot.talk_time,
        completed: snapshot.completed,
        abandoned: snapshot.abandoned,
        service_level_perf: snapshot.service_level_perf,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueAlertKind {
    /// Callers waiting with no agent available or busy.
    NoAgents,
    /// A caller has waited longer than the threshold.
    LongWait,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueAlert {
    pub queue: String,
    pub kind: QueueAlertKind,
    pub message: String,
    pub calls_waiting: usize,
    pub longest_wait: u64,
}

/// Alert rules over one summary.
pub fn compute_alerts(summary: &QueueSummary, long_wait_threshold: Duration) -> Vec<QueueAlert> {
    let mut alerts = Vec::new();
    if summary.calls_waiting > 0 && summary.available_agents + summary.busy_agents == 0 {
        alerts.push(QueueAlert {
            queue: summary
                .queue
                .clone(),
            kind: QueueAlertKind::NoAgents,
            message: format!(
                "{} calls waiting in {} with no agents",
                summary.calls_waiting, summary.queue
            ),
            calls_waiting: summary.calls_waiting,
            longest_wait: summary.longest_wait,
        });
    }
    if summary.longest_wait > long_wait_threshold.as_secs() {
        alerts.push(QueueAlert {
            queue: summary
                .queue
                .clone(),
            kind: QueueAlertKind::LongWait,
            message: format!(
                "caller waiting {}s in {} (threshold {}s)",
                summary.longest_wait,
                summary.queue,
                long_wait_threshold.as_secs()
            ),
            calls_waiting: summary.calls_waiting,
            longest_wait: summary.longest_wait,
        });
    }
    alerts
}
