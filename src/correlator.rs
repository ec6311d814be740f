//! ActionID routing, list buffering and event fan-out
//!
//! The reader task feeds every parsed block in here. Responses and list
//! records go to the pending waiter registered under their `ActionID`;
//! everything else is offered to the subscriber queues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::{
    action::AmiResponse,
    constants::{EVENT_LIST_START, HEADER_ACTION_ID, HEADER_EVENT_LIST, HEADER_MESSAGE},
    error::{AmiError, AmiResult},
    event::{AmiEvent, EventFilter},
    headers::AmiHeaders,
};

type Waiter = oneshot::Sender<AmiResult<AmiResponse>>;

/// Records of a multi-part response collected until `EventList: Complete`.
#[derive(Debug)]
struct ListAccumulator {
    response: AmiResponse,
    events: Vec<AmiEvent>,
}

struct Pending {
    waiter: Waiter,
    list: Option<ListAccumulator>,
}

/// One registered event consumer.
struct SubscriberSlot {
    id: u64,
    filter: EventFilter,
    tx: mpsc::Sender<Result<AmiEvent, AmiError>>,
    /// Set when events have been dropped and the consumer hasn't been told yet
    overflow: AtomicBool,
}

pub(crate) struct Correlator {
    pending: Mutex<HashMap<String, Pending>>,
    subscribers: Mutex<Vec<SubscriberSlot>>,
    next_subscriber_id: AtomicU64,
    /// Total count of dropped events across all subscribers
    dropped_event_count: AtomicU64,
}

/// `true` when a response announces list records to follow.
///
/// Pre-13 builds omit `EventList: start` on some actions but always say
/// "... will follow".
fn starts_list(headers: &AmiHeaders) -> bool {
    if headers
        .get(HEADER_EVENT_LIST)
        .is_some_and(|v| v.eq_ignore_ascii_case(EVENT_LIST_START))
    {
        return true;
    }
    headers
        .get(HEADER_MESSAGE)
        .is_some_and(|m| {
            m.trim_end_matches('.')
                .to_ascii_lowercase()
                .ends_with("will follow")
        })
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(1),
            dropped_event_count: AtomicU64::new(0),
        }
    }

    /// Register a waiter for `action_id` before the frame is written.
    pub(crate) fn register(&self, action_id: &str) -> oneshot::Receiver<AmiResult<AmiResponse>> {
        let (tx, rx) = oneshot::channel();
        self.lock_pending()
            .insert(
                action_id.to_string(),
                Pending {
                    waiter: tx,
                    list: None,
                },
            );
        rx
    }

    /// Forget a waiter (timeout or failed write). Late replies are discarded.
    pub(crate) fn cancel(&self, action_id: &str) {
        if self
            .lock_pending()
            .remove(action_id)
            .is_some()
        {
            trace!("[CORRELATE] Cancelled pending action {}", action_id);
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.lock_pending()
            .len()
    }

    /// Route a `Response:` block.
    pub(crate) fn on_response(&self, headers: AmiHeaders) {
        let Some(action_id) = headers
            .get(HEADER_ACTION_ID)
            .map(str::to_string)
        else {
            debug!("[CORRELATE] Response without ActionID, discarding");
            return;
        };

        let response = AmiResponse::new(headers);
        let mut pending = self.lock_pending();
        let Some(entry) = pending.get_mut(&action_id) else {
            debug!(
                "[CORRELATE] No waiter for ActionID {} (late or foreign response), discarding",
                action_id
            );
            return;
        };

        if response.is_success() && starts_list(response.headers()) {
            trace!("[CORRELATE] List response opened for ActionID {}", action_id);
            entry.list = Some(ListAccumulator {
                response,
                events: Vec::new(),
            });
            return;
        }

        if let Some(entry) = pending.remove(&action_id) {
            let _ = entry
                .waiter
                .send(Ok(response));
        }
    }

    /// Route an event.
    ///
    /// Returns `true` when the event was consumed as a list record of a
    /// pending action; otherwise the caller should publish it.
    pub(crate) fn on_list_event(&self, event: &AmiEvent) -> bool {
        let Some(action_id) = event.action_id() else {
            return false;
        };
        let mut pending = self.lock_pending();
        let Some(entry) = pending.get_mut(action_id) else {
            return false;
        };
        let Some(list) = entry
            .list
            .as_mut()
        else {
            return false;
        };

        if !event.is_list_complete() {
            list.events
                .push(event.clone());
            return true;
        }

        if let Some(entry) = pending.remove(action_id) {
            if let Some(list) = entry.list {
                trace!(
                    "[CORRELATE] List complete for ActionID {} with {} records",
                    action_id,
                    list.events
                        .len()
                );
                let response = list
                    .response
                    .with_events(list.events, Some(event.clone()));
                let _ = entry
                    .waiter
                    .send(Ok(response));
            }
        }
        true
    }

    /// Fail every outstanding action with `ConnectionLost`.
    pub(crate) fn fail_all(&self) {
        let drained: Vec<(String, Pending)> = self
            .lock_pending()
            .drain()
            .collect();
        if !drained.is_empty() {
            debug!(
                "[CORRELATE] Failing {} pending actions: connection lost",
                drained.len()
            );
        }
        for (_, entry) in drained {
            let _ = entry
                .waiter
                .send(Err(AmiError::ConnectionLost));
        }
    }

    /// Register an event consumer with its own bounded queue.
    pub(crate) fn subscribe(
        &self,
        filter: EventFilter,
        queue_size: usize,
    ) -> (u64, mpsc::Receiver<Result<AmiEvent, AmiError>>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let id = self
            .next_subscriber_id
            .fetch_add(1, Ordering::Relaxed);
        self.lock_subscribers()
            .push(SubscriberSlot {
                id,
                filter,
                tx,
                overflow: AtomicBool::new(false),
            });
        (id, rx)
    }

    pub(crate) fn unsubscribe(&self, id: u64) {
        self.lock_subscribers()
            .retain(|slot| slot.id != id);
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.lock_subscribers()
            .len()
    }

    /// Offer an event to every matching subscriber without blocking.
    pub(crate) fn publish(&self, event: &AmiEvent) {
        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|slot| {
            if !slot
                .filter
                .matches(event)
            {
                return !slot
                    .tx
                    .is_closed();
            }
            self.dispatch_event(slot, Ok(event.clone()))
        });
    }

    /// Try to send an event to one subscriber via try_send.
    ///
    /// If the queue is full, drop the item, set the overflow flag, and
    /// increment the dropped counter. Before each dispatch, check the overflow
    /// flag and attempt to deliver a QueueFull notification first.
    /// Returns `false` once the subscriber is gone.
    fn dispatch_event(&self, slot: &SubscriberSlot, item: Result<AmiEvent, AmiError>) -> bool {
        if slot
            .overflow
            .load(Ordering::Relaxed)
        {
            match slot
                .tx
                .try_send(Err(AmiError::QueueFull))
            {
                Ok(()) => {
                    slot.overflow
                        .store(false, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return false,
                Err(mpsc::error::TrySendError::Full(_)) => {}
            }
        }

        match slot
            .tx
            .try_send(item)
        {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
            Err(mpsc::error::TrySendError::Full(_)) => {
                if !slot
                    .overflow
                    .swap(true, Ordering::Relaxed)
                {
                    warn!(
                        "Event queue full for subscriber {}, dropping events",
                        slot.id
                    );
                }
                self.dropped_event_count
                    .fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    pub(crate) fn dropped_event_count(&self) -> u64 {
        self.dropped_event_count
            .load(Ordering::Relaxed)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, Pending>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<SubscriberSlot>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
