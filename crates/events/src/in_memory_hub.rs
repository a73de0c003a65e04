//! In-memory event log with persistent consumer groups, for tests/dev.
//!
//! - No IO / no async
//! - One shared log; every group starts at the beginning of it
//! - Each delivery goes to exactly one member of a group
//! - A stream has at most one delivery in flight per group, so its events are
//!   projected in log order whatever the number of members
//! - Unsettled deliveries stay in flight until acked, nacked or the group is dropped

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use custos_core::StreamId;
use thiserror::Error;
use tracing::{debug, warn};

use crate::envelope::RecordedEvent;
use crate::subscription::{
    Delivery, EventPublisher, NackAction, ParkedEvent, PersistentSubscription, SubscriptionError,
    SubscriptionSource,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    /// Publish failed due to internal lock poisoning.
    #[error("hub lock poisoned")]
    Poisoned,
}

#[derive(Debug, Default)]
struct GroupState {
    /// First log position never looked at.
    next: usize,
    in_flight: BTreeMap<usize, u32>,
    /// Retried positions and positions held back behind an in-flight event of
    /// their stream, with their retry counts.
    waiting: BTreeMap<usize, u32>,
    parked: Vec<ParkedEvent>,
    dropped: Option<String>,
}

impl GroupState {
    /// Lowest log position not yet settled.
    fn checkpoint(&self) -> usize {
        let in_flight = self.in_flight.keys().next().copied();
        let waiting = self.waiting.keys().next().copied();
        [in_flight, waiting]
            .into_iter()
            .flatten()
            .fold(self.next, usize::min)
    }

    /// Next position to hand out, oldest first, skipping streams with a delivery in flight.
    fn take(&mut self, log: &[RecordedEvent]) -> Option<(usize, u32)> {
        let busy: HashSet<&StreamId> = self.in_flight.keys().map(|&pos| &log[pos].stream_id).collect();

        let ready = self
            .waiting
            .iter()
            .find(|(pos, _)| !busy.contains(&log[**pos].stream_id))
            .map(|(&pos, &retry_count)| (pos, retry_count));
        if let Some((pos, retry_count)) = ready {
            self.waiting.remove(&pos);
            return Some((pos, retry_count));
        }

        // Any stream with a waiting position is busy here, or it would have been taken above.
        while self.next < log.len() {
            let pos = self.next;
            self.next += 1;
            if busy.contains(&log[pos].stream_id) {
                self.waiting.insert(pos, 0);
            } else {
                return Some((pos, 0));
            }
        }
        None
    }
}

#[derive(Debug, Default)]
struct HubState {
    log: Vec<RecordedEvent>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug)]
struct HubInner {
    state: Mutex<HubState>,
    ready: Condvar,
    max_redeliveries: u32,
}

/// In-memory log + consumer groups.
#[derive(Debug, Clone)]
pub struct InMemorySubscriptionHub {
    inner: Arc<HubInner>,
}

impl Default for InMemorySubscriptionHub {
    fn default() -> Self {
        Self::new(5)
    }
}

impl InMemorySubscriptionHub {
    /// `max_redeliveries` bounds `Retry` nacks before an event is parked.
    pub fn new(max_redeliveries: u32) -> Self {
        Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(HubState::default()),
                ready: Condvar::new(),
                max_redeliveries,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HubState>, HubError> {
        self.inner.state.lock().map_err(|_| HubError::Poisoned)
    }

    /// Simulate a broker-side drop: every member of `group` fails its next receive.
    pub fn drop_group(&self, group: &str, reason: &str) -> Result<(), HubError> {
        let mut state = self.lock()?;
        state.groups.entry(group.to_string()).or_default().dropped = Some(reason.to_string());
        self.inner.ready.notify_all();
        Ok(())
    }

    pub fn parked(&self, group: &str) -> Result<Vec<ParkedEvent>, HubError> {
        let state = self.lock()?;
        Ok(state
            .groups
            .get(group)
            .map(|g| g.parked.clone())
            .unwrap_or_default())
    }

    /// Number of log entries below which everything is settled for `group`.
    pub fn checkpoint(&self, group: &str) -> Result<usize, HubError> {
        let state = self.lock()?;
        Ok(state.groups.get(group).map(GroupState::checkpoint).unwrap_or(0))
    }

    /// Whether `group` has nothing left to deliver and nothing in flight.
    pub fn is_drained(&self, group: &str) -> Result<bool, HubError> {
        let state = self.lock()?;
        let len = state.log.len();
        Ok(state
            .groups
            .get(group)
            .map(|g| g.checkpoint() == len)
            .unwrap_or(len == 0))
    }

    pub fn len(&self) -> Result<usize, HubError> {
        Ok(self.lock()?.log.len())
    }

    pub fn is_empty(&self) -> Result<bool, HubError> {
        Ok(self.len()? == 0)
    }
}

impl EventPublisher for InMemorySubscriptionHub {
    type Error = HubError;

    fn publish(&self, event: &RecordedEvent) -> Result<(), Self::Error> {
        let mut state = self.lock()?;
        state.log.push(event.clone());
        self.inner.ready.notify_all();
        Ok(())
    }
}

impl SubscriptionSource for InMemorySubscriptionHub {
    fn connect(&self, group: &str, worker: usize) -> Result<Box<dyn PersistentSubscription>, SubscriptionError> {
        let mut state = self
            .lock()
            .map_err(|e| SubscriptionError::Connect(e.to_string()))?;
        state.groups.entry(group.to_string()).or_default();
        Ok(Box::new(InMemorySubscription {
            hub: self.clone(),
            group: group.to_string(),
            worker,
        }))
    }
}

/// One member of an in-memory consumer group.
#[derive(Debug)]
pub struct InMemorySubscription {
    hub: InMemorySubscriptionHub,
    group: String,
    worker: usize,
}

impl InMemorySubscription {
    pub fn worker(&self) -> usize {
        self.worker
    }

    fn settle_error(delivery: &Delivery, reason: impl Into<String>) -> SubscriptionError {
        SubscriptionError::Settle {
            delivery_id: delivery.delivery_id.clone(),
            reason: reason.into(),
        }
    }

    fn position(delivery: &Delivery) -> Result<usize, SubscriptionError> {
        delivery
            .delivery_id
            .parse()
            .map_err(|_| Self::settle_error(delivery, "not an in-memory delivery id"))
    }
}

impl PersistentSubscription for InMemorySubscription {
    fn receive(&self, timeout: Duration) -> Result<Option<Delivery>, SubscriptionError> {
        let deadline = Instant::now() + timeout;
        let mut state = self
            .hub
            .lock()
            .map_err(|e| SubscriptionError::Dropped(e.to_string()))?;

        loop {
            let HubState { log, groups } = &mut *state;
            let group = groups.entry(self.group.clone()).or_default();

            if let Some(reason) = &group.dropped {
                return Err(SubscriptionError::Dropped(reason.clone()));
            }

            if let Some((position, retry_count)) = group.take(log) {
                group.in_flight.insert(position, retry_count);
                return Ok(Some(Delivery {
                    delivery_id: position.to_string(),
                    event: log[position].clone(),
                    retry_count,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .hub
                .inner
                .ready
                .wait_timeout(state, deadline - now)
                .map_err(|_| SubscriptionError::Dropped(HubError::Poisoned.to_string()))?;
            state = guard;
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), SubscriptionError> {
        let position = Self::position(delivery)?;
        let mut state = self
            .hub
            .lock()
            .map_err(|e| Self::settle_error(delivery, e.to_string()))?;
        if let Some(group) = state.groups.get_mut(&self.group) {
            if group.in_flight.remove(&position).is_some() {
                // Releases the stream for events held back behind this one.
                self.hub.inner.ready.notify_all();
            }
        }
        Ok(())
    }

    fn nack(&self, delivery: &Delivery, reason: &str, action: NackAction) -> Result<(), SubscriptionError> {
        let position = Self::position(delivery)?;
        let max_redeliveries = self.hub.inner.max_redeliveries;
        let mut state = self
            .hub
            .lock()
            .map_err(|e| Self::settle_error(delivery, e.to_string()))?;
        let HubState { log, groups } = &mut *state;
        let Some(group) = groups.get_mut(&self.group) else {
            return Err(Self::settle_error(delivery, "unknown group"));
        };
        let Some(retry_count) = group.in_flight.remove(&position) else {
            // Already settled; nacks are idempotent.
            return Ok(());
        };

        let park = match action {
            NackAction::Park => true,
            NackAction::Retry => retry_count + 1 > max_redeliveries,
        };
        if park {
            warn!(
                group = %self.group,
                event_id = %log[position].event_id,
                retry_count,
                reason,
                "parking event"
            );
            group.parked.push(ParkedEvent {
                event: log[position].clone(),
                reason: reason.to_string(),
                parked_at: Utc::now(),
            });
        } else {
            debug!(group = %self.group, retry_count = retry_count + 1, "redelivering event");
            group.waiting.insert(position, retry_count + 1);
        }
        self.hub.inner.ready.notify_all();
        Ok(())
    }
}
