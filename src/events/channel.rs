// src/events/channel.rs

//! Bounded multi-producer, single-consumer event queue with a selectable
//! overflow policy.
//!
//! - `drop_oldest`: a full queue evicts its oldest event; publishers never wait.
//! - `block`: publishers wait for the consumer to free a slot.
//!
//! Free slots are tracked by a semaphore; the queue itself sits behind a
//! short-lived std mutex that is never held across an await.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, Semaphore};
use tracing::trace;

use crate::events::{EventEnvelope, MarathonEvent};
use crate::types::BackpressurePolicy;

struct Queue {
    buf: VecDeque<EventEnvelope>,
    publishers: usize,
    closed: bool,
    last_heartbeat: HashMap<String, Instant>,
}

struct Shared {
    queue: Mutex<Queue>,
    slots: Semaphore,
    not_empty: Notify,
    policy: BackpressurePolicy,
    heartbeat_throttle: Duration,
    dropped: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Create a channel holding at most `capacity` undelivered events.
///
/// Heartbeat events of one marathon closer together than
/// `heartbeat_throttle` are discarded at publish time.
pub fn bounded(
    capacity: usize,
    policy: BackpressurePolicy,
    heartbeat_throttle: Duration,
) -> (EventPublisher, EventSubscriber) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        queue: Mutex::new(Queue {
            buf: VecDeque::with_capacity(capacity),
            publishers: 1,
            closed: false,
            last_heartbeat: HashMap::new(),
        }),
        slots: Semaphore::new(capacity),
        not_empty: Notify::new(),
        policy,
        heartbeat_throttle,
        dropped: AtomicU64::new(0),
    });
    (
        EventPublisher {
            shared: shared.clone(),
        },
        EventSubscriber { shared },
    )
}

pub struct EventPublisher {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("policy", &self.shared.policy)
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl Clone for EventPublisher {
    fn clone(&self) -> Self {
        self.shared.lock().publishers += 1;
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for EventPublisher {
    fn drop(&mut self) {
        let last = {
            let mut q = self.shared.lock();
            q.publishers -= 1;
            q.publishers == 0
        };
        if last {
            self.shared.not_empty.notify_one();
        }
    }
}

impl EventPublisher {
    /// Publish an event for `marathon_id`.
    pub async fn emit(&self, marathon_id: &str, event: MarathonEvent) -> bool {
        self.publish(EventEnvelope::new(marathon_id, event)).await
    }

    /// Returns `false` if the event was throttled or nobody is listening.
    pub async fn publish(&self, envelope: EventEnvelope) -> bool {
        if self.throttled(&envelope) {
            trace!(marathon = %envelope.marathon_id, "heartbeat event throttled");
            return false;
        }

        match self.shared.policy {
            BackpressurePolicy::Block => {
                let Ok(permit) = self.shared.slots.acquire().await else {
                    return false;
                };
                permit.forget();
                let mut q = self.shared.lock();
                if q.closed {
                    return false;
                }
                q.buf.push_back(envelope);
            }
            BackpressurePolicy::DropOldest => {
                let mut q = self.shared.lock();
                if q.closed {
                    return false;
                }
                match self.shared.slots.try_acquire() {
                    Ok(permit) => permit.forget(),
                    Err(_) => {
                        // Full: the evicted event's slot is reused.
                        q.buf.pop_front();
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                q.buf.push_back(envelope);
            }
        }
        self.shared.not_empty.notify_one();
        true
    }

    /// Events evicted so far under `drop_oldest`.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    fn throttled(&self, envelope: &EventEnvelope) -> bool {
        if !matches!(envelope.event, MarathonEvent::Heartbeat { .. })
            || self.shared.heartbeat_throttle.is_zero()
        {
            return false;
        }
        let now = Instant::now();
        let mut q = self.shared.lock();
        match q.last_heartbeat.get(&envelope.marathon_id) {
            Some(prev) if now.duration_since(*prev) < self.shared.heartbeat_throttle => true,
            _ => {
                q.last_heartbeat.insert(envelope.marathon_id.clone(), now);
                false
            }
        }
    }
}

pub struct EventSubscriber {
    shared: Arc<Shared>,
}

impl Drop for EventSubscriber {
    fn drop(&mut self) {
        self.shared.lock().closed = true;
        self.shared.slots.close();
    }
}

impl EventSubscriber {
    /// Next event, or `None` once every publisher is gone and the queue is
    /// drained.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            {
                let mut q = self.shared.lock();
                if let Some(envelope) = q.buf.pop_front() {
                    // Released under the lock so a drop_oldest publisher
                    // never evicts while a slot is actually free.
                    self.shared.slots.add_permits(1);
                    return Some(envelope);
                }
                if q.publishers == 0 {
                    return None;
                }
            }
            self.shared.not_empty.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        let mut q = self.shared.lock();
        let envelope = q.buf.pop_front()?;
        self.shared.slots.add_permits(1);
        Some(envelope)
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().buf.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}
