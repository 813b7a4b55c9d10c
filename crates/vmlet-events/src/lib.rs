//! # vmlet-events
//!
//! A bounded ring of machine lifecycle events. Appends overwrite the
//! oldest entry once the ring is full, and a background task expires
//! entries whose TTL has passed. Consumers poll the full list; there is
//! no subscription model here.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vmlet_api::{MissingObjectId, ObjectMeta, StoreObject};

/// Result type alias for event operations.
pub type Result<T> = std::result::Result<T, EventError>;

/// Errors raised by the event ring.
#[derive(Debug, Error)]
pub enum EventError {
    /// The involved object has no usable identity.
    #[error("cannot derive event metadata: {0}")]
    InvalidObjectMeta(#[from] MissingObjectId),

    /// The ring mutex was poisoned by a panicking thread.
    #[error("event ring lock poisoned")]
    LockPoisoned,
}

/// Severity of an event, mirroring the usual normal/warning split.
pub const EVENT_TYPE_NORMAL: &str = "Normal";
pub const EVENT_TYPE_WARNING: &str = "Warning";

/// One lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub involved: ObjectMeta,
    pub event_type: String,
    pub reason: String,
    pub message: String,
    /// Unix seconds.
    pub event_time: i64,
}

struct Ring {
    slots: Vec<Option<Event>>,
    /// Index of the oldest event.
    head: usize,
    count: usize,
}

/// Fixed-capacity FIFO of events with per-entry TTL.
pub struct EventRing {
    ring: Mutex<Ring>,
    max_events: usize,
    ttl: Duration,
}

impl EventRing {
    /// A ring holding at most `max_events` entries, each expiring `ttl`
    /// after it was appended.
    pub fn new(max_events: usize, ttl: Duration) -> Self {
        Self {
            ring: Mutex::new(Ring {
                slots: (0..max_events).map(|_| None).collect(),
                head: 0,
                count: 0,
            }),
            max_events,
            ttl,
        }
    }

    /// Appends an event about `object`. A full ring overwrites its oldest
    /// entry.
    pub fn append<T: StoreObject>(
        &self,
        object: &T,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let involved = ObjectMeta::from_object(object)?;
        let event = Event {
            involved,
            event_type: event_type.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            event_time: Utc::now().timestamp(),
        };

        let mut ring = self.lock()?;
        let index = (ring.head + ring.count) % self.max_events;
        if ring.count == self.max_events {
            debug!(dropped = ?ring.slots[ring.head], "event ring full, dropping oldest");
            ring.head = (ring.head + 1) % self.max_events;
        } else {
            ring.count += 1;
        }
        ring.slots[index] = Some(event);
        Ok(())
    }

    /// All live events, oldest first. Entries are deep copies; mutating
    /// them does not touch the ring.
    pub fn list(&self) -> Result<Vec<Event>> {
        let ring = self.lock()?;
        let mut events = Vec::with_capacity(ring.count);
        for i in 0..ring.count {
            let index = (ring.head + i) % self.max_events;
            if let Some(event) = &ring.slots[index] {
                events.push(event.clone());
            }
        }
        Ok(events)
    }

    /// Drops events whose TTL elapsed before `now` (unix seconds),
    /// stopping at the first survivor.
    pub fn expire_at(&self, now: i64) -> Result<usize> {
        let ttl = self.ttl.as_secs() as i64;
        let mut ring = self.lock()?;
        let mut expired = 0;

        while ring.count > 0 {
            let head = ring.head;
            let Some(event) = &ring.slots[head] else {
                break;
            };
            if event.event_time + ttl > now {
                break;
            }
            ring.slots[head] = None;
            ring.head = (head + 1) % self.max_events;
            ring.count -= 1;
            expired += 1;
        }

        Ok(expired)
    }

    /// Expires against the current wall clock.
    pub fn expire(&self) -> Result<usize> {
        self.expire_at(Utc::now().timestamp())
    }

    /// Runs expiry every `resync_interval` until `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken, resync_interval: Duration) {
        let mut ticker = tokio::time::interval(resync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("event ring expirer shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Ok(expired) = self.expire() {
                        if expired > 0 {
                            debug!(expired, "expired events");
                        }
                    }
                }
            }
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Ring>> {
        self.ring.lock().map_err(|_| EventError::LockPoisoned)
    }
}
