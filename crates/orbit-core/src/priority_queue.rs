//! Priority Queue (C6): a bounded in-memory min-heap of due triggers,
//! refilled from the Trigger Store by a background filler task.
//!
//! The queue is authoritative only for ordering within its window; the
//! Trigger Store remains the source of truth, so every pop re-validates its
//! entry against the store before handing it to a caller (mirrors the
//! optimistic `version` check `trigger_store::bump_fire` already performs
//! on write).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use orbit_db::models::Trigger;

use crate::clock::Clock;
use crate::error::{CoreError, ErrCtx};
use crate::trigger_store;

/// A heap entry ordered by `(next_fire_at ASC, priority DESC, id ASC)`,
/// matching `trigger_store::fetch_due`'s ordering exactly so the queue and
/// the store never disagree about "who's next".
#[derive(Debug, Clone, Eq, PartialEq)]
struct Entry {
    next_fire_at: DateTime<Utc>,
    priority: i32,
    trigger_id: Uuid,
    version: i32,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert fire time (earliest = "greatest")
        // and keep priority ascending-as-max so a plain pop yields the
        // earliest, highest-priority trigger first.
        other
            .next_fire_at
            .cmp(&self.next_fire_at)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| other.trigger_id.cmp(&self.trigger_id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// An in-memory window over the triggers due to fire soonest.
///
/// Single-writer (the filler task), single-reader (the orchestrator loop)
/// by convention; the `tokio::sync::Mutex` enforces that at runtime since a
/// single process may run both concurrently.
pub struct PriorityQueue {
    pool: PgPool,
    heap: tokio::sync::Mutex<BinaryHeap<Entry>>,
    seen: tokio::sync::Mutex<HashSet<Uuid>>,
    low_water_mark: usize,
    refill_batch: i64,
}

impl PriorityQueue {
    pub fn new(pool: PgPool, low_water_mark: usize, refill_batch: i64) -> Self {
        Self {
            pool,
            heap: tokio::sync::Mutex::new(BinaryHeap::new()),
            seen: tokio::sync::Mutex::new(HashSet::new()),
            low_water_mark,
            refill_batch,
        }
    }

    /// Current number of queued entries (may include stale ones not yet
    /// dropped by a pop).
    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Refill from the Trigger Store if the heap has fallen below the
    /// low-water mark. Never inserts a second entry for a `trigger_id`
    /// already present.
    pub async fn refill(&self, now: DateTime<Utc>) -> Result<usize, CoreError> {
        let mut heap = self.heap.lock().await;
        if heap.len() >= self.low_water_mark {
            return Ok(0);
        }

        let due = trigger_store::fetch_due(&self.pool, now, self.refill_batch).await?;
        let mut seen = self.seen.lock().await;
        let mut inserted = 0;
        for trigger in due {
            if seen.contains(&trigger.id) {
                continue;
            }
            seen.insert(trigger.id);
            heap.push(Entry {
                next_fire_at: trigger.next_fire_at.unwrap_or(now),
                priority: trigger.priority,
                trigger_id: trigger.id,
                version: trigger.version,
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Pop the earliest, highest-priority entry, dropping any stale heads
    /// (trigger no longer active, or rescheduled since it was enqueued)
    /// until a fresh one is found or the heap empties.
    pub async fn pop(&self) -> Result<Option<Trigger>, CoreError> {
        loop {
            let entry = {
                let mut heap = self.heap.lock().await;
                let Some(entry) = heap.pop() else {
                    return Ok(None);
                };
                self.seen.lock().await.remove(&entry.trigger_id);
                entry
            };

            let current = trigger_store::get(&self.pool, entry.trigger_id).await;
            let current = match current {
                Ok(t) => t,
                Err(CoreError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };

            if current.version != entry.version {
                // Rescheduled, paused, or otherwise mutated since enqueue;
                // the entry is stale, discard and try the next one.
                continue;
            }
            if !matches!(current.status, orbit_db::models::TriggerStatus::Active) {
                continue;
            }
            return Ok(Some(current));
        }
    }

    /// Spawn the background filler loop. Returns immediately; the returned
    /// handle can be aborted on shutdown.
    pub fn spawn_filler(
        self: &Arc<Self>,
        clock: Arc<dyn Clock>,
        interval: StdDuration,
    ) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = queue.refill(clock.now()).await {
                    tracing::warn!(error = %e, "priority queue refill failed");
                }
            }
        })
    }
}

/// Validation helper used by callers constructing a `PriorityQueue`: a
/// low-water mark of zero would make `refill` a no-op forever.
pub fn validate_low_water_mark(low_water_mark: usize) -> Result<(), CoreError> {
    if low_water_mark == 0 {
        return Err(CoreError::validation(
            "priority queue low_water_mark must be >= 1",
            ErrCtx::default(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(secs: i64, priority: i32, id: Uuid) -> Entry {
        Entry {
            next_fire_at: DateTime::from_timestamp(secs, 0).unwrap(),
            priority,
            trigger_id: id,
            version: 0,
        }
    }

    #[test]
    fn earliest_fire_time_pops_first() {
        let mut heap = BinaryHeap::new();
        let a = entry(100, 0, Uuid::new_v4());
        let b = entry(50, 0, Uuid::new_v4());
        heap.push(a.clone());
        heap.push(b.clone());
        assert_eq!(heap.pop().unwrap().next_fire_at, b.next_fire_at);
    }

    #[test]
    fn ties_on_fire_time_break_by_priority_desc() {
        let mut heap = BinaryHeap::new();
        let id = Uuid::new_v4();
        let low = entry(100, 1, id);
        let high = entry(100, 5, id);
        heap.push(low);
        heap.push(high.clone());
        assert_eq!(heap.pop().unwrap().priority, high.priority);
    }

    #[test]
    fn ties_on_time_and_priority_break_by_id() {
        let mut heap = BinaryHeap::new();
        let small_id = Uuid::nil();
        let big_id = Uuid::max();
        heap.push(entry(100, 0, big_id));
        heap.push(entry(100, 0, small_id));
        assert_eq!(heap.pop().unwrap().trigger_id, small_id);
    }

    #[test]
    fn low_water_mark_of_zero_is_rejected() {
        assert!(validate_low_water_mark(0).is_err());
        assert!(validate_low_water_mark(1).is_ok());
    }
}
