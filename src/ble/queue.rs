//! Priority notification queue (component G). Bounded, `queue_max` slots,
//! default backpressure policy `priority`. CRITICAL items are never
//! silently dropped under the `priority` policy — a full-of-CRITICAL
//! queue makes the caller wait out `put_timeout_ms` via
//! `NotifyQueue::enqueue_critical`, and only a timeout there counts as a
//! CRITICAL drop (which must raise an alert at the call site).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::types::{BackpressurePolicy, NotifyPriority};

/// Which characteristic a queued notification will be published to.
/// `override_bits` is write-only and never appears here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    EnvMeasurements,
    ControlTargets,
    StageState,
    StatusFlags,
    ActuatorStatus,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub characteristic: Characteristic,
    pub priority: NotifyPriority,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Evicted(NotifyPriority),
    Coalesced,
    Dropped(NotifyPriority),
    /// Only returned for a CRITICAL item under the `priority` policy when
    /// the queue holds no lower-priority victim to evict — the caller must
    /// retry with `enqueue_critical`, never treat this as a silent drop.
    Blocked,
}

#[derive(Default)]
struct DropCounters {
    by_priority: [u64; 4],
}

pub struct NotifyQueue {
    inner: Mutex<VecDeque<Notification>>,
    capacity: usize,
    policy: BackpressurePolicy,
    notify_space: tokio::sync::Notify,
    drops: Mutex<DropCounters>,
    critical_timeouts: AtomicU64,
}

impl NotifyQueue {
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            notify_space: tokio::sync::Notify::new(),
            drops: Mutex::new(DropCounters::default()),
            critical_timeouts: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self, priority: NotifyPriority) -> u64 {
        self.drops.lock().expect("drops lock poisoned").by_priority[priority as usize]
    }

    /// Count of CRITICAL items dropped after exhausting `enqueue_critical`'s
    /// wait budget. Per the queue invariant this should remain 0 in normal
    /// operation; nonzero means the BLE publisher is falling behind badly
    /// enough to need attention.
    pub fn critical_dropped(&self) -> u64 {
        self.critical_timeouts.load(Ordering::Relaxed)
    }

    fn record_dropped(drops: &mut DropCounters, priority: NotifyPriority) {
        drops.by_priority[priority as usize] += 1;
    }

    pub fn dequeue(&self) -> Option<Notification> {
        let item = self.inner.lock().expect("queue lock poisoned").pop_front();
        if item.is_some() {
            self.notify_space.notify_waiters();
        }
        item
    }

    /// Synchronous enqueue attempt; never blocks. See `enqueue_critical`
    /// for the path that honors the CRITICAL never-dropped invariant.
    pub fn try_enqueue(&self, item: Notification) -> EnqueueOutcome {
        let mut queue = self.inner.lock().expect("queue lock poisoned");
        let outcome = match self.policy {
            BackpressurePolicy::Priority => Self::enqueue_priority(&mut queue, self.capacity, item),
            BackpressurePolicy::DropOldest => Self::enqueue_drop_oldest(&mut queue, self.capacity, item),
            BackpressurePolicy::DropNewest => Self::enqueue_drop_newest(&mut queue, self.capacity, item),
            BackpressurePolicy::Coalesce => Self::enqueue_coalesce(&mut queue, self.capacity, item),
        };
        if let EnqueueOutcome::Dropped(p) | EnqueueOutcome::Evicted(p) = outcome {
            Self::record_dropped(&mut self.drops.lock().expect("drops lock poisoned"), p);
        }
        drop(queue);
        if matches!(outcome, EnqueueOutcome::Enqueued | EnqueueOutcome::Evicted(_) | EnqueueOutcome::Coalesced) {
            self.notify_space.notify_waiters();
        }
        outcome
    }

    fn enqueue_priority(queue: &mut VecDeque<Notification>, capacity: usize, item: Notification) -> EnqueueOutcome {
        if queue.len() < capacity {
            queue.push_back(item);
            return EnqueueOutcome::Enqueued;
        }
        let worst_idx = queue
            .iter()
            .enumerate()
            .max_by_key(|(_, n)| n.priority)
            .map(|(i, _)| i)
            .expect("queue is full, so non-empty");
        let worst_priority = queue[worst_idx].priority;

        if item.priority < worst_priority {
            let evicted = queue.remove(worst_idx).expect("index came from this queue");
            queue.push_back(item);
            EnqueueOutcome::Evicted(evicted.priority)
        } else if item.priority == NotifyPriority::Critical {
            EnqueueOutcome::Blocked
        } else {
            EnqueueOutcome::Dropped(item.priority)
        }
    }

    fn enqueue_drop_oldest(queue: &mut VecDeque<Notification>, capacity: usize, item: Notification) -> EnqueueOutcome {
        if queue.len() >= capacity {
            if let Some(oldest) = queue.pop_front() {
                queue.push_back(item);
                return EnqueueOutcome::Evicted(oldest.priority);
            }
        }
        queue.push_back(item);
        EnqueueOutcome::Enqueued
    }

    fn enqueue_drop_newest(queue: &mut VecDeque<Notification>, capacity: usize, item: Notification) -> EnqueueOutcome {
        if queue.len() >= capacity {
            return EnqueueOutcome::Dropped(item.priority);
        }
        queue.push_back(item);
        EnqueueOutcome::Enqueued
    }

    fn enqueue_coalesce(queue: &mut VecDeque<Notification>, capacity: usize, item: Notification) -> EnqueueOutcome {
        if let Some(existing) = queue.iter_mut().find(|n| n.characteristic == item.characteristic) {
            *existing = item;
            return EnqueueOutcome::Coalesced;
        }
        Self::enqueue_drop_oldest(queue, capacity, item)
    }

    /// The only legitimate way a CRITICAL notification is dropped: retries
    /// `try_enqueue` until it succeeds or `timeout` elapses, waiting on
    /// queue-space notifications in between rather than busy-polling.
    pub async fn enqueue_critical(&self, item: Notification, timeout: Duration) -> bool {
        debug_assert_eq!(item.priority, NotifyPriority::Critical);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let wait = self.notify_space.notified();
            match self.try_enqueue(clone_notification(&item)) {
                EnqueueOutcome::Blocked => {}
                _ => return true,
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                self.critical_timeouts.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            let _ = tokio::time::timeout(deadline - now, wait).await;
        }
    }
}

fn clone_notification(n: &Notification) -> Notification {
    Notification { characteristic: n.characteristic, priority: n.priority, payload: n.payload.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(characteristic: Characteristic, priority: NotifyPriority) -> Notification {
        Notification { characteristic, priority, payload: vec![priority as u8] }
    }

    #[test]
    fn critical_evicts_lowest_priority_item() {
        let q = NotifyQueue::new(4, BackpressurePolicy::Priority);
        q.try_enqueue(item(Characteristic::ControlTargets, NotifyPriority::Medium));
        q.try_enqueue(item(Characteristic::StageState, NotifyPriority::Low));
        q.try_enqueue(item(Characteristic::StatusFlags, NotifyPriority::Low));
        q.try_enqueue(item(Characteristic::StageState, NotifyPriority::Low));
        assert_eq!(q.len(), 4);

        let outcome = q.try_enqueue(item(Characteristic::EnvMeasurements, NotifyPriority::Critical));
        assert_eq!(outcome, EnqueueOutcome::Evicted(NotifyPriority::Low));
        assert_eq!(q.len(), 4);
        assert_eq!(q.dropped(NotifyPriority::Low), 1);
        assert_eq!(q.critical_dropped(), 0);
    }

    #[test]
    fn queue_full_of_critical_blocks_rather_than_drops() {
        let q = NotifyQueue::new(2, BackpressurePolicy::Priority);
        q.try_enqueue(item(Characteristic::EnvMeasurements, NotifyPriority::Critical));
        q.try_enqueue(item(Characteristic::ActuatorStatus, NotifyPriority::Critical));
        let outcome = q.try_enqueue(item(Characteristic::EnvMeasurements, NotifyPriority::Critical));
        assert_eq!(outcome, EnqueueOutcome::Blocked);
    }

    #[tokio::test]
    async fn enqueue_critical_times_out_and_counts_the_drop() {
        let q = NotifyQueue::new(1, BackpressurePolicy::Priority);
        q.try_enqueue(item(Characteristic::EnvMeasurements, NotifyPriority::Critical));
        let ok = q
            .enqueue_critical(item(Characteristic::ActuatorStatus, NotifyPriority::Critical), Duration::from_millis(10))
            .await;
        assert!(!ok);
        assert_eq!(q.critical_dropped(), 1);
    }

    #[tokio::test]
    async fn enqueue_critical_succeeds_once_space_frees() {
        let q = std::sync::Arc::new(NotifyQueue::new(1, BackpressurePolicy::Priority));
        q.try_enqueue(item(Characteristic::EnvMeasurements, NotifyPriority::Critical));

        let q2 = q.clone();
        let waiter = tokio::spawn(async move {
            q2.enqueue_critical(item(Characteristic::ActuatorStatus, NotifyPriority::Critical), Duration::from_secs(1))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.dequeue();

        assert!(waiter.await.unwrap());
        assert_eq!(q.critical_dropped(), 0);
    }

    #[test]
    fn drop_newest_rejects_incoming_when_full() {
        let q = NotifyQueue::new(1, BackpressurePolicy::DropNewest);
        q.try_enqueue(item(Characteristic::StageState, NotifyPriority::Low));
        let outcome = q.try_enqueue(item(Characteristic::StatusFlags, NotifyPriority::High));
        assert_eq!(outcome, EnqueueOutcome::Dropped(NotifyPriority::High));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn coalesce_replaces_same_characteristic_in_place() {
        let q = NotifyQueue::new(4, BackpressurePolicy::Coalesce);
        q.try_enqueue(item(Characteristic::StatusFlags, NotifyPriority::High));
        let outcome = q.try_enqueue(item(Characteristic::StatusFlags, NotifyPriority::High));
        assert_eq!(outcome, EnqueueOutcome::Coalesced);
        assert_eq!(q.len(), 1);
    }
}
