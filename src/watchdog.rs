//! Time-based supervision of in-flight resources (C4).
//!
//! The deadline arithmetic in this module is pure and synchronous - it is
//! exercised directly in unit tests without a clock. [`WatchdogScheduler`] is
//! the async piece: a single priority queue of `(deadline, job)` entries
//! shared by every resource on a link, rather than one OS thread or one
//! `tokio::task` per resource, per the "single scheduler with a priority
//! queue" design note. A job's identifier is bumped every time its owning
//! resource reschedules or concludes, so a stale wakeup (one that lost a race
//! with a state transition) is silently dropped instead of acting on
//! out-of-date state.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;

use tokio::time::{Duration, Instant};

use crate::hash::Hash;

/// Which side of a transfer a scheduled job belongs to; the deadline formula
/// and the action taken on expiry differ by role (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceRole {
    Sender,
    Receiver,
}

/// A job popped off the scheduler once its deadline has elapsed. The caller
/// re-validates it against the resource's current status before acting - the
/// scheduler only knows about time, not protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledJob {
    pub resource_hash: Hash,
    pub role: ResourceRole,
    pub job_id: u64,
}

struct HeapEntry {
    deadline: Instant,
    job: ScheduledJob,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline sorts first.
        other.deadline.cmp(&self.deadline)
    }
}

/// A min-heap of per-resource deadlines plus a generation counter per
/// `(resource_hash, role)` used to invalidate superseded jobs.
pub struct WatchdogScheduler {
    heap: Mutex<BinaryHeap<HeapEntry>>,
    generations: Mutex<HashMap<(Hash, ResourceRole), u64>>,
}

impl WatchdogScheduler {
    pub fn new() -> Self {
        Self { heap: Mutex::new(BinaryHeap::new()), generations: Mutex::new(HashMap::new()) }
    }

    /// Schedules (or reschedules) the next wakeup for a resource, bumping its
    /// job id so any previously queued wakeup for the same `(hash, role)`
    /// becomes stale and is skipped by [`Self::wait_next`].
    pub fn schedule(&self, resource_hash: Hash, role: ResourceRole, deadline: Instant) -> u64 {
        let job_id = {
            let mut generations = self.generations.lock().unwrap();
            let entry = generations.entry((resource_hash, role)).or_insert(0);
            *entry += 1;
            *entry
        };
        self.heap.lock().unwrap().push(HeapEntry {
            deadline,
            job: ScheduledJob { resource_hash, role, job_id },
        });
        job_id
    }

    /// Invalidates any outstanding job for `(hash, role)` without scheduling
    /// a replacement - used when a resource reaches a terminal status or a
    /// status past which the watchdog no longer applies (e.g. `Assembling`).
    pub fn cancel(&self, resource_hash: Hash, role: ResourceRole) {
        let mut generations = self.generations.lock().unwrap();
        let entry = generations.entry((resource_hash, role)).or_insert(0);
        *entry += 1;
    }

    /// Whether `job_id` is still the current generation for its resource -
    /// i.e. this wakeup was not superseded by a later reschedule or a cancel.
    pub fn is_current(&self, job: ScheduledJob) -> bool {
        self.generations
            .lock()
            .unwrap()
            .get(&(job.resource_hash, job.role))
            .copied()
            .unwrap_or(0)
            == job.job_id
    }

    /// Pops and sleeps until the earliest scheduled deadline, returning the
    /// job once it is due. Stale entries (superseded by a later `schedule`
    /// or `cancel`) are silently discarded and the wait continues on the
    /// next entry. Returns `None` only if the heap is empty - callers
    /// typically hold this scheduler for the crate's lifetime, so an empty
    /// heap just means "no resource is currently in flight."
    pub async fn wait_next(&self) -> Option<ScheduledJob> {
        loop {
            let next = { self.heap.lock().unwrap().pop() };
            let entry = next?;
            if !self.is_current(entry.job) {
                continue;
            }
            let now = Instant::now();
            if entry.deadline > now {
                tokio::time::sleep(entry.deadline - now).await;
            }
            // A reschedule may have landed while we slept; re-check before
            // handing the job back.
            if self.is_current(entry.job) {
                return Some(entry.job);
            }
        }
    }
}

impl Default for WatchdogScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// `rtt.map(|r| r * timeout_factor)`, falling back to `default_timeout`
/// before the first RTT sample is available.
fn effective_timeout(rtt: Option<Duration>, timeout_factor: f64, default_timeout: Duration) -> Duration {
    match rtt {
        Some(rtt) => Duration::from_secs_f64(rtt.as_secs_f64() * timeout_factor),
        None => default_timeout,
    }
}

/// Sender, `Advertised`: `adv_sent + default_timeout`.
pub fn advertised_deadline(adv_sent: Instant, default_timeout: Duration) -> Instant {
    adv_sent + default_timeout
}

/// Receiver, `Transferring`: `last_activity + rtt * timeout_factor`.
pub fn receiver_transferring_deadline(
    last_activity: Instant,
    rtt: Option<Duration>,
    timeout_factor: f64,
    default_timeout: Duration,
) -> Instant {
    last_activity + effective_timeout(rtt, timeout_factor, default_timeout)
}

/// Sender, `Transferring`: `last_activity + rtt * timeout_factor * MAX_RETRIES + SENDER_GRACE_TIME`.
pub fn sender_transferring_deadline(
    last_activity: Instant,
    rtt: Option<Duration>,
    timeout_factor: f64,
    default_timeout: Duration,
    max_retries: u8,
    grace: Duration,
) -> Instant {
    let base = effective_timeout(rtt, timeout_factor, default_timeout);
    last_activity + base * max_retries as u32 + grace
}

/// Sender, `AwaitingProof`: `last_part_sent + rtt * timeout_factor + SENDER_GRACE_TIME`.
pub fn sender_awaiting_proof_deadline(
    last_part_sent: Instant,
    rtt: Option<Duration>,
    timeout_factor: f64,
    default_timeout: Duration,
    grace: Duration,
) -> Instant {
    last_part_sent + effective_timeout(rtt, timeout_factor, default_timeout) + grace
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_timeout_uses_default_before_rtt_known() {
        let d = effective_timeout(None, 2.0, Duration::from_secs(5));
        assert_eq!(d, Duration::from_secs(5));
    }

    #[test]
    fn effective_timeout_scales_rtt() {
        let d = effective_timeout(Some(Duration::from_millis(100)), 3.0, Duration::from_secs(5));
        assert_eq!(d, Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_wakes_in_deadline_order() {
        let scheduler = WatchdogScheduler::new();
        let now = Instant::now();
        let a = Hash::new([1u8; 32]);
        let b = Hash::new([2u8; 32]);
        scheduler.schedule(a, ResourceRole::Sender, now + Duration::from_secs(5));
        scheduler.schedule(b, ResourceRole::Receiver, now + Duration::from_secs(1));

        let first = scheduler.wait_next().await.unwrap();
        assert_eq!(first.resource_hash, b);
        let second = scheduler.wait_next().await.unwrap();
        assert_eq!(second.resource_hash, a);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_invalidates_the_earlier_job() {
        let scheduler = WatchdogScheduler::new();
        let now = Instant::now();
        let a = Hash::new([3u8; 32]);
        scheduler.schedule(a, ResourceRole::Sender, now + Duration::from_secs(1));
        // A fresh part arrives and pushes the deadline out before it fires.
        scheduler.schedule(a, ResourceRole::Sender, now + Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(2)).await;
        // Only one live job remains; it must be the later one.
        let job = scheduler.wait_next().await.unwrap();
        assert_eq!(job.job_id, 2);
    }

    #[test]
    fn cancel_invalidates_pending_job() {
        let scheduler = WatchdogScheduler::new();
        let now = Instant::now();
        let a = Hash::new([4u8; 32]);
        let job_id = scheduler.schedule(a, ResourceRole::Sender, now + Duration::from_secs(1));
        scheduler.cancel(a, ResourceRole::Sender);
        assert!(!scheduler.is_current(ScheduledJob { resource_hash: a, role: ResourceRole::Sender, job_id }));
    }
}
