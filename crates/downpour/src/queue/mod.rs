//! Fair job queue shared between the engine and the worker pool.
//!
//! Scheduling discipline: round-robin across distinct users, FIFO within
//! each user's own backlog. This bounds the delay any single user can
//! impose on others while preserving per-user submission order. A
//! configurable per-user in-flight cap keeps one user from occupying the
//! whole worker pool; jobs over the cap stay queued, not rejected.

use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::{config, metrics, EngineError, EngineResult};

pub mod job;

pub use job::{Job, JobRequest, JobState, JobView};

/// Queue entry: a job reference carrying its fairness key and the
/// monotonic enqueue instant used for wait-time metrics.
#[derive(Debug, Clone)]
pub struct Ticket {
    /// Job this entry refers to
    pub job_id: Uuid,
    /// Submitting user (fairness key)
    pub user_id: i64,
    /// Monotonic admission instant
    pub enqueued_at: Instant,
}

impl Ticket {
    /// Creates a ticket stamped with the current instant.
    pub fn new(job_id: Uuid, user_id: i64) -> Self {
        Self {
            job_id,
            user_id,
            enqueued_at: Instant::now(),
        }
    }
}

#[derive(Default)]
struct QueueInner {
    /// FIFO backlog per user
    backlogs: HashMap<i64, VecDeque<Ticket>>,
    /// Dispatch rotation: users with pending work, in turn order
    rotation: VecDeque<i64>,
    /// Jobs currently running per user
    running: HashMap<i64, usize>,
}

impl QueueInner {
    fn depth(&self) -> usize {
        self.backlogs.values().map(VecDeque::len).sum()
    }
}

/// Bounded fair queue for download jobs.
///
/// The engine submits on one side; workers pull with
/// [`next_for_worker`](JobQueue::next_for_worker) on the other. All state
/// lives behind one `tokio` mutex; dispatch decisions (turn order, cap
/// check, slot accounting) happen atomically under it.
pub struct JobQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    per_user_cap: usize,
    closed: CancellationToken,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(config::queue::MAX_PENDING, config::queue::PER_USER_RUNNING_CAP)
    }
}

impl JobQueue {
    /// Creates an empty queue.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of pending entries; `submit` fails
    ///   with `QueueFull` beyond it
    /// * `per_user_cap` - Maximum jobs one user may have running at once
    pub fn new(capacity: usize, per_user_cap: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            capacity,
            per_user_cap: per_user_cap.max(1),
            closed: CancellationToken::new(),
        }
    }

    /// The configured pending bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Adds an entry to the submitting user's backlog.
    ///
    /// Fails fast with `QueueFull` when the pending bound is reached:
    /// backpressure is signalled to the caller instead of growing without
    /// limit.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use downpour::queue::{JobQueue, Ticket};
    /// use uuid::Uuid;
    ///
    /// # async fn example() {
    /// let queue = JobQueue::default();
    /// queue.submit(Ticket::new(Uuid::new_v4(), 42)).await.unwrap();
    /// # }
    /// ```
    pub async fn submit(&self, ticket: Ticket) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;

        if inner.depth() >= self.capacity {
            log::warn!(
                "Queue is full ({} pending), rejecting job {}",
                inner.depth(),
                ticket.job_id
            );
            return Err(EngineError::QueueFull {
                capacity: self.capacity,
            });
        }

        let user_id = ticket.user_id;
        log::debug!("Queueing job {} for user {}", ticket.job_id, user_id);
        inner.backlogs.entry(user_id).or_default().push_back(ticket);
        if !inner.rotation.contains(&user_id) {
            inner.rotation.push_back(user_id);
        }

        metrics::update_queue_depth_total(inner.depth());
        Ok(())
    }

    /// Blocks until an entry is dispatchable, the timeout elapses or the
    /// queue is closed.
    ///
    /// Polls at the configured check interval. Returns `None` on timeout
    /// or shutdown so workers can re-check their cancellation token.
    pub async fn next_for_worker(&self, wait: Duration) -> Option<Ticket> {
        let deadline = Instant::now() + wait;

        loop {
            if self.closed.is_cancelled() {
                return None;
            }

            {
                let mut inner = self.inner.lock().await;
                if let Some(ticket) = self.dispatch_locked(&mut inner) {
                    metrics::update_queue_depth_total(inner.depth());
                    metrics::record_queue_wait(ticket.enqueued_at.elapsed().as_secs_f64());
                    log::debug!(
                        "Dispatching job {} for user {} (queue depth {})",
                        ticket.job_id,
                        ticket.user_id,
                        inner.depth()
                    );
                    return Some(ticket);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let tick = config::queue::check_interval().min(deadline - now);
            tokio::select! {
                _ = self.closed.cancelled() => return None,
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }

    /// Picks the next entry respecting turn order and the in-flight cap.
    ///
    /// Each user with pending work gets one turn per rotation; a
    /// dispatched user goes to the back of the rotation. Users at their
    /// in-flight cap keep their backlog but lose the turn.
    fn dispatch_locked(&self, inner: &mut QueueInner) -> Option<Ticket> {
        for _ in 0..inner.rotation.len() {
            let user_id = match inner.rotation.pop_front() {
                Some(id) => id,
                None => break,
            };

            if inner.running.get(&user_id).copied().unwrap_or(0) >= self.per_user_cap {
                if inner.backlogs.get(&user_id).map_or(false, |b| !b.is_empty()) {
                    inner.rotation.push_back(user_id);
                }
                continue;
            }

            let ticket = match inner.backlogs.get_mut(&user_id).and_then(VecDeque::pop_front) {
                Some(ticket) => ticket,
                // Backlog drained by cancellations: the rotation entry expires here
                None => continue,
            };

            if inner.backlogs.get(&user_id).map_or(false, |b| !b.is_empty()) {
                inner.rotation.push_back(user_id);
            } else {
                inner.backlogs.remove(&user_id);
            }

            *inner.running.entry(user_id).or_insert(0) += 1;
            return Some(ticket);
        }

        None
    }

    /// Removes a pending entry, e.g. when its job is cancelled while
    /// still `Queued`.
    ///
    /// # Returns
    ///
    /// `true` if an entry was found and removed; `false` if the job was
    /// not pending (already dispatched, finished or unknown).
    pub async fn remove(&self, job_id: Uuid) -> bool {
        let mut inner = self.inner.lock().await;

        let mut removed = false;
        for backlog in inner.backlogs.values_mut() {
            let before = backlog.len();
            backlog.retain(|t| t.job_id != job_id);
            if backlog.len() != before {
                removed = true;
                break;
            }
        }

        if removed {
            inner.backlogs.retain(|_, b| !b.is_empty());
            metrics::update_queue_depth_total(inner.depth());
        }
        removed
    }

    /// Returns a user's running slot after their job reached a terminal
    /// state. Must be called exactly once per dispatched ticket.
    pub async fn on_finished(&self, user_id: i64) {
        let mut inner = self.inner.lock().await;
        match inner.running.get_mut(&user_id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                inner.running.remove(&user_id);
            }
            None => {
                log::warn!("⚠️ on_finished for user {} with no running slot", user_id);
            }
        }
    }

    /// Current number of pending entries across all users.
    pub async fn depth(&self) -> usize {
        self.inner.lock().await.depth()
    }

    /// Pending entries for one user.
    pub async fn depth_for_user(&self, user_id: i64) -> usize {
        self.inner
            .lock()
            .await
            .backlogs
            .get(&user_id)
            .map_or(0, VecDeque::len)
    }

    /// Jobs currently holding a running slot for one user.
    pub async fn running_for_user(&self, user_id: i64) -> usize {
        self.inner.lock().await.running.get(&user_id).copied().unwrap_or(0)
    }

    /// Closes the queue: pending entries stay, but `next_for_worker`
    /// returns `None` from now on. Used at shutdown.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn ticket(user_id: i64) -> Ticket {
        Ticket::new(Uuid::new_v4(), user_id)
    }

    /// Zero wait: try one dispatch pass without sleeping.
    async fn try_next(queue: &JobQueue) -> Option<Ticket> {
        queue.next_for_worker(Duration::ZERO).await
    }

    // ==================== Submission Tests ====================

    #[tokio::test]
    async fn test_submit_and_dispatch_single() {
        let queue = JobQueue::new(10, 2);
        let t = ticket(1);
        let job_id = t.job_id;

        queue.submit(t).await.unwrap();
        assert_eq!(queue.depth().await, 1);

        let dispatched = try_next(&queue).await.unwrap();
        assert_eq!(dispatched.job_id, job_id);
        assert_eq!(queue.depth().await, 0);
        assert_eq!(queue.running_for_user(1).await, 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_when_full() {
        let queue = JobQueue::new(2, 2);
        queue.submit(ticket(1)).await.unwrap();
        queue.submit(ticket(2)).await.unwrap();

        let result = queue.submit(ticket(3)).await;
        assert!(matches!(result, Err(EngineError::QueueFull { capacity: 2 })));
        assert_eq!(queue.depth().await, 2);
    }

    #[tokio::test]
    async fn test_dispatched_jobs_free_queue_capacity() {
        let queue = JobQueue::new(1, 2);
        queue.submit(ticket(1)).await.unwrap();
        assert!(queue.submit(ticket(1)).await.is_err());

        try_next(&queue).await.unwrap();
        // Running jobs no longer count against the pending bound
        queue.submit(ticket(1)).await.unwrap();
    }

    // ==================== Fairness Tests ====================

    #[tokio::test]
    async fn test_round_robin_across_users() {
        let queue = JobQueue::new(100, 10);
        // Interleaved backlogs: two jobs each for users 1, 2, 3
        for user_id in [1, 2, 3, 1, 2, 3] {
            queue.submit(ticket(user_id)).await.unwrap();
        }

        let mut dispatch_order = Vec::new();
        while let Some(t) = try_next(&queue).await {
            dispatch_order.push(t.user_id);
        }

        // Every pending user is served once before anyone is served twice
        assert_eq!(dispatch_order, vec![1, 2, 3, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_round_robin_with_uneven_backlogs() {
        let queue = JobQueue::new(100, 10);
        for user_id in [1, 1, 1, 2] {
            queue.submit(ticket(user_id)).await.unwrap();
        }

        let mut dispatch_order = Vec::new();
        while let Some(t) = try_next(&queue).await {
            dispatch_order.push(t.user_id);
        }

        assert_eq!(dispatch_order, vec![1, 2, 1, 1]);
    }

    #[tokio::test]
    async fn test_fifo_within_user() {
        let queue = JobQueue::new(100, 10);
        let tickets: Vec<Ticket> = (0..3).map(|_| ticket(7)).collect();
        let expected: Vec<Uuid> = tickets.iter().map(|t| t.job_id).collect();
        for t in tickets {
            queue.submit(t).await.unwrap();
        }

        let mut dispatched = Vec::new();
        while let Some(t) = try_next(&queue).await {
            dispatched.push(t.job_id);
        }
        assert_eq!(dispatched, expected);
    }

    #[tokio::test]
    async fn test_late_submitter_joins_rotation_at_back() {
        let queue = JobQueue::new(100, 10);
        queue.submit(ticket(1)).await.unwrap();
        queue.submit(ticket(1)).await.unwrap();

        assert_eq!(try_next(&queue).await.unwrap().user_id, 1);

        // User 2 arrives after user 1 was served once
        queue.submit(ticket(2)).await.unwrap();
        assert_eq!(try_next(&queue).await.unwrap().user_id, 1);
        assert_eq!(try_next(&queue).await.unwrap().user_id, 2);
    }

    // ==================== In-Flight Cap Tests ====================

    #[tokio::test]
    async fn test_per_user_cap_holds_excess_jobs() {
        let queue = JobQueue::new(100, 2);
        for _ in 0..5 {
            queue.submit(ticket(9)).await.unwrap();
        }

        assert!(try_next(&queue).await.is_some());
        assert!(try_next(&queue).await.is_some());
        // Cap reached: the remaining three stay queued
        assert!(try_next(&queue).await.is_none());
        assert_eq!(queue.depth_for_user(9).await, 3);
        assert_eq!(queue.running_for_user(9).await, 2);

        queue.on_finished(9).await;
        assert!(try_next(&queue).await.is_some());
        assert!(try_next(&queue).await.is_none());
        assert_eq!(queue.running_for_user(9).await, 2);
    }

    #[tokio::test]
    async fn test_capped_user_does_not_block_others() {
        let queue = JobQueue::new(100, 1);
        queue.submit(ticket(1)).await.unwrap();
        queue.submit(ticket(1)).await.unwrap();
        queue.submit(ticket(2)).await.unwrap();

        assert_eq!(try_next(&queue).await.unwrap().user_id, 1);
        // User 1 is at cap; user 2 is served instead
        assert_eq!(try_next(&queue).await.unwrap().user_id, 2);
        assert!(try_next(&queue).await.is_none());

        queue.on_finished(1).await;
        assert_eq!(try_next(&queue).await.unwrap().user_id, 1);
    }

    // ==================== Removal Tests ====================

    #[tokio::test]
    async fn test_remove_pending_entry() {
        let queue = JobQueue::new(100, 2);
        let first = ticket(1);
        let second = ticket(1);
        let first_id = first.job_id;
        let second_id = second.job_id;
        queue.submit(first).await.unwrap();
        queue.submit(second).await.unwrap();

        assert!(queue.remove(first_id).await);
        assert_eq!(queue.depth().await, 1);
        // Second removal of the same job is a no-op
        assert!(!queue.remove(first_id).await);

        assert_eq!(try_next(&queue).await.unwrap().job_id, second_id);
    }

    #[tokio::test]
    async fn test_remove_unknown_job() {
        let queue = JobQueue::new(100, 2);
        assert!(!queue.remove(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_fully_cancelled_user_skipped_in_rotation() {
        let queue = JobQueue::new(100, 2);
        let doomed = ticket(1);
        let doomed_id = doomed.job_id;
        queue.submit(doomed).await.unwrap();
        queue.submit(ticket(2)).await.unwrap();

        assert!(queue.remove(doomed_id).await);
        // User 1's stale rotation entry must not stall dispatch
        assert_eq!(try_next(&queue).await.unwrap().user_id, 2);
        assert!(try_next(&queue).await.is_none());
    }

    // ==================== Blocking & Shutdown Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_next_for_worker_times_out_when_empty() {
        let queue = JobQueue::new(100, 2);
        let started = Instant::now();
        assert!(queue.next_for_worker(Duration::from_millis(300)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_for_worker_picks_up_late_submit() {
        let queue = Arc::new(JobQueue::new(100, 2));

        let submitter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                queue.submit(ticket(5)).await.unwrap();
            })
        };

        let dispatched = queue.next_for_worker(Duration::from_secs(2)).await;
        assert_eq!(dispatched.unwrap().user_id, 5);
        submitter.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_unblocks_waiting_worker() {
        let queue = Arc::new(JobQueue::new(100, 2));

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next_for_worker(Duration::from_secs(60)).await })
        };

        // Give the waiter a chance to park, then shut down
        tokio::task::yield_now().await;
        queue.close();

        assert!(waiter.await.unwrap().is_none());
        assert!(queue.is_closed());

        // Closed queue still accepts nothing for dispatch
        queue.submit(ticket(1)).await.unwrap();
        assert!(queue.next_for_worker(Duration::ZERO).await.is_none());
    }
}
