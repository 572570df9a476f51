//! Priority queue and admission control
//!
//! A single binary heap orders ready jobs by priority, then by
//! submission sequence (oldest first). Admission control runs before
//! anything touches the queue: a per-client sliding-window rate limit
//! and a total capacity bound, both rejected synchronously at submit.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use super::job::{JobId, JobPriority};

/// Heap entry; `Ord` puts the highest priority first and breaks ties
/// with the lowest sequence number (earliest submission)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueEntry {
    priority: JobPriority,
    seq: u64,
    job_id: JobId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority-ordered ready queue with a wakeup signal for workers
pub struct JobQueue {
    heap: Mutex<BinaryHeap<QueueEntry>>,
    notify: Notify,
    seq: AtomicU64,
}

impl JobQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Enqueue a job and wake one waiting worker
    pub fn push(&self, priority: JobPriority, job_id: JobId) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.heap.lock().unwrap().push(QueueEntry {
            priority,
            seq,
            job_id,
        });
        self.notify.notify_one();
    }

    /// Pop the highest-priority, oldest-submitted job
    pub fn pop(&self) -> Option<JobId> {
        self.heap.lock().unwrap().pop().map(|e| e.job_id)
    }

    /// Wait until a push signals new work
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Wake every waiting worker (used on shutdown)
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }

    /// Number of queued jobs
    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.heap.lock().unwrap().is_empty()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Sliding-window per-client rate limiter
pub struct RateLimiter {
    window: Duration,
    cap: usize,
    clients: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Create a limiter allowing `cap` requests per `window`
    pub fn new(cap: usize, window: Duration) -> Self {
        Self {
            window,
            cap,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request for `client` and report whether it is allowed
    pub fn check(&self, client: &str) -> bool {
        let now = Instant::now();
        let mut clients = self.clients.lock().unwrap();
        let history = clients.entry(client.to_string()).or_default();

        while history
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.window)
        {
            history.pop_front();
        }

        if history.len() >= self.cap {
            return false;
        }
        history.push_back(now);
        true
    }

    /// Drop clients with no requests inside the window
    pub fn prune(&self) {
        let now = Instant::now();
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|_, history| {
            history
                .back()
                .is_some_and(|t| now.duration_since(*t) <= self.window)
        });
    }

    /// Number of tracked clients
    pub fn tracked_clients(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_then_fifo() {
        let queue = JobQueue::new();
        let a = JobId::new();
        let b = JobId::new();
        let c = JobId::new();

        // Submitted in order A (low), B (high), C (normal).
        queue.push(JobPriority::Low, a);
        queue.push(JobPriority::High, b);
        queue.push(JobPriority::Normal, c);

        assert_eq!(queue.pop(), Some(b));
        assert_eq!(queue.pop(), Some(c));
        assert_eq!(queue.pop(), Some(a));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_equal_priority_is_fifo() {
        let queue = JobQueue::new();
        let ids: Vec<JobId> = (0..5).map(|_| JobId::new()).collect();
        for id in &ids {
            queue.push(JobPriority::Normal, *id);
        }
        for id in &ids {
            assert_eq!(queue.pop(), Some(*id));
        }
    }

    #[test]
    fn test_rate_limiter_caps_per_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.check("c1"));
        assert!(limiter.check("c1"));
        assert!(limiter.check("c1"));
        assert!(!limiter.check("c1"));
        // Other clients are unaffected.
        assert!(limiter.check("c2"));
    }

    #[test]
    fn test_rate_limiter_window_slides() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.check("c1"));
        assert!(!limiter.check("c1"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check("c1"));
    }

    #[test]
    fn test_prune_drops_idle_clients() {
        let limiter = RateLimiter::new(5, Duration::from_millis(10));
        limiter.check("c1");
        std::thread::sleep(Duration::from_millis(20));
        limiter.prune();
        assert_eq!(limiter.tracked_clients(), 0);
    }
}
