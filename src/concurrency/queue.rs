use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

use super::lock;

/// Keyed FIFO queue. Tasks sharing a key run in submission order with at
/// most `max_concurrent` of them running at once; different keys never
/// block each other.
///
/// Lanes are created on first use and dropped as soon as nobody is running
/// or waiting on them. The next waiter is woken when a permit is released,
/// never run inline, so long chains do not grow the stack.
#[derive(Debug)]
pub struct ConcurrencyQueue<K> {
    max_concurrent: NonZeroUsize,
    lanes: Mutex<HashMap<K, Lane>>,
}

#[derive(Debug)]
struct Lane {
    permits: Arc<Semaphore>,
    users: usize,
}

impl<K> Default for ConcurrencyQueue<K> {
    fn default() -> Self {
        Self::serial()
    }
}

impl<K> ConcurrencyQueue<K> {
    pub fn new(max_concurrent: NonZeroUsize) -> Self {
        Self {
            max_concurrent,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// One task at a time per key.
    pub fn serial() -> Self {
        Self::new(NonZeroUsize::MIN)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.get()
    }
}

impl<K> ConcurrencyQueue<K>
where
    K: Hash + Eq + Clone,
{
    /// Run `task` once its turn comes on lane `key` and return its output.
    ///
    /// Dropping the returned future before it completes gives up the place
    /// in line (or the running slot) without affecting other tasks.
    pub async fn enqueue<F, Fut, T>(&self, key: K, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = self.checkout(key);
        // Lanes never close their semaphore.
        let _permit = lease.permits.acquire().await.ok();
        task().await
    }

    /// Tasks running or waiting on `key`.
    pub fn pending(&self, key: &K) -> usize {
        lock(&self.lanes).get(key).map_or(0, |lane| lane.users)
    }

    /// Number of live lanes.
    pub fn lanes(&self) -> usize {
        lock(&self.lanes).len()
    }

    fn checkout(&self, key: K) -> LaneLease<'_, K> {
        let mut lanes = lock(&self.lanes);
        let lane = lanes.entry(key.clone()).or_insert_with(|| Lane {
            permits: Arc::new(Semaphore::new(self.max_concurrent.get())),
            users: 0,
        });
        lane.users += 1;
        LaneLease {
            queue: self,
            permits: Arc::clone(&lane.permits),
            key: Some(key),
        }
    }

    fn release(&self, key: &K) {
        let mut lanes = lock(&self.lanes);
        if let Some(lane) = lanes.get_mut(key) {
            lane.users -= 1;
            if lane.users == 0 {
                lanes.remove(key);
            }
        }
    }
}

struct LaneLease<'a, K>
where
    K: Hash + Eq + Clone,
{
    queue: &'a ConcurrencyQueue<K>,
    permits: Arc<Semaphore>,
    key: Option<K>,
}

impl<K> Drop for LaneLease<'_, K>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.queue.release(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn returns_task_output() {
        let queue = ConcurrencyQueue::serial();
        assert_eq!(queue.enqueue("k", || async { 7 }).await, 7);
        let failed: Result<(), &str> = queue.enqueue("k", || async { Err("boom") }).await;
        assert_eq!(failed, Err("boom"));
    }

    #[tokio::test]
    async fn next_task_waits_for_previous_to_settle() {
        let queue = Arc::new(ConcurrencyQueue::serial());
        let (release, gate) = oneshot::channel::<()>();
        let second_started = Arc::new(AtomicBool::new(false));

        let q = Arc::clone(&queue);
        let first = tokio::spawn(async move {
            q.enqueue("conn", || async move {
                gate.await.ok();
                "first"
            })
            .await
        });
        settle().await;

        let q = Arc::clone(&queue);
        let flag = Arc::clone(&second_started);
        let second = tokio::spawn(async move {
            q.enqueue("conn", move || async move {
                flag.store(true, Ordering::SeqCst);
                "second"
            })
            .await
        });
        settle().await;

        assert!(!second_started.load(Ordering::SeqCst));
        assert_eq!(queue.pending(&"conn"), 2);

        release.send(()).unwrap();
        assert_eq!(first.await.unwrap(), "first");
        assert_eq!(second.await.unwrap(), "second");
        assert!(second_started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn runs_in_submission_order() {
        let queue = Arc::new(ConcurrencyQueue::serial());
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..5 {
            let q = Arc::clone(&queue);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                q.enqueue(1u8, move || async move {
                    tokio::task::yield_now().await;
                    order.lock().unwrap().push(i);
                })
                .await
            }));
            settle().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn bounds_concurrency_per_key() {
        let queue = Arc::new(ConcurrencyQueue::new(NonZeroUsize::new(3).unwrap()));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let q = Arc::clone(&queue);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                q.enqueue("host", move || async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    settle().await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn keys_do_not_block_each_other() {
        let queue = Arc::new(ConcurrencyQueue::serial());
        let (_hold, gate) = oneshot::channel::<()>();
        let q = Arc::clone(&queue);
        let blocked = tokio::spawn(async move { q.enqueue("a", || async move { gate.await.ok() }).await });
        settle().await;

        assert_eq!(queue.enqueue("b", || async { 1 }).await, 1);
        blocked.abort();
    }

    #[tokio::test]
    async fn lanes_are_dropped_when_empty() {
        let queue = ConcurrencyQueue::serial();
        queue.enqueue("a", || async {}).await;
        queue.enqueue("b", || async {}).await;
        assert_eq!(queue.lanes(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_releases_its_place() {
        let queue = Arc::new(ConcurrencyQueue::serial());
        let (release, gate) = oneshot::channel::<()>();
        let q = Arc::clone(&queue);
        let first = tokio::spawn(async move { q.enqueue("k", || async move { gate.await.ok() }).await });
        settle().await;

        let q = Arc::clone(&queue);
        let waiter = tokio::spawn(async move { q.enqueue("k", || async {}).await });
        settle().await;
        assert_eq!(queue.pending(&"k"), 2);

        waiter.abort();
        settle().await;
        assert_eq!(queue.pending(&"k"), 1);

        release.send(()).unwrap();
        first.await.unwrap();
        assert_eq!(queue.lanes(), 0);
    }
}
