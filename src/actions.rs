use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex},
};

use futures::future::BoxFuture;
use tokio::sync::watch;

/// Bounded-parallel executor of actions tagged with a string id.
///
/// At most `max_concurrent` actions run at once and actions sharing an id
/// are serialized, so install/remove operations on the same item can never
/// overlap while distinct items proceed in parallel.
#[derive(Clone)]
pub struct ActionQueue {
    inner: Arc<Inner>,
}

struct Inner {
    max_concurrent: usize,
    state: Mutex<QueueState>,
    outstanding: watch::Sender<usize>,
}

#[derive(Default)]
struct QueueState {
    running: Vec<String>,
    waiting: VecDeque<PendingAction>,
}

struct PendingAction {
    id: String,
    action: BoxFuture<'static, ()>,
}

impl ActionQueue {
    pub fn new(max_concurrent: usize) -> Self {
        let (outstanding, _) = watch::channel(0usize);

        Self {
            inner: Arc::new(Inner {
                max_concurrent,
                state: Mutex::new(QueueState::default()),
                outstanding,
            }),
        }
    }

    /// Enqueues an action. Runs immediately when the id is not already
    /// running and a slot is free, otherwise waits its turn.
    pub fn execute<F>(&self, id: impl Into<String>, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = id.into();
        let action: BoxFuture<'static, ()> = Box::pin(action);

        self.inner.outstanding.send_modify(|count| *count += 1);

        {
            let mut state = self.inner.state.lock().unwrap();

            if state.running.iter().any(|running| *running == id)
                || state.running.len() >= self.inner.max_concurrent
            {
                state.waiting.push_back(PendingAction { id, action });
                return;
            }

            state.running.push(id.clone());
        }

        self.spawn_driver(id, action);
    }

    /// Waits until both the running and waiting queues drain.
    pub async fn wait(&self) {
        let mut rx = self.inner.outstanding.subscribe();

        while *rx.borrow_and_update() != 0 {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn spawn_driver(&self, id: String, action: BoxFuture<'static, ()>) {
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let mut current = Some((id, action));

            while let Some((id, action)) = current.take() {
                action.await;
                current = inner.finish(&id);
            }
        });
    }
}

impl Inner {
    /// Removes a completed action from the running queue and promotes the
    /// first waiting action whose id is not currently running.
    fn finish(&self, id: &str) -> Option<(String, BoxFuture<'static, ()>)> {
        let next = {
            let mut state = self.state.lock().unwrap();

            if let Some(pos) = state.running.iter().position(|running| running == id) {
                state.running.remove(pos);
            }

            let promoted_pos = state.waiting.iter().position(|pending| {
                !state
                    .running
                    .iter()
                    .any(|running| *running == pending.id)
            });

            if let Some(pending) = promoted_pos.and_then(|pos| state.waiting.remove(pos)) {
                state.running.push(pending.id.clone());
                Some((pending.id, pending.action))
            } else {
                None
            }
        };

        self.outstanding.send_modify(|count| *count -= 1);

        next
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn test_same_id_actions_are_serialized() {
        let queue = ActionQueue::new(10);
        let running = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let running = running.clone();
            let overlaps = overlaps.clone();

            queue.execute("item", async move {
                if running.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        queue.wait().await;

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let queue = ActionQueue::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for i in 0..20 {
            let running = running.clone();
            let max_seen = max_seen.clone();

            queue.execute(format!("item{i}"), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        queue.wait().await;

        assert!(max_seen.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_distinct_ids_run_in_parallel() {
        let queue = ActionQueue::new(10);
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        for i in 0..2 {
            let barrier = barrier.clone();

            // Each action blocks until the other has started; this only
            // completes if the two actions really overlap.
            queue.execute(format!("item{i}"), async move {
                barrier.wait().await;
            });
        }

        tokio::time::timeout(Duration::from_secs(5), queue.wait())
            .await
            .expect("actions deadlocked");
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_empty() {
        let queue = ActionQueue::new(10);
        queue.wait().await;
    }
}
