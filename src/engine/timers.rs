//! Keyed registry of cancellable background tasks.
//!
//! Offer expiry timers are keyed by offer id, dispatch loops by order id.
//! Arming a key that is already armed cancels the previous task first.

use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Armed {
    generation: Uuid,
    token: CancellationToken,
}

/// Handed to the spawned task so it can release its own slot on exit.
#[derive(Clone)]
pub struct TaskHandle {
    pub key: Uuid,
    pub generation: Uuid,
    pub token: CancellationToken,
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<Uuid, Armed>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `task` under `key`. The task receives its handle and should
    /// observe `handle.token` for cancellation.
    pub fn spawn<F, Fut>(&self, key: Uuid, task: F) -> TaskHandle
    where
        F: FnOnce(TaskHandle) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = TaskHandle {
            key,
            generation: Uuid::new_v4(),
            token: CancellationToken::new(),
        };

        if let Some(previous) = self.tasks.insert(
            key,
            Armed {
                generation: handle.generation,
                token: handle.token.clone(),
            },
        ) {
            previous.token.cancel();
        }

        tokio::spawn(task(handle.clone()));
        handle
    }

    /// Runs `task` once after `delay` unless disarmed first.
    pub fn arm_after<F, Fut>(&self, key: Uuid, delay: Duration, task: F) -> TaskHandle
    where
        F: FnOnce(TaskHandle) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(key, move |handle| async move {
            let token = handle.token.clone();
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => task(handle).await,
            }
        })
    }

    /// Cancels the task under `key`. Returns whether one was armed.
    pub fn disarm(&self, key: &Uuid) -> bool {
        match self.tasks.remove(key) {
            Some((_, armed)) => {
                armed.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drops the registration if it still belongs to `handle`.
    pub fn release(&self, handle: &TaskHandle) {
        self.tasks
            .remove_if(&handle.key, |_, armed| armed.generation == handle.generation);
    }

    pub fn is_armed(&self, key: &Uuid) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use uuid::Uuid;

    use super::TaskRegistry;

    #[tokio::test(start_paused = true)]
    async fn armed_task_fires_after_delay() {
        let registry = Arc::new(TaskRegistry::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let key = Uuid::new_v4();

        let counter = fired.clone();
        let reg = registry.clone();
        registry.arm_after(key, Duration::from_secs(60), move |handle| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            reg.release(&handle);
        });

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!registry.is_armed(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_task_never_fires() {
        let registry = TaskRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let key = Uuid::new_v4();

        let counter = fired.clone();
        registry.arm_after(key, Duration::from_secs(60), move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(registry.disarm(&key));
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!registry.disarm(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_cancels_the_previous_task_and_keeps_the_new_slot() {
        let registry = TaskRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let key = Uuid::new_v4();

        let first = fired.clone();
        let stale = registry.arm_after(key, Duration::from_secs(10), move |_| async move {
            first.fetch_add(1, Ordering::SeqCst);
        });
        let second = fired.clone();
        registry.arm_after(key, Duration::from_secs(10), move |_| async move {
            second.fetch_add(10, Ordering::SeqCst);
        });

        registry.release(&stale);
        assert!(registry.is_armed(&key));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }
}
