use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = HashMap<String, Arc<AsyncMutex<()>>>;

/// One async lock per slug. An entry is dropped together with the last guard
/// or waiter that refers to it.
#[derive(Default)]
pub(crate) struct SlugLocks {
    locks: Arc<Mutex<LockMap>>,
}

impl SlugLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, slug: &str) -> SlugGuard {
        let lock = self
            .locks
            .lock()
            .entry(slug.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        SlugGuard {
            slug: slug.to_string(),
            guard: Some(lock.lock_owned().await),
            locks: self.locks.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

pub(crate) struct SlugGuard {
    slug: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<Mutex<LockMap>>,
}

impl Drop for SlugGuard {
    fn drop(&mut self) {
        // clones of an entry are only taken under the map lock
        let mut locks = self.locks.lock();
        drop(self.guard.take());
        if locks
            .get(&self.slug)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(&self.slug);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_slug_serializes() {
        let locks = Arc::new(SlugLocks::new());
        let guard = locks.lock("a").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock("a").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // a different slug is independent
        let _b = locks.lock("b").await;

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn released_entries_are_removed() {
        let locks = SlugLocks::new();
        drop(locks.lock("a").await);
        let b = locks.lock("b").await;
        drop(locks.lock("c").await);
        assert_eq!(locks.len(), 1);
        drop(b);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn entry_survives_while_someone_waits() {
        let locks = Arc::new(SlugLocks::new());
        let guard = locks.lock("a").await;
        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock("a").await;
            other.len()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(guard);
        assert_eq!(waiter.await.unwrap(), 1);
        assert_eq!(locks.len(), 0);
    }
}
