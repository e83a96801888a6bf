//! Process-wide handle to a camera stack's manager object

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

/// Init-once, teardown-once holder for a shared manager.
///
/// Sessions clone the `Arc` they get from [`init`](Self::init), so tearing
/// the holder down only drops the process-wide reference; the manager itself
/// lives until the last session using it is gone.
pub struct DeviceManager<T> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T> Default for DeviceManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeviceManager<T> {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Return the manager, creating it on first use. Later calls return the
    /// same instance without calling `create`.
    pub fn init<E>(&self, create: impl FnOnce() -> Result<T, E>) -> Result<Arc<T>, E> {
        let mut slot = self.lock();
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }

        let manager = Arc::new(create()?);
        *slot = Some(manager.clone());
        info!("Camera manager started");
        Ok(manager)
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.lock().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().is_some()
    }

    /// Drop the process-wide reference. Returns whether there was one.
    pub fn teardown(&self) -> bool {
        let Some(manager) = self.lock().take() else {
            debug!("teardown without a running camera manager");
            return false;
        };

        let users = Arc::strong_count(&manager) - 1;
        if users > 0 {
            debug!("camera manager stays alive for {} open sessions", users);
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<T>>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn init_runs_once() {
        let manager = DeviceManager::new();
        let mut created = 0;

        let a = manager
            .init(|| {
                created += 1;
                Ok::<_, ()>(7)
            })
            .unwrap();
        let b = manager.init(|| Err(())).unwrap();

        assert_eq!(created, 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(manager.is_initialized());
    }

    #[test]
    fn failed_init_leaves_it_uninitialized() {
        let manager: DeviceManager<u32> = DeviceManager::new();
        assert_eq!(manager.init(|| Err("no cameras")), Err("no cameras"));
        assert!(!manager.is_initialized());
        assert_eq!(*manager.init(|| Ok::<_, ()>(3)).unwrap(), 3);
    }

    #[test]
    fn teardown_without_init_is_harmless() {
        let manager: DeviceManager<u32> = DeviceManager::new();
        assert!(!manager.teardown());
        assert!(!manager.teardown());
    }

    #[test]
    fn sessions_keep_the_manager_alive() {
        let drops = Arc::new(AtomicUsize::new(0));
        let manager = DeviceManager::new();

        let session_ref = manager
            .init(|| Ok::<_, ()>(DropCounter(drops.clone())))
            .unwrap();
        assert!(manager.teardown());
        assert!(!manager.teardown());
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(session_ref);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(manager.get().is_none());
    }
}
