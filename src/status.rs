//! Shared, concurrently readable status values.

use std::sync::{Arc, Mutex, PoisonError};

/// Receives every new snapshot of a status value.
pub type Publisher<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A status value mutated by one owner and read by anyone.
///
/// Every `update` publishes a snapshot after the lock is released, so a
/// publisher may itself update another cell without lock nesting.
pub struct StatusCell<T> {
    inner: Arc<Mutex<T>>,
    publish: Option<Publisher<T>>,
}

impl<T> Clone for StatusCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            publish: self.publish.clone(),
        }
    }
}

impl<T: Clone> StatusCell<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
            publish: None,
        }
    }

    pub fn with_publisher(initial: T, publish: Publisher<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
            publish: Some(publish),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let snapshot = {
            let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard);
            guard.clone()
        };
        if let Some(publish) = &self.publish {
            publish(&snapshot);
        }
    }

    pub fn snapshot(&self) -> T {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Status types an orchestrated operation can report.
pub trait OperationStatus: Clone + Send + Sync + 'static {
    fn is_terminal(&self) -> bool;

    /// Force the internal-error terminal state.
    fn fail_internal(&mut self, message: String);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn update_publishes_snapshot() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let cell = StatusCell::with_publisher(
            0usize,
            Arc::new(move |v: &usize| seen_clone.store(*v, Ordering::SeqCst)),
        );

        cell.update(|v| *v = 7);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert_eq!(cell.snapshot(), 7);
    }

    #[test]
    fn publisher_may_update_parent_cell() {
        let parent = StatusCell::new((0u32, 0u32));
        let parent_clone = parent.clone();
        let child = StatusCell::with_publisher(
            0u32,
            Arc::new(move |v: &u32| parent_clone.update(|p| p.1 = *v)),
        );

        child.update(|v| *v = 3);
        assert_eq!(parent.snapshot(), (0, 3));
    }
}
