//! Scoped ownership of listener registrations.
//!
//! Every handler the sync core attaches (to the channel or to the awareness
//! replica) is recorded here together with the closure that detaches it.
//! Release runs the closures in reverse order of registration, exactly once,
//! whether it is triggered explicitly or by `Drop`.

use parking_lot::Mutex;
use tracing::trace;

type Release = Box<dyn FnOnce() + Send>;

/// Ordered set of registrations released together
pub struct Subscriptions {
    entries: Mutex<Option<Vec<(&'static str, Release)>>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Some(Vec::new())),
        }
    }

    /// Record a registration. Once released, new entries are released immediately.
    pub fn push<F>(&self, label: &'static str, release: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut entries = self.entries.lock();
        match entries.as_mut() {
            Some(list) => list.push((label, Box::new(release))),
            None => {
                drop(entries);
                trace!(label, "releasing late registration");
                release();
            }
        }
    }

    /// Release everything in reverse order. Returns false if already released.
    pub fn release(&self) -> bool {
        let Some(list) = self.entries.lock().take() else {
            return false;
        };
        for (label, release) in list.into_iter().rev() {
            trace!(label, "releasing registration");
            release();
        }
        true
    }

    pub fn is_released(&self) -> bool {
        self.entries.lock().is_none()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Subscriptions {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_release_in_reverse_order_once() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let subs = Subscriptions::new();
        for label in ["first", "second", "third"] {
            let order = order.clone();
            subs.push(label, move || order.lock().push(label));
        }
        assert_eq!(subs.len(), 3);

        assert!(subs.release());
        assert!(!subs.release());
        assert!(subs.is_released());
        assert_eq!(*order.lock(), vec!["third", "second", "first"]);
    }

    #[test]
    fn test_drop_releases() {
        let released = Arc::new(Mutex::new(false));
        {
            let subs = Subscriptions::new();
            let flag = released.clone();
            subs.push("flag", move || *flag.lock() = true);
        }
        assert!(*released.lock());
    }

    #[test]
    fn test_push_after_release_runs_immediately() {
        let subs = Subscriptions::new();
        subs.release();

        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        subs.push("late", move || *flag.lock() = true);
        assert!(*ran.lock());
        assert!(subs.is_empty());
    }
}
