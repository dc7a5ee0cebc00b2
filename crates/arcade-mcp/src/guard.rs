//! Connection-count guard for network transports

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

#[derive(Debug, Default)]
struct GuardState {
    counter: u64,
    active: HashSet<String>,
}

/// Caps the number of live connections. Reaching the cap is a rejection,
/// not an error: [`acquire`](Self::acquire) returns `None`.
#[derive(Debug)]
pub struct ConnectionGuard {
    prefix: String,
    max: usize,
    state: Mutex<GuardState>,
}

impl ConnectionGuard {
    pub fn new(prefix: impl Into<String>, max: usize) -> Self {
        Self {
            prefix: prefix.into(),
            max,
            state: Mutex::new(GuardState::default()),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().map(|s| s.active.len()).unwrap_or(0)
    }

    /// Claim a slot, returning its `{prefix}_{n}` identifier.
    pub fn acquire(&self) -> Option<String> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.active.len() >= self.max {
            warn!(prefix = %self.prefix, max = self.max, "Connection limit reached");
            return None;
        }
        state.counter += 1;
        let id = format!("{}_{}", self.prefix, state.counter);
        state.active.insert(id.clone());
        debug!(connection = %id, active = state.active.len(), "Connection acquired");
        Some(id)
    }

    /// Free a slot; unknown ids are ignored.
    pub fn release(&self, id: &str) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.active.remove(id) {
            debug!(connection = %id, active = state.active.len(), "Connection released");
        }
    }

    /// Acquire a slot tied to the returned lease's lifetime.
    pub fn acquire_lease(self: &Arc<Self>) -> Option<ConnectionLease> {
        let id = self.acquire()?;
        Some(ConnectionLease {
            guard: Arc::clone(self),
            id,
        })
    }
}

/// Releases its slot when dropped.
#[derive(Debug)]
pub struct ConnectionLease {
    guard: Arc<ConnectionGuard>,
    id: String,
}

impl ConnectionLease {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.guard.release(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_capacity() {
        let guard = ConnectionGuard::new("sse", 2);
        let a = guard.acquire();
        let b = guard.acquire();
        let c = guard.acquire();

        assert_eq!(a.as_deref(), Some("sse_1"));
        assert_eq!(b.as_deref(), Some("sse_2"));
        assert!(c.is_none());
        assert_eq!(guard.active_count(), 2);

        guard.release("sse_1");
        assert_eq!(guard.acquire().as_deref(), Some("sse_3"));
        assert_eq!(guard.active_count(), 2);
    }

    #[test]
    fn test_rejection_does_not_mutate() {
        let guard = ConnectionGuard::new("http", 1);
        guard.acquire();
        assert!(guard.acquire().is_none());
        assert!(guard.acquire().is_none());
        guard.release("http_1");
        // Rejections did not advance the counter
        assert_eq!(guard.acquire().as_deref(), Some("http_2"));
    }

    #[test]
    fn test_release_is_idempotent() {
        let guard = ConnectionGuard::new("sse", 2);
        let id = guard.acquire().unwrap();
        guard.release(&id);
        guard.release(&id);
        guard.release("never-issued");
        assert_eq!(guard.active_count(), 0);
    }

    #[test]
    fn test_zero_capacity_always_rejects() {
        let guard = ConnectionGuard::new("sse", 0);
        assert!(guard.acquire().is_none());
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let guard = Arc::new(ConnectionGuard::new("sse", 1));
        {
            let lease = guard.acquire_lease().unwrap();
            assert_eq!(lease.id(), "sse_1");
            assert!(guard.acquire_lease().is_none());
        }
        assert_eq!(guard.active_count(), 0);
        assert!(guard.acquire_lease().is_some());
    }

    #[test]
    fn test_concurrent_acquires_never_exceed_max() {
        let guard = Arc::new(ConnectionGuard::new("c", 5));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let guard = guard.clone();
                std::thread::spawn(move || guard.acquire())
            })
            .collect();
        let granted = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(granted, 5);
        assert_eq!(guard.active_count(), 5);
    }
}
