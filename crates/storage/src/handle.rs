//! Weak handle / strong lock
//!
//! Consumers of a data store (queries, transactions, maintenance tasks) hold
//! an [`AsyncHandle`] rather than the store itself. [`AsyncHandle::lock`]
//! yields a [`StrongLock`] that keeps the store alive while held and fails
//! once the store has been dropped. [`AsyncHandle::reset`] first rejects new
//! acquisitions, then blocks until every outstanding lock is released, and
//! finally hands the store back to the caller for destruction.
//!
//! A thread holding a `StrongLock` must not call `reset` on the same handle;
//! it would wait for itself.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

struct HandleState<T> {
    resource: Option<Arc<T>>,
    holders: usize,
}

struct HandleInner<T> {
    state: Mutex<HandleState<T>>,
    released: Condvar,
}

/// Shared, invalidatable reference to a resource
pub struct AsyncHandle<T> {
    inner: Arc<HandleInner<T>>,
}

impl<T> Clone for AsyncHandle<T> {
    fn clone(&self) -> Self {
        AsyncHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for AsyncHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("AsyncHandle")
            .field("alive", &st.resource.is_some())
            .field("holders", &st.holders)
            .finish()
    }
}

impl<T> AsyncHandle<T> {
    /// Wrap a resource
    pub fn new(resource: T) -> Self {
        AsyncHandle {
            inner: Arc::new(HandleInner {
                state: Mutex::new(HandleState {
                    resource: Some(Arc::new(resource)),
                    holders: 0,
                }),
                released: Condvar::new(),
            }),
        }
    }

    /// Acquire a strong lock; `None` once the resource has been reset
    pub fn lock(&self) -> Option<StrongLock<T>> {
        let mut st = self.inner.state.lock();
        let resource = Arc::clone(st.resource.as_ref()?);
        st.holders += 1;
        Some(StrongLock {
            resource,
            _holder: Holder {
                inner: Arc::clone(&self.inner),
            },
        })
    }

    /// True until [`AsyncHandle::reset`] has been called
    pub fn is_alive(&self) -> bool {
        self.inner.state.lock().resource.is_some()
    }

    /// Number of strong locks currently held
    pub fn holders(&self) -> usize {
        self.inner.state.lock().holders
    }

    /// Invalidate the handle, wait for every holder to release, and return
    /// the resource. Returns `None` if the handle was already reset.
    pub fn reset(&self) -> Option<T> {
        let mut st = self.inner.state.lock();
        let resource = st.resource.take()?;
        while st.holders > 0 {
            self.inner.released.wait(&mut st);
        }
        drop(st);
        Arc::try_unwrap(resource).ok()
    }

    /// True when both handles refer to the same resource slot
    pub fn ptr_eq(&self, other: &AsyncHandle<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Keeps the resource behind an [`AsyncHandle`] alive while held
pub struct StrongLock<T> {
    // Field order matters: the resource is released before the holder
    // count drops, so `reset` can reclaim sole ownership.
    resource: Arc<T>,
    _holder: Holder<T>,
}

impl<T> Deref for StrongLock<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.resource
    }
}

impl<T> fmt::Debug for StrongLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StrongLock")
    }
}

/// One counted holder of a handle
struct Holder<T> {
    inner: Arc<HandleInner<T>>,
}

impl<T> Drop for Holder<T> {
    fn drop(&mut self) {
        let mut st = self.inner.state.lock();
        st.holders -= 1;
        if st.holders == 0 {
            self.inner.released.notify_all();
        }
    }
}
