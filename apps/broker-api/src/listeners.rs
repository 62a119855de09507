//! Copy-on-write listener lists.
//!
//! Listener sets are read on every notification and written rarely, so
//! readers take a cheap snapshot and iterate it without holding any lock.

use std::sync::Arc;

use parking_lot::RwLock;

pub struct ListenerList<L: ?Sized> {
    inner: RwLock<Arc<Vec<Arc<L>>>>,
}

impl<L: ?Sized> ListenerList<L> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Add a listener unless the same instance is already registered.
    pub fn add(&self, listener: Arc<L>) -> bool {
        let mut guard = self.inner.write();
        if guard.iter().any(|l| same(l, &listener)) {
            return false;
        }
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(listener);
        *guard = Arc::new(next);
        true
    }

    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut guard = self.inner.write();
        if !guard.iter().any(|l| same(l, listener)) {
            return false;
        }
        let next: Vec<Arc<L>> = guard.iter().filter(|l| !same(l, listener)).cloned().collect();
        *guard = Arc::new(next);
        true
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<L>>> {
        Arc::clone(&self.inner.read())
    }

    /// Take every listener out, leaving the list empty.
    pub fn drain(&self) -> Arc<Vec<Arc<L>>> {
        std::mem::replace(&mut *self.inner.write(), Arc::new(Vec::new()))
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L: ?Sized> Default for ListenerList<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity comparison that ignores trait-object metadata.
fn same<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
