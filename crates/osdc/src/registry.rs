use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::request::Request;

/// Indexed collection of outstanding requests, keyed by monotonic tid.
///
/// Mirrors the lock discipline described alongside it: the mutex is held
/// only for the index mutation itself, never across a send or an await.
pub struct Registry {
    inner: Mutex<Inner>,
}

struct Inner {
    last_tid: u64,
    index: BTreeMap<u64, Arc<Request>>,
    /// tid of the request the liveness timer is currently anchored on.
    timeout_tid: Option<u64>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                last_tid: 0,
                index: BTreeMap::new(),
                timeout_tid: None,
            }),
        }
    }

    /// Assign the next tid, stamp it into the request, and insert it into
    /// the index. Arms the timer (by recording it as the anchor) if the
    /// registry was empty beforehand.
    pub fn register(&self, req: Arc<Request>) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.last_tid += 1;
        let tid = inner.last_tid;
        req.assign_tid(tid);
        let was_empty = inner.index.is_empty();
        inner.index.insert(tid, req);
        if was_empty {
            inner.timeout_tid = Some(tid);
        }
        tracing::debug!(tid, "request registered");
        tid
    }

    /// Remove `tid` from the index. If it was the timer's anchor, advance
    /// the anchor to the next-lowest remaining tid, wrapping to `None` if
    /// the registry is now empty.
    pub fn unregister(&self, tid: u64) -> Option<Arc<Request>> {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.index.remove(&tid);
        if removed.is_some() && inner.timeout_tid == Some(tid) {
            inner.timeout_tid = inner.index.range(tid + 1..).next().map(|(&k, _)| k);
        }
        if removed.is_some() {
            tracing::debug!(tid, "request unregistered");
        }
        removed
    }

    pub fn lookup(&self, tid: u64) -> Option<Arc<Request>> {
        self.inner.lock().unwrap().index.get(&tid).cloned()
    }

    /// All requests with id >= `tid`, in ascending order.
    pub fn scan_from(&self, tid: u64) -> Vec<Arc<Request>> {
        self.inner
            .lock()
            .unwrap()
            .index
            .range(tid..)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// All requests currently registered, in ascending id order. Used by
    /// `kick`, which must walk the whole registry on every map change.
    pub fn scan_all(&self) -> Vec<Arc<Request>> {
        self.scan_from(0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timeout_tid(&self) -> Option<u64> {
        self.inner.lock().unwrap().timeout_tid
    }

    /// The currently oldest-anchored request, if any, for the timer to act
    /// on.
    pub fn oldest(&self) -> Option<Arc<Request>> {
        let tid = self.timeout_tid()?;
        self.lookup(tid)
    }
}
