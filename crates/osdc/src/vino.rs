use std::sync::Arc;

/// Sentinel snapshot id denoting the live, writable version of an object.
pub const SNAP_HEAD: u64 = u64::MAX;

/// Versioned inode identity: an object family plus the snapshot it's pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vino {
    pub ino: u64,
    pub snap: u64,
}

impl Vino {
    pub fn head(ino: u64) -> Self {
        Self {
            ino,
            snap: SNAP_HEAD,
        }
    }

    pub fn is_head(&self) -> bool {
        self.snap == SNAP_HEAD
    }
}

/// Reference-counted set of snapshot ids in effect when a write was issued.
///
/// The client never mutates a `SnapContext`; it attaches and propagates one
/// for the life of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapContext {
    pub seq: u64,
    pub snaps: Arc<[u64]>,
}

impl SnapContext {
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            seq: 0,
            snaps: Arc::from(Vec::new().into_boxed_slice()),
        })
    }

    pub fn new(seq: u64, snaps: Vec<u64>) -> Arc<Self> {
        Arc::new(Self {
            seq,
            snaps: Arc::from(snaps.into_boxed_slice()),
        })
    }
}
