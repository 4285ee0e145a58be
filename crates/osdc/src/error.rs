/// Crate-wide error type: one variant per external failure mode, with a
/// `#[from]` conversion wherever a lower layer's error naturally wraps.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no placement rule for pool {pool}, type {rule_type}, size {size}")]
    NoPlacementRule {
        pool: u64,
        rule_type: u32,
        size: u32,
    },

    #[error("cluster map epoch {got} is not a contiguous successor of {current}")]
    NonContiguousEpoch { current: u64, got: u64 },

    #[error("cluster map fsid mismatch: mount expects {expected}, got {got}")]
    FsidMismatch { expected: u64, got: u64 },

    #[error("corrupt cluster map message: {0}")]
    CorruptMap(&'static str),

    #[error("corrupt reply: front length {got} does not match expected {expected}")]
    CorruptReply { expected: usize, got: usize },

    #[error("file layout has zero object size or zero stripe unit")]
    InvalidLayout,

    #[error("request {tid} is no longer registered")]
    NotRegistered { tid: u64 },

    #[error("synchronous wait was interrupted")]
    Interrupted,

    #[error("messenger send failed: {0}")]
    Send(String),

    #[error("user-copy fault: {0}")]
    UserCopy(String),

    #[error("osd returned failure {result} for request {tid}")]
    OsdFailure { tid: u64, result: i32 },
}

pub type Result<T> = std::result::Result<T, Error>;
