use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::sync::Notify;

use crate::layout::FileLayout;
use crate::pg::PgId;
use crate::vino::{SnapContext, Vino};

bitflags::bitflags! {
    /// Header flags, ORed into the outgoing `OP` message on every send.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFlags: u32 {
        /// Request acknowledgement.
        const ACK = 0x0001;
        /// Request commit-to-disk confirmation.
        const ONDISK = 0x0004;
        /// Set on every resend after the first; never set on the first send.
        const RETRY = 0x0008;
        /// Serialize this write against the object's snapshot sequence.
        const ORDERSNAP = 0x0010;
        /// This is a mutating operation.
        const MODIFY = 0x0020;
    }
}

/// A single embedded operation: read or write of `length` bytes starting at
/// `offset` within the target object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Op {
    pub kind: OpKind,
    pub offset: u64,
    pub length: u64,
}

/// A page-sized buffer. The outgoing message and an eventual incoming reply
/// may both reference the same underlying page vector; see `PageSlot`.
pub type Page = BytesMut;

/// A slot referencing the shared page vector from one side (outgoing or
/// reply) of a request's in-flight messages.
///
/// Cancellation clears the slot under its own mutex rather than nulling a
/// raw pointer, so a concurrent reply handler that still holds the lock
/// momentarily either sees the pages or sees `None` -- never a dangling
/// reference.
#[derive(Default)]
pub struct PageSlot(Mutex<Option<Arc<Mutex<Vec<Page>>>>>);

impl PageSlot {
    pub fn install(&self, pages: Arc<Mutex<Vec<Page>>>) {
        *self.0.lock().unwrap() = Some(pages);
    }

    pub fn revoke(&self) {
        *self.0.lock().unwrap() = None;
    }

    pub fn is_installed(&self) -> bool {
        self.0.lock().unwrap().is_some()
    }

    pub fn get(&self) -> Option<Arc<Mutex<Vec<Page>>>> {
        self.0.lock().unwrap().clone()
    }
}

/// Result of a completed reply, set into `Request::reply_slot` exactly once.
#[derive(Debug, Clone)]
pub struct ReplyOutcome {
    pub result: i32,
    /// Per-op return codes/lengths, one per embedded op (always one here).
    pub op_result: i32,
}

/// Mutually exclusive completion modes for a request.
pub enum Completion {
    /// A synchronous caller is waiting on `Notify`.
    Waiter(Notify),
    /// An asynchronous caller observes completion through this callback.
    Callback(Mutex<Option<Box<dyn FnOnce(&Request) + Send>>>),
}

impl Completion {
    pub fn waiter() -> Self {
        Completion::Waiter(Notify::new())
    }

    pub fn callback(f: impl FnOnce(&Request) + Send + 'static) -> Self {
        Completion::Callback(Mutex::new(Some(Box::new(f))))
    }

    /// Fire the completion: wake the waiter, or invoke and consume the
    /// callback exactly once.
    pub(crate) fn fire(&self, req: &Request) {
        match self {
            Completion::Waiter(notify) => notify.notify_one(),
            Completion::Callback(slot) => {
                if let Some(f) = slot.lock().unwrap().take() {
                    f(req);
                }
            }
        }
    }

    pub async fn wait(&self) {
        match self {
            Completion::Waiter(notify) => notify.notified().await,
            Completion::Callback(_) => {
                // Callback-mode requests are never awaited directly by the
                // facade; `writepages_start` returns immediately after send.
            }
        }
    }
}

/// The unit of work dispatched to an OSD and tracked until reply or abort.
pub struct Request {
    tid: AtomicU64,
    pub pgid: PgId,
    pub vino: Vino,
    pub object_no: u64,
    pub object_name: String,
    pub layout: FileLayout,
    pub op: Op,
    pub snap_context: Arc<SnapContext>,
    pub flags: Mutex<OpFlags>,
    pub osdmap_epoch: AtomicU64,

    /// Owned page storage; read requests allocate before send, write
    /// requests populate it with caller data before send.
    pub pages: Arc<Mutex<Vec<Page>>>,
    pub outgoing_pages: PageSlot,
    pub reply_pages: PageSlot,

    pub reply_slot: Mutex<Option<ReplyOutcome>>,
    pub completion: Completion,

    pub aborted: AtomicBool,
    pub dispatch: Mutex<DispatchStateInner>,
}

/// Last-dispatch bookkeeping, read by resubmit and the timeout engine.
#[derive(Debug, Default, Clone)]
pub struct DispatchStateInner {
    pub last_target: Option<u32>,
    pub last_target_addr: Option<String>,
    pub last_stamp: Option<std::time::Instant>,
}

/// Sentinel tid meaning "not yet registered".
pub const TID_UNASSIGNED: u64 = 0;

impl Request {
    pub fn new(
        pgid: PgId,
        vino: Vino,
        object_no: u64,
        object_name: String,
        layout: FileLayout,
        op: Op,
        snap_context: Arc<SnapContext>,
        flags: OpFlags,
        completion: Completion,
    ) -> Arc<Self> {
        Arc::new(Self {
            tid: AtomicU64::new(TID_UNASSIGNED),
            pgid,
            vino,
            object_no,
            object_name,
            layout,
            op,
            snap_context,
            flags: Mutex::new(flags),
            osdmap_epoch: AtomicU64::new(0),
            pages: Arc::new(Mutex::new(Vec::new())),
            outgoing_pages: PageSlot::default(),
            reply_pages: PageSlot::default(),
            reply_slot: Mutex::new(None),
            completion,
            aborted: AtomicBool::new(false),
            dispatch: Mutex::new(DispatchStateInner::default()),
        })
    }

    pub fn tid(&self) -> u64 {
        self.tid.load(Ordering::Acquire)
    }

    /// Assign the tid at registration time. Invariant: called exactly once.
    pub fn assign_tid(&self, tid: u64) {
        self.tid.store(tid, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn mark_retry(&self) {
        self.flags.lock().unwrap().insert(OpFlags::RETRY);
    }

    pub fn flags_bits(&self) -> OpFlags {
        *self.flags.lock().unwrap()
    }

    /// Cancel a synchronous wait: set `aborted` first, then revoke both page
    /// slots under their own mutexes. Ordering matters: `aborted` must be
    /// visible to a racing resubmit before the pages are pulled out from
    /// under it.
    pub fn abort_and_revoke(&self) {
        self.aborted.store(true, Ordering::Release);
        self.outgoing_pages.revoke();
        self.reply_pages.revoke();
    }

    /// Complete the request: record the outcome and fire the completion
    /// exactly once. Called by the reply handler.
    pub fn complete(&self, outcome: ReplyOutcome) {
        *self.reply_slot.lock().unwrap() = Some(outcome);
        self.completion.fire(self);
    }
}
