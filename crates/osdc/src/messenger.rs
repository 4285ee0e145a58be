//! Collaborator interfaces this client drives but does not implement: the
//! wire messenger and the monitor client. Both are out of scope for this
//! crate — this module only fixes the shape a real implementation, or a
//! test fake, must present.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::request::Page;
use crate::wire::OpHeader;

/// Sending half of the peer-reset notification channel. A real messenger
/// holds a clone and pushes the peer address whenever it observes a
/// TCP-level reset; `DispatchEngine::run_reset_loop` holds the matching
/// receiver and turns each event into a `kick(Some(addr))`.
pub type ResetSender = mpsc::UnboundedSender<String>;
pub type ResetReceiver = mpsc::UnboundedReceiver<String>;

/// Outbound network surface. Implementations own the actual socket/transport;
/// this crate only ever calls these three methods.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send an `OP` message to `(target, addr)`. `pages` is `Some` for
    /// writes (payload to send) and for reads that want a destination
    /// vector pre-installed; `None` otherwise.
    async fn send_op(
        &self,
        target: u32,
        addr: &str,
        header: OpHeader,
        pages: Option<Arc<std::sync::Mutex<Vec<Page>>>>,
    ) -> Result<()>;

    /// Ask the monitor side of the session for a map at or newer than
    /// `epoch`. Distinct from `Monitor::request_osdmap` in that this is the
    /// wire send; `Monitor` is the higher-level epoch bookkeeping.
    async fn send_get_osdmap(&self, epoch: u64) -> Result<()>;

    /// Liveness probe to a specific target, used by the registry's timer.
    async fn send_ping(&self, target: u32, addr: &str) -> Result<()>;
}

/// Cluster-map epoch bookkeeping and the mount-time filesystem identifier.
/// Kept separate from `Messenger` because it models session/session state
/// (what epoch have we already asked for) rather than wire I/O.
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Request an osdmap update at or newer than `epoch`, deduplicating
    /// against any outstanding request for the same or newer epoch.
    async fn request_osdmap(&self, epoch: u64);

    /// Record that `epoch` has been observed, so future `request_osdmap`
    /// calls for `<= epoch` are no-ops.
    fn got_osdmap(&self, epoch: u64);

    /// The filesystem identifier learned at mount time.
    fn fsid(&self) -> u64;
}
