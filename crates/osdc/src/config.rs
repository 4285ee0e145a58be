use std::time::Duration;

/// Caller-supplied configuration. Parsing env/file/CLI sources into this
/// struct happens outside this crate; it only fixes the typed surface.
///
/// Deliberately has no `Default`: a client built with guessed timeouts or
/// sizes is a client that silently behaves wrong under load, so every field
/// must be supplied explicitly by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Filesystem identifier learned at mount; every cluster-map update is
    /// checked against this.
    pub fsid: u64,
    /// How long a request may go without a reply before the liveness timer
    /// pings its target.
    pub osd_timeout: Duration,
    /// If true, writes complete on ACK rather than waiting for ONDISK.
    pub unsafe_writeback: bool,
    /// Preferred write chunk size, in bytes.
    pub wsize: usize,
    /// Preferred read chunk size, in bytes.
    pub rsize: usize,
}

impl ClientConfig {
    pub fn new(fsid: u64, osd_timeout: Duration, wsize: usize, rsize: usize) -> Self {
        Self {
            fsid,
            osd_timeout,
            unsafe_writeback: false,
            wsize,
            rsize,
        }
    }

    pub fn with_unsafe_writeback(mut self, unsafe_writeback: bool) -> Self {
        self.unsafe_writeback = unsafe_writeback;
        self
    }
}
