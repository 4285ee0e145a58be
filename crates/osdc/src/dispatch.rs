use std::sync::Arc;

use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::cluster_map::{ClusterMap, ClusterMapInner, MapUpdate};
use crate::error::Result;
use crate::messenger::{Messenger, Monitor, ResetReceiver};
use crate::placement::pick_target;
use crate::registry::Registry;
use crate::request::{OpFlags, Request};
use crate::wire::OpHeader;

/// Binds requests to targets using the placement engine, hands them to the
/// messenger, and re-sends affected requests whenever the cluster map
/// advances or a peer connection resets.
pub struct DispatchEngine<M, Mon> {
    map: Arc<ClusterMap>,
    registry: Arc<Registry>,
    messenger: Arc<M>,
    monitor: Arc<Mon>,
    mount_fsid: u64,
}

impl<M, Mon> DispatchEngine<M, Mon>
where
    M: Messenger,
    Mon: Monitor,
{
    pub fn new(
        map: Arc<ClusterMap>,
        registry: Arc<Registry>,
        messenger: Arc<M>,
        monitor: Arc<Mon>,
        mount_fsid: u64,
    ) -> Self {
        Self {
            map,
            registry,
            messenger,
            monitor,
            mount_fsid,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn map(&self) -> &Arc<ClusterMap> {
        &self.map
    }

    fn build_header(&self, req: &Request, epoch: u64) -> OpHeader {
        OpHeader {
            client_inc: 0,
            flags: req.flags_bits().bits(),
            osdmap_epoch: epoch,
            tid: req.tid(),
            ino: req.vino.ino,
            bno: req.object_no,
            snap: req.vino.snap,
            object_size: req.layout.object_size,
            stripe_unit: req.layout.stripe_unit,
            stripe_count: req.layout.stripe_count,
            snap_seq: req.snap_context.seq,
            op: req.op,
            snaps: req.snap_context.snaps.to_vec(),
        }
    }

    /// Bind `req` to a target under the current map snapshot and hand it to
    /// the messenger. If no target is available yet, the request stays
    /// registered and a map refresh is requested; this is not an error.
    #[tracing::instrument(skip(self, req), fields(tid = req.tid()))]
    pub async fn send(&self, req: &Arc<Request>) -> Result<()> {
        let snapshot = self.map.snapshot();
        let Some(target) = pick_target(&snapshot, &req.pgid) else {
            tracing::debug!("no target yet, requesting newer map");
            self.request_newer_map(snapshot.epoch + 1).await;
            return Ok(());
        };
        let addr = snapshot
            .nodes
            .get(&target)
            .map(|n| n.addr.clone())
            .unwrap_or_default();

        let header = self.build_header(req, snapshot.epoch);
        {
            let mut d = req.dispatch.lock().unwrap();
            d.last_target = Some(target);
            d.last_target_addr = Some(addr.clone());
            d.last_stamp = Some(Instant::now());
        }
        req.outgoing_pages.install(req.pages.clone());

        tracing::debug!(target, %addr, "dispatching request");
        self.messenger
            .send_op(target, &addr, header, Some(req.pages.clone()))
            .await
    }

    /// Re-evaluate placement for every registered request and resend those
    /// whose target changed, or whose last-known address matches `who` (a
    /// peer that was just reported reset).
    #[tracing::instrument(skip(self))]
    pub async fn kick(&self, who: Option<&str>) -> Result<()> {
        let snapshot = self.map.snapshot();
        let requests = self.registry.scan_all();
        let mut need_newer_map = false;

        for req in requests {
            if req.is_aborted() {
                continue;
            }
            let target = pick_target(&snapshot, &req.pgid);
            let Some(target) = target else {
                let mut d = req.dispatch.lock().unwrap();
                d.last_target_addr = None;
                need_newer_map = true;
                continue;
            };
            let addr = snapshot
                .nodes
                .get(&target)
                .map(|n| n.addr.clone())
                .unwrap_or_default();

            let previous_addr = req.dispatch.lock().unwrap().last_target_addr.clone();
            let address_changed = previous_addr.as_deref() != Some(addr.as_str());
            let matches_reset_peer = who.is_some() && previous_addr.as_deref() == who;

            if address_changed || matches_reset_peer {
                req.mark_retry();
                tracing::debug!(tid = req.tid(), target, %addr, "resubmitting request");
                if let Err(e) = self.send(&req).await {
                    tracing::warn!(tid = req.tid(), ?e, "resubmit send failed");
                }
            }
        }

        if need_newer_map {
            self.request_newer_map(snapshot.epoch + 1).await;
        }
        Ok(())
    }

    /// Ingest a map update and, if it advanced the published map, notify
    /// the monitor of the new epoch and resubmit affected requests.
    pub async fn ingest_map_update(&self, update: MapUpdate) -> Result<()> {
        let advanced = self.map.ingest(self.mount_fsid, update)?;
        if advanced {
            let epoch = self.map.epoch();
            tracing::info!(epoch, "cluster map advanced");
            self.monitor.got_osdmap(epoch);
            self.kick(None).await?;
        }
        Ok(())
    }

    /// Drive one iteration of the registry's liveness timer: opportunistically
    /// ask for a newer map, then ping the target of every request whose last
    /// dispatch is older than `osd_timeout`.
    pub async fn run_timeout_once(&self, osd_timeout: std::time::Duration) -> Result<()> {
        let epoch = self.map.epoch();
        self.request_newer_map(epoch + 1).await;

        let now = Instant::now();
        for req in self.registry.scan_all() {
            let stamp = req.dispatch.lock().unwrap().last_stamp;
            let Some(stamp) = stamp else { continue };
            if now.saturating_duration_since(stamp) >= osd_timeout {
                let target_addr = req.dispatch.lock().unwrap().clone();
                if let (Some(target), Some(addr)) =
                    (target_addr.last_target, target_addr.last_target_addr)
                {
                    if let Err(e) = self.messenger.send_ping(target, &addr).await {
                        tracing::warn!(tid = req.tid(), ?e, "liveness ping failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// How long to sleep before the next timeout iteration: `osd_timeout`
    /// minus the time already elapsed since the oldest outstanding
    /// request's last dispatch, anchored on the registry's single timer
    /// slot. With nothing outstanding, re-arms for a full `osd_timeout` so
    /// the loop keeps polling for a newer map at a steady cadence.
    fn next_timeout_delay(&self, osd_timeout: Duration) -> Duration {
        let Some(oldest) = self.registry.oldest() else {
            return osd_timeout;
        };
        let Some(stamp) = oldest.dispatch.lock().unwrap().last_stamp else {
            return osd_timeout;
        };
        osd_timeout.saturating_sub(Instant::now().saturating_duration_since(stamp))
    }

    /// Drive the liveness timer forever, one delayed work item anchored on
    /// the oldest outstanding request at a time (mirroring the
    /// single-handed timer a real client drives off one timer thread),
    /// until `shutdown` is notified.
    pub async fn run_timeout_loop(&self, osd_timeout: Duration, shutdown: &Notify) {
        loop {
            let delay = self.next_timeout_delay(osd_timeout);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.notified() => return,
            }
            if let Err(e) = self.run_timeout_once(osd_timeout).await {
                tracing::warn!(?e, "timeout handler iteration failed");
            }
        }
    }

    /// Ask for a newer map both at the session level (`Monitor`, which
    /// dedupes against any already-outstanding request) and on the wire
    /// (`GET_OSDMAP`, via the messenger). A send failure here is logged and
    /// otherwise ignored: the timer and the next `kick`/`send` will ask
    /// again.
    async fn request_newer_map(&self, epoch: u64) {
        self.monitor.request_osdmap(epoch).await;
        if let Err(e) = self.messenger.send_get_osdmap(epoch).await {
            tracing::warn!(?e, epoch, "failed to send GET_OSDMAP");
        }
    }

    /// Drive the peer-reset channel forever: every address the messenger
    /// reports a TCP-level reset for triggers a `kick(Some(addr))`, since a
    /// reset invalidates any outstanding reply promise to that peer (§4.5).
    /// Exits when the channel closes or `shutdown` is notified.
    pub async fn run_reset_loop(&self, mut resets: ResetReceiver, shutdown: &Notify) {
        loop {
            tokio::select! {
                addr = resets.recv() => {
                    let Some(addr) = addr else { return };
                    tracing::debug!(%addr, "peer reset, resubmitting bound requests");
                    if let Err(e) = self.kick(Some(&addr)).await {
                        tracing::warn!(?e, %addr, "resubmit after peer reset failed");
                    }
                }
                _ = shutdown.notified() => return,
            }
        }
    }
}

/// Construct a fresh, ruleful placement-ready map for callers that just
/// mounted and have not yet ingested any map update. Exists so tests and
/// the facade have a non-panicking starting point; real mounts replace it
/// on the first `OSD_MAP` message.
pub fn empty_map(fsid: u64) -> ClusterMapInner {
    ClusterMapInner::new(0, fsid, 0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster_map::NodeInfo;
    use crate::layout::FileLayout;
    use crate::pg::pgid_for_object;
    use crate::request::{Completion, Op, OpKind};
    use crate::vino::{SnapContext, Vino};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeMessenger {
        sent: AsyncMutex<Vec<(u32, String, OpHeader)>>,
        pinged: AsyncMutex<Vec<(u32, String)>>,
        get_osdmap_sent: AsyncMutex<Vec<u64>>,
    }

    impl FakeMessenger {
        fn new() -> Self {
            Self {
                sent: AsyncMutex::new(Vec::new()),
                pinged: AsyncMutex::new(Vec::new()),
                get_osdmap_sent: AsyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl Messenger for FakeMessenger {
        async fn send_op(
            &self,
            target: u32,
            addr: &str,
            header: OpHeader,
            _pages: Option<Arc<StdMutex<Vec<crate::request::Page>>>>,
        ) -> Result<()> {
            self.sent
                .lock()
                .await
                .push((target, addr.to_string(), header));
            Ok(())
        }

        async fn send_get_osdmap(&self, epoch: u64) -> Result<()> {
            self.get_osdmap_sent.lock().await.push(epoch);
            Ok(())
        }

        async fn send_ping(&self, target: u32, addr: &str) -> Result<()> {
            self.pinged.lock().await.push((target, addr.to_string()));
            Ok(())
        }
    }

    struct FakeMonitor {
        requested: AsyncMutex<Vec<u64>>,
        fsid: u64,
    }

    #[async_trait::async_trait]
    impl Monitor for FakeMonitor {
        async fn request_osdmap(&self, epoch: u64) {
            self.requested.lock().await.push(epoch);
        }

        fn got_osdmap(&self, _epoch: u64) {}

        fn fsid(&self) -> u64 {
            self.fsid
        }
    }

    fn map_with_two_nodes(fsid: u64, epoch: u64) -> ClusterMapInner {
        ClusterMapInner::new(epoch, fsid, 8, 8)
            .with_rule(1, 0, 1)
            .with_node(NodeInfo {
                id: 5,
                addr: "10.0.0.5:6800".into(),
                up: true,
                weight: 100,
            })
            .with_node(NodeInfo {
                id: 7,
                addr: "10.0.0.7:6800".into(),
                up: true,
                weight: 100,
            })
    }

    fn sample_request(object_name: &str) -> Arc<Request> {
        Request::new(
            pgid_for_object(object_name, 1, -1, 0, 1),
            Vino::head(1),
            0,
            object_name.into(),
            FileLayout::simple(4 << 20, 1),
            Op {
                kind: OpKind::Read,
                offset: 0,
                length: 10,
            },
            SnapContext::empty(),
            OpFlags::empty(),
            Completion::waiter(),
        )
    }

    #[tokio::test]
    async fn send_dispatches_to_picked_target_and_stamps_request() {
        let map = Arc::new(ClusterMap::new(map_with_two_nodes(1, 1)));
        let registry = Arc::new(Registry::new());
        let messenger = Arc::new(FakeMessenger::new());
        let monitor = Arc::new(FakeMonitor {
            requested: AsyncMutex::new(Vec::new()),
            fsid: 1,
        });
        let engine = DispatchEngine::new(map, registry.clone(), messenger.clone(), monitor, 1);

        let req = sample_request("obj.0");
        registry.register(req.clone());
        engine.send(&req).await.unwrap();

        assert_eq!(messenger.sent.lock().await.len(), 1);
        assert!(req.dispatch.lock().unwrap().last_target.is_some());
    }

    #[tokio::test]
    async fn first_send_never_sets_retry_but_kick_does() {
        let map_inner = map_with_two_nodes(1, 1);
        let map = Arc::new(ClusterMap::new(map_inner));
        let registry = Arc::new(Registry::new());
        let messenger = Arc::new(FakeMessenger::new());
        let monitor = Arc::new(FakeMonitor {
            requested: AsyncMutex::new(Vec::new()),
            fsid: 1,
        });
        let engine = DispatchEngine::new(map.clone(), registry.clone(), messenger, monitor, 1);

        let req = sample_request("obj.0");
        registry.register(req.clone());
        engine.send(&req).await.unwrap();
        assert!(!req.flags_bits().contains(OpFlags::RETRY));

        // Advance the map epoch, then kick; the request's RETRY flag should
        // only ever be set by the resubmit path, never by `send`.
        let update = MapUpdate {
            fsid: 1,
            incrementals: vec![map_with_two_nodes(1, 2)],
            fulls: vec![],
        };
        map.ingest(1, update).unwrap();
        engine.kick(None).await.unwrap();
    }

    #[tokio::test]
    async fn kick_requests_newer_map_when_no_candidate_is_up() {
        let inner = ClusterMapInner::new(1, 1, 8, 8)
            .with_rule(1, 0, 1)
            .with_node(NodeInfo {
                id: 5,
                addr: "10.0.0.5:6800".into(),
                up: false,
                weight: 100,
            });
        let map = Arc::new(ClusterMap::new(inner));
        let registry = Arc::new(Registry::new());
        let messenger = Arc::new(FakeMessenger::new());
        let monitor = Arc::new(FakeMonitor {
            requested: AsyncMutex::new(Vec::new()),
            fsid: 1,
        });
        let engine = DispatchEngine::new(
            map,
            registry.clone(),
            messenger.clone(),
            monitor.clone(),
            1,
        );

        let req = sample_request("obj.0");
        registry.register(req.clone());
        engine.kick(None).await.unwrap();

        assert!(!monitor.requested.lock().await.is_empty());
        assert!(
            !messenger.get_osdmap_sent.lock().await.is_empty(),
            "kick should also send GET_OSDMAP on the wire, not just notify the monitor"
        );
    }

    #[tokio::test]
    async fn aborted_requests_are_skipped_by_kick() {
        let map = Arc::new(ClusterMap::new(map_with_two_nodes(1, 1)));
        let registry = Arc::new(Registry::new());
        let messenger = Arc::new(FakeMessenger::new());
        let monitor = Arc::new(FakeMonitor {
            requested: AsyncMutex::new(Vec::new()),
            fsid: 1,
        });
        let engine = DispatchEngine::new(map, registry.clone(), messenger.clone(), monitor, 1);

        let req = sample_request("obj.0");
        registry.register(req.clone());
        req.abort_and_revoke();
        engine.kick(None).await.unwrap();

        assert!(messenger.sent.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_timeout_once_pings_requests_older_than_osd_timeout() {
        let map = Arc::new(ClusterMap::new(map_with_two_nodes(1, 1)));
        let registry = Arc::new(Registry::new());
        let messenger = Arc::new(FakeMessenger::new());
        let monitor = Arc::new(FakeMonitor {
            requested: AsyncMutex::new(Vec::new()),
            fsid: 1,
        });
        let engine = DispatchEngine::new(map, registry.clone(), messenger.clone(), monitor, 1);

        let req = sample_request("obj.0");
        registry.register(req.clone());
        engine.send(&req).await.unwrap();

        let osd_timeout = std::time::Duration::from_secs(30);
        tokio::time::advance(osd_timeout + std::time::Duration::from_secs(1)).await;
        engine.run_timeout_once(osd_timeout).await.unwrap();

        assert_eq!(messenger.pinged.lock().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_timeout_once_never_removes_or_completes_requests() {
        let map = Arc::new(ClusterMap::new(map_with_two_nodes(1, 1)));
        let registry = Arc::new(Registry::new());
        let messenger = Arc::new(FakeMessenger::new());
        let monitor = Arc::new(FakeMonitor {
            requested: AsyncMutex::new(Vec::new()),
            fsid: 1,
        });
        let engine = DispatchEngine::new(map, registry.clone(), messenger, monitor, 1);

        let req = sample_request("obj.0");
        let tid = registry.register(req.clone());
        engine.send(&req).await.unwrap();

        let osd_timeout = std::time::Duration::from_secs(30);
        tokio::time::advance(osd_timeout * 3).await;
        engine.run_timeout_once(osd_timeout).await.unwrap();
        engine.run_timeout_once(osd_timeout).await.unwrap();

        assert!(registry.lookup(tid).is_some());
        assert!(req.reply_slot.lock().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_loop_stops_on_shutdown_notification() {
        let map = Arc::new(ClusterMap::new(map_with_two_nodes(1, 1)));
        let registry = Arc::new(Registry::new());
        let messenger = Arc::new(FakeMessenger::new());
        let monitor = Arc::new(FakeMonitor {
            requested: AsyncMutex::new(Vec::new()),
            fsid: 1,
        });
        let engine = Arc::new(DispatchEngine::new(
            map,
            registry.clone(),
            messenger,
            monitor,
            1,
        ));

        let shutdown = Arc::new(Notify::new());
        let loop_engine = engine.clone();
        let loop_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            loop_engine
                .run_timeout_loop(std::time::Duration::from_secs(30), &loop_shutdown)
                .await;
        });

        tokio::task::yield_now().await;
        shutdown.notify_one();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("timeout loop should exit promptly after shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn reset_loop_kicks_the_request_bound_to_the_reset_peer() {
        let map = Arc::new(ClusterMap::new(map_with_two_nodes(1, 1)));
        let registry = Arc::new(Registry::new());
        let messenger = Arc::new(FakeMessenger::new());
        let monitor = Arc::new(FakeMonitor {
            requested: AsyncMutex::new(Vec::new()),
            fsid: 1,
        });
        let engine = Arc::new(DispatchEngine::new(
            map,
            registry.clone(),
            messenger.clone(),
            monitor,
            1,
        ));

        let req = sample_request("obj.0");
        registry.register(req.clone());
        engine.send(&req).await.unwrap();
        let addr = req.dispatch.lock().unwrap().last_target_addr.clone().unwrap();
        messenger.sent.lock().await.clear();

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let loop_engine = engine.clone();
        let loop_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            loop_engine.run_reset_loop(rx, &loop_shutdown).await;
        });

        tx.send(addr).unwrap();
        // Give the spawned loop a chance to process the reset before we
        // shut it down and assert on its effect.
        for _ in 0..10 {
            tokio::task::yield_now().await;
            if !messenger.sent.lock().await.is_empty() {
                break;
            }
        }

        shutdown.notify_one();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("reset loop should exit promptly after shutdown")
            .unwrap();

        assert_eq!(messenger.sent.lock().await.len(), 1);
        assert!(req.flags_bits().contains(OpFlags::RETRY));
    }
}
