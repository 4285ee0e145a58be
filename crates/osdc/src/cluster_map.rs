use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::pg::{stable_mod, PgId};

/// Per-node address and liveness/weight as published in the cluster map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: u32,
    pub addr: String,
    pub up: bool,
    pub weight: u32,
}

/// Entry in the placement rule table: describes how to select `size` nodes
/// for a pg belonging to `(pool, rule_type)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RuleKey {
    pool: u64,
    rule_type: u32,
    size: u32,
}

/// Immutable snapshot of cluster membership at a given epoch.
///
/// Maps are never mutated once constructed; advancing the client's view of
/// the cluster is always done by building a new `ClusterMapInner` and
/// publishing it atomically (see `ClusterMap::publish`).
#[derive(Debug, Clone)]
pub struct ClusterMapInner {
    pub epoch: u64,
    pub fsid: u64,
    pub nodes: HashMap<u32, NodeInfo>,
    rules: HashMap<RuleKey, ()>,
    /// Placement-group count used when a pg has no preferred node.
    pub pg_num: u32,
    /// Placement-group count used when a pg has a preferred node.
    pub pg_num_local: u32,
}

impl ClusterMapInner {
    pub fn new(epoch: u64, fsid: u64, pg_num: u32, pg_num_local: u32) -> Self {
        Self {
            epoch,
            fsid,
            nodes: HashMap::new(),
            rules: HashMap::new(),
            pg_num,
            pg_num_local,
        }
    }

    pub fn with_node(mut self, node: NodeInfo) -> Self {
        self.nodes.insert(node.id, node);
        self
    }

    pub fn with_rule(mut self, pool: u64, rule_type: u32, size: u32) -> Self {
        self.rules.insert(
            RuleKey {
                pool,
                rule_type,
                size,
            },
            (),
        );
        self
    }

    fn has_rule(&self, pool: u64, rule_type: u32, size: u32) -> bool {
        self.rules.contains_key(&RuleKey {
            pool,
            rule_type,
            size,
        })
    }

    /// Flat `(pool, rule_type, size)` view of the rule table, for the wire
    /// codec to serialize.
    pub(crate) fn rule_entries(&self) -> Vec<(u64, u32, u32)> {
        self.rules
            .keys()
            .map(|k| (k.pool, k.rule_type, k.size))
            .collect()
    }

    /// Execute the placement rule for `pgid`, producing an ordered
    /// candidate list of up to `pgid.size` distinct node ids.
    ///
    /// This is a deterministic, reproducible stand-in for CRUSH: real
    /// cluster topologies (racks, hosts, weights) are out of scope for this
    /// client; what matters here is that the same `(map, pgid)` always
    /// yields the same ordering, which is all the placement engine's
    /// contract requires.
    pub(crate) fn candidates(&self, pgid: &PgId) -> Result<Vec<u32>> {
        if !self.has_rule(pgid.pool, pgid.rule_type, pgid.size) {
            return Err(Error::NoPlacementRule {
                pool: pgid.pool,
                rule_type: pgid.rule_type,
                size: pgid.size,
            });
        }

        let pg_count = if pgid.preferred >= 0 {
            self.pg_num_local
        } else {
            self.pg_num
        };
        if pg_count == 0 {
            return Err(Error::NoPlacementRule {
                pool: pgid.pool,
                rule_type: pgid.rule_type,
                size: pgid.size,
            });
        }
        let pps = stable_mod(pgid.ps, pg_count);

        let mut node_ids: Vec<u32> = self.nodes.keys().copied().collect();
        node_ids.sort_unstable();
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut picked = Vec::with_capacity(pgid.size as usize);
        let mut replica = 0u32;
        // Linear-probe a deterministic hash ring until `size` distinct
        // nodes are picked or every node has been considered.
        while picked.len() < pgid.size as usize && replica < node_ids.len() as u32 {
            let h = crate::pg::jenkins_oaat_hash(&[
                (pps & 0xff) as u8,
                ((pps >> 8) & 0xff) as u8,
                ((pps >> 16) & 0xff) as u8,
                ((pps >> 24) & 0xff) as u8,
                replica as u8,
            ]);
            let idx = (h as usize) % node_ids.len();
            let candidate = node_ids[idx];
            if !picked.contains(&candidate) {
                picked.push(candidate);
            }
            replica += 1;
        }
        // Fill any remainder deterministically by walking the sorted id
        // list, so `candidates` always returns exactly `min(size, nodes)`.
        for &id in &node_ids {
            if picked.len() >= pgid.size as usize {
                break;
            }
            if !picked.contains(&id) {
                picked.push(id);
            }
        }

        Ok(picked)
    }
}

/// A map-update message as received from the monitor: a filesystem
/// identifier, a list of incremental deltas, and a list of full map
/// replacements.
pub struct MapUpdate {
    pub fsid: u64,
    pub incrementals: Vec<ClusterMapInner>,
    pub fulls: Vec<ClusterMapInner>,
}

/// Readers-writer guarded, versioned cluster map.
///
/// Advancing the map is always an atomic pointer swap: a writer builds the
/// new snapshot off to the side and then replaces the published `Arc` under
/// a short exclusive hold. Readers (placement, dispatch, the timer) only
/// ever need a shared hold long enough to clone the `Arc`, so a writer never
/// blocks a reader behind the ingestion of a new map and vice versa. This
/// realizes a "publish new map, then let resubmit read-share it" protocol
/// without ever needing a true writer-to-reader lock downgrade.
pub struct ClusterMap {
    current: RwLock<Arc<ClusterMapInner>>,
}

impl ClusterMap {
    pub fn new(initial: ClusterMapInner) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// Shared snapshot of the currently published map.
    pub fn snapshot(&self) -> Arc<ClusterMapInner> {
        self.current.read().unwrap().clone()
    }

    pub fn epoch(&self) -> u64 {
        self.snapshot().epoch
    }

    /// Ingest a map-update message. Returns `Ok(true)` if the published map
    /// advanced, `Ok(false)` if the message was accepted but changed
    /// nothing (stale incrementals/fulls), and `Err` if the message was
    /// rejected outright (fsid mismatch or corruption). A rejected message
    /// never publishes a partial map.
    pub fn ingest(&self, mount_fsid: u64, update: MapUpdate) -> Result<bool> {
        if update.fsid != mount_fsid {
            return Err(Error::FsidMismatch {
                expected: mount_fsid,
                got: update.fsid,
            });
        }

        let mut guard = self.current.write().unwrap();

        // Apply every contiguous successor in turn: once e+1 lands, e+2 may
        // now also be a contiguous successor, so keep scanning the batch
        // until nothing matches `current.epoch + 1` any more. A monitor
        // that batches several incrementals after the client falls behind
        // relies on this to land on its newest epoch in one ingest call,
        // not stop one step short.
        let mut incrementals = update.incrementals;
        let mut advanced = false;
        loop {
            let next_epoch = guard.epoch + 1;
            let Some(pos) = incrementals.iter().position(|inc| inc.epoch == next_epoch) else {
                break;
            };
            *guard = Arc::new(incrementals.remove(pos));
            advanced = true;
        }
        if advanced {
            return Ok(true);
        }

        // No incremental advanced the map: consider fulls, skipping all
        // but the last.
        if let Some(last_full) = update.fulls.into_iter().last() {
            if last_full.epoch > guard.epoch {
                *guard = Arc::new(last_full);
                return Ok(true);
            }
        }

        Ok(false)
    }
}
