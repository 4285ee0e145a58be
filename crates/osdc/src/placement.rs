use crate::cluster_map::ClusterMapInner;
use crate::pg::PgId;

/// Pick the first live node in the ordered candidate list the placement
/// rule produces for `pgid`.
///
/// Pure and side-effect free: callable with nothing more than a shared
/// reference to a map snapshot, and deterministic given `(map, pgid)`.
/// Returns `None` (not an error) if the rule has no candidates up, since
/// "no target yet" is an expected, transient condition the dispatcher
/// handles by waiting for a newer map.
pub fn pick_target(map: &ClusterMapInner, pgid: &PgId) -> Option<u32> {
    let candidates = match map.candidates(pgid) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(?e, ?pgid, "no placement rule for pgid");
            return None;
        }
    };

    candidates
        .into_iter()
        .find(|id| map.nodes.get(id).is_some_and(|n| n.up))
}
