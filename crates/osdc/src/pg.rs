/// Placement group id: the argument to the placement engine.
///
/// Produced deterministically from an object name, a file layout, and the
/// cluster map that's in effect when the request is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PgId {
    pub pool: u64,
    pub rule_type: u32,
    /// Preferred node hint, or `-1` for "no preference".
    pub preferred: i64,
    /// Placement hash: derived from the object name.
    pub ps: u32,
    /// Number of nodes the rule should select.
    pub size: u32,
}

/// Jenkins one-at-a-time hash: simple, fast, well-distributed. Used to
/// derive the placement-hash seed from an object name; not cryptographic,
/// and not a reimplementation of any server-side hash -- just a stable,
/// deterministic seed this client alone needs to agree with itself on.
pub fn jenkins_oaat_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &b in bytes {
        hash = hash.wrapping_add(b as u32);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash = hash.wrapping_add(hash << 15);
    hash
}

/// Stable-mod: `x mod m`, tuned so that the result changes as little as
/// possible when `m` grows. A plain `x % m` reshuffles almost everything
/// whenever `m` changes; the bit-halving scheme below only reassigns the pgs
/// that must move, the same property the server-side function relies on.
///
/// `m` must be non-zero; a zero placement-group count is a configuration
/// error the cluster map layer rejects before placement is ever consulted.
pub fn stable_mod(x: u32, m: u32) -> u32 {
    debug_assert!(m > 0);
    if m == 0 {
        return 0;
    }
    // Smallest power of two >= m.
    let mut bits = 32 - (m - 1).leading_zeros();
    if bits == 0 {
        bits = 1;
    }
    let mask = (1u64 << bits) - 1;
    let mut v = (x as u64) & mask;
    if v >= m as u64 {
        bits -= 1;
        let mask = (1u64 << bits) - 1;
        v = (x as u64) & mask;
    }
    v as u32
}

/// Compute the pg id for an object, given its name, the file layout's pool
/// and placement preference, and the rule type and replica count the
/// cluster map's placement rule for this pool specifies.
pub fn pgid_for_object(
    object_name: &str,
    pool: u64,
    preferred: i64,
    rule_type: u32,
    size: u32,
) -> PgId {
    PgId {
        pool,
        rule_type,
        preferred,
        ps: jenkins_oaat_hash(object_name.as_bytes()),
        size,
    }
}
