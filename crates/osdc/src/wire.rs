//! Little-endian wire codec for the messages this client produces and
//! consumes. Kept separate from the in-memory `Request`/`ClusterMapInner`
//! types so that the codec can be unit-tested for byte-exact round trips
//! independent of the concurrency machinery around it.

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::cluster_map::{ClusterMapInner, NodeInfo};
use crate::error::{Error, Result};
use crate::request::{Op, OpKind};

fn opcode_of(kind: OpKind) -> u16 {
    match kind {
        OpKind::Read => 1,
        OpKind::Write => 2,
    }
}

fn opkind_of(code: u16) -> Result<OpKind> {
    match code {
        1 => Ok(OpKind::Read),
        2 => Ok(OpKind::Write),
        _ => Err(Error::CorruptMap("unknown opcode")),
    }
}

/// Header fields of an outgoing `OP` message, plus its one embedded op and
/// trailing snapshot-id vector. The page payload (for writes) travels
/// alongside this, not inside it; see `Request::pages`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpHeader {
    pub client_inc: u64,
    pub flags: u32,
    pub osdmap_epoch: u64,
    pub tid: u64,
    pub ino: u64,
    pub bno: u64,
    pub snap: u64,
    pub object_size: u64,
    pub stripe_unit: u64,
    pub stripe_count: u32,
    pub snap_seq: u64,
    pub op: Op,
    pub snaps: Vec<u64>,
}

impl OpHeader {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u64_le(self.client_inc);
        buf.put_u32_le(self.flags);
        buf.put_u64_le(self.osdmap_epoch);
        buf.put_u64_le(self.tid);
        buf.put_u64_le(self.ino);
        buf.put_u64_le(self.bno);
        buf.put_u64_le(self.snap);
        buf.put_u64_le(self.object_size);
        buf.put_u64_le(self.stripe_unit);
        buf.put_u32_le(self.stripe_count);
        buf.put_u32_le(self.snaps.len() as u32);
        buf.put_u64_le(self.snap_seq);
        buf.put_u32_le(1); // num_ops: always one embedded op in this client.
        buf.put_u16_le(opcode_of(self.op.kind));
        buf.put_u64_le(self.op.offset);
        buf.put_u64_le(self.op.length);
        for s in &self.snaps {
            buf.put_u64_le(*s);
        }
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        let need = |n: usize, have: usize| -> Result<()> {
            if have < n {
                Err(Error::CorruptMap("truncated op header"))
            } else {
                Ok(())
            }
        };
        need(8 * 9 + 4 * 3 + 2, bytes.len())?;
        let client_inc = bytes.get_u64_le();
        let flags = bytes.get_u32_le();
        let osdmap_epoch = bytes.get_u64_le();
        let tid = bytes.get_u64_le();
        let ino = bytes.get_u64_le();
        let bno = bytes.get_u64_le();
        let snap = bytes.get_u64_le();
        let object_size = bytes.get_u64_le();
        let stripe_unit = bytes.get_u64_le();
        let stripe_count = bytes.get_u32_le();
        let num_snaps = bytes.get_u32_le();
        let snap_seq = bytes.get_u64_le();
        let num_ops = bytes.get_u32_le();
        if num_ops != 1 {
            return Err(Error::CorruptMap("expected exactly one embedded op"));
        }
        let opcode = bytes.get_u16_le();
        let offset = bytes.get_u64_le();
        let length = bytes.get_u64_le();
        let op = Op {
            kind: opkind_of(opcode)?,
            offset,
            length,
        };
        need(num_snaps as usize * 8, bytes.len())?;
        let mut snaps = Vec::with_capacity(num_snaps as usize);
        for _ in 0..num_snaps {
            snaps.push(bytes.get_u64_le());
        }
        Ok(Self {
            client_inc,
            flags,
            osdmap_epoch,
            tid,
            ino,
            bno,
            snap,
            object_size,
            stripe_unit,
            stripe_count,
            snap_seq,
            op,
            snaps,
        })
    }
}

/// Header of an `OP_REPLY` message, plus its one per-op result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyHeader {
    pub tid: u64,
    pub flags: u32,
    pub result: i32,
    pub op_result: i32,
    pub op_len: u64,
}

impl ReplyHeader {
    pub const WIRE_LEN: usize = 8 + 4 + 4 + 4 + 8;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::WIRE_LEN);
        buf.put_u64_le(self.tid);
        buf.put_u32_le(self.flags);
        buf.put_i32_le(self.result);
        buf.put_u32_le(1); // num_ops
        buf.put_i32_le(self.op_result);
        buf.put_u64_le(self.op_len);
        buf.freeze()
    }

    /// Validate the front length against the expected
    /// `sizeof(reply_head) + num_ops * sizeof(op)` shape before decoding.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::WIRE_LEN {
            return Err(Error::CorruptReply {
                expected: Self::WIRE_LEN,
                got: bytes.len(),
            });
        }
        let mut cur = std::io::Cursor::new(bytes);
        let tid = cur.read_u64::<LE>().unwrap();
        let flags = cur.read_u32::<LE>().unwrap();
        let result = cur.read_i32::<LE>().unwrap();
        let num_ops = cur.read_u32::<LE>().unwrap();
        if num_ops != 1 {
            return Err(Error::CorruptReply {
                expected: Self::WIRE_LEN,
                got: bytes.len(),
            });
        }
        let op_result = cur.read_i32::<LE>().unwrap();
        let op_len = cur.read_u64::<LE>().unwrap();
        Ok(Self {
            tid,
            flags,
            result,
            op_result,
            op_len,
        })
    }
}

/// Opaque (epoch, bytes) pair as carried inside an `OSD_MAP` message, before
/// the bytes are decoded into a `ClusterMapInner`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapBlob {
    pub epoch: u64,
    pub bytes: Bytes,
}

/// Wire form of an `OSD_MAP` message: fsid, then count-prefixed
/// incrementals, then count-prefixed fulls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsdMapWire {
    pub fsid: u64,
    pub incrementals: Vec<MapBlob>,
    pub fulls: Vec<MapBlob>,
}

fn encode_blob_list(buf: &mut BytesMut, blobs: &[MapBlob]) {
    buf.put_u32_le(blobs.len() as u32);
    for b in blobs {
        buf.put_u64_le(b.epoch);
        buf.put_u32_le(b.bytes.len() as u32);
        buf.put_slice(&b.bytes);
    }
}

fn decode_blob_list(bytes: &mut Bytes) -> Result<Vec<MapBlob>> {
    if bytes.remaining() < 4 {
        return Err(Error::CorruptMap("truncated blob count"));
    }
    let count = bytes.get_u32_le();
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if bytes.remaining() < 12 {
            return Err(Error::CorruptMap("truncated blob header"));
        }
        let epoch = bytes.get_u64_le();
        let len = bytes.get_u32_le() as usize;
        if bytes.remaining() < len {
            return Err(Error::CorruptMap("truncated blob body"));
        }
        let body = bytes.copy_to_bytes(len);
        out.push(MapBlob { epoch, bytes: body });
    }
    Ok(out)
}

impl OsdMapWire {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u64_le(self.fsid);
        encode_blob_list(&mut buf, &self.incrementals);
        encode_blob_list(&mut buf, &self.fulls);
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        if bytes.remaining() < 8 {
            return Err(Error::CorruptMap("truncated osdmap fsid"));
        }
        let fsid = bytes.get_u64_le();
        let incrementals = decode_blob_list(&mut bytes)?;
        let fulls = decode_blob_list(&mut bytes)?;
        Ok(Self {
            fsid,
            incrementals,
            fulls,
        })
    }
}

/// Encode a full `ClusterMapInner` into the blob format carried inside
/// `OsdMapWire` entries. Not part of the public OSD wire protocol proper
/// (the real server-side format is opaque to this client); this is this
/// crate's own blob layout for the fsid/epoch/nodes/rules it actually needs.
pub fn encode_cluster_map(map: &ClusterMapInner) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u64_le(map.epoch);
    buf.put_u64_le(map.fsid);
    buf.put_u32_le(map.pg_num);
    buf.put_u32_le(map.pg_num_local);

    let mut nodes: Vec<&NodeInfo> = map.nodes.values().collect();
    nodes.sort_by_key(|n| n.id);
    buf.put_u32_le(nodes.len() as u32);
    for n in nodes {
        buf.put_u32_le(n.id);
        buf.put_u32_le(n.addr.len() as u32);
        buf.put_slice(n.addr.as_bytes());
        buf.put_u8(n.up as u8);
        buf.put_u32_le(n.weight);
    }

    let rules = map.rule_entries();
    buf.put_u32_le(rules.len() as u32);
    for (pool, rule_type, size) in rules {
        buf.put_u64_le(pool);
        buf.put_u32_le(rule_type);
        buf.put_u32_le(size);
    }
    buf.freeze()
}

pub fn decode_cluster_map(mut bytes: Bytes) -> Result<ClusterMapInner> {
    if bytes.remaining() < 8 + 8 + 4 + 4 + 4 {
        return Err(Error::CorruptMap("truncated cluster map blob"));
    }
    let epoch = bytes.get_u64_le();
    let fsid = bytes.get_u64_le();
    let pg_num = bytes.get_u32_le();
    let pg_num_local = bytes.get_u32_le();

    let mut map = ClusterMapInner::new(epoch, fsid, pg_num, pg_num_local);

    let node_count = bytes.get_u32_le();
    for _ in 0..node_count {
        if bytes.remaining() < 8 {
            return Err(Error::CorruptMap("truncated node header"));
        }
        let id = bytes.get_u32_le();
        let addr_len = bytes.get_u32_le() as usize;
        if bytes.remaining() < addr_len + 1 + 4 {
            return Err(Error::CorruptMap("truncated node body"));
        }
        let addr_bytes = bytes.copy_to_bytes(addr_len);
        let addr = String::from_utf8(addr_bytes.to_vec())
            .map_err(|_| Error::CorruptMap("node address is not utf-8"))?;
        let up = bytes.get_u8() != 0;
        let weight = bytes.get_u32_le();
        map = map.with_node(NodeInfo {
            id,
            addr,
            up,
            weight,
        });
    }

    if bytes.remaining() < 4 {
        return Err(Error::CorruptMap("truncated rule count"));
    }
    let rule_count = bytes.get_u32_le();
    for _ in 0..rule_count {
        if bytes.remaining() < 16 {
            return Err(Error::CorruptMap("truncated rule entry"));
        }
        let pool = bytes.get_u64_le();
        let rule_type = bytes.get_u32_le();
        let size = bytes.get_u32_le();
        map = map.with_rule(pool, rule_type, size);
    }

    Ok(map)
}
