use crate::error::{Error, Result};

/// Describes how a file is striped across objects. Treated as immutable
/// input by everything downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLayout {
    pub object_size: u64,
    pub stripe_unit: u64,
    pub stripe_count: u32,
    pub pool: u64,
    /// Preferred placement-group hint, or `-1` for "no preference".
    pub preferred: i64,
}

impl FileLayout {
    pub fn simple(object_size: u64, pool: u64) -> Self {
        Self {
            object_size,
            stripe_unit: object_size,
            stripe_count: 1,
            pool,
            preferred: -1,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.object_size == 0 || self.stripe_unit == 0 || self.stripe_count == 0 {
            return Err(Error::InvalidLayout);
        }
        Ok(())
    }
}

/// Result of mapping a (file, offset, length) triple through a `FileLayout`.
///
/// An object extent never crosses an object boundary: `file_to_extents`
/// truncates at the boundary and the caller resumes with the remainder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectExtent {
    pub object_no: u64,
    pub object_off: u64,
    pub object_len: u64,
}

/// Map a single `(off, len)` file extent to the first object extent it
/// touches, truncating at the object boundary. Returns `(extent, consumed)`
/// where `consumed <= len` is the number of file bytes the extent accounts
/// for. The caller loops, advancing `off` by `consumed` and reducing `len`
/// by the same amount, until `len` reaches zero.
///
/// Only single-stripe (`stripe_count == 1`) layouts are supported for now;
/// wide striping is the obvious extension point but isn't exercised by any
/// caller in this crate.
pub fn file_to_extent(layout: &FileLayout, off: u64, len: u64) -> Result<(ObjectExtent, u64)> {
    layout.validate()?;

    if len == 0 {
        return Ok((
            ObjectExtent {
                object_no: off / layout.object_size,
                object_off: off % layout.object_size,
                object_len: 0,
            },
            0,
        ));
    }

    let object_no = off / layout.object_size;
    let object_off = off % layout.object_size;
    let remaining_in_object = layout.object_size - object_off;
    let object_len = remaining_in_object.min(len);

    Ok((
        ObjectExtent {
            object_no,
            object_off,
            object_len,
        },
        object_len,
    ))
}

/// The wire-visible object name for a given vino + object number, in the
/// `<ino>.<object_no padded hex>` convention.
pub fn object_name(ino: u64, object_no: u64) -> String {
    format!("{:016x}.{:08x}", ino, object_no)
}
