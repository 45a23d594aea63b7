//! Purge intents and their journal encoding
//!
//! Each record is framed by a version pair and a payload length so old
//! readers can skip fields appended by newer writers, and readers reject
//! records that require a newer decoder than they are.
//!
//! Record format:
//! ```text
//! +----------+----------+--------+---------------------------------+
//! | struct_v | compat_v | Length | Payload                         |
//! | 1B       | 1B       | 4B LE  | action, ino, size, layout, ...  |
//! +----------+----------+--------+---------------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use stripefs_common::{
    Error, FileLayout, Frag, FragTree, InodeId, PoolId, Result, SnapContext,
};

/// Current intent encoding version
const ITEM_VERSION: u8 = 1;
/// Oldest decoder that can still read our records
const ITEM_COMPAT: u8 = 1;

/// Layout sub-encoding version; v2 added the pool namespace
const LAYOUT_VERSION: u8 = 2;
const LAYOUT_COMPAT: u8 = 1;

/// What to do with an inode's objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeAction {
    /// Delete a file's stripe objects and its backtrace object
    File,
    /// Delete a directory's fragment objects
    Directory,
    /// Delete a file's tail objects and zero the first one
    TruncateFile,
    /// Action byte written by a newer version; preserved so the queue can
    /// apply its drop policy instead of failing the record
    Unknown(u8),
}

impl PurgeAction {
    #[must_use]
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::File,
            2 => Self::Directory,
            3 => Self::TruncateFile,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::File => 1,
            Self::Directory => 2,
            Self::TruncateFile => 3,
            Self::Unknown(v) => v,
        }
    }
}

/// A single unit of deferred deletion
///
/// Immutable once appended to the journal; destroyed when all of its object
/// store operations have completed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurgeItem {
    pub action: PurgeAction,
    pub ino: InodeId,
    /// Logical file size in bytes; drives the stripe object count
    pub size: u64,
    pub layout: FileLayout,
    /// Prior pools that may still hold a backtrace object for this inode
    pub old_pools: Vec<PoolId>,
    /// Attached to every data object operation for snapshot bookkeeping
    pub snapc: SnapContext,
    /// Fragment tree of a directory inode; leaves name the dirfrag objects
    pub fragtree: FragTree,
}

impl PurgeItem {
    /// Intent to delete a whole file.
    #[must_use]
    pub fn purge_file(
        ino: InodeId,
        size: u64,
        layout: FileLayout,
        old_pools: Vec<PoolId>,
        snapc: SnapContext,
    ) -> Self {
        Self {
            action: PurgeAction::File,
            ino,
            size,
            layout,
            old_pools,
            snapc,
            fragtree: FragTree::new(),
        }
    }

    /// Intent to delete a directory's fragment objects.
    #[must_use]
    pub fn purge_dir(ino: InodeId, fragtree: FragTree) -> Self {
        Self {
            action: PurgeAction::Directory,
            ino,
            size: 0,
            layout: FileLayout::default_for_pool(PoolId::new(-1)),
            old_pools: Vec::new(),
            snapc: SnapContext::NULL,
            fragtree,
        }
    }

    /// Intent to drop a file's objects beyond the first and zero the first.
    #[must_use]
    pub fn truncate(ino: InodeId, size: u64, layout: FileLayout, snapc: SnapContext) -> Self {
        Self {
            action: PurgeAction::TruncateFile,
            ino,
            size,
            layout,
            old_pools: Vec::new(),
            snapc,
            fragtree: FragTree::new(),
        }
    }

    /// Serialize for the journal.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(96);
        payload.put_u8(self.action.as_u8());
        payload.put_u64_le(self.ino.as_u64());
        payload.put_u64_le(self.size);
        encode_layout(&mut payload, &self.layout);

        payload.put_u32_le(self.old_pools.len() as u32);
        for pool in &self.old_pools {
            payload.put_i64_le(pool.as_i64());
        }

        payload.put_u64_le(self.snapc.seq);
        payload.put_u32_le(self.snapc.snaps.len() as u32);
        for snap in &self.snapc.snaps {
            payload.put_u64_le(*snap);
        }

        payload.put_u32_le(self.fragtree.split_count() as u32);
        for (frag, by) in self.fragtree.splits() {
            payload.put_u32_le(frag.encoded());
            payload.put_i32_le(i32::from(by));
        }

        let mut buf = BytesMut::with_capacity(payload.len() + 6);
        buf.put_u8(ITEM_VERSION);
        buf.put_u8(ITEM_COMPAT);
        buf.put_u32_le(payload.len() as u32);
        buf.extend_from_slice(&payload);
        buf.freeze()
    }

    /// Deserialize a journal record.
    ///
    /// Records from a newer writer decode as long as their compat version is
    /// within ours; fields past what we understand are skipped via the
    /// length prefix. A compat version beyond ours is a hard error.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cur = buf;
        let (_struct_v, mut payload) = decode_envelope(&mut cur, ITEM_VERSION)?;

        let action = PurgeAction::from_u8(get_u8(&mut payload)?);
        let ino = InodeId::new(get_u64_le(&mut payload)?);
        let size = get_u64_le(&mut payload)?;
        let layout = decode_layout(&mut payload)?;

        let pool_count = get_u32_le(&mut payload)? as usize;
        check_count(pool_count, payload.len(), 8)?;
        let mut old_pools = Vec::with_capacity(pool_count);
        for _ in 0..pool_count {
            old_pools.push(PoolId::new(get_i64_le(&mut payload)?));
        }

        let seq = get_u64_le(&mut payload)?;
        let snap_count = get_u32_le(&mut payload)? as usize;
        check_count(snap_count, payload.len(), 8)?;
        let mut snaps = Vec::with_capacity(snap_count);
        for _ in 0..snap_count {
            snaps.push(get_u64_le(&mut payload)?);
        }

        let split_count = get_u32_le(&mut payload)? as usize;
        check_count(split_count, payload.len(), 8)?;
        let mut fragtree = FragTree::new();
        for _ in 0..split_count {
            let frag = Frag::from_encoded(get_u32_le(&mut payload)?);
            let by = get_i32_le(&mut payload)?;
            if !(1..=24).contains(&by) || u32::from(frag.bits()) + by as u32 > 24 {
                return Err(Error::InvalidEncoding(format!(
                    "fragment {frag} split by {by} bits"
                )));
            }
            fragtree.split(frag, by as u8);
        }

        Ok(Self {
            action,
            ino,
            size,
            layout,
            old_pools,
            snapc: SnapContext::new(seq, snaps),
            fragtree,
        })
    }
}

fn encode_layout(buf: &mut BytesMut, layout: &FileLayout) {
    let mut payload = BytesMut::with_capacity(24 + layout.pool_namespace.len());
    payload.put_u32_le(layout.stripe_unit);
    payload.put_u32_le(layout.stripe_count);
    payload.put_u32_le(layout.object_size);
    payload.put_i64_le(layout.pool.as_i64());
    // v2 field
    payload.put_u32_le(layout.pool_namespace.len() as u32);
    payload.put_slice(layout.pool_namespace.as_bytes());

    buf.put_u8(LAYOUT_VERSION);
    buf.put_u8(LAYOUT_COMPAT);
    buf.put_u32_le(payload.len() as u32);
    buf.extend_from_slice(&payload);
}

fn decode_layout(cur: &mut &[u8]) -> Result<FileLayout> {
    let (struct_v, mut payload) = decode_envelope(cur, LAYOUT_VERSION)?;

    let stripe_unit = get_u32_le(&mut payload)?;
    let stripe_count = get_u32_le(&mut payload)?;
    let object_size = get_u32_le(&mut payload)?;
    let pool = PoolId::new(get_i64_le(&mut payload)?);
    let pool_namespace = if struct_v >= 2 {
        let len = get_u32_le(&mut payload)? as usize;
        need(payload, len)?;
        String::from_utf8(payload[..len].to_vec())
            .map_err(|_| Error::InvalidEncoding("pool namespace is not utf-8".into()))?
    } else {
        // v1 writers predate pool namespaces
        String::new()
    };

    Ok(FileLayout {
        stripe_unit,
        stripe_count,
        object_size,
        pool,
        pool_namespace,
    })
}

/// Read a (struct_v, compat_v, length) prologue and split off the payload,
/// advancing `cur` past it. Trailing payload bytes beyond what the caller
/// consumes are skipped by construction.
fn decode_envelope<'a>(cur: &mut &'a [u8], supported: u8) -> Result<(u8, &'a [u8])> {
    need(cur, 6)?;
    let struct_v = cur.get_u8();
    let compat_v = cur.get_u8();
    if compat_v > supported {
        return Err(Error::IncompatibleVersion {
            version: compat_v,
            supported,
        });
    }
    let len = cur.get_u32_le() as usize;
    need(cur, len)?;
    let (payload, rest) = cur.split_at(len);
    *cur = rest;
    Ok((struct_v, payload))
}

fn need(buf: &[u8], n: usize) -> Result<()> {
    if buf.len() < n {
        return Err(Error::TruncatedRecord {
            need: n,
            have: buf.len(),
        });
    }
    Ok(())
}

/// Reject length prefixes that could not possibly fit the remaining bytes.
fn check_count(count: usize, remaining: usize, min_elem: usize) -> Result<()> {
    if count.saturating_mul(min_elem) > remaining {
        return Err(Error::TruncatedRecord {
            need: count.saturating_mul(min_elem),
            have: remaining,
        });
    }
    Ok(())
}

fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u32_le(buf: &mut &[u8]) -> Result<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn get_i32_le(buf: &mut &[u8]) -> Result<i32> {
    need(buf, 4)?;
    Ok(buf.get_i32_le())
}

fn get_u64_le(buf: &mut &[u8]) -> Result<u64> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

fn get_i64_le(buf: &mut &[u8]) -> Result<i64> {
    need(buf, 8)?;
    Ok(buf.get_i64_le())
}
