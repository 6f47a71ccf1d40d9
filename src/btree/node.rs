//! B-tree node fundamentals shared by both layouts.
//!
//! Every node page carries a [`NodeHeader`] at the start of its payload:
//! slot count, node flags, and the leftmost child pointer (`ptr_down`,
//! internal nodes only). The slot region that follows is layout-specific;
//! see [`pax`](super::pax) and [`slotted`](super::slotted).
//!
//! This module also owns the two pieces both layouts share: the binary
//! search with a layout-provided linear fallback, and the inline record
//! codec (empty/tiny/small/blob encodings in an 8-byte record slot).

use std::cmp::Ordering;

use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{NODE_HEADER_SIZE, PAGE_HEADER_SIZE};
use crate::error::{Error, Result};

/// Node flag: this node is a leaf.
pub const NODE_LEAF: u32 = 1 << 0;

/// Per-slot key flags (persisted as one byte).
pub const KEY_BLOB_TINY: u8 = 1 << 0;
pub const KEY_BLOB_SMALL: u8 = 1 << 1;
pub const KEY_BLOB_EMPTY: u8 = 1 << 2;
pub const KEY_DUPLICATES: u8 = 1 << 3;
pub const KEY_EXTENDED: u8 = 1 << 4;

/// Header at the start of every node page's payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NodeHeader {
    count: U32,
    flags: U32,
    ptr_down: U64,
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

impl NodeHeader {
    pub fn from_page(data: &[u8]) -> Result<&Self> {
        let start = PAGE_HEADER_SIZE;
        Self::ref_from_bytes(&data[start..start + NODE_HEADER_SIZE])
            .map_err(|e| Error::Corrupt(format!("bad node header: {e:?}")))
    }

    pub fn from_page_mut(data: &mut [u8]) -> Result<&mut Self> {
        let start = PAGE_HEADER_SIZE;
        Self::mut_from_bytes(&mut data[start..start + NODE_HEADER_SIZE])
            .map_err(|e| Error::Corrupt(format!("bad node header: {e:?}")))
    }

    pub fn init(&mut self, leaf: bool) {
        self.count = U32::new(0);
        self.flags = U32::new(if leaf { NODE_LEAF } else { 0 });
        self.ptr_down = U64::new(0);
    }

    pub fn count(&self) -> u32 {
        self.count.get()
    }

    pub fn set_count(&mut self, count: u32) {
        self.count = U32::new(count);
    }

    pub fn is_leaf(&self) -> bool {
        self.flags.get() & NODE_LEAF != 0
    }

    pub fn ptr_down(&self) -> u64 {
        self.ptr_down.get()
    }

    pub fn set_ptr_down(&mut self, page: u64) {
        self.ptr_down = U64::new(page);
    }
}

/// A key as stored in a slot: inline bytes, or the blob id of an extended
/// key that overflowed the inline budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRef<'a> {
    Inline(&'a [u8]),
    Extended(u64),
}

/// Binary search over `count` slots with a linear-scan fallback once the
/// remaining range is at most `threshold` slots (`0` disables the
/// fallback). `cmp_at(i)` is `probe.cmp(key_i)`.
///
/// Returns `(slot, cmp)`: on an exact match `cmp == Equal` and `slot` is
/// the match; otherwise `slot` is the greatest index whose key is less
/// than the probe (`cmp == Greater`), or `-1` with `cmp == Less` when the
/// probe sorts below every key.
pub fn search_slots<E, F>(
    count: usize,
    threshold: usize,
    mut cmp_at: F,
) -> std::result::Result<(i64, Ordering), E>
where
    F: FnMut(usize) -> std::result::Result<Ordering, E>,
{
    if count == 0 {
        return Ok((-1, Ordering::Less));
    }

    let mut l = 0usize;
    let mut r = count;
    let mut last = count + 1;

    while r - l > threshold {
        let i = l + (r - l) / 2;

        // the median equals the last probed greater-side index: found the
        // closest smaller key
        if i == last {
            return Ok((i as i64, Ordering::Greater));
        }

        match cmp_at(i)? {
            Ordering::Equal => return Ok((i as i64, Ordering::Equal)),
            Ordering::Less => {
                if i == 0 {
                    return Ok((-1, Ordering::Less));
                }
                r = i;
            }
            Ordering::Greater => {
                last = i;
                l = i;
            }
        }
    }

    // linear scan over the remaining range
    for i in l..r {
        match cmp_at(i)? {
            Ordering::Equal => return Ok((i as i64, Ordering::Equal)),
            Ordering::Less => {
                return if i == 0 {
                    Ok((-1, Ordering::Less))
                } else {
                    Ok((i as i64 - 1, Ordering::Greater))
                };
            }
            Ordering::Greater => {}
        }
    }
    Ok((r as i64 - 1, Ordering::Greater))
}

// ---------------------------------------------------------------------------
// Inline record codec
// ---------------------------------------------------------------------------

/// Encodes a record into an 8-byte slot if it fits: `Empty` (size 0),
/// `Tiny` (1..=7 bytes, length in the top byte), `Small` (exactly 8
/// bytes). Returns the new key flags, or `None` if the record must go to
/// blob storage.
pub fn encode_inline_record(slot: &mut [u8], flags: u8, record: &[u8]) -> Option<u8> {
    debug_assert_eq!(slot.len(), 8);
    let flags = flags & !(KEY_BLOB_TINY | KEY_BLOB_SMALL | KEY_BLOB_EMPTY);
    match record.len() {
        0 => {
            slot.fill(0);
            Some(flags | KEY_BLOB_EMPTY)
        }
        1..=7 => {
            slot.fill(0);
            slot[..record.len()].copy_from_slice(record);
            // the highest byte of the record slot is the size of the blob
            slot[7] = record.len() as u8;
            Some(flags | KEY_BLOB_TINY)
        }
        8 => {
            slot.copy_from_slice(record);
            Some(flags | KEY_BLOB_SMALL)
        }
        _ => None,
    }
}

/// Marks the slot as holding a blob id.
pub fn encode_blob_record(slot: &mut [u8], flags: u8, blob_id: u64) -> u8 {
    debug_assert_eq!(slot.len(), 8);
    slot.copy_from_slice(&blob_id.to_le_bytes());
    flags & !(KEY_BLOB_TINY | KEY_BLOB_SMALL | KEY_BLOB_EMPTY)
}

/// What an 8-byte record slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineRecord<'a> {
    Empty,
    Inline(&'a [u8]),
    Blob(u64),
}

/// Decodes an 8-byte record slot against its key flags.
pub fn decode_record<'a>(slot: &'a [u8], flags: u8) -> Result<InlineRecord<'a>> {
    debug_assert_eq!(slot.len(), 8);
    if flags & KEY_BLOB_EMPTY != 0 {
        Ok(InlineRecord::Empty)
    } else if flags & KEY_BLOB_TINY != 0 {
        let len = slot[7] as usize;
        if len == 0 || len > 7 {
            return Err(Error::Corrupt(format!("bad tiny record length {len}")));
        }
        Ok(InlineRecord::Inline(&slot[..len]))
    } else if flags & KEY_BLOB_SMALL != 0 {
        Ok(InlineRecord::Inline(slot))
    } else {
        let blob_id = u64::from_le_bytes(slot.try_into().expect("record slot is 8 bytes"));
        Ok(InlineRecord::Blob(blob_id))
    }
}

/// True if the record slot references blob storage.
pub fn record_is_blob(slot: &[u8], flags: u8) -> bool {
    matches!(decode_record(slot, flags), Ok(InlineRecord::Blob(id)) if id != 0)
}
