/*
 * This file is part of KAFS.
 *
 * KAFS is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * KAFS is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * KAFS. If not, see <https://www.gnu.org/licenses/>.
 */

//! The packed inode record and the inode-table allocator.
//!
//! Like the superblock, an inode is never cast to a `#[repr(C)]` struct:
//! [`InodeView`] is a typed accessor over a raw byte slice borrowed from the
//! mount context's mapping.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::layout::{INODE_NONE, INODE_ROOT, REF_SLOTS};

const OFF_MODE: usize = 0;
const OFF_UID: usize = 2;
const OFF_GID: usize = 4;
const OFF_LINKCNT: usize = 6;
const OFF_RDEV: usize = 8;
const OFF_BLOCKS: usize = 12;
const OFF_SIZE: usize = 16;
const OFF_ATIME: usize = 24;
const OFF_CTIME: usize = 32;
const OFF_MTIME: usize = 40;
const OFF_DTIME: usize = 48;
/// Start of the 15-slot, 4-byte reference table; also the inline data area.
pub const REFS_OFFSET: usize = 56;

macro_rules! field_u16 {
    ($get:ident, $set:ident, $off:expr) => {
        pub fn $get(&self) -> u16 {
            u16::from_le_bytes(self.0[$off..$off + 2].try_into().unwrap())
        }

        pub fn $set(&mut self, v: u16) {
            self.0[$off..$off + 2].copy_from_slice(&v.to_le_bytes());
        }
    };
}

macro_rules! field_u32 {
    ($get:ident, $set:ident, $off:expr) => {
        pub fn $get(&self) -> u32 {
            u32::from_le_bytes(self.0[$off..$off + 4].try_into().unwrap())
        }

        pub fn $set(&mut self, v: u32) {
            self.0[$off..$off + 4].copy_from_slice(&v.to_le_bytes());
        }
    };
}

macro_rules! field_u64 {
    ($get:ident, $set:ident, $off:expr) => {
        pub fn $get(&self) -> u64 {
            u64::from_le_bytes(self.0[$off..$off + 8].try_into().unwrap())
        }

        pub fn $set(&mut self, v: u64) {
            self.0[$off..$off + 8].copy_from_slice(&v.to_le_bytes());
        }
    };
}

/// A typed view over one inode record's bytes.
pub struct InodeView<'a>(pub &'a mut [u8]);

impl<'a> InodeView<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self(bytes)
    }

    field_u16!(mode, set_mode, OFF_MODE);
    field_u16!(uid, set_uid, OFF_UID);
    field_u16!(gid, set_gid, OFF_GID);
    field_u16!(linkcnt, set_linkcnt, OFF_LINKCNT);
    field_u16!(rdev, set_rdev, OFF_RDEV);
    field_u32!(blocks, set_blocks, OFF_BLOCKS);
    field_u64!(size, set_size, OFF_SIZE);
    field_u64!(atime, set_atime, OFF_ATIME);
    field_u64!(ctime, set_ctime, OFF_CTIME);
    field_u64!(mtime, set_mtime, OFF_MTIME);
    field_u64!(dtime, set_dtime, OFF_DTIME);

    /// Occupancy bit: an inode is in use iff its mode is nonzero.
    pub fn is_used(&self) -> bool {
        self.mode() != 0
    }

    /// Clears every field, leaving `mode == 0` (unoccupied).
    pub fn clear(&mut self) {
        self.0.fill(0);
    }

    /// Reads reference slot `i` (`0..REF_SLOTS`).
    pub fn ref_get(&self, i: usize) -> u32 {
        debug_assert!(i < REF_SLOTS);
        let off = REFS_OFFSET + i * 4;
        u32::from_le_bytes(self.0[off..off + 4].try_into().unwrap())
    }

    /// Writes reference slot `i`.
    pub fn ref_set(&mut self, i: usize, v: u32) {
        debug_assert!(i < REF_SLOTS);
        let off = REFS_OFFSET + i * 4;
        self.0[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// The raw inline-data/reference-table bytes, `REF_SLOTS * 4` long.
    pub fn inline_bytes(&self) -> &[u8] {
        &self.0[REFS_OFFSET..]
    }

    pub fn inline_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0[REFS_OFFSET..]
    }

    pub fn linkcnt_incr(&mut self) -> u16 {
        let l = self.linkcnt();
        if l == u16::MAX {
            return l;
        }
        self.set_linkcnt(l + 1);
        l + 1
    }

    pub fn linkcnt_decr(&mut self) -> u16 {
        let l = self.linkcnt();
        debug_assert!(l > 0, "linkcnt underflow");
        let l = l.saturating_sub(1);
        self.set_linkcnt(l);
        l
    }
}

/// Finds and publishes (by setting `mode`) the next free inode at or after
/// the saved search hint, wrapping once past the reserved inode 0.
///
/// Caller is expected to hold the allocator lock.
pub fn find_free(ctx: &Context, mode: u16) -> Result<u32> {
    let inode_count = ctx.inode_count();
    if inode_count == 0 {
        return Err(Error::NoSpace);
    }
    let mut hints = ctx.alloc_hints.lock().unwrap();
    let mut candidate = hints.last_inode;
    for _ in 0..inode_count {
        candidate = if candidate >= inode_count {
            INODE_ROOT
        } else {
            candidate + 1
        };
        if candidate == INODE_NONE {
            continue;
        }
        let mut view = InodeView::new(ctx.inode_bytes(candidate));
        if !view.is_used() {
            view.set_mode(mode);
            hints.last_inode = candidate;
            return Ok(candidate);
        }
    }
    Err(Error::NoSpace)
}

/// Transient single-field accessors, each opening and immediately dropping
/// its own [`InodeView`]. Preferred over holding a view across other
/// `Context` calls, since the mapping's aliasing discipline is enforced by
/// convention, not the borrow checker.
pub fn mode(ctx: &Context, ino: u32) -> u16 {
    InodeView::new(ctx.inode_bytes(ino)).mode()
}
pub fn set_mode(ctx: &Context, ino: u32, v: u16) {
    InodeView::new(ctx.inode_bytes(ino)).set_mode(v);
}
pub fn uid(ctx: &Context, ino: u32) -> u16 {
    InodeView::new(ctx.inode_bytes(ino)).uid()
}
pub fn set_uid(ctx: &Context, ino: u32, v: u16) {
    InodeView::new(ctx.inode_bytes(ino)).set_uid(v);
}
pub fn gid(ctx: &Context, ino: u32) -> u16 {
    InodeView::new(ctx.inode_bytes(ino)).gid()
}
pub fn set_gid(ctx: &Context, ino: u32, v: u16) {
    InodeView::new(ctx.inode_bytes(ino)).set_gid(v);
}
pub fn rdev(ctx: &Context, ino: u32) -> u16 {
    InodeView::new(ctx.inode_bytes(ino)).rdev()
}
pub fn set_rdev(ctx: &Context, ino: u32, v: u16) {
    InodeView::new(ctx.inode_bytes(ino)).set_rdev(v);
}
pub fn size(ctx: &Context, ino: u32) -> u64 {
    InodeView::new(ctx.inode_bytes(ino)).size()
}
pub fn set_size(ctx: &Context, ino: u32, v: u64) {
    InodeView::new(ctx.inode_bytes(ino)).set_size(v);
}
pub fn blocks(ctx: &Context, ino: u32) -> u32 {
    InodeView::new(ctx.inode_bytes(ino)).blocks()
}
pub fn set_blocks(ctx: &Context, ino: u32, v: u32) {
    InodeView::new(ctx.inode_bytes(ino)).set_blocks(v);
}
pub fn linkcnt(ctx: &Context, ino: u32) -> u16 {
    InodeView::new(ctx.inode_bytes(ino)).linkcnt()
}
pub fn set_linkcnt(ctx: &Context, ino: u32, v: u16) {
    InodeView::new(ctx.inode_bytes(ino)).set_linkcnt(v);
}
pub fn linkcnt_incr(ctx: &Context, ino: u32) -> u16 {
    InodeView::new(ctx.inode_bytes(ino)).linkcnt_incr()
}
pub fn linkcnt_decr(ctx: &Context, ino: u32) -> u16 {
    InodeView::new(ctx.inode_bytes(ino)).linkcnt_decr()
}
pub fn atime(ctx: &Context, ino: u32) -> u64 {
    InodeView::new(ctx.inode_bytes(ino)).atime()
}
pub fn set_atime(ctx: &Context, ino: u32, v: u64) {
    InodeView::new(ctx.inode_bytes(ino)).set_atime(v);
}
pub fn ctime(ctx: &Context, ino: u32) -> u64 {
    InodeView::new(ctx.inode_bytes(ino)).ctime()
}
pub fn set_ctime(ctx: &Context, ino: u32, v: u64) {
    InodeView::new(ctx.inode_bytes(ino)).set_ctime(v);
}
pub fn mtime(ctx: &Context, ino: u32) -> u64 {
    InodeView::new(ctx.inode_bytes(ino)).mtime()
}
pub fn set_mtime(ctx: &Context, ino: u32, v: u64) {
    InodeView::new(ctx.inode_bytes(ino)).set_mtime(v);
}
pub fn dtime(ctx: &Context, ino: u32) -> u64 {
    InodeView::new(ctx.inode_bytes(ino)).dtime()
}
pub fn set_dtime(ctx: &Context, ino: u32, v: u64) {
    InodeView::new(ctx.inode_bytes(ino)).set_dtime(v);
}

/// Stamps `ctime` and `mtime` with `now` (seconds since the epoch).
pub fn touch_data(ctx: &Context, ino: u32, now: u64) {
    let mut v = InodeView::new(ctx.inode_bytes(ino));
    v.set_ctime(now);
    v.set_mtime(now);
}

/// Stamps `ctime` only, for metadata-only changes (chmod/chown/link).
pub fn touch_meta(ctx: &Context, ino: u32, now: u64) {
    InodeView::new(ctx.inode_bytes(ino)).set_ctime(now);
}

/// Returns a copy of the inline-data area (valid when `size <= INLINE_CAPACITY`).
pub fn inline_read(ctx: &Context, ino: u32) -> Vec<u8> {
    InodeView::new(ctx.inode_bytes(ino)).inline_bytes().to_vec()
}

/// Writes `data` (must fit within `INLINE_CAPACITY`) into the inline area,
/// zero-padding the remainder.
pub fn inline_write(ctx: &Context, ino: u32, data: &[u8]) {
    debug_assert!(data.len() <= crate::layout::INLINE_CAPACITY);
    let mut view = InodeView::new(ctx.inode_bytes(ino));
    let dst = view.inline_bytes_mut();
    dst.fill(0);
    dst[..data.len()].copy_from_slice(data);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::temp_image;

    #[test]
    fn fresh_inode_table_is_unused() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let view = InodeView::new(ctx.inode_bytes(2));
        assert!(!view.is_used());
    }

    #[test]
    fn find_free_publishes_mode_and_skips_reserved_zero() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let ino = find_free(&ctx, 0o100644).unwrap();
        assert_ne!(ino, INODE_NONE);
        assert!(InodeView::new(ctx.inode_bytes(ino)).is_used());
    }

    #[test]
    fn refs_roundtrip() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let mut view = InodeView::new(ctx.inode_bytes(3));
        view.ref_set(0, 42);
        view.ref_set(14, 7);
        assert_eq!(view.ref_get(0), 42);
        assert_eq!(view.ref_get(14), 7);
    }
}
