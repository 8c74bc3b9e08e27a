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

//! The fixed 128-byte superblock and the region layout derived from it.
//!
//! The superblock is never cast to a `#[repr(C)]` struct over the mapped
//! memory: every field is read and written through explicit little-endian
//! accessors on a raw byte slice, so the on-disk shape stays decoupled from
//! the host's own struct layout and endianness.

use crate::error::{Error, Result};
use support::util::{ceil_division, pow2};

/// On-disk magic number, `"KAFS"`.
pub const MAGIC: [u8; 4] = *b"KAFS";
/// The only format version this implementation understands.
pub const FORMAT_VERSION: u32 = 1;

/// Size in bytes of the on-disk superblock.
pub const SUPERBLOCK_SIZE: usize = 128;
/// Byte offset of the superblock from the start of the image.
pub const SUPERBLOCK_OFFSET: u64 = 0;

/// Size in bytes of a packed inode record.
///
/// Design note: the distilled component table states "64 bytes", but that
/// leaves no room for the listed metadata fields alongside a full 15-slot,
/// 60-byte reference table. Resolved by keeping the full field list and the
/// full reference table (both load-bearing elsewhere in the spec) and
/// rounding the record up to 128 bytes, matching the superblock's size.
pub const INODE_SIZE: usize = 128;
/// Size in bytes of a packed HRL entry.
pub const HRL_ENTRY_SIZE: usize = 24;
/// Number of reference slots in an inode's block map.
pub const REF_SLOTS: usize = 15;
/// Number of direct block references (`R[0..12)`).
pub const DIRECT_REFS: usize = 12;
/// Inline data capacity in bytes (`15 * 4`).
pub const INLINE_CAPACITY: usize = REF_SLOTS * 4;
/// Reserved inode index, never allocated.
pub const INODE_NONE: u32 = 0;
/// The root directory's inode index.
pub const INODE_ROOT: u32 = 1;
/// Sentinel for "no block" in a 32-bit reference slot.
pub const BLOCK_NONE: u32 = 0;

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

const OFF_VERSION: usize = 4;
const OFF_LOG_BLOCK_SIZE: usize = 8;
const OFF_MOUNT_TIME: usize = 12;
const OFF_WRITE_TIME: usize = 20;
const OFF_MOUNT_COUNT: usize = 28;
const OFF_INODE_COUNT: usize = 32;
const OFF_BLOCK_COUNT: usize = 36;
const OFF_RESERVED_BLOCKS: usize = 40;
const OFF_FREE_BLOCKS: usize = 44;
const OFF_FREE_INODES: usize = 48;
const OFF_FIRST_DATA_BLOCK: usize = 52;
const OFF_HASH_FAST: usize = 56;
const OFF_HASH_STRONG: usize = 60;
const OFF_HRL_INDEX_OFFSET: usize = 64;
const OFF_HRL_INDEX_SIZE: usize = 72;
const OFF_HRL_ENTRY_OFFSET: usize = 76;
const OFF_HRL_ENTRY_COUNT: usize = 84;
const OFF_JOURNAL_OFFSET: usize = 88;
const OFF_JOURNAL_SIZE: usize = 96;
const OFF_JOURNAL_FLAGS: usize = 104;

/// A typed view over the 128-byte on-disk superblock.
#[derive(Clone)]
pub struct Superblock(pub [u8; SUPERBLOCK_SIZE]);

impl Superblock {
    /// Returns a zeroed superblock with the magic and version fields set.
    pub fn new() -> Self {
        let mut sb = Self([0; SUPERBLOCK_SIZE]);
        sb.0[0..4].copy_from_slice(&MAGIC);
        sb.set_format_version(FORMAT_VERSION);
        sb
    }

    /// Parses a superblock from a byte slice, checking the magic and version.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < SUPERBLOCK_SIZE {
            return Err(Error::Io);
        }
        let mut sb = Self([0; SUPERBLOCK_SIZE]);
        sb.0.copy_from_slice(&buf[..SUPERBLOCK_SIZE]);
        if sb.0[0..4] != MAGIC {
            return Err(Error::Protocol);
        }
        if sb.format_version() != FORMAT_VERSION {
            return Err(Error::Protocol);
        }
        Ok(sb)
    }

    field_u32!(format_version, set_format_version, OFF_VERSION);
    field_u32!(log_block_size, set_log_block_size, OFF_LOG_BLOCK_SIZE);
    field_u64!(mount_time, set_mount_time, OFF_MOUNT_TIME);
    field_u64!(write_time, set_write_time, OFF_WRITE_TIME);
    field_u32!(mount_count, set_mount_count, OFF_MOUNT_COUNT);
    field_u32!(inode_count, set_inode_count, OFF_INODE_COUNT);
    field_u32!(block_count, set_block_count, OFF_BLOCK_COUNT);
    field_u32!(reserved_blocks, set_reserved_blocks, OFF_RESERVED_BLOCKS);
    field_u32!(free_blocks, set_free_blocks, OFF_FREE_BLOCKS);
    field_u32!(free_inodes, set_free_inodes, OFF_FREE_INODES);
    field_u32!(
        first_data_block,
        set_first_data_block,
        OFF_FIRST_DATA_BLOCK
    );
    field_u32!(hash_fast, set_hash_fast, OFF_HASH_FAST);
    field_u32!(hash_strong, set_hash_strong, OFF_HASH_STRONG);
    field_u64!(hrl_index_offset, set_hrl_index_offset, OFF_HRL_INDEX_OFFSET);
    field_u32!(hrl_index_size, set_hrl_index_size, OFF_HRL_INDEX_SIZE);
    field_u64!(hrl_entry_offset, set_hrl_entry_offset, OFF_HRL_ENTRY_OFFSET);
    field_u32!(hrl_entry_count, set_hrl_entry_count, OFF_HRL_ENTRY_COUNT);
    field_u64!(journal_offset, set_journal_offset, OFF_JOURNAL_OFFSET);
    field_u64!(journal_size, set_journal_size, OFF_JOURNAL_SIZE);
    field_u32!(journal_flags, set_journal_flags, OFF_JOURNAL_FLAGS);

    /// Returns the block size in bytes (`2^(log_block_size + 10)`).
    pub fn block_size(&self) -> u64 {
        pow2(self.log_block_size() + 10)
    }

    /// Number of HRL buckets, derived from the index size (`index_size / 4`).
    pub fn hrl_bucket_count(&self) -> u32 {
        (self.hrl_index_size() / 4) as u32
    }
}

impl Default for Superblock {
    fn default() -> Self {
        Self::new()
    }
}

/// The byte ranges of every on-image region, computed once from a validated
/// superblock.
#[derive(Clone, Copy, Debug)]
pub struct Layout {
    pub block_size: u64,
    pub bitmap_offset: u64,
    pub bitmap_size: u64,
    pub inode_table_offset: u64,
    pub inode_table_size: u64,
    pub hrl_index_offset: u64,
    pub hrl_index_size: u64,
    pub hrl_entry_offset: u64,
    pub hrl_entry_size: u64,
    pub journal_offset: u64,
    pub journal_size: u64,
    pub data_offset: u64,
    pub block_count: u64,
    pub inode_count: u64,
}

impl Layout {
    /// Computes the region layout of an image from its superblock.
    pub fn from_superblock(sb: &Superblock) -> Self {
        let block_size = sb.block_size();
        let block_count = sb.block_count() as u64;
        let inode_count = sb.inode_count() as u64;

        let bitmap_offset = round_up(SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE as u64, block_size);
        let bitmap_bytes = ceil_division(block_count, 8);
        let bitmap_bytes = round_up(bitmap_bytes.max(1), 8);
        let bitmap_size = round_up(bitmap_bytes, block_size);

        let inode_table_offset = bitmap_offset + bitmap_size;
        let inode_table_bytes = inode_count * INODE_SIZE as u64;
        let inode_table_size = round_up(inode_table_bytes.max(1), block_size);

        let hrl_index_offset = inode_table_offset + inode_table_size;
        let hrl_index_size = round_up(sb.hrl_index_size() as u64, block_size);

        let hrl_entry_offset = hrl_index_offset + hrl_index_size;
        let hrl_entry_size = round_up(
            sb.hrl_entry_count() as u64 * HRL_ENTRY_SIZE as u64,
            block_size,
        );

        let journal_offset = if sb.journal_offset() != 0 {
            sb.journal_offset()
        } else {
            hrl_entry_offset + hrl_entry_size
        };
        let journal_size = sb.journal_size();

        let data_offset = round_up(journal_offset + journal_size, block_size);

        Self {
            block_size,
            bitmap_offset,
            bitmap_size,
            inode_table_offset,
            inode_table_size,
            hrl_index_offset,
            hrl_index_size,
            hrl_entry_offset,
            hrl_entry_size,
            journal_offset,
            journal_size,
            data_offset,
            block_count,
            inode_count,
        }
    }

    /// Returns the byte offset of the `i`th block.
    pub fn block_offset(&self, blo: u32) -> u64 {
        self.data_offset + blo as u64 * self.block_size
    }

    /// Returns the byte offset of inode `ino` (1-indexed) within the inode table.
    pub fn inode_offset(&self, ino: u32) -> u64 {
        self.inode_table_offset + (ino - 1) as u64 * INODE_SIZE as u64
    }
}

fn round_up(n: u64, to: u64) -> u64 {
    ceil_division(n, to) * to
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn superblock_size_is_128() {
        assert_eq!(SUPERBLOCK_SIZE, 128);
    }

    #[test]
    fn roundtrip_fields() {
        let mut sb = Superblock::new();
        sb.set_log_block_size(2); // 4 KiB blocks
        sb.set_inode_count(1024);
        sb.set_block_count(16384);
        sb.set_journal_offset(12345678);
        sb.set_journal_size(65536);

        let encoded = sb.0;
        let decoded = Superblock::parse(&encoded).unwrap();
        assert_eq!(decoded.block_size(), 4096);
        assert_eq!(decoded.inode_count(), 1024);
        assert_eq!(decoded.block_count(), 16384);
        assert_eq!(decoded.journal_offset(), 12345678);
        assert_eq!(decoded.journal_size(), 65536);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        buf[0..4].copy_from_slice(b"NOPE");
        assert_eq!(Superblock::parse(&buf).unwrap_err(), Error::Protocol);
    }

    #[test]
    fn rejects_bad_version() {
        let mut sb = Superblock::new();
        sb.set_format_version(FORMAT_VERSION + 1);
        assert_eq!(Superblock::parse(&sb.0).unwrap_err(), Error::Protocol);
    }
}
