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

//! The in-memory mount context: created at mount, destroyed at unmount,
//! never persisted. Owns the mmap region and the file descriptor exclusively;
//! every other structure (bitmap, inode table, HRL index/entries, journal)
//! is a typed view computed against byte ranges of this mapping, guarded by
//! the locks documented in [`crate::locks`].

use crate::error::{Error, Result};
use crate::hotplug::Proxy;
use crate::journal::Journal;
use crate::layout::{Layout, Superblock, INODE_SIZE};
use memmap2::MmapMut;
use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use support::util::get_timestamp;

/// HRL statistics counters, exposed for diagnostics (`kafsctl status`).
#[derive(Default)]
pub struct HrlStats {
    pub put_calls: AtomicU64,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub fallbacks: AtomicU64,
}

/// Last-seen free-search hints for block and inode allocation.
#[derive(Default, Clone, Copy)]
pub struct AllocHints {
    pub last_block: u32,
    pub last_inode: u32,
}

/// The mount context.
pub struct Context {
    mmap: UnsafeCell<MmapMut>,
    file: File,
    pub layout: Layout,
    superblock: Mutex<Superblock>,
    /// Serialises the block bitmap and its free counter.
    pub bitmap_lock: Mutex<()>,
    /// Serialises inode/block allocation, free counters, and write-timestamp updates.
    pub alloc_lock: Mutex<()>,
    pub alloc_hints: Mutex<AllocHints>,
    inode_locks: Vec<Mutex<()>>,
    hrl_locks: Vec<Mutex<()>>,
    open_count: Mutex<Vec<u32>>,
    pub hrl_stats: HrlStats,
    pub journal: Journal,
    pub hotplug: Proxy,
}

// Safety: every byte range of `mmap` is owned exclusively by exactly one of
// the locks above (documented per-region); no unsynchronised access occurs.
unsafe impl Sync for Context {}

impl Context {
    /// Mounts the image at `path`: maps it, validates the superblock, sizes
    /// the runtime tables from the persisted inode/bucket counts, and
    /// replays the journal.
    pub fn mount(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let sb = Superblock::parse(&mmap[..])?;
        let layout = Layout::from_superblock(&sb);

        let inode_count = layout.inode_count as usize;
        let bucket_count = sb.hrl_bucket_count() as usize;

        inode_count
            .checked_add(1)
            .and_then(|n| n.checked_mul(std::mem::size_of::<Mutex<()>>()))
            .ok_or(Error::Io)?;

        let inode_locks = (0..=inode_count).map(|_| Mutex::new(())).collect();
        let hrl_locks = (0..bucket_count.max(1)).map(|_| Mutex::new(())).collect();
        let open_count = vec![0u32; inode_count + 1];

        let journal = Journal::open(layout.journal_offset, layout.journal_size);

        let mut ctx = Self {
            mmap: UnsafeCell::new(mmap),
            file,
            layout,
            superblock: Mutex::new(sb),
            bitmap_lock: Mutex::new(()),
            alloc_lock: Mutex::new(()),
            alloc_hints: Mutex::new(AllocHints::default()),
            inode_locks,
            hrl_locks,
            open_count: Mutex::new(open_count),
            hrl_stats: HrlStats::default(),
            journal,
            hotplug: Proxy::disabled(),
        };

        ctx.journal.replay(&ctx, None)?;

        {
            let mut sb = ctx.superblock.lock().unwrap();
            let count = sb.mount_count() + 1;
            sb.set_mount_count(count);
            sb.set_mount_time(get_timestamp().as_secs());
            let bytes = sb.0;
            drop(sb);
            ctx.write_superblock_bytes(&bytes);
        }

        Ok(ctx)
    }

    fn write_superblock_bytes(&self, bytes: &[u8; crate::layout::SUPERBLOCK_SIZE]) {
        let slice = unsafe { self.bytes_mut(0, bytes.len()) };
        slice.copy_from_slice(bytes);
    }

    /// Returns a snapshot of the cached superblock.
    pub fn superblock(&self) -> Superblock {
        self.superblock.lock().unwrap().clone()
    }

    /// Applies `f` to the cached superblock under the allocator/bitmap lock's
    /// caller's discipline, then writes the result through to the mapping.
    pub fn with_superblock_mut<T>(&self, f: impl FnOnce(&mut Superblock) -> T) -> T {
        let mut sb = self.superblock.lock().unwrap();
        let r = f(&mut sb);
        let bytes = sb.0;
        drop(sb);
        self.write_superblock_bytes(&bytes);
        r
    }

    /// Number of inodes the runtime tables were sized for.
    pub fn inode_count(&self) -> u32 {
        self.layout.inode_count as u32
    }

    /// Number of HRL buckets.
    pub fn bucket_count(&self) -> u32 {
        self.hrl_locks.len() as u32
    }

    /// Returns the mutex guarding inode `ino`'s metadata, block map, and (if
    /// a directory) directory stream.
    pub fn inode_lock(&self, ino: u32) -> &Mutex<()> {
        &self.inode_locks[ino as usize]
    }

    /// Returns the mutex guarding HRL bucket `b`'s chain and its exclusively
    /// referenced physical blocks.
    pub fn bucket_lock(&self, b: u32) -> &Mutex<()> {
        &self.hrl_locks[b as usize % self.hrl_locks.len()]
    }

    /// Increments the open-file-handle count for `ino`.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if `ino` is outside the fixed-size table sized
    /// at mount (the table is never resized, per design).
    pub fn open_inc(&self, ino: u32) -> Result<()> {
        let mut t = self.open_count.lock().unwrap();
        let slot = t.get_mut(ino as usize).ok_or(Error::Io)?;
        *slot += 1;
        Ok(())
    }

    /// Decrements the open-file-handle count for `ino`, returning the new count.
    pub fn open_dec(&self, ino: u32) -> Result<u32> {
        let mut t = self.open_count.lock().unwrap();
        let slot = t.get_mut(ino as usize).ok_or(Error::Io)?;
        *slot = slot.saturating_sub(1);
        Ok(*slot)
    }

    /// Returns the current open-handle count for `ino`.
    pub fn open_count(&self, ino: u32) -> u32 {
        let t = self.open_count.lock().unwrap();
        t.get(ino as usize).copied().unwrap_or(0)
    }

    /// Returns a mutable view of `len` bytes at offset `off` in the mapping.
    ///
    /// # Safety
    /// The caller must hold the lock documented for the `[off, off+len)`
    /// range before calling this, and must not alias overlapping calls.
    pub unsafe fn bytes_mut(&self, off: u64, len: usize) -> &mut [u8] {
        let base = (*self.mmap.get()).as_mut_ptr();
        std::slice::from_raw_parts_mut(base.add(off as usize), len)
    }

    /// Read-only counterpart of [`Self::bytes_mut`].
    ///
    /// # Safety
    /// Same requirements as [`Self::bytes_mut`].
    pub unsafe fn bytes(&self, off: u64, len: usize) -> &[u8] {
        self.bytes_mut(off, len)
    }

    /// Reads one whole block into an owned buffer.
    pub fn read_block(&self, blo: u32) -> Vec<u8> {
        let off = self.layout.block_offset(blo);
        let len = self.layout.block_size as usize;
        unsafe { self.bytes(off, len) }.to_vec()
    }

    /// Writes one whole block from `buf` (must be exactly `block_size` bytes).
    pub fn write_block(&self, blo: u32, buf: &[u8]) {
        debug_assert_eq!(buf.len(), self.layout.block_size as usize);
        let off = self.layout.block_offset(blo);
        let dst = unsafe { self.bytes_mut(off, buf.len()) };
        dst.copy_from_slice(buf);
    }

    /// Zeroes one whole block.
    pub fn zero_block(&self, blo: u32) {
        let off = self.layout.block_offset(blo);
        let len = self.layout.block_size as usize;
        unsafe { self.bytes_mut(off, len) }.fill(0);
    }

    /// Returns the raw inode record bytes for `ino`.
    pub fn inode_bytes(&self, ino: u32) -> &mut [u8] {
        let off = self.layout.inode_offset(ino);
        unsafe { self.bytes_mut(off, INODE_SIZE) }
    }

    /// Returns the bitmap's byte region.
    pub fn bitmap_bytes(&self) -> &mut [u8] {
        unsafe { self.bytes_mut(self.layout.bitmap_offset, self.layout.bitmap_size as usize) }
    }

    /// Returns the HRL bucket-head table.
    pub fn hrl_index_bytes(&self) -> &mut [u8] {
        unsafe {
            self.bytes_mut(
                self.layout.hrl_index_offset,
                self.layout.hrl_index_size as usize,
            )
        }
    }

    /// Returns the HRL entry table.
    pub fn hrl_entry_bytes(&self) -> &mut [u8] {
        unsafe {
            self.bytes_mut(
                self.layout.hrl_entry_offset,
                self.layout.hrl_entry_size as usize,
            )
        }
    }

    /// Returns the journal region.
    pub fn journal_bytes(&self) -> &mut [u8] {
        unsafe {
            self.bytes_mut(self.layout.journal_offset, self.layout.journal_size as usize)
        }
    }

    /// Flushes the mapping to disk (`msync`) and the file metadata (`fsync`).
    pub fn flush(&self) -> Result<()> {
        let mmap = unsafe { &*self.mmap.get() };
        mmap.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Unmounts: flushes any pending journal batch, then flushes the mapping.
    pub fn unmount(&self) -> Result<()> {
        self.journal.shutdown_flush(self)?;
        self.flush()
    }
}
