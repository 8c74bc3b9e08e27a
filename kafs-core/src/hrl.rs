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

//! The content-addressed Hash Reference Layer: hash-chained buckets of
//! refcounted entries, each owning exactly one physical block.

use crate::bitmap;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::locks::BucketMark;
use std::sync::atomic::Ordering;

const OFF_REFCNT: usize = 0;
const OFF_NEXT_PLUS1: usize = 4;
const OFF_BLO: usize = 8;
const OFF_FAST: usize = 16;

/// The 64-bit FNV-1a hash used to bucket and deduplicate block content.
pub fn hash(buf: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut h = OFFSET_BASIS;
    for &b in buf {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    h
}

struct EntryView<'a>(&'a mut [u8]);

impl<'a> EntryView<'a> {
    fn refcnt(&self) -> u32 {
        u32::from_le_bytes(self.0[OFF_REFCNT..OFF_REFCNT + 4].try_into().unwrap())
    }
    fn set_refcnt(&mut self, v: u32) {
        self.0[OFF_REFCNT..OFF_REFCNT + 4].copy_from_slice(&v.to_le_bytes());
    }
    fn next_plus1(&self) -> u32 {
        u32::from_le_bytes(self.0[OFF_NEXT_PLUS1..OFF_NEXT_PLUS1 + 4].try_into().unwrap())
    }
    fn set_next_plus1(&mut self, v: u32) {
        self.0[OFF_NEXT_PLUS1..OFF_NEXT_PLUS1 + 4].copy_from_slice(&v.to_le_bytes());
    }
    fn blo(&self) -> u32 {
        u32::from_le_bytes(self.0[OFF_BLO..OFF_BLO + 4].try_into().unwrap())
    }
    fn set_blo(&mut self, v: u32) {
        self.0[OFF_BLO..OFF_BLO + 4].copy_from_slice(&v.to_le_bytes());
    }
    fn fast(&self) -> u64 {
        u64::from_le_bytes(self.0[OFF_FAST..OFF_FAST + 8].try_into().unwrap())
    }
    fn set_fast(&mut self, v: u64) {
        self.0[OFF_FAST..OFF_FAST + 8].copy_from_slice(&v.to_le_bytes());
    }
    fn clear(&mut self) {
        self.0.fill(0);
    }
}

fn entry_count(ctx: &Context) -> u32 {
    ctx.superblock().hrl_entry_count()
}

fn entry_at(ctx: &Context, idx: u32) -> EntryView<'_> {
    let off = ctx.layout.hrl_entry_offset + idx as u64 * crate::layout::HRL_ENTRY_SIZE as u64;
    EntryView(unsafe { ctx.bytes_mut(off, crate::layout::HRL_ENTRY_SIZE) })
}

fn bucket_head(ctx: &Context, b: u32) -> u32 {
    let off = ctx.layout.hrl_index_offset + b as u64 * 4;
    u32::from_le_bytes(unsafe { ctx.bytes(off, 4) }.try_into().unwrap())
}

fn set_bucket_head(ctx: &Context, b: u32, v: u32) {
    let off = ctx.layout.hrl_index_offset + b as u64 * 4;
    unsafe { ctx.bytes_mut(off, 4) }.copy_from_slice(&v.to_le_bytes());
}

fn bucket_of(ctx: &Context, h: u64) -> u32 {
    let buckets = ctx.bucket_count() as u64;
    if buckets == 0 {
        0
    } else {
        (h & (buckets - 1)) as u32
    }
}

/// Looks up a matching live entry in bucket `b` whose content equals `buf`.
/// Bounds its walk to `entry_count` links to survive a corrupted chain.
fn find_in_bucket(ctx: &Context, b: u32, h: u64, buf: &[u8]) -> Result<Option<u32>> {
    let bound = entry_count(ctx).max(1);
    let mut steps = 0u32;
    let mut cur = bucket_head(ctx, b);
    while cur != 0 {
        if steps > bound {
            return Err(Error::Io);
        }
        steps += 1;
        let idx = cur - 1;
        let (fast, blo, refcnt, next) = {
            let e = entry_at(ctx, idx);
            (e.fast(), e.blo(), e.refcnt(), e.next_plus1())
        };
        if refcnt > 0 && fast == h && ctx.read_block(blo) == buf {
            return Ok(Some(idx));
        }
        cur = next;
    }
    Ok(None)
}

fn find_free_entry(ctx: &Context) -> Result<u32> {
    let count = entry_count(ctx);
    for idx in 0..count {
        if entry_at(ctx, idx).refcnt() == 0 {
            return Ok(idx);
        }
    }
    Err(Error::NoSpace)
}

/// Finds or creates an entry for `buf`'s content, returning `(hrid, is_new,
/// blo)`. A freshly created entry starts at `refcnt == 0`; the caller takes
/// its first reference via [`inc_ref`].
pub fn put(ctx: &Context, buf: &[u8]) -> Result<(u32, bool, u32)> {
    ctx.hrl_stats.put_calls.fetch_add(1, Ordering::Relaxed);
    let h = hash(buf);
    let b = bucket_of(ctx, h);
    let _mark = BucketMark::enter();
    let _bucket_guard = ctx.bucket_lock(b).lock().unwrap();

    if let Some(idx) = find_in_bucket(ctx, b, h, buf)? {
        ctx.hrl_stats.hits.fetch_add(1, Ordering::Relaxed);
        let blo = entry_at(ctx, idx).blo();
        return Ok((idx, false, blo));
    }

    let idx = find_free_entry(ctx)?;
    let blo = bitmap::alloc(ctx)?;
    ctx.write_block(blo, buf);

    let head = bucket_head(ctx, b);
    let mut e = entry_at(ctx, idx);
    e.set_refcnt(0);
    e.set_next_plus1(head);
    e.set_blo(blo);
    e.set_fast(h);
    set_bucket_head(ctx, b, idx + 1);

    ctx.hrl_stats.misses.fetch_add(1, Ordering::Relaxed);
    Ok((idx, true, blo))
}

fn bucket_of_entry(ctx: &Context, idx: u32) -> u32 {
    bucket_of(ctx, entry_at(ctx, idx).fast())
}

/// Increments the refcount of entry `hrid`.
pub fn inc_ref(ctx: &Context, hrid: u32) -> Result<()> {
    let b = bucket_of_entry(ctx, hrid);
    let _mark = BucketMark::enter();
    let _g = ctx.bucket_lock(b).lock().unwrap();
    let mut e = entry_at(ctx, hrid);
    let rc = e.refcnt();
    if rc == u32::MAX {
        return Err(Error::NoSpace);
    }
    e.set_refcnt(rc + 1);
    Ok(())
}

/// Decrements the refcount of entry `hrid`; at zero, frees and zeroes the
/// physical block, unlinks the entry from its bucket chain, and clears it.
pub fn dec_ref(ctx: &Context, hrid: u32) -> Result<()> {
    let b = bucket_of_entry(ctx, hrid);
    let _mark = BucketMark::enter();
    let _g = ctx.bucket_lock(b).lock().unwrap();

    let rc = entry_at(ctx, hrid).refcnt();
    debug_assert!(rc > 0, "dec_ref on a free HRL entry");
    if rc == 0 {
        return Err(Error::Io);
    }
    if rc > 1 {
        entry_at(ctx, hrid).set_refcnt(rc - 1);
        return Ok(());
    }

    let blo = entry_at(ctx, hrid).blo();
    unlink_from_bucket(ctx, b, hrid)?;
    ctx.zero_block(blo);
    bitmap::set_usage(ctx, blo, false)?;
    entry_at(ctx, hrid).clear();
    Ok(())
}

fn unlink_from_bucket(ctx: &Context, b: u32, hrid: u32) -> Result<()> {
    let bound = entry_count(ctx).max(1);
    let mut steps = 0u32;
    let mut cur = bucket_head(ctx, b);
    let mut prev: Option<u32> = None;
    while cur != 0 {
        if steps > bound {
            return Err(Error::Io);
        }
        steps += 1;
        let idx = cur - 1;
        let next = entry_at(ctx, idx).next_plus1();
        if idx == hrid {
            match prev {
                None => set_bucket_head(ctx, b, next),
                Some(p) => entry_at(ctx, p).set_next_plus1(next),
            }
            return Ok(());
        }
        prev = Some(idx);
        cur = next;
    }
    Err(Error::Io)
}

/// Adds a reference to the block at `blo` by content, for reflink clones.
/// Falls back to a no-op success if `blo` is not HRL-managed (a legacy
/// bitmap-only block is already implicitly "referenced" by its allocation).
pub fn inc_ref_by_blo(ctx: &Context, blo: u32) -> Result<()> {
    match find_entry_by_blo(ctx, blo)? {
        Some(idx) => inc_ref(ctx, idx),
        None => Ok(()),
    }
}

/// Releases a reference to the block at `blo` by content. Falls back to a
/// direct bitmap free if `blo` is not HRL-managed.
pub fn dec_ref_by_blo(ctx: &Context, blo: u32) -> Result<()> {
    match find_entry_by_blo(ctx, blo)? {
        Some(idx) => dec_ref(ctx, idx),
        None => {
            ctx.zero_block(blo);
            bitmap::set_usage(ctx, blo, false)
        }
    }
}

fn find_entry_by_blo(ctx: &Context, blo: u32) -> Result<Option<u32>> {
    let buf = ctx.read_block(blo);
    let h = hash(&buf);
    let b = bucket_of(ctx, h);
    let _mark = BucketMark::enter();
    let _g = ctx.bucket_lock(b).lock().unwrap();
    find_in_bucket(ctx, b, h, &buf)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::temp_image;

    #[test]
    fn put_then_put_same_content_dedups() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let buf = vec![0xABu8; ctx.layout.block_size as usize];
        let (id1, is_new1, blo1) = put(&ctx, &buf).unwrap();
        inc_ref(&ctx, id1).unwrap();
        let (id2, is_new2, blo2) = put(&ctx, &buf).unwrap();
        assert!(is_new1);
        assert!(!is_new2);
        assert_eq!(id1, id2);
        assert_eq!(blo1, blo2);
    }

    #[test]
    fn dec_ref_to_zero_frees_block() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let buf = vec![0x42u8; ctx.layout.block_size as usize];
        let (id, _, blo) = put(&ctx, &buf).unwrap();
        inc_ref(&ctx, id).unwrap();
        assert!(bitmap::get_usage(&ctx, blo));
        dec_ref(&ctx, id).unwrap();
        assert!(!bitmap::get_usage(&ctx, blo));
    }

    #[test]
    fn distinct_content_gets_distinct_entries() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let bs = ctx.layout.block_size as usize;
        let a = vec![1u8; bs];
        let b = vec![2u8; bs];
        let (ida, _, _) = put(&ctx, &a).unwrap();
        let (idb, _, _) = put(&ctx, &b).unwrap();
        assert_ne!(ida, idb);
    }
}
