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

//! The inline -> direct -> 1/2/3-level indirect block map, CoW-aware writes,
//! truncate, and empty-indirect pruning.
//!
//! Every function here assumes the caller already holds `ino`'s inode lock
//! (see [`crate::locks::InodeMark`]); none of them acquire it. HRL
//! dereferences that a write or truncate makes necessary are returned to the
//! caller as a list of block numbers to release, so the caller can drop the
//! inode lock before calling into [`crate::hrl`] (which takes bucket locks),
//! honouring the mandatory inode -> bucket -> allocator order.

use crate::bitmap;
use crate::context::Context;
use crate::error::Result;
use crate::hrl;
use crate::inode;
use crate::layout::{BLOCK_NONE, DIRECT_REFS, INLINE_CAPACITY};

/// Returns whether every byte of `buf` is zero.
pub fn is_all_zero(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

fn refs_per_block(ctx: &Context) -> u64 {
    ctx.layout.block_size / 4
}

fn read_u32(ctx: &Context, off: u64) -> u32 {
    u32::from_le_bytes(unsafe { ctx.bytes(off, 4) }.try_into().unwrap())
}

fn write_u32(ctx: &Context, off: u64, v: u32) {
    unsafe { ctx.bytes_mut(off, 4) }.copy_from_slice(&v.to_le_bytes());
}

fn inode_ref_offset(ctx: &Context, ino: u32, slot: usize) -> u64 {
    ctx.layout.inode_offset(ino) + crate::inode::REFS_OFFSET as u64 + slot as u64 * 4
}

fn table_off(ctx: &Context, table_blo: u32, idx: usize) -> u64 {
    ctx.layout.block_offset(table_blo) + idx as u64 * 4
}

fn alloc_zeroed_block(ctx: &Context) -> Result<u32> {
    let blo = bitmap::alloc(ctx)?;
    ctx.zero_block(blo);
    Ok(blo)
}

/// Reads the child pointer at `off`, allocating and writing through a fresh
/// zeroed block if it is currently `BLOCK_NONE`.
fn ensure_child_at_offset(ctx: &Context, off: u64) -> Result<u32> {
    let cur = read_u32(ctx, off);
    if cur != BLOCK_NONE {
        return Ok(cur);
    }
    let blo = alloc_zeroed_block(ctx)?;
    write_u32(ctx, off, blo);
    Ok(blo)
}

/// Resolves the byte offset of logical block `iblo`'s leaf reference slot,
/// allocating any missing intermediate (but not leaf) tables along the way.
fn leaf_offset_alloc(ctx: &Context, ino: u32, iblo: u64) -> Result<u64> {
    let rpb = refs_per_block(ctx);
    if iblo < DIRECT_REFS as u64 {
        return Ok(inode_ref_offset(ctx, ino, iblo as usize));
    }
    let mut rem = iblo - DIRECT_REFS as u64;
    if rem < rpb {
        let t = ensure_child_at_offset(ctx, inode_ref_offset(ctx, ino, 12))?;
        return Ok(table_off(ctx, t, rem as usize));
    }
    rem -= rpb;
    if rem < rpb * rpb {
        let t = ensure_child_at_offset(ctx, inode_ref_offset(ctx, ino, 13))?;
        let i = (rem / rpb) as usize;
        let m = ensure_child_at_offset(ctx, table_off(ctx, t, i))?;
        let j = (rem % rpb) as usize;
        return Ok(table_off(ctx, m, j));
    }
    rem -= rpb * rpb;
    let t = ensure_child_at_offset(ctx, inode_ref_offset(ctx, ino, 14))?;
    let i = (rem / (rpb * rpb)) as usize;
    let rem2 = rem % (rpb * rpb);
    let m = ensure_child_at_offset(ctx, table_off(ctx, t, i))?;
    let j = (rem2 / rpb) as usize;
    let n = ensure_child_at_offset(ctx, table_off(ctx, m, j))?;
    let k = (rem2 % rpb) as usize;
    Ok(table_off(ctx, n, k))
}

/// Same addressing as [`leaf_offset_alloc`], but never allocates: returns
/// `None` as soon as a required intermediate table is missing.
fn leaf_offset_get(ctx: &Context, ino: u32, iblo: u64) -> Option<u64> {
    let rpb = refs_per_block(ctx);
    if iblo < DIRECT_REFS as u64 {
        return Some(inode_ref_offset(ctx, ino, iblo as usize));
    }
    let mut rem = iblo - DIRECT_REFS as u64;
    if rem < rpb {
        let t = read_u32(ctx, inode_ref_offset(ctx, ino, 12));
        if t == BLOCK_NONE {
            return None;
        }
        return Some(table_off(ctx, t, rem as usize));
    }
    rem -= rpb;
    if rem < rpb * rpb {
        let t = read_u32(ctx, inode_ref_offset(ctx, ino, 13));
        if t == BLOCK_NONE {
            return None;
        }
        let i = (rem / rpb) as usize;
        let m = read_u32(ctx, table_off(ctx, t, i));
        if m == BLOCK_NONE {
            return None;
        }
        let j = (rem % rpb) as usize;
        return Some(table_off(ctx, m, j));
    }
    rem -= rpb * rpb;
    let t = read_u32(ctx, inode_ref_offset(ctx, ino, 14));
    if t == BLOCK_NONE {
        return None;
    }
    let i = (rem / (rpb * rpb)) as usize;
    let rem2 = rem % (rpb * rpb);
    let m = read_u32(ctx, table_off(ctx, t, i));
    if m == BLOCK_NONE {
        return None;
    }
    let j = (rem2 / rpb) as usize;
    let n = read_u32(ctx, table_off(ctx, m, j));
    if n == BLOCK_NONE {
        return None;
    }
    let k = (rem2 % rpb) as usize;
    Some(table_off(ctx, n, k))
}

/// Returns the physical block for logical block `iblo`, or [`BLOCK_NONE`] if
/// any level is missing. Never allocates.
pub fn get(ctx: &Context, ino: u32, iblo: u64) -> u32 {
    match leaf_offset_get(ctx, ino, iblo) {
        Some(off) => read_u32(ctx, off),
        None => BLOCK_NONE,
    }
}

/// Same as [`get`], but allocates missing intermediate tables and the leaf
/// itself (zeroed), written through the block allocator.
pub fn put(ctx: &Context, ino: u32, iblo: u64) -> Result<u32> {
    let off = leaf_offset_alloc(ctx, ino, iblo)?;
    ensure_child_at_offset(ctx, off)
}

/// Overwrites the leaf reference for `iblo` with `blo` (possibly
/// [`BLOCK_NONE`]), creating zeroed intermediate tables as needed.
pub fn set(ctx: &Context, ino: u32, iblo: u64, blo: u32) -> Result<()> {
    let off = leaf_offset_alloc(ctx, ino, iblo)?;
    write_u32(ctx, off, blo);
    Ok(())
}

fn is_table_all_zero(ctx: &Context, blo: u32) -> bool {
    is_all_zero(&ctx.read_block(blo))
}

/// After a `set(iblo, BLOCK_NONE)`, walks the (up to 3) indirect tables on
/// `iblo`'s path from the leaf upward, clearing and collecting any that are
/// now entirely empty. Caller holds the inode lock; the collected block
/// numbers must be dec-ref'd after releasing it.
pub fn prune_empty_indirects(ctx: &Context, ino: u32, iblo: u64) -> Result<Vec<u32>> {
    let rpb = refs_per_block(ctx);
    let mut freed = Vec::new();
    if iblo < DIRECT_REFS as u64 {
        return Ok(freed);
    }
    let mut rem = iblo - DIRECT_REFS as u64;

    if rem < rpb {
        let t = read_u32(ctx, inode_ref_offset(ctx, ino, 12));
        if t != BLOCK_NONE && is_table_all_zero(ctx, t) {
            write_u32(ctx, inode_ref_offset(ctx, ino, 12), BLOCK_NONE);
            freed.push(t);
        }
        return Ok(freed);
    }
    rem -= rpb;

    if rem < rpb * rpb {
        let i = (rem / rpb) as usize;
        let root = read_u32(ctx, inode_ref_offset(ctx, ino, 13));
        if root == BLOCK_NONE {
            return Ok(freed);
        }
        let mid_off = table_off(ctx, root, i);
        let mid = read_u32(ctx, mid_off);
        if mid != BLOCK_NONE && is_table_all_zero(ctx, mid) {
            write_u32(ctx, mid_off, BLOCK_NONE);
            freed.push(mid);
            if is_table_all_zero(ctx, root) {
                write_u32(ctx, inode_ref_offset(ctx, ino, 13), BLOCK_NONE);
                freed.push(root);
            }
        }
        return Ok(freed);
    }
    rem -= rpb * rpb;

    let i = (rem / (rpb * rpb)) as usize;
    let rem2 = rem % (rpb * rpb);
    let j = (rem2 / rpb) as usize;
    let root = read_u32(ctx, inode_ref_offset(ctx, ino, 14));
    if root == BLOCK_NONE {
        return Ok(freed);
    }
    let mid_off = table_off(ctx, root, i);
    let mid = read_u32(ctx, mid_off);
    if mid == BLOCK_NONE {
        return Ok(freed);
    }
    let leaf_off = table_off(ctx, mid, j);
    let leaf = read_u32(ctx, leaf_off);
    if leaf != BLOCK_NONE && is_table_all_zero(ctx, leaf) {
        write_u32(ctx, leaf_off, BLOCK_NONE);
        freed.push(leaf);
        if is_table_all_zero(ctx, mid) {
            write_u32(ctx, mid_off, BLOCK_NONE);
            freed.push(mid);
            if is_table_all_zero(ctx, root) {
                write_u32(ctx, inode_ref_offset(ctx, ino, 14), BLOCK_NONE);
                freed.push(root);
            }
        }
    }
    Ok(freed)
}

/// Reads logical block `iblo`'s content, or a full block of zeros if unmapped.
pub fn iblk_read(ctx: &Context, ino: u32, iblo: u64) -> Vec<u8> {
    let blo = get(ctx, ino, iblo);
    if blo == BLOCK_NONE {
        vec![0u8; ctx.layout.block_size as usize]
    } else {
        ctx.read_block(blo)
    }
}

/// Copy-on-write write of one full logical block. Returns the (possibly
/// empty) list of physical blocks whose reference must be dropped by the
/// caller once the inode lock is released.
pub fn iblk_write(ctx: &Context, ino: u32, iblo: u64, buf: &[u8]) -> Result<Vec<u32>> {
    debug_assert_eq!(buf.len(), ctx.layout.block_size as usize);
    let mut to_release = Vec::new();

    if is_all_zero(buf) {
        if let Some(off) = leaf_offset_get(ctx, ino, iblo) {
            let old = read_u32(ctx, off);
            if old != BLOCK_NONE {
                write_u32(ctx, off, BLOCK_NONE);
                to_release.push(old);
                to_release.extend(prune_empty_indirects(ctx, ino, iblo)?);
            }
        }
        return Ok(to_release);
    }

    let new_blo = match hrl::put(ctx, buf) {
        Ok((hrid, _is_new, blo)) => {
            hrl::inc_ref(ctx, hrid)?;
            blo
        }
        Err(_) => {
            ctx.hrl_stats
                .fallbacks
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let blo = bitmap::alloc(ctx)?;
            ctx.write_block(blo, buf);
            blo
        }
    };

    let off = leaf_offset_alloc(ctx, ino, iblo)?;
    let old = read_u32(ctx, off);
    write_u32(ctx, off, new_blo);
    if old != BLOCK_NONE {
        to_release.push(old);
    }
    Ok(to_release)
}

/// Reads `len` bytes at byte `offset` within the file, zero-extending past
/// the end of any hole and past the current size.
pub fn read_at(ctx: &Context, ino: u32, offset: u64, len: usize) -> Vec<u8> {
    let size = inode::size(ctx, ino);
    let mut out = vec![0u8; len];
    if offset >= size {
        return out;
    }
    let end = (offset + len as u64).min(size);
    let avail = (end - offset) as usize;

    if size as usize <= INLINE_CAPACITY {
        let inline = inode::inline_read(ctx, ino);
        out[..avail].copy_from_slice(&inline[offset as usize..offset as usize + avail]);
        return out;
    }

    let bs = ctx.layout.block_size;
    let mut done = 0usize;
    let mut pos = offset;
    while done < avail {
        let iblo = pos / bs;
        let within = (pos % bs) as usize;
        let chunk = ((bs as usize - within).min(avail - done)) as usize;
        let block = iblk_read(ctx, ino, iblo);
        out[done..done + chunk].copy_from_slice(&block[within..within + chunk]);
        done += chunk;
        pos += chunk as u64;
    }
    out
}

/// Writes `buf` at byte `offset`, growing the file (and transitioning out of
/// inline storage) as needed. Returns physical blocks to dec-ref after the
/// inode lock is released.
pub fn write_at(ctx: &Context, ino: u32, offset: u64, buf: &[u8]) -> Result<Vec<u32>> {
    let mut to_release = Vec::new();
    let old_size = inode::size(ctx, ino);
    let new_end = offset + buf.len() as u64;

    let currently_inline = old_size as usize <= INLINE_CAPACITY;
    let fits_inline = new_end as usize <= INLINE_CAPACITY;

    if currently_inline && fits_inline {
        let mut data = inode::inline_read(ctx, ino);
        data.resize(new_end as usize, 0);
        data[offset as usize..new_end as usize].copy_from_slice(buf);
        inode::inline_write(ctx, ino, &data);
        inode::set_size(ctx, ino, new_end);
        return Ok(to_release);
    }

    if currently_inline && !fits_inline {
        // Transition: move existing inline bytes into logical block 0.
        let inline = inode::inline_read(ctx, ino);
        let bs = ctx.layout.block_size as usize;
        let mut block0 = vec![0u8; bs];
        let keep = (old_size as usize).min(bs);
        block0[..keep].copy_from_slice(&inline[..keep]);
        inode::inline_write(ctx, ino, &[]);
        to_release.extend(iblk_write(ctx, ino, 0, &block0)?);
        inode::set_size(ctx, ino, old_size);
    }

    let bs = ctx.layout.block_size;
    let mut pos = offset;
    let mut src = 0usize;
    while src < buf.len() {
        let iblo = pos / bs;
        let within = (pos % bs) as usize;
        let chunk = ((bs as usize - within).min(buf.len() - src)) as usize;
        let mut block = iblk_read(ctx, ino, iblo);
        block[within..within + chunk].copy_from_slice(&buf[src..src + chunk]);
        to_release.extend(iblk_write(ctx, ino, iblo, &block)?);
        src += chunk;
        pos += chunk as u64;
    }

    if new_end > old_size {
        inode::set_size(ctx, ino, new_end);
    }
    Ok(to_release)
}

/// Shrinks or clears tail content down to `new_size`. Updates `size` before
/// releasing any blocks, so a concurrent reader never observes a stale size
/// pointing past a freed block. Returns blocks to dec-ref after the inode
/// lock is released.
pub fn truncate(ctx: &Context, ino: u32, new_size: u64) -> Result<Vec<u32>> {
    let old_size = inode::size(ctx, ino);
    if new_size >= old_size {
        if new_size > old_size {
            inode::set_size(ctx, ino, new_size);
        }
        return Ok(Vec::new());
    }

    let mut to_release = Vec::new();
    let bs = ctx.layout.block_size;

    if old_size as usize <= INLINE_CAPACITY {
        inode::set_size(ctx, ino, new_size);
        let mut inline = inode::inline_read(ctx, ino);
        for b in inline.iter_mut().skip(new_size as usize) {
            *b = 0;
        }
        inode::inline_write(ctx, ino, &inline);
        return Ok(to_release);
    }

    inode::set_size(ctx, ino, new_size);

    if new_size as usize <= INLINE_CAPACITY {
        // Shrinking into inline territory: save the surviving prefix first.
        let first_block = iblk_read(ctx, ino, 0);
        let mut inline = vec![0u8; INLINE_CAPACITY];
        inline[..new_size as usize].copy_from_slice(&first_block[..new_size as usize]);

        let old_block_count = old_size.div_ceil(bs);
        for iblo in 0..old_block_count {
            if let Some(off) = leaf_offset_get(ctx, ino, iblo) {
                let old = read_u32(ctx, off);
                if old != BLOCK_NONE {
                    write_u32(ctx, off, BLOCK_NONE);
                    to_release.push(old);
                    to_release.extend(prune_empty_indirects(ctx, ino, iblo)?);
                }
            }
        }
        inode::inline_write(ctx, ino, &inline);
        return Ok(to_release);
    }

    let old_block_count = old_size.div_ceil(bs);
    let new_block_count = new_size.div_ceil(bs);
    for iblo in new_block_count..old_block_count {
        if let Some(off) = leaf_offset_get(ctx, ino, iblo) {
            let old = read_u32(ctx, off);
            if old != BLOCK_NONE {
                write_u32(ctx, off, BLOCK_NONE);
                to_release.push(old);
                to_release.extend(prune_empty_indirects(ctx, ino, iblo)?);
            }
        }
    }
    Ok(to_release)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::temp_image;
    use crate::locks::InodeMark;

    fn release_all(ctx: &Context, blos: Vec<u32>) {
        for b in blos {
            hrl::dec_ref_by_blo(ctx, b).unwrap();
        }
    }

    #[test]
    fn write_read_inline_roundtrip() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let ino = inode::find_free(&ctx, 0o100644).unwrap();
        let _m = InodeMark::enter();
        let rel = write_at(&ctx, ino, 0, b"hello").unwrap();
        assert!(rel.is_empty());
        let got = read_at(&ctx, ino, 0, 5);
        assert_eq!(&got, b"hello");
    }

    #[test]
    fn write_past_inline_transitions_to_blocks() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let ino = inode::find_free(&ctx, 0o100644).unwrap();
        let _m = InodeMark::enter();
        let buf = vec![7u8; 5000];
        let rel = write_at(&ctx, ino, 0, &buf).unwrap();
        release_all(&ctx, rel);
        let got = read_at(&ctx, ino, 0, 5000);
        assert_eq!(got, buf);
    }

    #[test]
    fn dedup_write_hit_shares_block() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let ino_a = inode::find_free(&ctx, 0o100644).unwrap();
        let ino_b = inode::find_free(&ctx, 0o100644).unwrap();
        let buf = vec![9u8; 4096];
        {
            let _m = InodeMark::enter();
            write_at(&ctx, ino_a, 0, &buf).unwrap();
        }
        {
            let _m = InodeMark::enter();
            write_at(&ctx, ino_b, 0, &buf).unwrap();
        }
        let blo_a = get(&ctx, ino_a, 0);
        let blo_b = get(&ctx, ino_b, 0);
        assert_eq!(blo_a, blo_b);
    }

    #[test]
    fn truncate_to_zero_releases_blocks_and_clears_read() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let ino = inode::find_free(&ctx, 0o100644).unwrap();
        let buf = vec![3u8; 9000];
        let rel = {
            let _m = InodeMark::enter();
            write_at(&ctx, ino, 0, &buf).unwrap()
        };
        release_all(&ctx, rel);
        let rel = {
            let _m = InodeMark::enter();
            truncate(&ctx, ino, 0).unwrap()
        };
        release_all(&ctx, rel);
        assert_eq!(inode::size(&ctx, ino), 0);
        let got = read_at(&ctx, ino, 0, 10);
        assert!(is_all_zero(&got));
    }

    #[test]
    fn hole_write_reads_back_as_zero_without_allocating() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let ino = inode::find_free(&ctx, 0o100644).unwrap();
        let _m = InodeMark::enter();
        // Grow past inline without ever writing nonzero content: the
        // transition writes a full zero block at logical 0, which must not
        // allocate a physical block for it.
        write_at(&ctx, ino, 5000, b"x").unwrap();
        assert_eq!(get(&ctx, ino, 0), BLOCK_NONE);
    }
}
