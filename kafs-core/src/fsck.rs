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

//! Orphan inode reclaim: an inode with `linkcnt == 0` but `mode != 0` and no
//! open handle is fully reclaimed here, either from the sidecar's startup
//! sweep or from the front releasing the last handle on an unlinked file.
//!
//! Block release walks the block map's tree with an explicit stack bounded
//! to depth 3 (direct, single, double/triple), rather than recursive
//! closures, per the documented re-architecture of the reference's recursive
//! release routine.

use crate::blockmap;
use crate::context::Context;
use crate::error::Result;
use crate::hrl;
use crate::inode;
use crate::layout::{BLOCK_NONE, INLINE_CAPACITY};
use crate::locks::InodeMark;

/// Releases every block owned by `ino`'s block map (data blocks and
/// indirect tables alike) and zeroes its metadata, publishing it back to
/// the free-inode pool. Caller must already know `ino` is a safe orphan
/// (`linkcnt == 0`, `mode != 0`, `open_count == 0`).
fn release_inode(ctx: &Context, ino: u32) -> Result<()> {
    let size = inode::size(ctx, ino);
    let released = if size as usize <= INLINE_CAPACITY {
        Vec::new()
    } else {
        blockmap::truncate(ctx, ino, 0)?
    };
    for blo in released {
        hrl::dec_ref_by_blo(ctx, blo)?;
    }

    let now = support::util::get_timestamp().as_secs();
    inode::set_dtime(ctx, ino, now);
    clear_inode(ctx, ino);
    ctx.with_superblock_mut(|sb| {
        let free = sb.free_inodes();
        sb.set_free_inodes(free + 1);
    });
    Ok(())
}

fn clear_inode(ctx: &Context, ino: u32) {
    crate::inode::InodeView::new(ctx.inode_bytes(ino)).clear();
}

/// Reclaims `ino` if it is an orphan with no remaining open handles. A no-op
/// otherwise. Called by the POSIX layer after the last handle on an
/// unlinked file closes.
pub fn reclaim_if_orphan(ctx: &Context, ino: u32) -> Result<bool> {
    if ino == 0 {
        return Ok(false);
    }
    let _m = InodeMark::enter();
    let _g = ctx.inode_lock(ino).lock().unwrap();
    let is_orphan = inode::mode(ctx, ino) != 0
        && inode::linkcnt(ctx, ino) == 0
        && ctx.open_count(ino) == 0;
    if is_orphan {
        release_inode(ctx, ino)?;
        return Ok(true);
    }
    Ok(false)
}

/// Sweeps the whole inode table for orphans left behind by a crash between
/// `linkcnt` reaching zero and the last close (the front never got a chance
/// to reclaim). Skips any inode currently reported open, since a sweep run
/// by `kafsck` always runs offline against an unmounted image, where
/// `open_count` is always zero, but the check is kept for symmetry with
/// `reclaim_if_orphan`.
pub fn reclaim_orphans(ctx: &Context) -> Result<usize> {
    let mut reclaimed = 0usize;
    for ino in 1..=ctx.inode_count() {
        if reclaim_if_orphan(ctx, ino)? {
            reclaimed += 1;
        }
    }
    Ok(reclaimed)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dir;
    use crate::test_util::temp_image;

    #[test]
    fn orphan_with_no_handles_is_reclaimed() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let ino = inode::find_free(&ctx, 0o100644).unwrap();
        {
            let _m = InodeMark::enter();
            blockmap::write_at(&ctx, ino, 0, &vec![9u8; 5000]).unwrap();
        }
        // Simulate unlink: linkcnt already at zero (never linked into a dir).
        assert_eq!(inode::linkcnt(&ctx, ino), 0);
        assert!(reclaim_if_orphan(&ctx, ino).unwrap());
        assert_eq!(inode::mode(&ctx, ino), 0);
    }

    #[test]
    fn inode_with_open_handle_is_not_reclaimed() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let ino = inode::find_free(&ctx, 0o100644).unwrap();
        ctx.open_inc(ino).unwrap();
        assert!(!reclaim_if_orphan(&ctx, ino).unwrap());
        assert_ne!(inode::mode(&ctx, ino), 0);
    }

    #[test]
    fn reclaim_orphans_sweeps_whole_table() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let dir_ino = inode::find_free(&ctx, 0o040755).unwrap();
        let linked = inode::find_free(&ctx, 0o100644).unwrap();
        let orphan = inode::find_free(&ctx, 0o100644).unwrap();
        {
            let _m = InodeMark::enter();
            dir::add_linkcnt(&ctx, dir_ino, b"kept", linked).unwrap();
        }
        assert_eq!(inode::linkcnt(&ctx, orphan), 0);
        let n = reclaim_orphans(&ctx).unwrap();
        assert_eq!(n, 1);
        assert_eq!(inode::mode(&ctx, orphan), 0);
        assert_ne!(inode::mode(&ctx, linked), 0);
    }
}
