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

//! The free-block bitmap and its rotating first-fit allocator.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::locks::AllocMark;
use support::util::get_timestamp;

/// Returns whether block `blo` is currently marked used.
pub fn get_usage(ctx: &Context, blo: u32) -> bool {
    let _g = ctx.bitmap_lock.lock().unwrap();
    get_usage_locked(ctx, blo)
}

fn get_usage_locked(ctx: &Context, blo: u32) -> bool {
    let bytes = ctx.bitmap_bytes();
    let byte = (blo / 8) as usize;
    let bit = blo % 8;
    bytes[byte] & (1 << bit) != 0
}

/// Sets block `blo`'s usage bit, asserting the transition is valid, and
/// updates the superblock's free-block counter and write timestamp.
///
/// # Panics
/// In debug builds, panics on a used->used or free->free transition: both
/// indicate a caller bug (double-free or double-alloc).
pub fn set_usage(ctx: &Context, blo: u32, used: bool) -> Result<()> {
    let _g = ctx.bitmap_lock.lock().unwrap();
    let was_used = get_usage_locked(ctx, blo);
    debug_assert!(
        was_used != used,
        "bitmap transition bug: blo={blo} was_used={was_used} requested={used}"
    );
    if was_used == used {
        return Err(Error::Io);
    }

    let byte = (blo / 8) as usize;
    let bit = blo % 8;
    let bytes = ctx.bitmap_bytes();
    if used {
        bytes[byte] |= 1 << bit;
    } else {
        bytes[byte] &= !(1 << bit);
    }

    ctx.with_superblock_mut(|sb| {
        let free = sb.free_blocks();
        if used {
            sb.set_free_blocks(free.saturating_sub(1));
        } else {
            sb.set_free_blocks(free + 1);
        }
        sb.set_write_time(get_timestamp().as_secs());
    });
    Ok(())
}

/// Allocates and marks used the first free block at or after the saved
/// search hint, wrapping once.
pub fn alloc(ctx: &Context) -> Result<u32> {
    let _a = AllocMark::enter();
    let mut hints = ctx.alloc_hints.lock().unwrap();
    let block_count = ctx.layout.block_count as u32;
    if block_count == 0 {
        return Err(Error::NoSpace);
    }

    let start = hints.last_block;
    let mut blo = start;
    loop {
        blo = if blo + 1 >= block_count { 0 } else { blo + 1 };
        if !get_usage(ctx, blo) {
            set_usage(ctx, blo, true)?;
            hints.last_block = blo;
            return Ok(blo);
        }
        if blo == start {
            return Err(Error::NoSpace);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::temp_image;

    #[test]
    fn alloc_marks_used_and_decrements_free_count() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let before = ctx.superblock().free_blocks();
        let blo = alloc(&ctx).unwrap();
        assert!(get_usage(&ctx, blo));
        assert_eq!(ctx.superblock().free_blocks(), before - 1);
    }

    #[test]
    fn alloc_does_not_repeat_until_freed() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let a = alloc(&ctx).unwrap();
        let b = alloc(&ctx).unwrap();
        assert_ne!(a, b);
        set_usage(&ctx, a, false).unwrap();
        assert!(!get_usage(&ctx, a));
    }

    #[test]
    #[should_panic]
    fn double_free_panics_in_debug() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let blo = alloc(&ctx).unwrap();
        set_usage(&ctx, blo, false).unwrap();
        set_usage(&ctx, blo, false).unwrap();
    }
}
