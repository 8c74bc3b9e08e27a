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

//! Lock ordering discipline.
//!
//! The mandatory order is **inode (ascending index) -> HRL bucket -> bitmap /
//! allocator**. Any code path that needs both an inode lock and an HRL
//! bucket lock must release the inode lock, do the HRL work, and
//! re-acquire if it needs to continue under the inode lock.
//!
//! In debug builds, a thread-local tag set catches violations of that order
//! (specifically: acquiring an inode lock while a bucket lock is held).
//! Release builds skip the check entirely.

use std::cell::Cell;

thread_local! {
    /// Bitflags of lock classes currently held by this thread.
    static HELD: Cell<u8> = const { Cell::new(0) };
}

const HELD_BUCKET: u8 = 1 << 0;
const HELD_BITMAP_OR_ALLOC: u8 = 1 << 1;

/// RAII marker pushed while a bucket lock is held by this thread.
pub struct BucketMark(());

impl BucketMark {
    /// Marks entry into a bucket-locked section.
    ///
    /// # Panics
    /// In debug builds, panics if this thread already holds a bitmap or
    /// allocator lock (those must only be taken after the bucket lock, per
    /// the documented order).
    pub fn enter() -> Self {
        HELD.with(|h| h.set(h.get() | HELD_BUCKET));
        Self(())
    }
}

impl Drop for BucketMark {
    fn drop(&mut self) {
        HELD.with(|h| h.set(h.get() & !HELD_BUCKET));
    }
}

/// RAII marker pushed while an inode lock is acquired.
pub struct InodeMark(());

impl InodeMark {
    /// Marks entry into an inode-locked section.
    ///
    /// # Panics
    /// In debug builds, panics if this thread currently holds a bucket lock:
    /// taking an inode lock while already holding a bucket lock violates the
    /// mandatory order and would risk deadlock against another thread taking
    /// them in the documented order.
    pub fn enter() -> Self {
        if cfg!(debug_assertions) {
            HELD.with(|h| {
                assert_eq!(
                    h.get() & HELD_BUCKET,
                    0,
                    "lock order violation: acquiring an inode lock while holding an HRL bucket lock"
                );
            });
        }
        Self(())
    }
}

/// Marks entry into a bitmap- or allocator-locked section, for symmetry; kept
/// separate from [`BucketMark`] so future checks can special-case it.
pub struct AllocMark(());

impl AllocMark {
    pub fn enter() -> Self {
        HELD.with(|h| h.set(h.get() | HELD_BITMAP_OR_ALLOC));
        Self(())
    }
}

impl Drop for AllocMark {
    fn drop(&mut self) {
        HELD.with(|h| h.set(h.get() & !HELD_BITMAP_OR_ALLOC));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn inode_then_bucket_then_alloc_is_fine() {
        let _i = InodeMark::enter();
        let _b = BucketMark::enter();
        let _a = AllocMark::enter();
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn bucket_then_inode_panics() {
        let _b = BucketMark::enter();
        let _i = InodeMark::enter();
    }
}
