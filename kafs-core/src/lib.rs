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

//! KAFS: a content-addressed, journaled, copy-on-write file store.
//!
//! This crate is the engine shared by every front end (`mkfs-kafs`,
//! `kafsck`, `kafsfront`, `kafsd`, `kafsctl`): a mounted image is a
//! [`context::Context`] memory-mapped once, with every other module a typed
//! view over byte ranges of that mapping, guarded by the lock order in
//! [`locks`].

pub mod bitmap;
pub mod blockmap;
pub mod config;
pub mod context;
pub mod dir;
pub mod error;
pub mod fsck;
pub mod hotplug;
pub mod hrl;
pub mod inode;
pub mod journal;
pub mod layout;
pub mod locks;
pub mod posix;

#[cfg(test)]
pub mod test_util;

pub use context::Context;
pub use error::{Error, Result};
