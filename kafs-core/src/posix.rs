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

//! The POSIX operation layer: path resolution, permission checks, and the
//! per-call-credentialed file operations a front-end (`kafsfront`) drives.
//!
//! Every mutating operation is framed by a journal transaction named after
//! itself (`CREATE`, `MKDIR`, ...), and multi-inode operations take locks in
//! ascending inode-index order, per [`crate::locks`].

use crate::blockmap;
use crate::context::Context;
use crate::dir;
use crate::error::{Error, Result};
use crate::fsck;
use crate::hrl;
use crate::inode;
use crate::layout::{INLINE_CAPACITY, INODE_ROOT};
use crate::locks::InodeMark;
use support::util::get_timestamp;

pub const F_OK: u8 = 0;
pub const X_OK: u8 = 1;
pub const W_OK: u8 = 2;
pub const R_OK: u8 = 4;

/// The calling principal's identity, supplied per-call by the front-end
/// (taken from the FUSE request context, not this process's own identity).
#[derive(Clone)]
pub struct Credentials {
    pub uid: u16,
    pub gid: u16,
    pub groups: Vec<u16>,
}

impl Credentials {
    pub fn root() -> Self {
        Self {
            uid: 0,
            gid: 0,
            groups: Vec::new(),
        }
    }

    fn is_root(&self) -> bool {
        self.uid == 0
    }

    fn in_group(&self, gid: u16) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}

/// A file's metadata, as returned by `stat`/`fstat`.
pub struct Attr {
    pub ino: u32,
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub linkcnt: u16,
    pub size: u64,
    pub atime: u64,
    pub ctime: u64,
    pub mtime: u64,
    pub rdev: u16,
}

fn attr_of(ctx: &Context, ino: u32) -> Attr {
    Attr {
        ino,
        mode: inode::mode(ctx, ino),
        uid: inode::uid(ctx, ino),
        gid: inode::gid(ctx, ino),
        linkcnt: inode::linkcnt(ctx, ino),
        size: inode::size(ctx, ino),
        atime: inode::atime(ctx, ino),
        ctime: inode::ctime(ctx, ino),
        mtime: inode::mtime(ctx, ino),
        rdev: inode::rdev(ctx, ino),
    }
}

const S_IFMT: u16 = 0o170000;
const S_IFDIR: u16 = 0o040000;

fn is_dir_mode(mode: u16) -> bool {
    mode & S_IFMT == S_IFDIR
}

/// Checks `cred`'s access against `ino`'s mode/owner/group for the bits in
/// `want` (`R_OK`/`W_OK`/`X_OK`, OR'd; `F_OK` alone always passes once any
/// type check above has been done by the caller).
fn check_access(ctx: &Context, ino: u32, cred: &Credentials, want: u8) -> Result<()> {
    if cred.is_root() || want == F_OK {
        return Ok(());
    }
    let mode = inode::mode(ctx, ino);
    let fuid = inode::uid(ctx, ino);
    let fgid = inode::gid(ctx, ino);

    let granted = |other_bit: u16, user_bit: u16, group_bit: u16| -> bool {
        (mode & other_bit != 0)
            || (mode & user_bit != 0 && cred.uid == fuid)
            || (mode & group_bit != 0 && cred.in_group(fgid))
    };

    if want & R_OK != 0 && !granted(0o004, 0o400, 0o040) {
        return Err(Error::Permission);
    }
    if want & W_OK != 0 && !granted(0o002, 0o200, 0o020) {
        return Err(Error::Permission);
    }
    if want & X_OK != 0 && !granted(0o001, 0o100, 0o010) {
        return Err(Error::Permission);
    }
    Ok(())
}

fn split_path(path: &str) -> Vec<&[u8]> {
    path.trim_matches('/')
        .split('/')
        .filter(|c| !c.is_empty())
        .map(str::as_bytes)
        .collect()
}

/// Resolves every component of `path` from the root, requiring execute
/// permission on each intermediate directory, and returns `(parent_ino,
/// last_component)`. The final component's own access is the caller's
/// responsibility.
fn resolve_parent<'a>(ctx: &Context, cred: &Credentials, path: &'a str) -> Result<(u32, &'a [u8])> {
    let comps = split_path(path);
    let (last, dirs) = comps.split_last().ok_or(Error::Input)?;
    let mut cur = INODE_ROOT;
    for comp in dirs {
        let _m = InodeMark::enter();
        let _g = ctx.inode_lock(cur).lock().unwrap();
        if !is_dir_mode(inode::mode(ctx, cur)) {
            return Err(Error::NotADir);
        }
        check_access(ctx, cur, cred, X_OK)?;
        cur = dir::lookup(ctx, cur, comp).ok_or(Error::NotFound)?;
    }
    Ok((cur, last))
}

/// Resolves the whole path to its target inode; the root path resolves to
/// the root inode itself.
pub fn resolve(ctx: &Context, cred: &Credentials, path: &str) -> Result<u32> {
    if path.trim_matches('/').is_empty() {
        return Ok(INODE_ROOT);
    }
    let (parent, name) = resolve_parent(ctx, cred, path)?;
    let _m = InodeMark::enter();
    let _g = ctx.inode_lock(parent).lock().unwrap();
    if !is_dir_mode(inode::mode(ctx, parent)) {
        return Err(Error::NotADir);
    }
    check_access(ctx, parent, cred, X_OK)?;
    dir::lookup(ctx, parent, name).ok_or(Error::NotFound)
}

fn release_all(ctx: &Context, blos: Vec<u32>) -> Result<()> {
    for blo in blos {
        hrl::dec_ref_by_blo(ctx, blo)?;
    }
    Ok(())
}

/// `stat`/`fstat`: returns `ino`'s metadata directly, no path walk.
pub fn fstat(ctx: &Context, ino: u32) -> Attr {
    let _m = InodeMark::enter();
    let _g = ctx.inode_lock(ino).lock().unwrap();
    attr_of(ctx, ino)
}

/// `stat` by path.
pub fn stat(ctx: &Context, cred: &Credentials, path: &str) -> Result<Attr> {
    let ino = resolve(ctx, cred, path)?;
    Ok(fstat(ctx, ino))
}

/// `access(path, mode)`.
pub fn access(ctx: &Context, cred: &Credentials, path: &str, mode: u8) -> Result<()> {
    let ino = resolve(ctx, cred, path)?;
    let _m = InodeMark::enter();
    let _g = ctx.inode_lock(ino).lock().unwrap();
    check_access(ctx, ino, cred, mode)
}

/// Creates a regular file (or device/fifo node, via `rdev`) at `path`.
pub fn create(
    ctx: &Context,
    cred: &Credentials,
    path: &str,
    mode: u16,
    rdev: u16,
) -> Result<u32> {
    let (parent, name) = resolve_parent(ctx, cred, path)?;
    let seq = ctx.journal.begin(ctx, "CREATE", format_args!("path={path}"));

    let result = (|| -> Result<u32> {
        {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(parent).lock().unwrap();
            check_access(ctx, parent, cred, W_OK | X_OK)?;
        }

        let ino = inode::find_free(ctx, mode)?;
        {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(ino).lock().unwrap();
            inode::set_uid(ctx, ino, cred.uid);
            inode::set_gid(ctx, ino, cred.gid);
            inode::set_rdev(ctx, ino, rdev);
            let now = get_timestamp().as_secs();
            inode::set_atime(ctx, ino, now);
            inode::set_ctime(ctx, ino, now);
            inode::set_mtime(ctx, ino, now);
        }

        {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(parent).lock().unwrap();
            dir::add_linkcnt(ctx, parent, name, ino)?;
        }

        ctx.with_superblock_mut(|sb| {
            let free = sb.free_inodes();
            sb.set_free_inodes(free.saturating_sub(1));
            sb.set_write_time(get_timestamp().as_secs());
        });
        Ok(ino)
    })();

    match &result {
        Ok(_) => ctx.journal.commit(ctx, seq),
        Err(e) => ctx.journal.abort(ctx, seq, &e.to_string()),
    }
    result
}

/// Creates a directory at `path`, with a stored `..` entry back to the parent.
pub fn mkdir(ctx: &Context, cred: &Credentials, path: &str, mode: u16) -> Result<u32> {
    let (parent, name) = resolve_parent(ctx, cred, path)?;
    let seq = ctx.journal.begin(ctx, "MKDIR", format_args!("path={path}"));

    let result = (|| -> Result<u32> {
        {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(parent).lock().unwrap();
            check_access(ctx, parent, cred, W_OK | X_OK)?;
        }

        let ino = inode::find_free(ctx, mode | S_IFDIR)?;
        {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(ino).lock().unwrap();
            inode::set_uid(ctx, ino, cred.uid);
            inode::set_gid(ctx, ino, cred.gid);
            let now = get_timestamp().as_secs();
            inode::set_atime(ctx, ino, now);
            inode::set_ctime(ctx, ino, now);
            inode::set_mtime(ctx, ino, now);
        }

        {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(parent).lock().unwrap();
            dir::add_linkcnt(ctx, parent, name, ino)?;
        }
        {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(ino).lock().unwrap();
            dir::add_linkcnt(ctx, ino, b"..", parent)?;
        }

        ctx.with_superblock_mut(|sb| {
            let free = sb.free_inodes();
            sb.set_free_inodes(free.saturating_sub(1));
            sb.set_write_time(get_timestamp().as_secs());
        });
        Ok(ino)
    })();

    match &result {
        Ok(_) => ctx.journal.commit(ctx, seq),
        Err(e) => ctx.journal.abort(ctx, seq, &e.to_string()),
    }
    result
}

/// Removes the directory entry `path`, decrementing the target's link
/// count. Reclaims the inode immediately if that drops it to zero with no
/// open handles.
pub fn unlink(ctx: &Context, cred: &Credentials, path: &str) -> Result<()> {
    let (parent, name) = resolve_parent(ctx, cred, path)?;
    if name == b"." || name == b".." {
        return Err(Error::Input);
    }
    let seq = ctx.journal.begin(ctx, "UNLINK", format_args!("path={path}"));

    let result = (|| -> Result<()> {
        let target = {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(parent).lock().unwrap();
            check_access(ctx, parent, cred, W_OK | X_OK)?;
            dir::lookup(ctx, parent, name).ok_or(Error::NotFound)?
        };
        {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(target).lock().unwrap();
            if is_dir_mode(inode::mode(ctx, target)) {
                return Err(Error::IsADir);
            }
        }

        let (removed_ino, released) = {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(parent).lock().unwrap();
            dir::remove_raw(ctx, parent, name)?
        };
        release_all(ctx, released)?;

        {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(removed_ino).lock().unwrap();
            let remaining = inode::linkcnt_decr(ctx, removed_ino);
            if remaining == 0 {
                inode::set_dtime(ctx, removed_ino, get_timestamp().as_secs());
            }
        }
        fsck::reclaim_if_orphan(ctx, removed_ino)?;
        Ok(())
    })();

    match &result {
        Ok(_) => ctx.journal.commit(ctx, seq),
        Err(e) => ctx.journal.abort(ctx, seq, &e.to_string()),
    }
    result
}

/// Removes an empty directory (containing only `..`) at `path`.
pub fn rmdir(ctx: &Context, cred: &Credentials, path: &str) -> Result<()> {
    let (parent, name) = resolve_parent(ctx, cred, path)?;
    if name == b"." || name == b".." {
        return Err(Error::Input);
    }
    let seq = ctx.journal.begin(ctx, "RMDIR", format_args!("path={path}"));

    let result = (|| -> Result<()> {
        let target = {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(parent).lock().unwrap();
            check_access(ctx, parent, cred, W_OK | X_OK)?;
            dir::lookup(ctx, parent, name).ok_or(Error::NotFound)?
        };

        let (lo, hi) = ordered_pair(parent, target);
        let (_ga, _gb);
        if lo == hi {
            let _m = InodeMark::enter();
            _ga = ctx.inode_lock(lo).lock().unwrap();
            if !is_dir_mode(inode::mode(ctx, target)) {
                return Err(Error::NotADir);
            }
            if !dir::is_empty_except_dotdot(ctx, target) {
                return Err(Error::NotEmpty);
            }
        } else {
            let _m = InodeMark::enter();
            _ga = ctx.inode_lock(lo).lock().unwrap();
            _gb = ctx.inode_lock(hi).lock().unwrap();
            if !is_dir_mode(inode::mode(ctx, target)) {
                return Err(Error::NotADir);
            }
            if !dir::is_empty_except_dotdot(ctx, target) {
                return Err(Error::NotEmpty);
            }
        }

        let (_, released) = {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(parent).lock().unwrap();
            dir::remove_linkcnt(ctx, parent, name)?
        };
        release_all(ctx, released)?;

        let (_, released) = {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(target).lock().unwrap();
            dir::remove_raw(ctx, target, b"..")?
        };
        release_all(ctx, released)?;

        {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(target).lock().unwrap();
            inode::linkcnt_decr(ctx, target);
            inode::set_dtime(ctx, target, get_timestamp().as_secs());
        }
        fsck::reclaim_if_orphan(ctx, target)?;
        Ok(())
    })();

    match &result {
        Ok(_) => ctx.journal.commit(ctx, seq),
        Err(e) => ctx.journal.abort(ctx, seq, &e.to_string()),
    }
    result
}

fn ordered_pair(a: u32, b: u32) -> (u32, u32) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Creates a new hard link `new_path -> existing target of old_path`.
pub fn link(ctx: &Context, cred: &Credentials, old_path: &str, new_path: &str) -> Result<()> {
    let target = resolve(ctx, cred, old_path)?;
    let (parent, name) = resolve_parent(ctx, cred, new_path)?;
    let seq = ctx.journal.begin(
        ctx,
        "LINK",
        format_args!("from={old_path} to={new_path}"),
    );

    let result = (|| -> Result<()> {
        {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(target).lock().unwrap();
            if is_dir_mode(inode::mode(ctx, target)) {
                return Err(Error::IsADir);
            }
        }
        {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(parent).lock().unwrap();
            check_access(ctx, parent, cred, W_OK | X_OK)?;
            dir::add_linkcnt(ctx, parent, name, target)?;
        }
        {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(target).lock().unwrap();
            inode::touch_meta(ctx, target, get_timestamp().as_secs());
        }
        Ok(())
    })();

    match &result {
        Ok(_) => ctx.journal.commit(ctx, seq),
        Err(e) => ctx.journal.abort(ctx, seq, &e.to_string()),
    }
    result
}

/// `rename(from, to, noreplace)`. `noreplace` rejects an existing `to`.
pub fn rename(
    ctx: &Context,
    cred: &Credentials,
    from: &str,
    to: &str,
    noreplace: bool,
) -> Result<()> {
    let (src_parent, src_name) = resolve_parent(ctx, cred, from)?;
    let (dst_parent, dst_name) = resolve_parent(ctx, cred, to)?;
    let seq = ctx
        .journal
        .begin(ctx, "RENAME", format_args!("from={from} to={to}"));

    let result = (|| -> Result<()> {
        let moved = {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(src_parent).lock().unwrap();
            check_access(ctx, src_parent, cred, W_OK | X_OK)?;
            dir::lookup(ctx, src_parent, src_name).ok_or(Error::NotFound)?
        };

        let existing = {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(dst_parent).lock().unwrap();
            check_access(ctx, dst_parent, cred, W_OK | X_OK)?;
            dir::lookup(ctx, dst_parent, dst_name)
        };
        if existing.is_some() && noreplace {
            return Err(Error::Exists);
        }
        if let Some(e) = existing {
            if e == moved {
                return Ok(());
            }
        }
        if is_descendant(ctx, dst_parent, moved) {
            return Err(Error::Input);
        }

        let moved_is_dir = {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(moved).lock().unwrap();
            is_dir_mode(inode::mode(ctx, moved))
        };

        if let Some(old_target) = existing {
            let old_is_dir = {
                let _m = InodeMark::enter();
                let _g = ctx.inode_lock(old_target).lock().unwrap();
                is_dir_mode(inode::mode(ctx, old_target))
            };
            if old_is_dir != moved_is_dir {
                return Err(if old_is_dir {
                    Error::IsADir
                } else {
                    Error::NotADir
                });
            }
            if old_is_dir && !dir::is_empty_except_dotdot(ctx, old_target) {
                return Err(Error::NotEmpty);
            }

            let (_, released) = {
                let _m = InodeMark::enter();
                let _g = ctx.inode_lock(dst_parent).lock().unwrap();
                dir::remove_raw(ctx, dst_parent, dst_name)?
            };
            release_all(ctx, released)?;
            {
                let _m = InodeMark::enter();
                let _g = ctx.inode_lock(old_target).lock().unwrap();
                let remaining = inode::linkcnt_decr(ctx, old_target);
                if remaining == 0 {
                    inode::set_dtime(ctx, old_target, get_timestamp().as_secs());
                }
            }
            fsck::reclaim_if_orphan(ctx, old_target)?;
        }

        let (_, released) = {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(src_parent).lock().unwrap();
            dir::remove_raw(ctx, src_parent, src_name)?
        };
        release_all(ctx, released)?;

        {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(dst_parent).lock().unwrap();
            dir::add_raw(ctx, dst_parent, dst_name, moved)?;
        }

        if moved_is_dir && src_parent != dst_parent {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(moved).lock().unwrap();
            let (_, released) = dir::remove_raw(ctx, moved, b"..")?;
            release_all(ctx, released)?;
            dir::add_raw(ctx, moved, b"..", dst_parent)?;
        }

        {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(moved).lock().unwrap();
            inode::touch_meta(ctx, moved, get_timestamp().as_secs());
        }
        Ok(())
    })();

    match &result {
        Ok(_) => ctx.journal.commit(ctx, seq),
        Err(e) => ctx.journal.abort(ctx, seq, &e.to_string()),
    }
    result
}

/// True if `candidate` is `root` or appears somewhere on `root`'s `..` chain
/// up to the filesystem root (bounded by inode count to survive a
/// corrupted `..` cycle).
fn is_descendant(ctx: &Context, candidate: u32, root: u32) -> bool {
    let mut cur = candidate;
    for _ in 0..ctx.inode_count() {
        if cur == root {
            return true;
        }
        if cur == INODE_ROOT {
            return false;
        }
        let parent = {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(cur).lock().unwrap();
            if !is_dir_mode(inode::mode(ctx, cur)) {
                return false;
            }
            dir::lookup(ctx, cur, b"..")
        };
        match parent {
            Some(p) => cur = p,
            None => return false,
        }
    }
    false
}

/// Truncates `ino` to `new_size`.
pub fn truncate(ctx: &Context, cred: &Credentials, path: &str, new_size: u64) -> Result<()> {
    let ino = resolve(ctx, cred, path)?;
    let seq = ctx
        .journal
        .begin(ctx, "TRUNCATE", format_args!("path={path} size={new_size}"));

    let result = (|| -> Result<()> {
        let released = {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(ino).lock().unwrap();
            check_access(ctx, ino, cred, W_OK)?;
            let r = blockmap::truncate(ctx, ino, new_size)?;
            inode::touch_data(ctx, ino, get_timestamp().as_secs());
            r
        };
        release_all(ctx, released)
    })();

    match &result {
        Ok(_) => ctx.journal.commit(ctx, seq),
        Err(e) => ctx.journal.abort(ctx, seq, &e.to_string()),
    }
    result
}

/// Truncates an already-open inode directly (the `O_TRUNC` path of `open`).
pub fn truncate_ino(ctx: &Context, ino: u32, new_size: u64) -> Result<()> {
    let released = {
        let _m = InodeMark::enter();
        let _g = ctx.inode_lock(ino).lock().unwrap();
        let r = blockmap::truncate(ctx, ino, new_size)?;
        inode::touch_data(ctx, ino, get_timestamp().as_secs());
        r
    };
    release_all(ctx, released)
}

pub fn chmod(ctx: &Context, cred: &Credentials, path: &str, mode: u16) -> Result<()> {
    let ino = resolve(ctx, cred, path)?;
    let seq = ctx
        .journal
        .begin(ctx, "CHMOD", format_args!("path={path} mode={mode:o}"));
    let result = (|| -> Result<()> {
        let _m = InodeMark::enter();
        let _g = ctx.inode_lock(ino).lock().unwrap();
        if !cred.is_root() && cred.uid != inode::uid(ctx, ino) {
            return Err(Error::Permission);
        }
        let preserved = inode::mode(ctx, ino) & S_IFMT;
        inode::set_mode(ctx, ino, preserved | (mode & !S_IFMT));
        inode::touch_meta(ctx, ino, get_timestamp().as_secs());
        Ok(())
    })();
    match &result {
        Ok(_) => ctx.journal.commit(ctx, seq),
        Err(e) => ctx.journal.abort(ctx, seq, &e.to_string()),
    }
    result
}

pub fn chown(
    ctx: &Context,
    cred: &Credentials,
    path: &str,
    uid: Option<u16>,
    gid: Option<u16>,
) -> Result<()> {
    let ino = resolve(ctx, cred, path)?;
    let seq = ctx.journal.begin(ctx, "CHOWN", format_args!("path={path}"));
    let result = (|| -> Result<()> {
        let _m = InodeMark::enter();
        let _g = ctx.inode_lock(ino).lock().unwrap();
        if !cred.is_root() {
            return Err(Error::Permission);
        }
        if let Some(u) = uid {
            inode::set_uid(ctx, ino, u);
        }
        if let Some(g) = gid {
            inode::set_gid(ctx, ino, g);
        }
        inode::touch_meta(ctx, ino, get_timestamp().as_secs());
        Ok(())
    })();
    match &result {
        Ok(_) => ctx.journal.commit(ctx, seq),
        Err(e) => ctx.journal.abort(ctx, seq, &e.to_string()),
    }
    result
}

const S_IFLNK: u16 = 0o120000;

/// Creates a symlink at `path` whose target text is `target`.
pub fn symlink(ctx: &Context, cred: &Credentials, target: &str, path: &str) -> Result<u32> {
    let (parent, name) = resolve_parent(ctx, cred, path)?;
    let seq = ctx
        .journal
        .begin(ctx, "SYMLINK", format_args!("path={path} target={target}"));

    let result = (|| -> Result<u32> {
        {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(parent).lock().unwrap();
            check_access(ctx, parent, cred, W_OK | X_OK)?;
        }

        let ino = inode::find_free(ctx, S_IFLNK | 0o777)?;
        {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(ino).lock().unwrap();
            inode::set_uid(ctx, ino, cred.uid);
            inode::set_gid(ctx, ino, cred.gid);
            let now = get_timestamp().as_secs();
            inode::set_atime(ctx, ino, now);
            inode::set_ctime(ctx, ino, now);
            inode::set_mtime(ctx, ino, now);
            let bytes = target.as_bytes();
            if bytes.len() <= INLINE_CAPACITY {
                inode::inline_write(ctx, ino, bytes);
                inode::set_size(ctx, ino, bytes.len() as u64);
            }
        }
        if target.as_bytes().len() > INLINE_CAPACITY {
            let released = blockmap::write_at(ctx, ino, 0, target.as_bytes())?;
            release_all(ctx, released)?;
        }

        {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(parent).lock().unwrap();
            dir::add_linkcnt(ctx, parent, name, ino)?;
        }
        ctx.with_superblock_mut(|sb| {
            let free = sb.free_inodes();
            sb.set_free_inodes(free.saturating_sub(1));
        });
        Ok(ino)
    })();

    match &result {
        Ok(_) => ctx.journal.commit(ctx, seq),
        Err(e) => ctx.journal.abort(ctx, seq, &e.to_string()),
    }
    result
}

/// Reads a symlink's target text.
pub fn readlink(ctx: &Context, ino: u32) -> Result<String> {
    let _m = InodeMark::enter();
    let _g = ctx.inode_lock(ino).lock().unwrap();
    if inode::mode(ctx, ino) & S_IFMT != S_IFLNK {
        return Err(Error::Input);
    }
    let size = inode::size(ctx, ino);
    let bytes = if size as usize <= INLINE_CAPACITY {
        let mut v = inode::inline_read(ctx, ino);
        v.truncate(size as usize);
        v
    } else {
        drop(_g);
        drop(_m);
        blockmap::read_at(ctx, ino, 0, size as usize)
    };
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// `readdir`: `.` synthesized, then every stored entry (including `..`).
pub fn readdir(ctx: &Context, cred: &Credentials, ino: u32) -> Result<Vec<(Vec<u8>, u32)>> {
    let _m = InodeMark::enter();
    let _g = ctx.inode_lock(ino).lock().unwrap();
    if !is_dir_mode(inode::mode(ctx, ino)) {
        return Err(Error::NotADir);
    }
    check_access(ctx, ino, cred, R_OK | X_OK)?;
    let mut entries = vec![(b".".to_vec(), ino)];
    entries.extend(dir::list(ctx, ino));
    Ok(entries)
}

/// Reads up to `len` bytes at `offset` from `ino`.
pub fn read(ctx: &Context, ino: u32, offset: u64, len: usize) -> Vec<u8> {
    let _m = InodeMark::enter();
    let _g = ctx.inode_lock(ino).lock().unwrap();
    blockmap::read_at(ctx, ino, offset, len)
}

/// Writes `buf` at `offset` into `ino`.
pub fn write(ctx: &Context, ino: u32, offset: u64, buf: &[u8]) -> Result<usize> {
    let released = {
        let _m = InodeMark::enter();
        let _g = ctx.inode_lock(ino).lock().unwrap();
        let r = blockmap::write_at(ctx, ino, offset, buf)?;
        inode::touch_data(ctx, ino, get_timestamp().as_secs());
        r
    };
    release_all(ctx, released)?;
    Ok(buf.len())
}

/// `fsync`/`fdatasync`: flushes the whole mapping (directory streams and
/// file data share the same mapping, so there is no per-inode flush
/// granularity to exploit).
pub fn fsync(ctx: &Context) -> Result<()> {
    ctx.flush()
}

/// `copy_file_range`. When `whole_file` is set (the kernel-internal flag
/// that indicates a full-file copy request) and `off_in == off_out == 0`,
/// this reuses the reflink path; otherwise performs a chunked read+write
/// with both inode locks held in ascending order.
pub fn copy_file_range(
    ctx: &Context,
    src: u32,
    off_in: u64,
    dst: u32,
    off_out: u64,
    len: usize,
    whole_file: bool,
) -> Result<usize> {
    if whole_file && off_in == 0 && off_out == 0 {
        reflink_clone(ctx, src, dst)?;
        return Ok(inode::size(ctx, dst) as usize);
    }

    let (lo, hi) = ordered_pair(src, dst);
    let _m = InodeMark::enter();
    let _ga = ctx.inode_lock(lo).lock().unwrap();
    let _gb = if hi != lo {
        Some(ctx.inode_lock(hi).lock().unwrap())
    } else {
        None
    };

    let buf = blockmap::read_at(ctx, src, off_in, len);
    let released = blockmap::write_at(ctx, dst, off_out, &buf)?;
    inode::touch_data(ctx, dst, get_timestamp().as_secs());
    drop(_gb);
    drop(_ga);
    release_all(ctx, released)?;
    Ok(buf.len())
}

/// Atomic whole-file clone: `dst` becomes a content-identical copy of `src`
/// sharing physical blocks via HRL reference counts.
pub fn reflink_clone(ctx: &Context, src: u32, dst: u32) -> Result<()> {
    if src == dst {
        return Ok(());
    }

    let (size, inline_data, block_refs) = {
        let _m = InodeMark::enter();
        let _g = ctx.inode_lock(src).lock().unwrap();
        let size = inode::size(ctx, src);
        if size as usize <= INLINE_CAPACITY {
            (size, Some(inode::inline_read(ctx, src)), Vec::new())
        } else {
            let block_count = size.div_ceil(ctx.layout.block_size);
            let refs: Vec<u32> = (0..block_count).map(|i| blockmap::get(ctx, src, i)).collect();
            (size, None, refs)
        }
    };

    let outcome = (|| -> Result<()> {
        let _m = InodeMark::enter();
        let (lo, hi) = ordered_pair(src, dst);
        let _ga = ctx.inode_lock(lo).lock().unwrap();
        let _gb = if hi != lo {
            Some(ctx.inode_lock(hi).lock().unwrap())
        } else {
            None
        };

        let old_released = blockmap::truncate(ctx, dst, 0)?;
        drop(_gb);
        drop(_ga);
        release_all(ctx, old_released)?;

        let _ga = ctx.inode_lock(lo).lock().unwrap();
        let _gb = if hi != lo {
            Some(ctx.inode_lock(hi).lock().unwrap())
        } else {
            None
        };

        if let Some(data) = &inline_data {
            inode::inline_write(ctx, dst, data);
            inode::set_size(ctx, dst, size);
        } else {
            inode::set_size(ctx, dst, size);
            for (i, &blo) in block_refs.iter().enumerate() {
                if blo == 0 {
                    continue;
                }
                hrl::inc_ref_by_blo(ctx, blo)?;
                blockmap::set(ctx, dst, i as u64, blo)?;
            }
        }
        let now = get_timestamp().as_secs();
        inode::touch_data(ctx, dst, now);
        Ok(())
    })();

    if outcome.is_err() {
        let released = blockmap::truncate(ctx, dst, 0).unwrap_or_default();
        let _ = release_all(ctx, released);
    }
    outcome
}

/// Opens `path`: resolves, checks access for the requested mode, and
/// truncates to zero if `trunc` is set and write access was requested.
pub fn open(
    ctx: &Context,
    cred: &Credentials,
    path: &str,
    want: u8,
    trunc: bool,
) -> Result<u32> {
    let ino = resolve(ctx, cred, path)?;
    {
        let _m = InodeMark::enter();
        let _g = ctx.inode_lock(ino).lock().unwrap();
        check_access(ctx, ino, cred, want)?;
    }
    ctx.open_inc(ino)?;
    if trunc && want & W_OK != 0 {
        if let Err(e) = truncate_ino(ctx, ino, 0) {
            ctx.open_dec(ino)?;
            return Err(e);
        }
    }
    Ok(ino)
}

/// Closes a handle on `ino`, reclaiming it if it was the last handle on an
/// already-unlinked (`linkcnt == 0`) inode.
pub fn close(ctx: &Context, ino: u32) -> Result<()> {
    let remaining = ctx.open_dec(ino)?;
    if remaining == 0 {
        fsck::reclaim_if_orphan(ctx, ino)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::temp_image;

    fn root_cred() -> Credentials {
        Credentials::root()
    }

    #[test]
    fn create_write_read_roundtrip() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let cred = root_cred();
        let ino = create(&ctx, &cred, "/hello.txt", 0o644, 0).unwrap();
        write(&ctx, ino, 0, b"hello world").unwrap();
        let got = read(&ctx, ino, 0, 11);
        assert_eq!(&got, b"hello world");
    }

    #[test]
    fn mkdir_then_readdir_lists_entry_and_dot() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let cred = root_cred();
        let dir_ino = mkdir(&ctx, &cred, "/sub", 0o755).unwrap();
        let file_ino = create(&ctx, &cred, "/sub/f", 0o644, 0).unwrap();
        let entries = readdir(&ctx, &cred, dir_ino).unwrap();
        let names: Vec<_> = entries.iter().map(|(n, _)| n.clone()).collect();
        assert!(names.contains(&b".".to_vec()));
        assert!(names.contains(&b"..".to_vec()));
        assert!(names.contains(&b"f".to_vec()));
        assert_eq!(entries.iter().find(|(n, _)| n == b"f").unwrap().1, file_ino);
    }

    #[test]
    fn open_then_unlink_keeps_handle_readable() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let cred = root_cred();
        create(&ctx, &cred, "/f", 0o644, 0).unwrap();
        write(&ctx, resolve(&ctx, &cred, "/f").unwrap(), 0, b"abcdef").unwrap();
        let fdr = open(&ctx, &cred, "/f", R_OK, false).unwrap();

        unlink(&ctx, &cred, "/f").unwrap();
        assert_eq!(access(&ctx, &cred, "/f", F_OK).unwrap_err(), Error::NotFound);

        let data = read(&ctx, fdr, 0, 6);
        assert_eq!(&data, b"abcdef");
        close(&ctx, fdr).unwrap();
        assert_eq!(inode::mode(&ctx, fdr), 0);
    }

    #[test]
    fn rename_overwrite_replaces_destination() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let cred = root_cred();
        mkdir(&ctx, &cred, "/dir", 0o755).unwrap();
        let a = create(&ctx, &cred, "/dir/a.txt", 0o644, 0).unwrap();
        write(&ctx, a, 0, b"AAAA").unwrap();
        let b = create(&ctx, &cred, "/dir/b.txt", 0o644, 0).unwrap();
        write(&ctx, b, 0, b"BBBB").unwrap();

        rename(&ctx, &cred, "/dir/a.txt", "/dir/b.txt", false).unwrap();
        assert_eq!(access(&ctx, &cred, "/dir/a.txt", F_OK).unwrap_err(), Error::NotFound);
        let got_ino = resolve(&ctx, &cred, "/dir/b.txt").unwrap();
        assert_eq!(got_ino, a);
        assert_eq!(read(&ctx, got_ino, 0, 4), b"AAAA");
    }

    #[test]
    fn rename_into_own_subtree_rejected() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let cred = root_cred();
        mkdir(&ctx, &cred, "/a", 0o755).unwrap();
        mkdir(&ctx, &cred, "/a/b", 0o755).unwrap();
        let err = rename(&ctx, &cred, "/a", "/a/b/a", false).unwrap_err();
        assert_eq!(err, Error::Input);
    }

    #[test]
    fn reflink_clone_shares_blocks_cow_on_write() {
        let ctx = temp_image(8 * 1024 * 1024, 4096);
        let cred = root_cred();
        let src = create(&ctx, &cred, "/src", 0o644, 0).unwrap();
        let mut buf = vec![0u8; 3 * 4096];
        buf[0] = 0;
        buf[4096] = 1;
        buf[8192] = 2;
        write(&ctx, src, 0, &buf).unwrap();

        let dst = create(&ctx, &cred, "/dst", 0o644, 0).unwrap();
        reflink_clone(&ctx, src, dst).unwrap();

        write(&ctx, dst, 100, b"ZZZ").unwrap();
        let dst_bytes = read(&ctx, dst, 100, 3);
        let src_bytes = read(&ctx, src, 100, 3);
        assert_eq!(&dst_bytes, b"ZZZ");
        assert_ne!(src_bytes, dst_bytes);
    }

    #[test]
    fn permission_denied_without_owner_match() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let cred = root_cred();
        let ino = create(&ctx, &cred, "/priv", 0o600, 0).unwrap();
        {
            let _m = InodeMark::enter();
            let _g = ctx.inode_lock(ino).lock().unwrap();
            inode::set_uid(&ctx, ino, 5000);
        }
        let other = Credentials {
            uid: 9999,
            gid: 9999,
            groups: vec![],
        };
        let err = access(&ctx, &other, "/priv", R_OK).unwrap_err();
        assert_eq!(err, Error::Permission);
    }
}
