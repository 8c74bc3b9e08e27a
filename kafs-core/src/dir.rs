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

//! Directory content: a packed `{ino: u32_le, namelen: u16_le, name}` record
//! stream stored in the directory inode's own byte stream, read and
//! rewritten as a whole through [`blockmap::read_at`]/[`blockmap::write_at`].
//!
//! Caller holds the directory inode's lock for every function here.

use crate::blockmap;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::inode;

/// Longest name accepted in a directory entry, including the trailing byte
/// budget `namelen` itself must stay under.
pub const FILENAME_MAX: usize = 256;

const RECORD_HEADER: usize = 4 + 2;

/// One parsed directory record.
#[derive(Clone)]
pub struct Entry {
    pub ino: u32,
    pub name: Vec<u8>,
    /// Byte offset of this record within the snapshot.
    pub offset: usize,
    /// Total record length (header + name), for in-place rewrites.
    pub record_len: usize,
}

/// Reads the whole directory stream into an owned buffer.
pub fn dir_snapshot(ctx: &Context, ino: u32) -> Vec<u8> {
    let size = inode::size(ctx, ino);
    blockmap::read_at(ctx, ino, 0, size as usize)
}

/// Rewrites the directory stream from `buf` and truncates to its length.
/// Returns blocks to dec-ref after the caller releases the inode lock.
pub fn dir_writeback(ctx: &Context, ino: u32, buf: &[u8]) -> Result<Vec<u32>> {
    let mut released = blockmap::write_at(ctx, ino, 0, buf)?;
    released.extend(blockmap::truncate(ctx, ino, buf.len() as u64)?);
    Ok(released)
}

/// Iterates the records in `buf`, stopping at any terminator (`ino == 0` or
/// `namelen == 0`) or a tail too short to hold a full record.
pub fn iter(buf: &[u8]) -> impl Iterator<Item = Entry> + '_ {
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        if pos + RECORD_HEADER > buf.len() {
            return None;
        }
        let ino = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
        let namelen = u16::from_le_bytes(buf[pos + 4..pos + 6].try_into().unwrap()) as usize;
        if ino == 0 || namelen == 0 {
            return None;
        }
        if pos + RECORD_HEADER + namelen > buf.len() {
            return None;
        }
        let name = buf[pos + RECORD_HEADER..pos + RECORD_HEADER + namelen].to_vec();
        let record_len = RECORD_HEADER + namelen;
        let entry = Entry {
            ino,
            name,
            offset: pos,
            record_len,
        };
        pos += record_len;
        Some(entry)
    })
}

fn find(buf: &[u8], name: &[u8]) -> Option<Entry> {
    iter(buf).find(|e| e.name == name)
}

fn encode_record(ino: u32, name: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(RECORD_HEADER + name.len());
    out.extend_from_slice(&ino.to_le_bytes());
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(name);
    out
}

fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name.len() >= FILENAME_MAX {
        return Err(Error::Input);
    }
    Ok(())
}

/// Adds `name -> ino`, appending to the snapshot, without touching linkcnt.
/// Used for rename's destination install when the source's own link is
/// being carried over rather than freshly created.
pub fn add_raw(ctx: &Context, dir_ino: u32, name: &[u8], ino: u32) -> Result<Vec<u32>> {
    validate_name(name)?;
    let snap = dir_snapshot(ctx, dir_ino);
    if find(&snap, name).is_some() {
        return Err(Error::Exists);
    }
    let mut out = snap;
    out.extend_from_slice(&encode_record(ino, name));
    dir_writeback(ctx, dir_ino, &out)
}

/// Adds `name -> ino` and increments the target inode's link count.
pub fn add_linkcnt(ctx: &Context, dir_ino: u32, name: &[u8], ino: u32) -> Result<Vec<u32>> {
    let released = add_raw(ctx, dir_ino, name, ino)?;
    inode::linkcnt_incr(ctx, ino);
    Ok(released)
}

/// Removes `name`, leaving the target inode's link count untouched. Used by
/// rename's source-side removal when the link is being transferred, not
/// dropped.
pub fn remove_raw(ctx: &Context, dir_ino: u32, name: &[u8]) -> Result<(u32, Vec<u32>)> {
    let snap = dir_snapshot(ctx, dir_ino);
    let entry = find(&snap, name).ok_or(Error::NotFound)?;
    let mut out = snap;
    out.drain(entry.offset..entry.offset + entry.record_len);
    let released = dir_writeback(ctx, dir_ino, &out)?;
    Ok((entry.ino, released))
}

/// Removes `name` and decrements the target inode's link count.
pub fn remove_linkcnt(ctx: &Context, dir_ino: u32, name: &[u8]) -> Result<(u32, Vec<u32>)> {
    let (ino, released) = remove_raw(ctx, dir_ino, name)?;
    inode::linkcnt_decr(ctx, ino);
    Ok((ino, released))
}

/// Looks up `name`, returning its inode number.
pub fn lookup(ctx: &Context, dir_ino: u32, name: &[u8]) -> Option<u32> {
    let snap = dir_snapshot(ctx, dir_ino);
    find(&snap, name).map(|e| e.ino)
}

/// Returns whether `name` exists as an entry in the directory.
pub fn exists(ctx: &Context, dir_ino: u32, name: &[u8]) -> bool {
    lookup(ctx, dir_ino, name).is_some()
}

/// True iff the only stored entry is `..` (a freshly `mkdir`'d, still-empty
/// directory, never populated beyond its parent link).
pub fn is_empty_except_dotdot(ctx: &Context, dir_ino: u32) -> bool {
    let snap = dir_snapshot(ctx, dir_ino);
    let mut entries = iter(&snap);
    match entries.next() {
        Some(e) if e.name == b".." => entries.next().is_none(),
        Some(_) => false,
        None => true,
    }
}

/// All entries as owned `(name, ino)` pairs, for `readdir`.
pub fn list(ctx: &Context, dir_ino: u32) -> Vec<(Vec<u8>, u32)> {
    let snap = dir_snapshot(ctx, dir_ino);
    iter(&snap).map(|e| (e.name, e.ino)).collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::locks::InodeMark;
    use crate::test_util::temp_image;

    #[test]
    fn add_then_lookup_then_remove() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let dir_ino = inode::find_free(&ctx, 0o040755).unwrap();
        let file_ino = inode::find_free(&ctx, 0o100644).unwrap();
        let _m = InodeMark::enter();

        add_linkcnt(&ctx, dir_ino, b"hello.txt", file_ino).unwrap();
        assert_eq!(lookup(&ctx, dir_ino, b"hello.txt"), Some(file_ino));
        assert_eq!(inode::linkcnt(&ctx, file_ino), 1);

        let (ino, _) = remove_linkcnt(&ctx, dir_ino, b"hello.txt").unwrap();
        assert_eq!(ino, file_ino);
        assert_eq!(inode::linkcnt(&ctx, file_ino), 0);
        assert!(!exists(&ctx, dir_ino, b"hello.txt"));
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let dir_ino = inode::find_free(&ctx, 0o040755).unwrap();
        let file_ino = inode::find_free(&ctx, 0o100644).unwrap();
        let _m = InodeMark::enter();
        add_linkcnt(&ctx, dir_ino, b"a", file_ino).unwrap();
        let err = add_linkcnt(&ctx, dir_ino, b"a", file_ino).unwrap_err();
        assert_eq!(err, Error::Exists);
    }

    #[test]
    fn empty_name_and_overlong_name_rejected() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let dir_ino = inode::find_free(&ctx, 0o040755).unwrap();
        let file_ino = inode::find_free(&ctx, 0o100644).unwrap();
        let _m = InodeMark::enter();
        assert_eq!(
            add_linkcnt(&ctx, dir_ino, b"", file_ino).unwrap_err(),
            Error::Input
        );
        let long = vec![b'x'; FILENAME_MAX];
        assert_eq!(
            add_linkcnt(&ctx, dir_ino, &long, file_ino).unwrap_err(),
            Error::Input
        );
    }

    #[test]
    fn fresh_directory_with_only_dotdot_is_rmdir_eligible() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let parent = inode::find_free(&ctx, 0o040755).unwrap();
        let child = inode::find_free(&ctx, 0o040755).unwrap();
        let _m = InodeMark::enter();
        add_raw(&ctx, child, b"..", parent).unwrap();
        assert!(is_empty_except_dotdot(&ctx, child));
        add_linkcnt(&ctx, child, b"file", parent).unwrap();
        assert!(!is_empty_except_dotdot(&ctx, child));
    }

    #[test]
    fn list_yields_all_entries_in_order() {
        let ctx = temp_image(4 * 1024 * 1024, 4096);
        let dir_ino = inode::find_free(&ctx, 0o040755).unwrap();
        let a = inode::find_free(&ctx, 0o100644).unwrap();
        let b = inode::find_free(&ctx, 0o100644).unwrap();
        let _m = InodeMark::enter();
        add_linkcnt(&ctx, dir_ino, b"a", a).unwrap();
        add_linkcnt(&ctx, dir_ino, b"b", b).unwrap();
        let got = list(&ctx, dir_ino);
        assert_eq!(got, vec![(b"a".to_vec(), a), (b"b".to_vec(), b)]);
    }
}
