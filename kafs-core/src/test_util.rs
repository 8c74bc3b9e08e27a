//! Test-only helpers for building a mountable scratch image.

use crate::context::Context;
use crate::layout::Superblock;
use std::io::Write;
use support::util::log2;

/// Builds a small, freshly formatted image of `size` bytes with the given
/// `block_size` and mounts it, returning the live [`Context`].
///
/// The backing file is leaked into the OS temp directory rather than cleaned
/// up: acceptable for test-only scratch images.
pub fn temp_image(size: u64, block_size: u32) -> Context {
    let tmp = tempfile::NamedTempFile::new().expect("create temp file");
    let path = tmp.path().to_path_buf();
    std::mem::forget(tmp);

    let inode_count = 64u32;
    let bucket_count = 64u32;
    let entry_count = 256u32;
    let journal_size = 64 * 1024u64;

    let mut sb = Superblock::new();
    sb.set_log_block_size(log2((block_size / 1024) as u64).expect("power of two block size"));
    sb.set_inode_count(inode_count);
    sb.set_block_count((size / block_size as u64) as u32);
    sb.set_hrl_index_size(bucket_count * 4);
    sb.set_hrl_entry_count(entry_count);
    sb.set_journal_size(journal_size);

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .expect("open temp file");
    file.set_len(size).expect("size temp file");
    file.write_all(&sb.0).expect("write superblock");
    drop(file);

    Context::mount(&path).expect("mount scratch image")
}
