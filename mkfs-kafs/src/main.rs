//! The `mkfs.kafs` tool creates a fresh KAFS image on a file or block device.

use kafs_core::context::Context;
use kafs_core::layout::{Layout, Superblock, INODE_ROOT, SUPERBLOCK_SIZE};
use kafs_core::{dir, inode};
use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::process::exit;
use support::util::{ceil_division, log2, ByteSize};

const DEFAULT_BLOCK_SIZE: u64 = 4096;
const DEFAULT_BYTES_PER_INODE: u64 = 16384;
const MIN_INODES: u32 = 16;
const MIN_JOURNAL_SIZE: u64 = 256 * 1024;
const MAX_JOURNAL_SIZE: u64 = 64 * 1024 * 1024;

struct Args {
    device_path: Option<PathBuf>,
    block_size: u64,
    bytes_per_inode: u64,
    inode_count: Option<u32>,
    force: bool,
    help: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            device_path: None,
            block_size: DEFAULT_BLOCK_SIZE,
            bytes_per_inode: DEFAULT_BYTES_PER_INODE,
            inode_count: None,
            force: false,
            help: false,
        }
    }
}

fn print_usage(bin: &str) {
    eprintln!("Usage: {bin} [OPTIONS] <device>");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -b SIZE    block size in bytes, a power of two (default {DEFAULT_BLOCK_SIZE})");
    eprintln!("  -N COUNT   exact number of inodes to create");
    eprintln!("  -i RATIO   bytes per inode, used when -N is not given (default {DEFAULT_BYTES_PER_INODE})");
    eprintln!("  -f         skip the confirmation prompt when a filesystem is already present");
    eprintln!("  -h         print this help text");
}

fn parse_args(bin: &str, mut argv: impl Iterator<Item = String>) -> Args {
    let mut args = Args::default();
    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "-h" | "--help" => args.help = true,
            "-f" => args.force = true,
            "-b" => {
                let v = argv.next().unwrap_or_else(|| support::error(bin, "-b requires a value"));
                args.block_size = v.parse().unwrap_or_else(|_| support::error(bin, format!("invalid block size `{v}`")));
            }
            "-N" => {
                let v = argv.next().unwrap_or_else(|| support::error(bin, "-N requires a value"));
                args.inode_count = Some(v.parse().unwrap_or_else(|_| support::error(bin, format!("invalid inode count `{v}`"))));
            }
            "-i" => {
                let v = argv.next().unwrap_or_else(|| support::error(bin, "-i requires a value"));
                args.bytes_per_inode = v.parse().unwrap_or_else(|_| support::error(bin, format!("invalid bytes-per-inode `{v}`")));
            }
            _ => args.device_path = Some(PathBuf::from(arg)),
        }
    }
    args
}

fn round_up(n: u64, to: u64) -> u64 {
    ceil_division(n, to) * to
}

/// Builds a superblock sized to fit `image_len` bytes, iterating layout
/// computation once to let the data-block count settle (changing
/// `block_count` can, in rare cases, push the bitmap region over a block
/// boundary and shift every offset after it by one block).
fn build_superblock(image_len: u64, block_size: u64, inode_count: u32) -> Superblock {
    let bucket_count = ((image_len / block_size / 4).clamp(64, 1 << 20)) as u32;
    let entry_count = ((image_len / block_size).clamp(256, 1 << 24)) as u32;
    let journal_size = round_up((image_len / 100).clamp(MIN_JOURNAL_SIZE, MAX_JOURNAL_SIZE), block_size);

    let mut sb = Superblock::new();
    sb.set_log_block_size(log2(block_size / 1024).unwrap_or(0));
    sb.set_inode_count(inode_count);
    sb.set_hrl_index_size(bucket_count * 4);
    sb.set_hrl_entry_count(entry_count);
    sb.set_journal_size(journal_size);

    let mut block_count = (image_len / block_size) as u32;
    for _ in 0..3 {
        sb.set_block_count(block_count);
        let layout = Layout::from_superblock(&sb);
        let data_bytes = image_len.saturating_sub(layout.data_offset);
        let new_count = (data_bytes / block_size) as u32;
        if new_count == block_count {
            break;
        }
        block_count = new_count;
    }
    sb.set_free_blocks(block_count);
    sb.set_free_inodes(inode_count.saturating_sub(1));
    sb
}

fn zero_region(file: &mut std::fs::File, offset: u64, len: u64, block_size: u64) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    let zeros = vec![0u8; block_size as usize];
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(block_size);
        file.write_all(&zeros[..chunk as usize])?;
        remaining -= chunk;
    }
    Ok(())
}

fn already_formatted(file: &mut std::fs::File) -> bool {
    if file.seek(SeekFrom::Start(0)).is_err() {
        return false;
    }
    let mut buf = [0u8; SUPERBLOCK_SIZE];
    if file.read_exact(&mut buf).is_err() {
        return false;
    }
    Superblock::parse(&buf).is_ok()
}

/// Lays out the root directory: a directory inode holding a single `..`
/// entry pointing at itself. `add_linkcnt` bumps the target's link count for
/// that entry, which for root is itself, so no separate bump is needed.
fn init_root(ctx: &Context) {
    let ino = inode::find_free(ctx, 0o040755).expect("root inode");
    debug_assert_eq!(ino, INODE_ROOT);
    let now = support::util::get_timestamp().as_secs();
    inode::set_atime(ctx, ino, now);
    inode::set_ctime(ctx, ino, now);
    inode::set_mtime(ctx, ino, now);
    dir::add_linkcnt(ctx, ino, b"..", ino).expect("root's `..` entry");
    ctx.with_superblock_mut(|sb| sb.set_free_inodes(sb.free_inodes().saturating_sub(1)));
}

fn main() {
    let (bin, argv) = support::args();
    let args = parse_args(&bin, argv.map(|s| s.to_string_lossy().into_owned()));

    if args.help {
        print_usage(&bin);
        return;
    }
    let device_path = args.device_path.unwrap_or_else(|| {
        print_usage(&bin);
        exit(1);
    });
    if !support::util::is_pow2(args.block_size) || args.block_size < 1024 {
        support::error(&bin, "block size must be a power of two, at least 1024 bytes");
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&device_path)
        .unwrap_or_else(|e| support::error(&bin, format!("{}: {e}", device_path.display())));

    if already_formatted(&mut file) && !args.force {
        let proceed = support::prompt::confirm(format!(
            "{}: already contains a KAFS filesystem; proceed anyway? (y/N) ",
            device_path.display()
        ));
        if !proceed {
            eprintln!("{bin}: aborted");
            exit(1);
        }
    }

    let image_len = file
        .metadata()
        .unwrap_or_else(|e| support::error(&bin, e))
        .len();
    if image_len < 1024 * 1024 {
        support::error(&bin, "device is too small for a KAFS filesystem (need at least 1 MiB)");
    }

    let inode_count = args
        .inode_count
        .unwrap_or_else(|| ((image_len / args.bytes_per_inode) as u32).max(MIN_INODES));

    let sb = build_superblock(image_len, args.block_size, inode_count);
    let layout = Layout::from_superblock(&sb);
    if layout.data_offset >= image_len || layout.block_count == 0 {
        support::error(&bin, "device is too small for the requested inode/block-size settings");
    }

    zero_region(&mut file, layout.bitmap_offset, layout.bitmap_size, args.block_size)
        .unwrap_or_else(|e| support::error(&bin, e));
    zero_region(&mut file, layout.inode_table_offset, layout.inode_table_size, args.block_size)
        .unwrap_or_else(|e| support::error(&bin, e));
    zero_region(&mut file, layout.hrl_index_offset, layout.hrl_index_size, args.block_size)
        .unwrap_or_else(|e| support::error(&bin, e));
    zero_region(&mut file, layout.hrl_entry_offset, layout.hrl_entry_size, args.block_size)
        .unwrap_or_else(|e| support::error(&bin, e));
    zero_region(&mut file, layout.journal_offset, layout.journal_size, args.block_size)
        .unwrap_or_else(|e| support::error(&bin, e));

    file.seek(SeekFrom::Start(0)).unwrap();
    file.write_all(&sb.0).unwrap_or_else(|e| support::error(&bin, e));
    file.flush().unwrap_or_else(|e| support::error(&bin, e));
    drop(file);

    let ctx = Context::mount(&device_path).unwrap_or_else(|e| support::error(&bin, e));
    init_root(&ctx);
    ctx.flush().unwrap_or_else(|e| support::error(&bin, e));

    println!(
        "{bin}: created KAFS filesystem on {} ({}, {} inodes, {} data blocks)",
        device_path.display(),
        ByteSize(image_len),
        inode_count,
        layout.block_count,
    );
}

