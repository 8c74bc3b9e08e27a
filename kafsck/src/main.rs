//! `kafsck` checks and repairs a KAFS image: journal integrity, free-space
//! accounting, and the Hash Reference Layer's bucket chains.

use kafs_core::context::Context;
use kafs_core::layout::HRL_ENTRY_SIZE;
use kafs_core::{bitmap, fsck, inode};
use std::path::PathBuf;
use std::process::exit;

struct Args {
    device_path: Option<PathBuf>,
    fix: bool,
    journal_clear: bool,
    help: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self { device_path: None, fix: false, journal_clear: false, help: false }
    }
}

fn print_usage(bin: &str) {
    eprintln!("Usage: {bin} [OPTIONS] <device>");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -f, --fix        write back corrected free-space counters and reclaim orphans");
    eprintln!("  --journal-clear  discard the journal's ring buffer instead of replaying it");
    eprintln!("  -h, --help       print this help text");
}

fn parse_args(bin: &str, mut argv: impl Iterator<Item = String>) -> Args {
    let mut args = Args::default();
    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "-h" | "--help" => args.help = true,
            "-f" | "--fix" => args.fix = true,
            "--journal-clear" => args.journal_clear = true,
            _ => args.device_path = Some(PathBuf::from(arg)),
        }
    }
    args
}

/// Recomputes free block and inode counts by scanning the bitmap and inode
/// table directly, independent of the superblock's own running counters.
fn scan_free_counts(ctx: &Context) -> (u32, u32) {
    let block_count = ctx.layout.block_count;
    let free_blocks = (0..block_count).filter(|&blo| !bitmap::get_usage(ctx, blo)).count() as u32;
    let inode_count = ctx.inode_count();
    let free_inodes = (1..=inode_count).filter(|&ino| inode::mode(ctx, ino) == 0).count() as u32;
    (free_blocks, free_inodes)
}

/// A single HRL entry's fields, read directly off the mapped entry region.
/// Mirrors the private layout `hrl.rs` writes (refcnt, next+1, blo, fast
/// hash), at offsets 0, 4, 8, 16 within each 24-byte record.
struct RawEntry {
    refcnt: u32,
    next_plus1: u32,
    blo: u32,
}

fn read_entry(bytes: &[u8], idx: u32) -> RawEntry {
    let off = idx as usize * HRL_ENTRY_SIZE;
    let e = &bytes[off..off + HRL_ENTRY_SIZE];
    RawEntry {
        refcnt: u32::from_le_bytes(e[0..4].try_into().unwrap()),
        next_plus1: u32::from_le_bytes(e[4..8].try_into().unwrap()),
        blo: u32::from_le_bytes(e[8..12].try_into().unwrap()),
    }
}

/// Walks every bucket chain, checking for cycles and for live entries whose
/// block is out of range or not marked used in the bitmap. Returns the
/// number of problems found.
fn check_hrl(ctx: &Context) -> usize {
    let index = ctx.hrl_index_bytes();
    let entries = ctx.hrl_entry_bytes();
    let bucket_count = ctx.bucket_count();
    let entry_count = ctx.superblock().hrl_entry_count();
    let mut problems = 0usize;

    for b in 0..bucket_count {
        let head_off = b as usize * 4;
        let mut cur = u32::from_le_bytes(index[head_off..head_off + 4].try_into().unwrap());
        let mut steps = 0u32;
        let mut seen = std::collections::HashSet::new();
        while cur != 0 {
            if steps > entry_count || !seen.insert(cur) {
                eprintln!("kafsck: bucket {b} has a cyclic or runaway chain");
                problems += 1;
                break;
            }
            steps += 1;
            let idx = cur - 1;
            if idx >= entry_count {
                eprintln!("kafsck: bucket {b} links to out-of-range entry {idx}");
                problems += 1;
                break;
            }
            let entry = read_entry(entries, idx);
            if entry.refcnt > 0 {
                if entry.blo >= ctx.layout.block_count {
                    eprintln!("kafsck: entry {idx} refers to out-of-range block {}", entry.blo);
                    problems += 1;
                } else if !bitmap::get_usage(ctx, entry.blo) {
                    eprintln!("kafsck: entry {idx} is live but block {} is marked free", entry.blo);
                    problems += 1;
                }
            }
            cur = entry.next_plus1;
        }
    }
    problems
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

    let ctx = Context::mount(&device_path).unwrap_or_else(|e| support::error(&bin, e));
    let mut problems = 0usize;

    if args.journal_clear {
        ctx.journal.reset(&ctx);
        println!("{bin}: journal cleared");
    } else if let Err(e) = ctx.journal.check_consistency(&ctx) {
        eprintln!("{bin}: journal inconsistent: {e}");
        problems += 1;
    }

    match fsck::reclaim_orphans(&ctx) {
        Ok(0) => {}
        Ok(n) => println!("{bin}: reclaimed {n} orphaned inode(s)"),
        Err(e) => {
            eprintln!("{bin}: orphan sweep failed: {e}");
            problems += 1;
        }
    }

    let (free_blocks, free_inodes) = scan_free_counts(&ctx);
    let sb = ctx.superblock();
    if sb.free_blocks() != free_blocks {
        eprintln!(
            "{bin}: free block count mismatch: superblock says {}, actual {}",
            sb.free_blocks(),
            free_blocks
        );
        problems += 1;
    }
    if sb.free_inodes() != free_inodes {
        eprintln!(
            "{bin}: free inode count mismatch: superblock says {}, actual {}",
            sb.free_inodes(),
            free_inodes
        );
        problems += 1;
    }

    problems += check_hrl(&ctx);

    if args.fix && problems > 0 {
        ctx.with_superblock_mut(|sb| {
            sb.set_free_blocks(free_blocks);
            sb.set_free_inodes(free_inodes);
        });
        println!("{bin}: free-space counters corrected");
    }

    ctx.flush().unwrap_or_else(|e| support::error(&bin, e));

    if problems == 0 {
        println!("{bin}: clean");
    } else if args.fix {
        println!("{bin}: {problems} problem(s) found, counters repaired");
    } else {
        eprintln!("{bin}: {problems} problem(s) found, run with -f to repair what can be repaired");
        exit(1);
    }
}
