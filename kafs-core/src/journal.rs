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

//! The crash-consistent, ring-buffered in-image journal.
//!
//! Owned as a field on the mount [`crate::context::Context`] rather than a
//! process-wide static, per the design's re-architecture of the reference
//! implementation's journal singleton.

use crate::context::Context;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::Duration;
use support::crc32;

/// Size in bytes of the 64-byte-aligned journal header.
pub const HEADER_SIZE: u64 = 64;
/// Size in bytes of a record header (excludes payload).
pub const RECORD_HEADER_SIZE: u64 = 20;

const MAGIC: u32 = u32::from_le_bytes(*b"KAJL");
const VERSION: u32 = 1;

const TAG_BEG: u32 = u32::from_le_bytes(*b"BEG2");
const TAG_CMT: u32 = u32::from_le_bytes(*b"CMT2");
const TAG_ABR: u32 = u32::from_le_bytes(*b"ABR2");
const TAG_NOT: u32 = u32::from_le_bytes(*b"NOT2");
const TAG_WRAP: u32 = u32::from_le_bytes(*b"WRAP");

/// Default group-commit window, overridden by `KAFS_JOURNAL_GC_NS`.
pub const DEFAULT_GC_WINDOW: Duration = Duration::from_millis(2);

/// Decoded journal header.
#[derive(Clone, Copy)]
struct Header {
    ring_capacity: u64,
    write_off: u64,
    last_seq: u64,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&0u32.to_le_bytes()); // flags, unused
        buf[12..20].copy_from_slice(&self.ring_capacity.to_le_bytes());
        buf[20..28].copy_from_slice(&self.write_off.to_le_bytes());
        buf[28..36].copy_from_slice(&self.last_seq.to_le_bytes());
        // crc over the header with the crc field zeroed, which it already is here
        let crc = crc32::compute(&buf[0..36]);
        buf[36..40].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8], ring_capacity: u64) -> Option<Self> {
        if buf.len() < HEADER_SIZE as usize {
            return None;
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if magic != MAGIC || version != VERSION {
            return None;
        }
        let write_off = u64::from_le_bytes(buf[20..28].try_into().unwrap());
        let last_seq = u64::from_le_bytes(buf[28..36].try_into().unwrap());
        let stored_crc = u32::from_le_bytes(buf[36..40].try_into().unwrap());
        let computed = crc32::compute(&buf[0..36]);
        if stored_crc != computed {
            return None;
        }
        Some(Self {
            ring_capacity,
            write_off,
            last_seq,
        })
    }
}

/// The state a single-writer journal producer mutates on every record.
struct WriterState {
    seq: u64,
    write_off: u64,
}

struct GcState {
    pending: bool,
}

/// The in-image write-ahead journal.
pub struct Journal {
    offset: u64,
    size: u64,
    enabled: bool,
    gc_window: Duration,
    writer: Mutex<WriterState>,
    gc: Mutex<GcState>,
    gc_done: Condvar,
}

/// A parsed replay event, passed to the caller's callback on commit.
pub struct ReplayedOp<'a> {
    pub op: &'a str,
    pub args: &'a str,
}

impl Journal {
    /// Opens (without touching disk) the journal state for a region of the
    /// given size at the given offset. Replay is a separate step.
    pub fn open(offset: u64, size: u64) -> Self {
        let enabled = std::env::var("KAFS_JOURNAL_DISABLE").is_err();
        let gc_window = std::env::var("KAFS_JOURNAL_GC_NS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_nanos)
            .unwrap_or(DEFAULT_GC_WINDOW);
        Self {
            offset,
            size,
            enabled,
            gc_window,
            writer: Mutex::new(WriterState {
                seq: 0,
                write_off: 0,
            }),
            gc: Mutex::new(GcState { pending: false }),
            gc_done: Condvar::new(),
        }
    }

    fn ring_capacity(&self) -> u64 {
        self.size - HEADER_SIZE
    }

    fn read_header(&self, ctx: &Context) -> Option<Header> {
        let bytes = unsafe { ctx.bytes(self.offset, HEADER_SIZE as usize) };
        Header::decode(bytes, self.ring_capacity())
    }

    fn write_header(&self, ctx: &Context, header: &Header) {
        let bytes = unsafe { ctx.bytes_mut(self.offset, HEADER_SIZE as usize) };
        bytes.copy_from_slice(&header.encode());
    }

    fn ring_offset(&self, pos: u64) -> u64 {
        self.offset + HEADER_SIZE + pos
    }

    /// Writes one record at the writer's current offset, wrapping the ring
    /// if needed. Caller must hold `self.writer`. Returns the absolute
    /// position the record was written at.
    fn write_record(
        &self,
        ctx: &Context,
        w: &mut WriterState,
        tag: u32,
        seq: u64,
        payload: &[u8],
    ) -> Result<()> {
        let capacity = self.ring_capacity();
        let total = RECORD_HEADER_SIZE + payload.len() as u64;
        if total > capacity {
            return Err(Error::NoSpace);
        }
        if w.write_off + total > capacity {
            let remaining = capacity - w.write_off;
            if remaining >= RECORD_HEADER_SIZE {
                self.put_record(ctx, w.write_off, TAG_WRAP, 0, &[]);
            }
            w.write_off = 0;
        }
        self.put_record(ctx, w.write_off, tag, seq, payload);
        w.write_off += total;
        self.write_header(
            ctx,
            &Header {
                ring_capacity: capacity,
                write_off: w.write_off,
                last_seq: w.seq,
            },
        );
        Ok(())
    }

    fn put_record(&self, ctx: &Context, pos: u64, tag: u32, seq: u64, payload: &[u8]) {
        let total = (RECORD_HEADER_SIZE + payload.len() as u64) as usize;
        let mut buf = vec![0u8; total];
        buf[0..4].copy_from_slice(&tag.to_le_bytes());
        buf[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        buf[8..16].copy_from_slice(&seq.to_le_bytes());
        // crc field (16..20) left zero during the crc computation
        buf[20..].copy_from_slice(payload);
        let crc = crc32::compute(&buf);
        buf[16..20].copy_from_slice(&crc.to_le_bytes());
        let dst = unsafe { ctx.bytes_mut(self.ring_offset(pos), total) };
        dst.copy_from_slice(&buf);
    }

    /// Begins a transaction for operation `op`, returning its sequence number.
    pub fn begin(&self, ctx: &Context, op: &str, args: fmt::Arguments) -> u64 {
        if !self.enabled {
            return 0;
        }
        let mut w = self.writer.lock().unwrap();
        w.seq += 1;
        let seq = w.seq;
        let payload = format!("op={op} {args}");
        if let Err(e) = self.write_record(ctx, &mut w, TAG_BEG, seq, payload.as_bytes()) {
            log::warn!("journal: failed to write BEG2 for seq {seq}: {e}");
        }
        seq
    }

    /// Commits transaction `seq`, group-committing with concurrent committers
    /// inside the configured window.
    pub fn commit(&self, ctx: &Context, seq: u64) {
        if !self.enabled || seq == 0 {
            return;
        }
        {
            let mut w = self.writer.lock().unwrap();
            if let Err(e) = self.write_record(ctx, &mut w, TAG_CMT, seq, &[]) {
                log::warn!("journal: failed to write CMT2 for seq {seq}: {e}");
            }
        }
        self.group_commit_fsync(ctx);
    }

    /// Aborts transaction `seq` with a human-readable `reason`.
    pub fn abort(&self, ctx: &Context, seq: u64, reason: &str) {
        if !self.enabled || seq == 0 {
            return;
        }
        let mut w = self.writer.lock().unwrap();
        if let Err(e) = self.write_record(ctx, &mut w, TAG_ABR, seq, reason.as_bytes()) {
            log::warn!("journal: failed to write ABR2 for seq {seq}: {e}");
        }
    }

    /// Writes a fire-and-forget note; never participates in commit batching.
    pub fn note(&self, ctx: &Context, op: &str, args: fmt::Arguments) {
        if !self.enabled {
            return;
        }
        let mut w = self.writer.lock().unwrap();
        let payload = format!("op={op} {args}");
        if let Err(e) = self.write_record(ctx, &mut w, TAG_NOT, 0, payload.as_bytes()) {
            log::warn!("journal: failed to write NOT2: {e}");
        }
    }

    fn group_commit_fsync(&self, ctx: &Context) {
        if self.gc_window.is_zero() {
            if let Err(e) = ctx.flush() {
                log::warn!("journal: fsync failed: {e}");
            }
            return;
        }
        let mut gc = self.gc.lock().unwrap();
        if gc.pending {
            // A leader is already sleeping out the window; ride along.
            let _ = self.gc_done.wait(gc).unwrap();
            return;
        }
        gc.pending = true;
        drop(gc);
        std::thread::sleep(self.gc_window);
        if let Err(e) = ctx.flush() {
            log::warn!("journal: fsync failed: {e}");
        }
        let mut gc = self.gc.lock().unwrap();
        gc.pending = false;
        self.gc_done.notify_all();
    }

    /// Flushes any pending batch on orderly shutdown.
    pub fn shutdown_flush(&self, ctx: &Context) -> Result<()> {
        ctx.flush()
    }

    /// Replays committed transactions on mount, invoking `callback` for each
    /// one, then resets the ring to empty while preserving the sequence
    /// counter. Never fails the mount: on any header or record corruption it
    /// simply stops scanning and starts from a fresh, empty ring.
    pub fn replay(
        &self,
        ctx: &Context,
        mut callback: Option<&mut dyn FnMut(ReplayedOp)>,
    ) -> Result<()> {
        let header = match self.read_header(ctx) {
            Some(h) => h,
            None => {
                self.write_header(
                    ctx,
                    &Header {
                        ring_capacity: self.ring_capacity(),
                        write_off: 0,
                        last_seq: 0,
                    },
                );
                let mut w = self.writer.lock().unwrap();
                w.seq = 0;
                w.write_off = 0;
                return Ok(());
            }
        };

        let mut open: HashMap<u64, String> = HashMap::new();
        let mut pos = 0u64;
        let capacity = self.ring_capacity();
        while pos < header.write_off {
            if pos + RECORD_HEADER_SIZE > capacity {
                break;
            }
            let hdr_bytes = unsafe { ctx.bytes(self.ring_offset(pos), RECORD_HEADER_SIZE as usize) }
                .to_vec();
            let tag = u32::from_le_bytes(hdr_bytes[0..4].try_into().unwrap());
            let size = u32::from_le_bytes(hdr_bytes[4..8].try_into().unwrap()) as u64;
            let seq = u64::from_le_bytes(hdr_bytes[8..16].try_into().unwrap());
            let stored_crc = u32::from_le_bytes(hdr_bytes[16..20].try_into().unwrap());

            if tag == TAG_WRAP {
                pos = 0;
                continue;
            }
            if pos + RECORD_HEADER_SIZE + size > capacity {
                break;
            }
            let payload =
                unsafe { ctx.bytes(self.ring_offset(pos) + RECORD_HEADER_SIZE, size as usize) };
            let mut check_buf = hdr_bytes.clone();
            check_buf[16..20].copy_from_slice(&0u32.to_le_bytes());
            check_buf.extend_from_slice(payload);
            if crc32::compute(&check_buf) != stored_crc {
                break;
            }

            match tag {
                TAG_BEG => {
                    let text = String::from_utf8_lossy(payload).into_owned();
                    open.insert(seq, text);
                }
                TAG_CMT => {
                    if let Some(text) = open.remove(&seq) {
                        if let Some(cb) = callback.as_deref_mut() {
                            let (op, args) = split_op(&text);
                            cb(ReplayedOp { op, args });
                        }
                    }
                }
                TAG_ABR => {
                    open.remove(&seq);
                }
                TAG_NOT => {}
                _ => break,
            }

            pos += RECORD_HEADER_SIZE + size;
        }
        // Whatever remained open at shutdown is dropped.
        drop(open);

        let mut w = self.writer.lock().unwrap();
        w.seq = header.last_seq;
        w.write_off = 0;
        drop(w);
        self.write_header(
            ctx,
            &Header {
                ring_capacity: capacity,
                write_off: 0,
                last_seq: header.last_seq,
            },
        );
        Ok(())
    }

    /// Strict consistency check used by the `kafsck` sidecar: unlike
    /// [`Self::replay`], any corruption before `write_off` is reported
    /// instead of silently truncating the scan.
    pub fn check_consistency(&self, ctx: &Context) -> Result<()> {
        let header = self.read_header(ctx).ok_or(Error::Io)?;
        let mut pos = 0u64;
        let capacity = self.ring_capacity();
        while pos < header.write_off {
            if pos + RECORD_HEADER_SIZE > capacity {
                return Err(Error::Io);
            }
            let hdr_bytes = unsafe { ctx.bytes(self.ring_offset(pos), RECORD_HEADER_SIZE as usize) }
                .to_vec();
            let tag = u32::from_le_bytes(hdr_bytes[0..4].try_into().unwrap());
            let size = u32::from_le_bytes(hdr_bytes[4..8].try_into().unwrap()) as u64;
            let stored_crc = u32::from_le_bytes(hdr_bytes[16..20].try_into().unwrap());
            if tag == TAG_WRAP {
                pos = 0;
                continue;
            }
            if pos + RECORD_HEADER_SIZE + size > capacity {
                return Err(Error::Io);
            }
            let payload =
                unsafe { ctx.bytes(self.ring_offset(pos) + RECORD_HEADER_SIZE, size as usize) };
            let mut check_buf = hdr_bytes.clone();
            check_buf[16..20].copy_from_slice(&0u32.to_le_bytes());
            check_buf.extend_from_slice(payload);
            if crc32::compute(&check_buf) != stored_crc {
                return Err(Error::Io);
            }
            pos += RECORD_HEADER_SIZE + size;
        }
        Ok(())
    }

    /// Resets the ring to an empty-but-valid state, preserving nothing (used
    /// by `kafsck --journal-clear`).
    pub fn reset(&self, ctx: &Context) {
        let mut w = self.writer.lock().unwrap();
        w.seq = 0;
        w.write_off = 0;
        self.write_header(
            ctx,
            &Header {
                ring_capacity: self.ring_capacity(),
                write_off: 0,
                last_seq: 0,
            },
        );
    }
}

fn split_op(text: &str) -> (&str, &str) {
    let text = text.strip_prefix("op=").unwrap_or(text);
    match text.split_once(' ') {
        Some((op, rest)) => (op, rest),
        None => (text, ""),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::temp_image;

    #[test]
    fn begin_commit_replays_and_empties_ring() {
        let ctx = temp_image(16 * 1024 * 1024, 4096);
        let seq = ctx.journal.begin(&ctx, "CREATE", format_args!("path=/x"));
        ctx.journal.commit(&ctx, seq);

        let mut seen = vec![];
        ctx.journal
            .replay(&ctx, Some(&mut |ev: ReplayedOp| {
                seen.push((ev.op.to_string(), ev.args.to_string()));
            }))
            .unwrap();
        assert_eq!(seen, vec![("CREATE".to_string(), "path=/x".to_string())]);

        // A second replay of the now-reset ring invokes nothing.
        let mut seen2 = vec![];
        ctx.journal
            .replay(&ctx, Some(&mut |ev: ReplayedOp| seen2.push(ev.op.to_string())))
            .unwrap();
        assert!(seen2.is_empty());
    }

    #[test]
    fn unterminated_begin_is_dropped_on_replay() {
        let ctx = temp_image(16 * 1024 * 1024, 4096);
        let _seq = ctx.journal.begin(&ctx, "CREATE", format_args!("path=/x"));
        // No commit: simulate a crash between BEG2 and CMT2.

        let mut seen = vec![];
        ctx.journal
            .replay(&ctx, Some(&mut |ev: ReplayedOp| seen.push(ev.op.to_string())))
            .unwrap();
        assert!(seen.is_empty());
    }

    #[test]
    fn check_consistency_passes_on_clean_ring() {
        let ctx = temp_image(16 * 1024 * 1024, 4096);
        let seq = ctx.journal.begin(&ctx, "UNLINK", format_args!("path=/y"));
        ctx.journal.commit(&ctx, seq);
        assert!(ctx.journal.check_consistency(&ctx).is_ok());
    }
}
