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

//! The in-process hotplug RPC proxy to an optional external back-end, and the
//! wire codec it (and `kafsd`/`kafsctl`) share.
//!
//! The front keeps talking to a peer process across that peer's restart: a
//! session id persists, an epoch counts each reconnection, and the socket
//! binds on the front's side so the peer can be replaced without unmounting.

use crate::error::{Error, Result};
use std::io::Write;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Wire framing shared by the front, `kafsd`, and `kafsctl`.
pub mod wire {
    use std::io::{self, Read, Write};

    pub const REQUEST_MAGIC: u32 = u32::from_le_bytes(*b"KARP");
    pub const PROTOCOL_VERSION: u32 = 1;
    pub const MAX_PAYLOAD: usize = 16 * 1024;

    /// Bit set in `flags` on every request/response exchanged over this wire.
    pub const FLAG_ENDIAN_HOST: u32 = 1 << 0;

    /// Operation codes, per the design's RPC op table.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(u32)]
    pub enum Op {
        Hello = 1,
        Ready = 2,
        SessionRestore = 3,
        Getattr = 10,
        Read = 11,
        Write = 12,
        Truncate = 13,
        CtrlStatus = 20,
        CtrlCompat = 21,
        CtrlRestart = 22,
        CtrlSetTimeout = 23,
        CtrlEnvList = 24,
        CtrlEnvSet = 25,
        CtrlEnvUnset = 26,
    }

    impl Op {
        pub fn from_u32(v: u32) -> Option<Self> {
            use Op::*;
            Some(match v {
                1 => Hello,
                2 => Ready,
                3 => SessionRestore,
                10 => Getattr,
                11 => Read,
                12 => Write,
                13 => Truncate,
                20 => CtrlStatus,
                21 => CtrlCompat,
                22 => CtrlRestart,
                23 => CtrlSetTimeout,
                24 => CtrlEnvList,
                25 => CtrlEnvSet,
                26 => CtrlEnvUnset,
                _ => return None,
            })
        }
    }

    /// A request header, host byte order, followed by `payload_len` bytes.
    pub struct RequestHeader {
        pub op: u32,
        pub flags: u32,
        pub req_id: u64,
        pub session_id: u64,
        pub epoch: u64,
        pub payload_len: u32,
    }

    pub const REQUEST_HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 8 + 8 + 4;

    impl RequestHeader {
        pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
            let mut buf = [0u8; REQUEST_HEADER_SIZE];
            buf[0..4].copy_from_slice(&REQUEST_MAGIC.to_ne_bytes());
            buf[4..8].copy_from_slice(&PROTOCOL_VERSION.to_ne_bytes());
            buf[8..12].copy_from_slice(&self.op.to_ne_bytes());
            buf[12..16].copy_from_slice(&self.flags.to_ne_bytes());
            buf[16..24].copy_from_slice(&self.req_id.to_ne_bytes());
            buf[24..32].copy_from_slice(&self.session_id.to_ne_bytes());
            buf[32..40].copy_from_slice(&self.epoch.to_ne_bytes());
            buf[40..44].copy_from_slice(&self.payload_len.to_ne_bytes());
            w.write_all(&buf)
        }

        pub fn read_from(r: &mut impl Read) -> io::Result<Self> {
            let mut buf = [0u8; REQUEST_HEADER_SIZE];
            r.read_exact(&mut buf)?;
            let magic = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
            let version = u32::from_ne_bytes(buf[4..8].try_into().unwrap());
            if magic != REQUEST_MAGIC || version != PROTOCOL_VERSION {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "bad RPC header"));
            }
            Ok(Self {
                op: u32::from_ne_bytes(buf[8..12].try_into().unwrap()),
                flags: u32::from_ne_bytes(buf[12..16].try_into().unwrap()),
                req_id: u64::from_ne_bytes(buf[16..24].try_into().unwrap()),
                session_id: u64::from_ne_bytes(buf[24..32].try_into().unwrap()),
                epoch: u64::from_ne_bytes(buf[32..40].try_into().unwrap()),
                payload_len: u32::from_ne_bytes(buf[40..44].try_into().unwrap()),
            })
        }
    }

    /// A response header, followed by `payload_len` bytes.
    pub struct ResponseHeader {
        pub req_id: u64,
        /// Zero on success, else a negative `errno`.
        pub result: i32,
        pub payload_len: u32,
    }

    pub const RESPONSE_HEADER_SIZE: usize = 8 + 4 + 4;

    impl ResponseHeader {
        pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
            let mut buf = [0u8; RESPONSE_HEADER_SIZE];
            buf[0..8].copy_from_slice(&self.req_id.to_ne_bytes());
            buf[8..12].copy_from_slice(&self.result.to_ne_bytes());
            buf[12..16].copy_from_slice(&self.payload_len.to_ne_bytes());
            w.write_all(&buf)
        }

        pub fn read_from(r: &mut impl Read) -> io::Result<Self> {
            let mut buf = [0u8; RESPONSE_HEADER_SIZE];
            r.read_exact(&mut buf)?;
            Ok(Self {
                req_id: u64::from_ne_bytes(buf[0..8].try_into().unwrap()),
                result: i32::from_ne_bytes(buf[8..12].try_into().unwrap()),
                payload_len: u32::from_ne_bytes(buf[12..16].try_into().unwrap()),
            })
        }
    }

    pub fn read_payload(r: &mut impl Read, len: u32) -> io::Result<Vec<u8>> {
        if len as usize > MAX_PAYLOAD {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "payload too large"));
        }
        let mut buf = vec![0u8; len as usize];
        r.read_exact(&mut buf)?;
        Ok(buf)
    }
}

use wire::{Op, RequestHeader, ResponseHeader};

/// Feature bits this front understands and advertises in `HELLO`.
pub const FEATURE_BITS: u64 = 0;
pub const PROTOCOL_MAJOR: u32 = 1;
pub const PROTOCOL_MINOR: u32 = 0;

/// Connection state, per the design's `disabled -> waiting -> connected ->
/// error` transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disabled,
    Waiting,
    Connected,
    Error,
}

struct Wait {
    state: State,
    queued: usize,
    queue_cap: usize,
}

/// The front's proxy to an optional external back-end.
pub struct Proxy {
    listen_path: Option<PathBuf>,
    session_id: AtomicU64,
    epoch: AtomicU64,
    next_req_id: AtomicU64,
    wait_timeout: Duration,
    wait: Mutex<Wait>,
    cond: Condvar,
    conn: Mutex<Option<UnixStream>>,
    last_error: Mutex<Option<String>>,
}

impl Proxy {
    /// Builds a proxy with no back-end configured: every dispatch falls back
    /// to the local implementation immediately.
    pub fn disabled() -> Self {
        Self {
            listen_path: None,
            session_id: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            next_req_id: AtomicU64::new(1),
            wait_timeout: Duration::from_millis(0),
            wait: Mutex::new(Wait {
                state: State::Disabled,
                queued: 0,
                queue_cap: 0,
            }),
            cond: Condvar::new(),
            conn: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    /// Binds `path` and starts accepting a peer in the background.
    pub fn listen(path: PathBuf, wait_timeout_ms: u64, wait_queue_cap: usize) -> Result<Self> {
        let _ = std::fs::remove_file(&path);
        let proxy = Self {
            listen_path: Some(path),
            session_id: AtomicU64::new(rand_session_id()),
            epoch: AtomicU64::new(0),
            next_req_id: AtomicU64::new(1),
            wait_timeout: Duration::from_millis(wait_timeout_ms),
            wait: Mutex::new(Wait {
                state: State::Waiting,
                queued: 0,
                queue_cap: wait_queue_cap,
            }),
            cond: Condvar::new(),
            conn: Mutex::new(None),
            last_error: Mutex::new(None),
        };
        proxy.spawn_accept_thread();
        Ok(proxy)
    }

    pub fn state(&self) -> State {
        self.wait.lock().unwrap().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    fn spawn_accept_thread(&self) {
        let Some(path) = self.listen_path.clone() else {
            return;
        };
        // Safety note: this runs for the lifetime of the process; the proxy
        // itself is never moved out of the mount context, so the raw pointer
        // below stays valid for as long as the thread could observe it.
        let listener = match UnixListener::bind(&path) {
            Ok(l) => l,
            Err(e) => {
                *self.last_error.lock().unwrap() = Some(e.to_string());
                self.set_state(State::Error);
                return;
            }
        };
        // The accept loop only ever touches fields through &self via atomics
        // and mutexes, so handing it a raw pointer is sound as long as the
        // Context (and this Proxy within it) outlives the mount.
        let self_ptr = self as *const Proxy as usize;
        std::thread::spawn(move || {
            let this = unsafe { &*(self_ptr as *const Proxy) };
            loop {
                match listener.accept() {
                    Ok((stream, _addr)) => {
                        if this.handshake(stream).is_ok() {
                            this.set_state(State::Connected);
                        } else {
                            this.set_state(State::Waiting);
                        }
                    }
                    Err(e) => {
                        *this.last_error.lock().unwrap() = Some(e.to_string());
                        this.set_state(State::Error);
                    }
                }
            }
        });
    }

    fn handshake(&self, mut stream: UnixStream) -> std::io::Result<()> {
        let req = RequestHeader::read_from(&mut stream)?;
        if Op::from_u32(req.op) != Some(Op::Hello) || req.flags & wire::FLAG_ENDIAN_HOST == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "bad HELLO",
            ));
        }
        let payload = wire::read_payload(&mut stream, req.payload_len)?;
        if payload.len() < 8 {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "short HELLO"));
        }
        let peer_major = u32::from_ne_bytes(payload[0..4].try_into().unwrap());
        if peer_major != PROTOCOL_MAJOR {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "major version mismatch",
            ));
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let session_id = self.session_id.load(Ordering::SeqCst);
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&session_id.to_ne_bytes());
        payload.extend_from_slice(&epoch.to_ne_bytes());
        RequestHeader {
            op: Op::SessionRestore as u32,
            flags: wire::FLAG_ENDIAN_HOST,
            req_id: 0,
            session_id,
            epoch,
            payload_len: payload.len() as u32,
        }
        .write_to(&mut stream)?;
        stream.write_all(&payload)?;

        let resp = ResponseHeader::read_from(&mut stream)?;
        if resp.result != 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "peer rejected SESSION_RESTORE",
            ));
        }
        let _ = wire::read_payload(&mut stream, resp.payload_len)?;

        *self.conn.lock().unwrap() = Some(stream);
        Ok(())
    }

    fn set_state(&self, s: State) {
        let mut w = self.wait.lock().unwrap();
        w.state = s;
        self.cond.notify_all();
    }

    /// Dispatches `op` with `payload` to the peer, waiting (bounded) for a
    /// reconnect if currently disconnected.
    ///
    /// Returns [`Error::NotImplemented`] immediately, with no wait, when no
    /// back-end is configured: callers treat that as fallback-worthy.
    pub fn dispatch(&self, op: Op, payload: &[u8]) -> Result<Vec<u8>> {
        if self.listen_path.is_none() {
            return Err(Error::NotImplemented);
        }

        {
            let mut w = self.wait.lock().unwrap();
            if w.state != State::Connected {
                if w.queued >= w.queue_cap.max(1) {
                    return Err(Error::Timeout);
                }
                w.queued += 1;
                let (guard, result) = self
                    .cond
                    .wait_timeout_while(w, self.wait_timeout, |w| w.state != State::Connected)
                    .unwrap();
                w = guard;
                w.queued -= 1;
                if result.timed_out() {
                    return Err(Error::Timeout);
                }
            }
        }

        let mut conn = self.conn.lock().unwrap();
        let stream = match conn.as_mut() {
            Some(s) => s,
            None => return Err(Error::Io),
        };

        let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
        let header = RequestHeader {
            op: op as u32,
            flags: wire::FLAG_ENDIAN_HOST,
            req_id,
            session_id: self.session_id.load(Ordering::SeqCst),
            epoch: self.epoch.load(Ordering::SeqCst),
            payload_len: payload.len() as u32,
        };

        let outcome = (|| -> std::io::Result<(i32, Vec<u8>)> {
            header.write_to(stream)?;
            stream.write_all(payload)?;
            let resp = ResponseHeader::read_from(stream)?;
            let body = wire::read_payload(stream, resp.payload_len)?;
            Ok((resp.result, body))
        })();

        match outcome {
            Ok((0, body)) => Ok(body),
            Ok((result, _)) => Err(errno_to_error(-result)),
            Err(e) => {
                drop(conn);
                self.on_disconnect(&e);
                Err(Error::Io)
            }
        }
    }

    fn on_disconnect(&self, e: &std::io::Error) {
        *self.conn.lock().unwrap() = None;
        *self.last_error.lock().unwrap() = Some(e.to_string());
        self.set_state(State::Waiting);
    }
}

fn rand_session_id() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}

fn errno_to_error(errno: i32) -> Error {
    match errno {
        e if e == libc::ENOSYS || e == libc::EOPNOTSUPP => Error::NotImplemented,
        e if e == libc::ENOENT => Error::NotFound,
        e if e == libc::EEXIST => Error::Exists,
        e if e == libc::EACCES => Error::Permission,
        e if e == libc::ENOSPC => Error::NoSpace,
        e if e == libc::ENOTDIR => Error::NotADir,
        e if e == libc::EISDIR => Error::IsADir,
        e if e == libc::ENOTEMPTY => Error::NotEmpty,
        e if e == libc::EINVAL => Error::Input,
        _ => Error::Io,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn disabled_proxy_falls_back_immediately() {
        let p = Proxy::disabled();
        assert_eq!(p.state(), State::Disabled);
        assert_eq!(p.dispatch(Op::Getattr, &[]).unwrap_err(), Error::NotImplemented);
    }

    #[test]
    fn errno_mapping_round_trips_fallback_worthy() {
        assert!(errno_to_error(libc::ENOSYS).is_fallback_worthy());
        assert!(!errno_to_error(libc::EIO).is_fallback_worthy());
    }
}
