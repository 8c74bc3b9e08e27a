//! `kafsd` is the hotplug peer: it connects to a running `kafsfront`'s
//! listening socket, completes the `HELLO`/`SESSION_RESTORE` handshake, and
//! then serves data-path and control RPCs against the same mounted image.

use kafs_core::config::Config;
use kafs_core::context::Context;
use kafs_core::hotplug::wire::{self, Op, RequestHeader, ResponseHeader};
use kafs_core::hotplug::{PROTOCOL_MAJOR, PROTOCOL_MINOR};
use kafs_core::posix;
use std::collections::HashMap;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

fn print_usage(bin: &str) {
    eprintln!("Usage: {bin} <image>");
    eprintln!("Reads KAFS_HOTPLUG_SOCKET (and the other KAFS_* vars) from the environment.");
}

struct State {
    env: Mutex<HashMap<String, String>>,
    timeout_ms: AtomicU64,
    restart_requested: std::sync::atomic::AtomicBool,
}

impl State {
    fn new() -> Self {
        Self {
            env: Mutex::new(HashMap::new()),
            timeout_ms: AtomicU64::new(2000),
            restart_requested: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

fn hello_payload() -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.extend_from_slice(&PROTOCOL_MAJOR.to_ne_bytes());
    buf.extend_from_slice(&PROTOCOL_MINOR.to_ne_bytes());
    buf
}

/// Connects to the front and completes the `HELLO`/`SESSION_RESTORE`
/// handshake, returning the live stream and the session id it reported.
fn connect_and_handshake(socket: &PathBuf) -> std::io::Result<(UnixStream, u64, u64)> {
    let mut stream = UnixStream::connect(socket)?;
    RequestHeader {
        op: Op::Hello as u32,
        flags: wire::FLAG_ENDIAN_HOST,
        req_id: 0,
        session_id: 0,
        epoch: 0,
        payload_len: hello_payload().len() as u32,
    }
    .write_to(&mut stream)?;
    stream.write_all(&hello_payload())?;

    let req = RequestHeader::read_from(&mut stream)?;
    if Op::from_u32(req.op) != Some(Op::SessionRestore) {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected SESSION_RESTORE"));
    }
    let _ = wire::read_payload(&mut stream, req.payload_len)?;

    ResponseHeader { req_id: req.req_id, result: 0, payload_len: 0 }.write_to(&mut stream)?;

    Ok((stream, req.session_id, req.epoch))
}

fn encode_attr(a: &posix::Attr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(40);
    buf.extend_from_slice(&a.ino.to_ne_bytes());
    buf.extend_from_slice(&a.mode.to_ne_bytes());
    buf.extend_from_slice(&a.uid.to_ne_bytes());
    buf.extend_from_slice(&a.gid.to_ne_bytes());
    buf.extend_from_slice(&a.linkcnt.to_ne_bytes());
    buf.extend_from_slice(&a.rdev.to_ne_bytes());
    buf.extend_from_slice(&a.size.to_ne_bytes());
    buf.extend_from_slice(&a.atime.to_ne_bytes());
    buf.extend_from_slice(&a.ctime.to_ne_bytes());
    buf.extend_from_slice(&a.mtime.to_ne_bytes());
    buf
}

fn handle_request(ctx: &Context, state: &State, op: Op, payload: &[u8]) -> (i32, Vec<u8>) {
    match op {
        Op::Getattr => {
            if payload.len() < 4 {
                return (-libc::EINVAL, Vec::new());
            }
            let ino = u32::from_ne_bytes(payload[0..4].try_into().unwrap());
            (0, encode_attr(&posix::fstat(ctx, ino)))
        }
        Op::Read => {
            if payload.len() < 16 {
                return (-libc::EINVAL, Vec::new());
            }
            let ino = u32::from_ne_bytes(payload[0..4].try_into().unwrap());
            let offset = u64::from_ne_bytes(payload[4..12].try_into().unwrap());
            let len = u32::from_ne_bytes(payload[12..16].try_into().unwrap());
            (0, posix::read(ctx, ino, offset, len as usize))
        }
        Op::Write => {
            if payload.len() < 12 {
                return (-libc::EINVAL, Vec::new());
            }
            let ino = u32::from_ne_bytes(payload[0..4].try_into().unwrap());
            let offset = u64::from_ne_bytes(payload[4..12].try_into().unwrap());
            match posix::write(ctx, ino, offset, &payload[12..]) {
                Ok(n) => (0, (n as u32).to_ne_bytes().to_vec()),
                Err(e) => (-e.to_errno(), Vec::new()),
            }
        }
        Op::Truncate => {
            if payload.len() < 12 {
                return (-libc::EINVAL, Vec::new());
            }
            let ino = u32::from_ne_bytes(payload[0..4].try_into().unwrap());
            let size = u64::from_ne_bytes(payload[4..12].try_into().unwrap());
            match posix::truncate_ino(ctx, ino, size) {
                Ok(()) => (0, Vec::new()),
                Err(e) => (-e.to_errno(), Vec::new()),
            }
        }
        Op::CtrlStatus => {
            let msg = b"ok".to_vec();
            (0, msg)
        }
        Op::CtrlCompat => {
            let mut buf = Vec::with_capacity(8);
            buf.extend_from_slice(&PROTOCOL_MAJOR.to_ne_bytes());
            buf.extend_from_slice(&PROTOCOL_MINOR.to_ne_bytes());
            (0, buf)
        }
        Op::CtrlRestart => {
            state.restart_requested.store(true, Ordering::SeqCst);
            (0, Vec::new())
        }
        Op::CtrlSetTimeout => {
            if payload.len() < 8 {
                return (-libc::EINVAL, Vec::new());
            }
            let ms = u64::from_ne_bytes(payload[0..8].try_into().unwrap());
            state.timeout_ms.store(ms, Ordering::SeqCst);
            (0, Vec::new())
        }
        Op::CtrlEnvList => {
            let env = state.env.lock().unwrap();
            let mut buf = Vec::new();
            buf.extend_from_slice(&(env.len() as u32).to_ne_bytes());
            for (k, v) in env.iter() {
                buf.extend_from_slice(&(k.len() as u16).to_ne_bytes());
                buf.extend_from_slice(k.as_bytes());
                buf.extend_from_slice(&(v.len() as u16).to_ne_bytes());
                buf.extend_from_slice(v.as_bytes());
            }
            (0, buf)
        }
        Op::CtrlEnvSet => match decode_kv(payload) {
            Some((k, v)) => {
                state.env.lock().unwrap().insert(k, v);
                (0, Vec::new())
            }
            None => (-libc::EINVAL, Vec::new()),
        },
        Op::CtrlEnvUnset => match decode_key(payload) {
            Some(k) => {
                state.env.lock().unwrap().remove(&k);
                (0, Vec::new())
            }
            None => (-libc::EINVAL, Vec::new()),
        },
        Op::Hello | Op::Ready | Op::SessionRestore => (-libc::EPROTO, Vec::new()),
    }
}

fn decode_key(payload: &[u8]) -> Option<String> {
    if payload.len() < 2 {
        return None;
    }
    let klen = u16::from_ne_bytes(payload[0..2].try_into().ok()?) as usize;
    let key = payload.get(2..2 + klen)?;
    String::from_utf8(key.to_vec()).ok()
}

fn decode_kv(payload: &[u8]) -> Option<(String, String)> {
    if payload.len() < 2 {
        return None;
    }
    let klen = u16::from_ne_bytes(payload[0..2].try_into().ok()?) as usize;
    let key = payload.get(2..2 + klen)?;
    let rest = payload.get(2 + klen..)?;
    if rest.len() < 2 {
        return None;
    }
    let vlen = u16::from_ne_bytes(rest[0..2].try_into().ok()?) as usize;
    let val = rest.get(2..2 + vlen)?;
    Some((String::from_utf8(key.to_vec()).ok()?, String::from_utf8(val.to_vec()).ok()?))
}

/// Serves RPCs over `stream` until it errors out or a control restart is
/// requested.
fn serve(ctx: &Context, state: &State, mut stream: UnixStream) {
    loop {
        let req = match RequestHeader::read_from(&mut stream) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("kafsd: connection closed: {e}");
                return;
            }
        };
        let payload = match wire::read_payload(&mut stream, req.payload_len) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("kafsd: bad payload: {e}");
                return;
            }
        };
        let Some(op) = Op::from_u32(req.op) else {
            let _ = ResponseHeader { req_id: req.req_id, result: -libc::EPROTO, payload_len: 0 }
                .write_to(&mut stream);
            continue;
        };
        let (result, body) = handle_request(ctx, state, op, &payload);
        let header = ResponseHeader { req_id: req.req_id, result, payload_len: body.len() as u32 };
        if header.write_to(&mut stream).is_err() || stream.write_all(&body).is_err() {
            eprintln!("kafsd: failed to write response");
            return;
        }
        if state.restart_requested.load(Ordering::SeqCst) {
            println!("kafsd: restart requested, exiting");
            exit(0);
        }
    }
}

fn main() {
    env_logger::init();
    let (bin, mut argv) = support::args();
    let image_arg = argv.next().map(|s| PathBuf::from(s));

    let cfg = match image_arg {
        Some(p) => Config::with_image(p),
        None => Config::from_env().unwrap_or_else(|| {
            print_usage(&bin);
            exit(1);
        }),
    };

    let ctx = Context::mount(&cfg.image_path).unwrap_or_else(|e| support::error(&bin, e));
    let state = State::new();

    loop {
        match connect_and_handshake(&cfg.hotplug_socket) {
            Ok((stream, session_id, epoch)) => {
                println!("kafsd: connected (session {session_id}, epoch {epoch})");
                serve(&ctx, &state, stream);
            }
            Err(e) => {
                eprintln!("kafsd: connect to {}: {e}", cfg.hotplug_socket.display());
            }
        }
        std::thread::sleep(Duration::from_millis(500));
    }
}
