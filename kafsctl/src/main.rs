//! `kafsctl` issues a single control RPC against a running `kafsfront`'s
//! hotplug socket and prints the result: status, protocol compatibility,
//! a restart request, the peer's reconnect timeout, or its environment
//! overrides.

use kafs_core::config::Config;
use kafs_core::hotplug::wire::{self, Op, RequestHeader, ResponseHeader};
use kafs_core::hotplug::{PROTOCOL_MAJOR, PROTOCOL_MINOR};
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::process::exit;

fn print_usage(bin: &str) {
    eprintln!("Usage: {bin} <command> [args...]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  status                  report peer connection state");
    eprintln!("  compat                  report the peer's protocol version");
    eprintln!("  restart                 ask the peer to exit so a supervisor restarts it");
    eprintln!("  set-timeout <ms>        set the peer's reconnect wait timeout");
    eprintln!("  env-list                list the peer's environment overrides");
    eprintln!("  env-set <key> <value>   set an environment override");
    eprintln!("  env-unset <key>         remove an environment override");
    eprintln!();
    eprintln!("Reads KAFS_HOTPLUG_SOCKET (and KAFS_IMAGE) from the environment.");
}

fn hello_payload() -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.extend_from_slice(&PROTOCOL_MAJOR.to_ne_bytes());
    buf.extend_from_slice(&PROTOCOL_MINOR.to_ne_bytes());
    buf
}

/// Connects to the front, completes the `HELLO`/`SESSION_RESTORE` handshake
/// as a one-shot peer, sends a single request, and returns its response.
fn call(socket: &std::path::Path, op: Op, payload: &[u8]) -> std::io::Result<(i32, Vec<u8>)> {
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

    let restore = RequestHeader::read_from(&mut stream)?;
    let _ = wire::read_payload(&mut stream, restore.payload_len)?;
    ResponseHeader { req_id: restore.req_id, result: 0, payload_len: 0 }.write_to(&mut stream)?;

    let header = RequestHeader {
        op: op as u32,
        flags: wire::FLAG_ENDIAN_HOST,
        req_id: 1,
        session_id: restore.session_id,
        epoch: restore.epoch,
        payload_len: payload.len() as u32,
    };
    header.write_to(&mut stream)?;
    stream.write_all(payload)?;

    let resp = ResponseHeader::read_from(&mut stream)?;
    let body = wire::read_payload(&mut stream, resp.payload_len)?;
    Ok((resp.result, body))
}

fn encode_kv(key: &str, val: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(key.len() as u16).to_ne_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(&(val.len() as u16).to_ne_bytes());
    buf.extend_from_slice(val.as_bytes());
    buf
}

fn encode_key(key: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(key.len() as u16).to_ne_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf
}

fn print_env_list(body: &[u8]) {
    if body.len() < 4 {
        println!("(empty)");
        return;
    }
    let count = u32::from_ne_bytes(body[0..4].try_into().unwrap());
    let mut off = 4usize;
    for _ in 0..count {
        if off + 2 > body.len() {
            break;
        }
        let klen = u16::from_ne_bytes(body[off..off + 2].try_into().unwrap()) as usize;
        off += 2;
        let key = String::from_utf8_lossy(&body[off..off + klen]).into_owned();
        off += klen;
        let vlen = u16::from_ne_bytes(body[off..off + 2].try_into().unwrap()) as usize;
        off += 2;
        let val = String::from_utf8_lossy(&body[off..off + vlen]).into_owned();
        off += vlen;
        println!("{key}={val}");
    }
}

fn main() {
    let (bin, argv) = support::args();
    let mut args: Vec<String> = argv.map(|s| s.to_string_lossy().into_owned()).collect();
    if args.is_empty() {
        print_usage(&bin);
        exit(1);
    }
    let cmd = args.remove(0);

    let cfg = Config::from_env().unwrap_or_else(|| support::error(&bin, "KAFS_IMAGE is not set"));

    let (op, payload) = match cmd.as_str() {
        "status" => (Op::CtrlStatus, Vec::new()),
        "compat" => (Op::CtrlCompat, Vec::new()),
        "restart" => (Op::CtrlRestart, Vec::new()),
        "set-timeout" => {
            let ms: u64 = args
                .first()
                .unwrap_or_else(|| support::error(&bin, "set-timeout requires <ms>"))
                .parse()
                .unwrap_or_else(|_| support::error(&bin, "invalid timeout"));
            (Op::CtrlSetTimeout, ms.to_ne_bytes().to_vec())
        }
        "env-list" => (Op::CtrlEnvList, Vec::new()),
        "env-set" => {
            if args.len() < 2 {
                support::error(&bin, "env-set requires <key> <value>");
            }
            (Op::CtrlEnvSet, encode_kv(&args[0], &args[1]))
        }
        "env-unset" => {
            if args.is_empty() {
                support::error(&bin, "env-unset requires <key>");
            }
            (Op::CtrlEnvUnset, encode_key(&args[0]))
        }
        "-h" | "--help" => {
            print_usage(&bin);
            return;
        }
        other => support::error(&bin, format!("unknown command `{other}`")),
    };

    let (result, body) = call(&cfg.hotplug_socket, op, &payload)
        .unwrap_or_else(|e| support::error(&bin, format!("{}: {e}", cfg.hotplug_socket.display())));

    if result != 0 {
        support::error(&bin, format!("peer returned error {result}"));
    }

    match op {
        Op::CtrlStatus => println!("{}", String::from_utf8_lossy(&body)),
        Op::CtrlCompat => {
            if body.len() >= 8 {
                let major = u32::from_ne_bytes(body[0..4].try_into().unwrap());
                let minor = u32::from_ne_bytes(body[4..8].try_into().unwrap());
                println!("peer protocol {major}.{minor}");
            }
        }
        Op::CtrlEnvList => print_env_list(&body),
        _ => {}
    }
}
