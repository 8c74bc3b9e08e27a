//! `kafsfront` mounts a KAFS image as a FUSE filesystem, translating
//! inode-addressed FUSE callbacks into the path-addressed `posix` API by
//! keeping a small path cache alongside the mounted [`Context`].

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request,
};
use kafs_core::config::Config;
use kafs_core::context::Context;
use kafs_core::hotplug::Proxy;
use kafs_core::posix::{self, Attr, Credentials};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const TTL: Duration = Duration::from_secs(1);

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;
const S_IFCHR: u32 = 0o020000;
const S_IFBLK: u32 = 0o060000;
const S_IFIFO: u32 = 0o010000;
const S_IFSOCK: u32 = 0o140000;

fn kind_of(mode: u16) -> FileType {
    match mode as u32 & S_IFMT {
        S_IFDIR => FileType::Directory,
        S_IFLNK => FileType::Symlink,
        S_IFCHR => FileType::CharDevice,
        S_IFBLK => FileType::BlockDevice,
        S_IFIFO => FileType::NamedPipe,
        S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn secs_to_time(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn file_attr(a: &Attr) -> FileAttr {
    FileAttr {
        ino: a.ino as u64,
        size: a.size,
        blocks: a.size.div_ceil(512),
        atime: secs_to_time(a.atime),
        mtime: secs_to_time(a.mtime),
        ctime: secs_to_time(a.ctime),
        crtime: secs_to_time(a.ctime),
        kind: kind_of(a.mode),
        perm: (a.mode & 0o7777) as u16,
        nlink: a.linkcnt as u32,
        uid: a.uid as u32,
        gid: a.gid as u32,
        rdev: a.rdev as u32,
        blksize: 4096,
        flags: 0,
    }
}

fn cred_of(req: &Request<'_>) -> Credentials {
    Credentials { uid: req.uid() as u16, gid: req.gid() as u16, groups: Vec::new() }
}

fn errno(e: kafs_core::Error) -> i32 {
    e.to_errno()
}

/// Splits a FUSE/`open(2)` flags bitmask into the access-mode byte `posix`
/// expects plus whether `O_TRUNC` was requested.
fn access_from_flags(flags: i32) -> (u8, bool) {
    let want = match flags & libc::O_ACCMODE {
        libc::O_WRONLY => posix::W_OK,
        libc::O_RDWR => posix::R_OK | posix::W_OK,
        _ => posix::R_OK,
    };
    (want, flags & libc::O_TRUNC != 0)
}

type Job = Box<dyn FnOnce() + Send>;

/// A fixed pool of worker threads that every filesystem callback hands its
/// work off to, so `KAFS_SINGLE_THREADED`/`KAFS_MAX_THREADS` actually gate
/// how many ops run concurrently instead of only being echoed at startup.
/// `fuser`'s session loop reads one kernel request at a time, but its
/// `Reply*` types are `Send` and may be answered from another thread, so
/// handing a job to a worker and returning lets the loop move on to the next
/// request immediately.
struct Dispatcher {
    tx: mpsc::Sender<Job>,
}

impl Dispatcher {
    fn new(workers: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            std::thread::spawn(move || loop {
                let job = rx.lock().unwrap().recv();
                match job {
                    Ok(job) => job(),
                    Err(_) => break,
                }
            });
        }
        Self { tx }
    }

    fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Box::new(job));
    }
}

/// Maps FUSE's inode-addressed calls onto the core's path-addressed `posix`
/// API by remembering each live inode's path. Hardlinked files are tracked
/// under whichever path was last seen; `posix` itself is the source of truth
/// for link counts and content.
struct PathTable {
    paths: HashMap<u64, PathBuf>,
}

impl PathTable {
    fn new() -> Self {
        let mut paths = HashMap::new();
        paths.insert(1u64, PathBuf::from("/"));
        Self { paths }
    }

    fn get(&self, ino: u64) -> Option<PathBuf> {
        self.paths.get(&ino).cloned()
    }

    fn insert(&mut self, ino: u64, path: PathBuf) {
        self.paths.insert(ino, path);
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        let base = self.get(parent)?;
        Some(base.join(name))
    }
}

struct KafsFront {
    ctx: Context,
    paths: Mutex<PathTable>,
    dispatch: Dispatcher,
}

impl KafsFront {
    fn new(ctx: Context, workers: usize) -> Self {
        Self { ctx, paths: Mutex::new(PathTable::new()), dispatch: Dispatcher::new(workers) }
    }

    fn path_str(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    /// Hands `job` to the worker pool. `job` sees `&KafsFront` through a raw
    /// pointer rather than a borrow: `fuser::mount2` owns this value for the
    /// lifetime of the mount, so it outlives every job the pool ever runs,
    /// the same convention `hotplug::Proxy`'s accept thread relies on.
    fn spawn(&self, job: impl FnOnce(&KafsFront) + Send + 'static) {
        let self_ptr = self as *const KafsFront as usize;
        self.dispatch.spawn(move || {
            let this = unsafe { &*(self_ptr as *const KafsFront) };
            job(this);
        });
    }
}

impl Filesystem for KafsFront {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let cred = cred_of(req);
        let name = name.to_owned();
        self.spawn(move |this| {
            let Some(path) = this.paths.lock().unwrap().child_path(parent, &name) else {
                reply.error(libc::ENOENT);
                return;
            };
            match posix::resolve(&this.ctx, &cred, &Self::path_str(&path)) {
                Ok(ino) => {
                    this.paths.lock().unwrap().insert(ino as u64, path);
                    reply.entry(&TTL, &file_attr(&posix::fstat(&this.ctx, ino)), 0);
                }
                Err(e) => reply.error(errno(e)),
            }
        });
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        self.spawn(move |this| {
            reply.attr(&TTL, &file_attr(&posix::fstat(&this.ctx, ino as u32)));
        });
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let cred = cred_of(req);
        self.spawn(move |this| {
            let Some(path) = this.paths.lock().unwrap().get(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            let path = Self::path_str(&path);

            if let Some(m) = mode {
                if let Err(e) = posix::chmod(&this.ctx, &cred, &path, m as u16) {
                    reply.error(errno(e));
                    return;
                }
            }
            if uid.is_some() || gid.is_some() {
                let a = posix::fstat(&this.ctx, ino as u32);
                let new_uid = uid.map(|v| v as u16).unwrap_or(a.uid);
                let new_gid = gid.map(|v| v as u16).unwrap_or(a.gid);
                if let Err(e) = posix::chown(&this.ctx, &cred, &path, new_uid, new_gid) {
                    reply.error(errno(e));
                    return;
                }
            }
            if let Some(s) = size {
                if let Err(e) = posix::truncate(&this.ctx, &cred, &path, s) {
                    reply.error(errno(e));
                    return;
                }
            }
            reply.attr(&TTL, &file_attr(&posix::fstat(&this.ctx, ino as u32)));
        });
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let cred = cred_of(req);
        let name = name.to_owned();
        self.spawn(move |this| {
            let Some(path) = this.paths.lock().unwrap().child_path(parent, &name) else {
                reply.error(libc::ENOENT);
                return;
            };
            match posix::mkdir(&this.ctx, &cred, &Self::path_str(&path), mode as u16) {
                Ok(ino) => {
                    this.paths.lock().unwrap().insert(ino as u64, path);
                    reply.entry(&TTL, &file_attr(&posix::fstat(&this.ctx, ino)), 0);
                }
                Err(e) => reply.error(errno(e)),
            }
        });
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let cred = cred_of(req);
        let name = name.to_owned();
        self.spawn(move |this| {
            let Some(path) = this.paths.lock().unwrap().child_path(parent, &name) else {
                reply.error(libc::ENOENT);
                return;
            };
            match posix::create(&this.ctx, &cred, &Self::path_str(&path), mode as u16, 0) {
                Ok(ino) => {
                    let path_str = Self::path_str(&path);
                    this.paths.lock().unwrap().insert(ino as u64, path);
                    let (want, trunc) = access_from_flags(flags);
                    let _ino = posix::open(&this.ctx, &cred, &path_str, want, trunc);
                    reply.created(&TTL, &file_attr(&posix::fstat(&this.ctx, ino)), 0, 0, 0);
                }
                Err(e) => reply.error(errno(e)),
            }
        });
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let cred = cred_of(req);
        let name = name.to_owned();
        self.spawn(move |this| {
            let Some(path) = this.paths.lock().unwrap().child_path(parent, &name) else {
                reply.error(libc::ENOENT);
                return;
            };
            match posix::unlink(&this.ctx, &cred, &Self::path_str(&path)) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno(e)),
            }
        });
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let cred = cred_of(req);
        let name = name.to_owned();
        self.spawn(move |this| {
            let Some(path) = this.paths.lock().unwrap().child_path(parent, &name) else {
                reply.error(libc::ENOENT);
                return;
            };
            match posix::rmdir(&this.ctx, &cred, &Self::path_str(&path)) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno(e)),
            }
        });
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let cred = cred_of(req);
        let name = name.to_owned();
        let newname = newname.to_owned();
        self.spawn(move |this| {
            let mut table = this.paths.lock().unwrap();
            let (Some(src), Some(dst)) =
                (table.child_path(parent, &name), table.child_path(newparent, &newname))
            else {
                reply.error(libc::ENOENT);
                return;
            };
            drop(table);
            match posix::rename(&this.ctx, &cred, &Self::path_str(&src), &Self::path_str(&dst)) {
                Ok(()) => {
                    if let Ok(ino) = posix::resolve(&this.ctx, &cred, &Self::path_str(&dst)) {
                        this.paths.lock().unwrap().insert(ino as u64, dst);
                    }
                    reply.ok()
                }
                Err(e) => reply.error(errno(e)),
            }
        });
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let cred = cred_of(req);
        let newname = newname.to_owned();
        self.spawn(move |this| {
            let mut table = this.paths.lock().unwrap();
            let (Some(old), Some(new)) = (table.get(ino), table.child_path(newparent, &newname))
            else {
                reply.error(libc::ENOENT);
                return;
            };
            drop(table);
            match posix::link(&this.ctx, &cred, &Self::path_str(&old), &Self::path_str(&new)) {
                Ok(()) => {
                    this.paths.lock().unwrap().insert(ino, new);
                    reply.entry(&TTL, &file_attr(&posix::fstat(&this.ctx, ino as u32)), 0);
                }
                Err(e) => reply.error(errno(e)),
            }
        });
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let cred = cred_of(req);
        let link_name = link_name.to_owned();
        let target = target.to_owned();
        self.spawn(move |this| {
            let Some(path) = this.paths.lock().unwrap().child_path(parent, &link_name) else {
                reply.error(libc::ENOENT);
                return;
            };
            match posix::symlink(&this.ctx, &cred, &Self::path_str(&target), &Self::path_str(&path)) {
                Ok(ino) => {
                    this.paths.lock().unwrap().insert(ino as u64, path);
                    reply.entry(&TTL, &file_attr(&posix::fstat(&this.ctx, ino)), 0);
                }
                Err(e) => reply.error(errno(e)),
            }
        });
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        self.spawn(move |this| match posix::readlink(&this.ctx, ino as u32) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(errno(e)),
        });
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let cred = cred_of(req);
        self.spawn(move |this| {
            let Some(path) = this.paths.lock().unwrap().get(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            let (want, trunc) = access_from_flags(flags);
            match posix::open(&this.ctx, &cred, &Self::path_str(&path), want, trunc) {
                Ok(_ino) => reply.opened(0, 0),
                Err(e) => reply.error(errno(e)),
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        self.spawn(move |this| {
            let data = posix::read(&this.ctx, ino as u32, offset.max(0) as u64, size as usize);
            reply.data(&data);
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let data = data.to_vec();
        self.spawn(move |this| match posix::write(&this.ctx, ino as u32, offset.max(0) as u64, &data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno(e)),
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.spawn(move |this| {
            let _ = posix::close(&this.ctx, ino as u32);
            reply.ok();
        });
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        self.spawn(move |this| match posix::fsync(&this.ctx) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(e)),
        });
    }

    fn readdir(&mut self, req: &Request<'_>, ino: u64, _fh: u64, offset: i64, reply: ReplyDirectory) {
        let cred = cred_of(req);
        self.spawn(move |this| {
            let mut reply = reply;
            let entries = match posix::readdir(&this.ctx, &cred, ino as u32) {
                Ok(e) => e,
                Err(e) => {
                    reply.error(errno(e));
                    return;
                }
            };
            let mut full = vec![(b".".to_vec(), ino as u32, FileType::Directory)];
            for (name, child) in entries {
                let kind = kind_of(posix::fstat(&this.ctx, child).mode);
                full.push((name, child, kind));
            }
            for (i, (name, child, kind)) in full.into_iter().enumerate().skip(offset as usize) {
                if reply.add(child as u64, (i + 1) as i64, kind, OsStr::from_bytes(&name)) {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let cred = cred_of(req);
        self.spawn(move |this| {
            let Some(path) = this.paths.lock().unwrap().get(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            match posix::access(&this.ctx, &cred, &Self::path_str(&path), mask as u8) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno(e)),
            }
        });
    }
}

fn print_usage(bin: &str) {
    eprintln!("Usage: {bin} <image> <mountpoint>");
    eprintln!("Reads KAFS_* variables from the environment (see kafs_core::config).");
}

fn main() {
    env_logger::init();
    let (bin, mut argv) = support::args();
    let image = argv.next().map(PathBuf::from).unwrap_or_else(|| {
        print_usage(&bin);
        exit(1);
    });
    let mountpoint = argv.next().map(PathBuf::from).unwrap_or_else(|| {
        print_usage(&bin);
        exit(1);
    });

    let cfg = Config::with_image(image);
    let mut ctx = Context::mount(&cfg.image_path).unwrap_or_else(|e| support::error(&bin, e));
    if cfg.hotplug_data_mode {
        match Proxy::listen(cfg.hotplug_socket.clone(), cfg.hotplug_wait.as_millis() as u64, cfg.hotplug_queue_cap) {
            Ok(p) => ctx.hotplug = p,
            Err(e) => eprintln!("{bin}: hotplug disabled: {e}"),
        }
    }

    let workers = if cfg.single_threaded { 1 } else { cfg.max_threads };
    let options = vec![MountOption::FSName("kafs".to_string())];
    log::info!(
        "mounting {} at {} (workers={})",
        cfg.image_path.display(),
        mountpoint.display(),
        workers,
    );

    let fs = KafsFront::new(ctx, workers);
    fuser::mount2(fs, &mountpoint, &options).unwrap_or_else(|e| support::error(&bin, e));
}
