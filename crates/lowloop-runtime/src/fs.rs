//! File-system operations on the worker pool.
//!
//! Every operation has an async form on [`LoopContext`] (the continuation
//! receives a `LoopResult`) and a sync form on [`EngineHandle`] that blocks
//! the caller until a worker finishes. Reads and stats use the read lane;
//! anything that mutates the file system uses the modify lane.
//!
//! Open files are `File`-kind descriptors advertised in the registry, so a
//! script can refer to them by their integer handle.

use std::ffi::OsString;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lowloop_core::{kdebug, Descriptor, DescriptorKind, Interest, LoopError, LoopResult, Pollable};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use crate::blocking::{FnOp, PendingJob};
use crate::engine::EngineHandle;
use crate::event_loop::LoopContext;
use crate::pool::Lane;

/// Open flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
    pub exclusive: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        OpenFlags {
            read: true,
            ..Default::default()
        }
    }

    /// Parse a node-style flag string: `r`, `r+`, `w`, `w+`, `a`, `a+`,
    /// with an optional `x` for exclusive create.
    pub fn parse(text: &str) -> Option<Self> {
        let exclusive = text.contains('x');
        let base: String = text.chars().filter(|c| *c != 'x' && *c != 's').collect();
        let mut f = match base.as_str() {
            "r" => OpenFlags::read_only(),
            "r+" => OpenFlags {
                read: true,
                write: true,
                ..Default::default()
            },
            "w" => OpenFlags {
                write: true,
                create: true,
                truncate: true,
                ..Default::default()
            },
            "w+" => OpenFlags {
                read: true,
                write: true,
                create: true,
                truncate: true,
                ..Default::default()
            },
            "a" => OpenFlags {
                write: true,
                create: true,
                append: true,
                ..Default::default()
            },
            "a+" => OpenFlags {
                read: true,
                write: true,
                create: true,
                append: true,
                ..Default::default()
            },
            _ => return None,
        };
        if exclusive {
            if !f.create {
                return None;
            }
            f.exclusive = true;
        }
        Some(f)
    }

    pub fn to_oflag(self) -> OFlag {
        let mut o = match (self.read, self.write) {
            (_, false) => OFlag::O_RDONLY,
            (false, true) => OFlag::O_WRONLY,
            (true, true) => OFlag::O_RDWR,
        };
        if self.create {
            o |= OFlag::O_CREAT;
        }
        if self.truncate {
            o |= OFlag::O_TRUNC;
        }
        if self.append {
            o |= OFlag::O_APPEND;
        }
        if self.exclusive {
            o |= OFlag::O_EXCL;
        }
        o | OFlag::O_CLOEXEC
    }
}

/// The parts of `stat(2)` callers ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime_ms: i64,
    pub mtime_ms: i64,
    pub ctime_ms: i64,
}

impl FileStat {
    fn from_raw(st: &libc::stat) -> Self {
        FileStat {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            mode: st.st_mode as u32,
            nlink: st.st_nlink as u64,
            uid: st.st_uid,
            gid: st.st_gid,
            size: st.st_size as u64,
            blksize: st.st_blksize as u64,
            blocks: st.st_blocks as u64,
            atime_ms: st.st_atime as i64 * 1000 + st.st_atime_nsec as i64 / 1_000_000,
            mtime_ms: st.st_mtime as i64 * 1000 + st.st_mtime_nsec as i64 / 1_000_000,
            ctime_ms: st.st_ctime as i64 * 1000 + st.st_ctime_nsec as i64 / 1_000_000,
        }
    }

    fn from_metadata(m: &std::fs::Metadata) -> Self {
        FileStat {
            dev: m.dev(),
            ino: m.ino(),
            mode: m.mode(),
            nlink: m.nlink(),
            uid: m.uid(),
            gid: m.gid(),
            size: m.size(),
            blksize: m.blksize(),
            blocks: m.blocks(),
            atime_ms: m.atime() * 1000 + m.atime_nsec() / 1_000_000,
            mtime_ms: m.mtime() * 1000 + m.mtime_nsec() / 1_000_000,
            ctime_ms: m.ctime() * 1000 + m.ctime_nsec() / 1_000_000,
        }
    }

    pub fn is_file(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }
}

/// An open file. Never polled; registered so it has a script handle.
pub struct FileHandle {
    d: Descriptor,
    path: PathBuf,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("fd", &self.d.fd())
            .field("path", &self.path)
            .finish()
    }
}

impl FileHandle {
    fn new(fd: i32, path: PathBuf) -> Arc<FileHandle> {
        Arc::new(FileHandle {
            d: Descriptor::with_fd(DescriptorKind::File, fd),
            path,
        })
    }

    #[inline]
    pub fn fd(&self) -> i32 {
        self.d.fd()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.d.fd() < 0
    }

    fn live_fd(&self, syscall: &'static str) -> LoopResult<i32> {
        match self.d.fd() {
            fd if fd >= 0 => Ok(fd),
            _ => Err(LoopError::os(libc::EBADF, syscall)),
        }
    }

    /// Read up to `len` bytes, at `pos` if given, else at the file offset.
    pub fn read_blocking(&self, pos: Option<u64>, len: usize) -> LoopResult<Vec<u8>> {
        let fd = self.live_fd("read")?;
        let mut buf = vec![0u8; len];
        let n = loop {
            let n = unsafe {
                match pos {
                    Some(off) => libc::pread(
                        fd,
                        buf.as_mut_ptr() as *mut libc::c_void,
                        len,
                        off as libc::off_t,
                    ),
                    None => libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, len),
                }
            };
            if n >= 0 {
                break n as usize;
            }
            let err = LoopError::last_os(if pos.is_some() { "pread" } else { "read" });
            if err.errno() != Some(libc::EINTR) {
                return Err(err);
            }
        };
        buf.truncate(n);
        Ok(buf)
    }

    /// Write `data`, at `pos` if given. Returns the byte count written.
    pub fn write_blocking(&self, pos: Option<u64>, data: &[u8]) -> LoopResult<usize> {
        let fd = self.live_fd("write")?;
        loop {
            let n = unsafe {
                match pos {
                    Some(off) => libc::pwrite(
                        fd,
                        data.as_ptr() as *const libc::c_void,
                        data.len(),
                        off as libc::off_t,
                    ),
                    None => libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()),
                }
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = LoopError::last_os(if pos.is_some() { "pwrite" } else { "write" });
            if err.errno() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    pub fn fstat_blocking(&self) -> LoopResult<FileStat> {
        let fd = self.live_fd("fstat")?;
        let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd, st.as_mut_ptr()) } < 0 {
            return Err(LoopError::last_os("fstat"));
        }
        Ok(FileStat::from_raw(unsafe { &st.assume_init() }))
    }

    fn close_blocking(&self) -> LoopResult<()> {
        let fd = self.d.take_fd();
        if fd < 0 {
            return Err(LoopError::os(libc::EBADF, "close"));
        }
        nix::unistd::close(fd).map_err(|e| LoopError::os(e as i32, "close"))
    }
}

impl Pollable for FileHandle {
    fn descriptor(&self) -> &Descriptor {
        &self.d
    }

    fn on_readiness(&self, _ready: Interest) -> bool {
        true
    }
}

fn open_blocking(path: &Path, flags: OpenFlags, mode: u32) -> LoopResult<i32> {
    nix::fcntl::open(path, flags.to_oflag(), Mode::from_bits_truncate(mode as libc::mode_t))
        .map_err(|e| LoopError::os(e as i32, "open"))
}

fn stat_blocking(path: &Path) -> LoopResult<FileStat> {
    std::fs::metadata(path)
        .map(|m| FileStat::from_metadata(&m))
        .map_err(|e| LoopError::from_io(&e, "stat"))
}

fn rename_blocking(from: &Path, to: &Path) -> LoopResult<()> {
    std::fs::rename(from, to).map_err(|e| LoopError::from_io(&e, "rename"))
}

fn unlink_blocking(path: &Path) -> LoopResult<()> {
    nix::unistd::unlink(path).map_err(|e| LoopError::os(e as i32, "unlink"))
}

fn mkdir_blocking(path: &Path, recursive: bool, mode: u32) -> LoopResult<()> {
    std::fs::DirBuilder::new()
        .recursive(recursive)
        .mode(mode)
        .create(path)
        .map_err(|e| LoopError::from_io(&e, "mkdir"))
}

fn readdir_blocking(path: &Path) -> LoopResult<Vec<OsString>> {
    let entries = std::fs::read_dir(path).map_err(|e| LoopError::from_io(&e, "scandir"))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| LoopError::from_io(&e, "scandir"))?;
        names.push(entry.file_name());
    }
    names.sort();
    Ok(names)
}

/// Register a freshly opened fd. On failure the fd is closed.
fn register(handle: &EngineHandle, fd: i32, path: PathBuf) -> LoopResult<Arc<FileHandle>> {
    let file = FileHandle::new(fd, path);
    if let Err(e) = handle.advertise(file.clone()) {
        file.d.close_native();
        return Err(e);
    }
    Ok(file)
}

/// Withdraw before the worker closes, so a recycled fd number never meets
/// a stale registry entry.
fn unregister(handle: &EngineHandle, file: &Arc<FileHandle>) {
    handle.registry().withdraw(file.as_ref());
}

fn finish_close(handle: &EngineHandle, file: Arc<FileHandle>) {
    let obj: Arc<dyn Pollable> = file;
    handle.retire(&obj);
}

type Done<T> = Box<dyn FnOnce(&mut LoopContext, LoopResult<T>) -> LoopResult<()>>;

impl LoopContext {
    fn fs_job<T: Send + 'static>(
        &mut self,
        lane: Lane,
        work: impl FnOnce() -> LoopResult<T> + Send + 'static,
        cb: Done<T>,
    ) -> LoopResult<PendingJob> {
        self.submit_blocking(FnOp::new(lane, work), move |cx, out| match out {
            Some(result) => cb(cx, result),
            None => cb(cx, Err(LoopError::os(libc::ECANCELED, "fs"))),
        })
    }

    pub fn fs_open(
        &mut self,
        path: impl Into<PathBuf>,
        flags: OpenFlags,
        mode: u32,
        cb: impl FnOnce(&mut LoopContext, LoopResult<Arc<FileHandle>>) -> LoopResult<()> + 'static,
    ) -> LoopResult<PendingJob> {
        let path = path.into();
        let worker_path = path.clone();
        let lane = if flags.write || flags.create { Lane::Modify } else { Lane::Read };
        self.fs_job(
            lane,
            move || open_blocking(&worker_path, flags, mode),
            Box::new(move |cx, res: LoopResult<i32>| {
                let res = res.and_then(|fd| register(cx.handle(), fd, path));
                cb(cx, res)
            }),
        )
    }

    pub fn fs_read(
        &mut self,
        file: &Arc<FileHandle>,
        pos: Option<u64>,
        len: usize,
        cb: impl FnOnce(&mut LoopContext, LoopResult<Vec<u8>>) -> LoopResult<()> + 'static,
    ) -> LoopResult<PendingJob> {
        let file = file.clone();
        self.fs_job(Lane::Read, move || file.read_blocking(pos, len), Box::new(cb))
    }

    pub fn fs_write(
        &mut self,
        file: &Arc<FileHandle>,
        pos: Option<u64>,
        data: Vec<u8>,
        cb: impl FnOnce(&mut LoopContext, LoopResult<usize>) -> LoopResult<()> + 'static,
    ) -> LoopResult<PendingJob> {
        let file = file.clone();
        self.fs_job(Lane::Modify, move || file.write_blocking(pos, &data), Box::new(cb))
    }

    pub fn fs_fstat(
        &mut self,
        file: &Arc<FileHandle>,
        cb: impl FnOnce(&mut LoopContext, LoopResult<FileStat>) -> LoopResult<()> + 'static,
    ) -> LoopResult<PendingJob> {
        let file = file.clone();
        self.fs_job(Lane::Read, move || file.fstat_blocking(), Box::new(cb))
    }

    pub fn fs_close(
        &mut self,
        file: &Arc<FileHandle>,
        cb: impl FnOnce(&mut LoopContext, LoopResult<()>) -> LoopResult<()> + 'static,
    ) -> LoopResult<PendingJob> {
        unregister(self.handle(), file);
        let worker_file = file.clone();
        let file = file.clone();
        self.fs_job(
            Lane::Modify,
            move || worker_file.close_blocking(),
            Box::new(move |cx, res| {
                finish_close(cx.handle(), file);
                cb(cx, res)
            }),
        )
    }

    pub fn fs_stat(
        &mut self,
        path: impl Into<PathBuf>,
        cb: impl FnOnce(&mut LoopContext, LoopResult<FileStat>) -> LoopResult<()> + 'static,
    ) -> LoopResult<PendingJob> {
        let path = path.into();
        self.fs_job(Lane::Read, move || stat_blocking(&path), Box::new(cb))
    }

    pub fn fs_rename(
        &mut self,
        from: impl Into<PathBuf>,
        to: impl Into<PathBuf>,
        cb: impl FnOnce(&mut LoopContext, LoopResult<()>) -> LoopResult<()> + 'static,
    ) -> LoopResult<PendingJob> {
        let (from, to) = (from.into(), to.into());
        self.fs_job(Lane::Modify, move || rename_blocking(&from, &to), Box::new(cb))
    }

    pub fn fs_unlink(
        &mut self,
        path: impl Into<PathBuf>,
        cb: impl FnOnce(&mut LoopContext, LoopResult<()>) -> LoopResult<()> + 'static,
    ) -> LoopResult<PendingJob> {
        let path = path.into();
        self.fs_job(Lane::Modify, move || unlink_blocking(&path), Box::new(cb))
    }

    pub fn fs_mkdir(
        &mut self,
        path: impl Into<PathBuf>,
        recursive: bool,
        mode: u32,
        cb: impl FnOnce(&mut LoopContext, LoopResult<()>) -> LoopResult<()> + 'static,
    ) -> LoopResult<PendingJob> {
        let path = path.into();
        self.fs_job(Lane::Modify, move || mkdir_blocking(&path, recursive, mode), Box::new(cb))
    }

    pub fn fs_readdir(
        &mut self,
        path: impl Into<PathBuf>,
        cb: impl FnOnce(&mut LoopContext, LoopResult<Vec<OsString>>) -> LoopResult<()> + 'static,
    ) -> LoopResult<PendingJob> {
        let path = path.into();
        self.fs_job(Lane::Read, move || readdir_blocking(&path), Box::new(cb))
    }

    /// Open, read to the end and close in one worker trip.
    pub fn fs_read_file(
        &mut self,
        path: impl Into<PathBuf>,
        cb: impl FnOnce(&mut LoopContext, LoopResult<Vec<u8>>) -> LoopResult<()> + 'static,
    ) -> LoopResult<PendingJob> {
        let path = path.into();
        self.fs_job(
            Lane::Read,
            move || std::fs::read(&path).map_err(|e| LoopError::from_io(&e, "open")),
            Box::new(cb),
        )
    }
}

impl EngineHandle {
    fn fs_sync<T: Send + 'static>(
        &self,
        lane: Lane,
        work: impl FnOnce() -> LoopResult<T> + Send + 'static,
    ) -> LoopResult<T> {
        match self.run_sync(FnOp::new(lane, work))? {
            Some(result) => result,
            None => Err(LoopError::os(libc::ECANCELED, "fs")),
        }
    }

    pub fn fs_open_sync(
        &self,
        path: impl Into<PathBuf>,
        flags: OpenFlags,
        mode: u32,
    ) -> LoopResult<Arc<FileHandle>> {
        let path = path.into();
        let worker_path = path.clone();
        let lane = if flags.write || flags.create { Lane::Modify } else { Lane::Read };
        let fd = self.fs_sync(lane, move || open_blocking(&worker_path, flags, mode))?;
        kdebug!("opened {} as fd {}", path.display(), fd);
        register(self, fd, path)
    }

    pub fn fs_read_sync(
        &self,
        file: &Arc<FileHandle>,
        pos: Option<u64>,
        len: usize,
    ) -> LoopResult<Vec<u8>> {
        let file = file.clone();
        self.fs_sync(Lane::Read, move || file.read_blocking(pos, len))
    }

    pub fn fs_write_sync(&self, file: &Arc<FileHandle>, pos: Option<u64>, data: Vec<u8>) -> LoopResult<usize> {
        let file = file.clone();
        self.fs_sync(Lane::Modify, move || file.write_blocking(pos, &data))
    }

    pub fn fs_fstat_sync(&self, file: &Arc<FileHandle>) -> LoopResult<FileStat> {
        let file = file.clone();
        self.fs_sync(Lane::Read, move || file.fstat_blocking())
    }

    pub fn fs_close_sync(&self, file: &Arc<FileHandle>) -> LoopResult<()> {
        unregister(self, file);
        let worker_file = file.clone();
        let res = self.fs_sync(Lane::Modify, move || worker_file.close_blocking());
        finish_close(self, file.clone());
        res
    }

    pub fn fs_stat_sync(&self, path: impl Into<PathBuf>) -> LoopResult<FileStat> {
        let path = path.into();
        self.fs_sync(Lane::Read, move || stat_blocking(&path))
    }

    pub fn fs_rename_sync(&self, from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> LoopResult<()> {
        let (from, to) = (from.into(), to.into());
        self.fs_sync(Lane::Modify, move || rename_blocking(&from, &to))
    }

    pub fn fs_unlink_sync(&self, path: impl Into<PathBuf>) -> LoopResult<()> {
        let path = path.into();
        self.fs_sync(Lane::Modify, move || unlink_blocking(&path))
    }

    pub fn fs_mkdir_sync(&self, path: impl Into<PathBuf>, recursive: bool, mode: u32) -> LoopResult<()> {
        let path = path.into();
        self.fs_sync(Lane::Modify, move || mkdir_blocking(&path, recursive, mode))
    }

    pub fn fs_readdir_sync(&self, path: impl Into<PathBuf>) -> LoopResult<Vec<OsString>> {
        let path = path.into();
        self.fs_sync(Lane::Read, move || readdir_blocking(&path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::event_loop::DefaultHost;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn engine() -> Engine {
        let config = EngineConfig::new()
            .num_workers(2)
            .install_signals(false)
            .stdio_baseline(false);
        Engine::new(config, Box::new(DefaultHost)).unwrap()
    }

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lowloop-fs-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_parse_flags() {
        assert_eq!(OpenFlags::parse("r"), Some(OpenFlags::read_only()));
        let w = OpenFlags::parse("w+").unwrap();
        assert!(w.read && w.write && w.create && w.truncate);
        let ax = OpenFlags::parse("ax").unwrap();
        assert!(ax.append && ax.exclusive);
        assert!(OpenFlags::parse("rx").is_none());
        assert!(OpenFlags::parse("q").is_none());
        assert!(OpenFlags::read_only().to_oflag().contains(OFlag::O_CLOEXEC));
    }

    #[test]
    fn test_sync_round_trip() {
        let e = engine();
        let dir = scratch("sync");
        let path = dir.join("a.txt");
        let h = e.handle();

        let f = h.fs_open_sync(&path, OpenFlags::parse("w+").unwrap(), 0o644).unwrap();
        assert!(h.registry().get(f.fd()).is_some());
        assert_eq!(h.fs_write_sync(&f, None, b"hello world".to_vec()).unwrap(), 11);
        assert_eq!(h.fs_read_sync(&f, Some(6), 64).unwrap(), b"world");
        assert_eq!(h.fs_fstat_sync(&f).unwrap().size, 11);
        let fd = f.fd();
        h.fs_close_sync(&f).unwrap();
        assert!(f.is_closed());
        assert!(h.registry().get(fd).is_none());
        assert_eq!(h.fs_read_sync(&f, None, 1).unwrap_err().code(), "EBADF");

        let st = h.fs_stat_sync(&path).unwrap();
        assert!(st.is_file());
        h.fs_mkdir_sync(dir.join("x/y"), true, 0o755).unwrap();
        assert!(h.fs_stat_sync(dir.join("x/y")).unwrap().is_dir());
        h.fs_rename_sync(&path, dir.join("b.txt")).unwrap();
        let names = h.fs_readdir_sync(&dir).unwrap();
        assert_eq!(names, vec![OsString::from("b.txt"), OsString::from("x")]);
        h.fs_unlink_sync(dir.join("b.txt")).unwrap();
        assert_eq!(h.fs_stat_sync(dir.join("b.txt")).unwrap_err().code(), "ENOENT");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_open_missing_reports_errno_and_syscall() {
        let e = engine();
        let err = e
            .handle()
            .fs_open_sync("/nonexistent/lowloop/file", OpenFlags::read_only(), 0)
            .unwrap_err();
        assert_eq!(err.code(), "ENOENT");
        assert_eq!(err.syscall(), Some("open"));
    }

    #[test]
    fn test_async_open_read_close() {
        let mut e = engine();
        let dir = scratch("async");
        let path = dir.join("data.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let log = Rc::new(RefCell::new(Vec::<String>::new()));
        e.with_context(|cx| {
            let log = log.clone();
            cx.fs_open(&path, OpenFlags::read_only(), 0, move |cx, res| {
                let file = res?;
                log.borrow_mut().push("open".into());
                let log2 = log.clone();
                cx.fs_read(&file.clone(), Some(2), 4, move |cx, res| {
                    log2.borrow_mut().push(String::from_utf8(res?).unwrap_or_default());
                    let log3 = log2.clone();
                    cx.fs_close(&file, move |cx, res| {
                        res?;
                        assert!(cx.handle().registry().is_empty());
                        log3.borrow_mut().push("closed".into());
                        Ok(())
                    })?;
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap();
        });
        e.run().unwrap();
        assert_eq!(*log.borrow(), vec!["open", "2345", "closed"]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_async_error_reaches_callback() {
        let mut e = engine();
        let seen = Rc::new(RefCell::new(None));
        e.with_context(|cx| {
            let seen = seen.clone();
            cx.fs_stat("/nonexistent/lowloop", move |_, res| {
                *seen.borrow_mut() = res.err().map(|e| e.code());
                Ok(())
            })
            .unwrap();
        });
        e.run().unwrap();
        assert_eq!(seen.borrow().as_deref(), Some("ENOENT"));
    }
}
