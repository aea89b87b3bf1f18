//! Filesystem operations.
//!
//! Every operation is one description (`FsOp`) executed by a worker thread
//! for the asynchronous form, or inline for the synchronous form. The
//! result projects per operation family: nothing for mutators, an integer
//! for `open`/`write`/`sendfile`, a [`Stat`] record for the stat family,
//! bytes for `read`, a path for `readlink`, and an entry list for
//! `readdir`.

use std::ffi::{CStr, CString};
use std::mem;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::context::Context;
use crate::error::{Errno, Error, Result};
use crate::request::{Continuation, Request, RequestKind};
use crate::work::Job;

/// Stat record with the flattened numeric fields plus kind booleans.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u64,
    pub nlink: u64,
    pub uid: u64,
    pub gid: u64,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub is_file: bool,
    pub is_directory: bool,
    pub is_character_device: bool,
    pub is_block_device: bool,
    pub is_fifo: bool,
    pub is_symbolic_link: bool,
    pub is_socket: bool,
}

impl From<libc::stat> for Stat {
    fn from(st: libc::stat) -> Stat {
        let kind = st.st_mode & libc::S_IFMT;
        Stat {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            mode: st.st_mode as u64,
            nlink: st.st_nlink as u64,
            uid: st.st_uid as u64,
            gid: st.st_gid as u64,
            rdev: st.st_rdev as u64,
            size: st.st_size as u64,
            blksize: st.st_blksize as u64,
            blocks: st.st_blocks as u64,
            atime: st.st_atime as u64,
            mtime: st.st_mtime as u64,
            ctime: st.st_ctime as u64,
            is_file: kind == libc::S_IFREG,
            is_directory: kind == libc::S_IFDIR,
            is_character_device: kind == libc::S_IFCHR,
            is_block_device: kind == libc::S_IFBLK,
            is_fifo: kind == libc::S_IFIFO,
            is_symbolic_link: kind == libc::S_IFLNK,
            is_socket: kind == libc::S_IFSOCK,
        }
    }
}

/// Projected result of a filesystem operation.
#[derive(Clone, Debug, PartialEq)]
pub enum FsValue {
    None,
    Int(i64),
    Stat(Stat),
    Path(String),
    Data(Vec<u8>),
    Entries(Vec<String>),
}

pub type FsResult = std::result::Result<FsValue, Errno>;

/// Description of one operation, complete enough to execute on any thread.
pub(crate) enum FsOp {
    Open { path: CString, flags: i32, mode: u32 },
    Close { fd: RawFd },
    Read { fd: RawFd, len: usize, offset: i64 },
    Write { fd: RawFd, data: Vec<u8>, offset: i64 },
    Stat { path: CString },
    Lstat { path: CString },
    Fstat { fd: RawFd },
    Unlink { path: CString },
    Mkdir { path: CString, mode: u32 },
    Rmdir { path: CString },
    Readdir { path: CString },
    Rename { from: CString, to: CString },
    Fsync { fd: RawFd },
    Fdatasync { fd: RawFd },
    Ftruncate { fd: RawFd, len: i64 },
    Sendfile { out_fd: RawFd, in_fd: RawFd, offset: i64, len: usize },
    Chmod { path: CString, mode: u32 },
    Fchmod { fd: RawFd, mode: u32 },
    Utime { path: CString, atime: f64, mtime: f64 },
    Futime { fd: RawFd, atime: f64, mtime: f64 },
    Link { from: CString, to: CString },
    Symlink { from: CString, to: CString },
    Readlink { path: CString },
    Chown { path: CString, uid: u32, gid: u32 },
    Fchown { fd: RawFd, uid: u32, gid: u32 },
}

pub(crate) struct FsOutcome(FsResult);

impl FsOutcome {
    pub(crate) fn cancelled() -> FsOutcome {
        FsOutcome(Err(Errno::ECANCELED))
    }
}

const FS_QUEUED: u8 = 0;
const FS_RUNNING: u8 = 1;
const FS_CANCELLED: u8 = 2;

pub(crate) struct FsReq {
    state: Arc<AtomicU8>,
    cont: Continuation<FsResult>,
}

impl FsReq {
    /// Cancel if still queued. The worker observes the flag before running
    /// the operation and reports `ECANCELED`.
    pub(crate) fn cancel(&self) -> bool {
        self.state
            .compare_exchange(FS_QUEUED, FS_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Mark an op started; `false` when it was cancelled first.
pub(crate) fn fs_claim(state: &AtomicU8) -> bool {
    state
        .compare_exchange(FS_QUEUED, FS_RUNNING, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

macro_rules! fs_fronts {
    ($( $(#[$doc:meta])* $name:ident / $sync:ident ($($arg:ident : $ty:ty),*) -> $ret:ty => $build:expr, $project:expr; )*) => {
        impl Context {
            $(
                $(#[$doc])*
                pub fn $name(
                    &mut self,
                    $($arg: $ty,)*
                    cont: Continuation<FsResult>,
                ) -> Result<Request> {
                    let op: Result<FsOp> = ($build)($($arg),*);
                    Ok(self.fs_submit(op?, cont))
                }

                /// Synchronous form.
                pub fn $sync(&mut self, $($arg: $ty),*) -> Result<$ret> {
                    let op: Result<FsOp> = ($build)($($arg),*);
                    let FsOutcome(result) = run_fs_op(&op?);
                    let value = result.map_err(Error::Sys)?;
                    ($project)(value)
                }
            )*
        }
    };
}

fn path_arg(index: u8, path: &str) -> Result<CString> {
    CString::new(path).map_err(|_| Error::arg(index, "path without interior nul"))
}

/// Parse an open-mode string: one of `r`, `r+`, `w`, `w+`, `a`, `a+`.
fn parse_open_flags(flags: &str) -> Result<i32> {
    let flags = match flags {
        "r" => libc::O_RDONLY,
        "r+" => libc::O_RDWR,
        "w" => libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
        "w+" => libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC,
        "a" => libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND,
        "a+" => libc::O_RDWR | libc::O_CREAT | libc::O_APPEND,
        _ => return Err(Error::arg(2, "open mode string")),
    };
    Ok(flags | libc::O_CLOEXEC)
}

fn expect_int(value: FsValue) -> Result<i64> {
    match value {
        FsValue::Int(n) => Ok(n),
        _ => Err(Error::State("unexpected fs result shape")),
    }
}

fn expect_none(value: FsValue) -> Result<()> {
    match value {
        FsValue::None => Ok(()),
        _ => Err(Error::State("unexpected fs result shape")),
    }
}

fn expect_stat(value: FsValue) -> Result<Stat> {
    match value {
        FsValue::Stat(stat) => Ok(stat),
        _ => Err(Error::State("unexpected fs result shape")),
    }
}

fn expect_data(value: FsValue) -> Result<Vec<u8>> {
    match value {
        FsValue::Data(data) => Ok(data),
        _ => Err(Error::State("unexpected fs result shape")),
    }
}

fn expect_path(value: FsValue) -> Result<String> {
    match value {
        FsValue::Path(path) => Ok(path),
        _ => Err(Error::State("unexpected fs result shape")),
    }
}

fn expect_entries(value: FsValue) -> Result<Vec<String>> {
    match value {
        FsValue::Entries(entries) => Ok(entries),
        _ => Err(Error::State("unexpected fs result shape")),
    }
}

fs_fronts! {
    /// Open a file; the mode string follows the host convention
    /// (`"r"`, `"r+"`, `"w"`, `"w+"`, `"a"`, `"a+"`).
    fs_open/fs_open_sync(path: &str, flags: &str, mode: u32) -> i64 =>
        |path, flags, mode| Ok(FsOp::Open { path: path_arg(1, path)?, flags: parse_open_flags(flags)?, mode }),
        expect_int;
    fs_close/fs_close_sync(fd: RawFd) -> () =>
        |fd| Ok(FsOp::Close { fd }), expect_none;
    /// Read up to `len` bytes at `offset` (`-1` for the current position).
    fs_read/fs_read_sync(fd: RawFd, len: usize, offset: i64) -> Vec<u8> =>
        |fd, len, offset| Ok(FsOp::Read { fd, len, offset }), expect_data;
    /// Write `data` at `offset` (`-1` for the current position); projects
    /// the byte count.
    fs_write/fs_write_sync(fd: RawFd, data: Vec<u8>, offset: i64) -> i64 =>
        |fd, data, offset| Ok(FsOp::Write { fd, data, offset }), expect_int;
    fs_stat/fs_stat_sync(path: &str) -> Stat =>
        |path| Ok(FsOp::Stat { path: path_arg(1, path)? }), expect_stat;
    fs_lstat/fs_lstat_sync(path: &str) -> Stat =>
        |path| Ok(FsOp::Lstat { path: path_arg(1, path)? }), expect_stat;
    fs_fstat/fs_fstat_sync(fd: RawFd) -> Stat =>
        |fd| Ok(FsOp::Fstat { fd }), expect_stat;
    fs_unlink/fs_unlink_sync(path: &str) -> () =>
        |path| Ok(FsOp::Unlink { path: path_arg(1, path)? }), expect_none;
    fs_mkdir/fs_mkdir_sync(path: &str, mode: u32) -> () =>
        |path, mode| Ok(FsOp::Mkdir { path: path_arg(1, path)?, mode }), expect_none;
    fs_rmdir/fs_rmdir_sync(path: &str) -> () =>
        |path| Ok(FsOp::Rmdir { path: path_arg(1, path)? }), expect_none;
    /// Directory entries, `.` and `..` excluded.
    fs_readdir/fs_readdir_sync(path: &str) -> Vec<String> =>
        |path| Ok(FsOp::Readdir { path: path_arg(1, path)? }), expect_entries;
    fs_rename/fs_rename_sync(from: &str, to: &str) -> () =>
        |from, to| Ok(FsOp::Rename { from: path_arg(1, from)?, to: path_arg(2, to)? }), expect_none;
    fs_fsync/fs_fsync_sync(fd: RawFd) -> () =>
        |fd| Ok(FsOp::Fsync { fd }), expect_none;
    fs_fdatasync/fs_fdatasync_sync(fd: RawFd) -> () =>
        |fd| Ok(FsOp::Fdatasync { fd }), expect_none;
    fs_ftruncate/fs_ftruncate_sync(fd: RawFd, len: i64) -> () =>
        |fd, len| Ok(FsOp::Ftruncate { fd, len }), expect_none;
    /// Kernel-side copy; projects the bytes moved.
    fs_sendfile/fs_sendfile_sync(out_fd: RawFd, in_fd: RawFd, offset: i64, len: usize) -> i64 =>
        |out_fd, in_fd, offset, len| Ok(FsOp::Sendfile { out_fd, in_fd, offset, len }), expect_int;
    fs_chmod/fs_chmod_sync(path: &str, mode: u32) -> () =>
        |path, mode| Ok(FsOp::Chmod { path: path_arg(1, path)?, mode }), expect_none;
    fs_fchmod/fs_fchmod_sync(fd: RawFd, mode: u32) -> () =>
        |fd, mode| Ok(FsOp::Fchmod { fd, mode }), expect_none;
    /// Times are seconds with fractional part.
    fs_utime/fs_utime_sync(path: &str, atime: f64, mtime: f64) -> () =>
        |path, atime, mtime| Ok(FsOp::Utime { path: path_arg(1, path)?, atime, mtime }), expect_none;
    fs_futime/fs_futime_sync(fd: RawFd, atime: f64, mtime: f64) -> () =>
        |fd, atime, mtime| Ok(FsOp::Futime { fd, atime, mtime }), expect_none;
    fs_link/fs_link_sync(from: &str, to: &str) -> () =>
        |from, to| Ok(FsOp::Link { from: path_arg(1, from)?, to: path_arg(2, to)? }), expect_none;
    fs_symlink/fs_symlink_sync(from: &str, to: &str) -> () =>
        |from, to| Ok(FsOp::Symlink { from: path_arg(1, from)?, to: path_arg(2, to)? }), expect_none;
    fs_readlink/fs_readlink_sync(path: &str) -> String =>
        |path| Ok(FsOp::Readlink { path: path_arg(1, path)? }), expect_path;
    fs_chown/fs_chown_sync(path: &str, uid: u32, gid: u32) -> () =>
        |path, uid, gid| Ok(FsOp::Chown { path: path_arg(1, path)?, uid, gid }), expect_none;
    fs_fchown/fs_fchown_sync(fd: RawFd, uid: u32, gid: u32) -> () =>
        |fd, uid, gid| Ok(FsOp::Fchown { fd, uid, gid }), expect_none;
}

impl Context {
    fn fs_submit(&mut self, op: FsOp, cont: Continuation<FsResult>) -> Request {
        let state = Arc::new(AtomicU8::new(FS_QUEUED));
        let req = self.alloc_request(
            None,
            RequestKind::Fs(FsReq {
                state: Arc::clone(&state),
                cont,
            }),
        );
        self.pool().submit(Job::Fs { req, op, state });
        req
    }

    pub(crate) fn fs_complete(&mut self, req: Request, outcome: FsOutcome) {
        if let Some(record) = self.take_request(req) {
            if let RequestKind::Fs(fs) = record.kind {
                let FsOutcome(result) = outcome;
                fs.cont.fulfill(self, result);
            }
        }
    }
}

/// Execute the operation. Runs on a pool thread for async requests and
/// inline for the synchronous forms.
pub(crate) fn run_fs_op(op: &FsOp) -> FsOutcome {
    FsOutcome(run_fs_op_inner(op))
}

fn errno_result<T>(res: std::io::Result<T>, map: impl FnOnce(T) -> FsValue) -> FsResult {
    match res {
        Ok(value) => Ok(map(value)),
        Err(err) => Err(Errno::from_io(&err)),
    }
}

fn run_fs_op_inner(op: &FsOp) -> FsResult {
    match op {
        FsOp::Open { path, flags, mode } => errno_result(
            syscall!(open(path.as_ptr(), *flags, *mode as libc::c_uint)),
            |fd| FsValue::Int(fd as i64),
        ),
        FsOp::Close { fd } => errno_result(syscall!(close(*fd)), |_| FsValue::None),
        FsOp::Read { fd, len, offset } => {
            let mut buf = vec![0u8; *len];
            let res = if *offset < 0 {
                syscall!(read(*fd, buf.as_mut_ptr() as *mut libc::c_void, *len))
            } else {
                syscall!(pread(
                    *fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    *len,
                    *offset
                ))
            };
            errno_result(res, |n| {
                buf.truncate(n as usize);
                FsValue::Data(mem::take(&mut buf))
            })
        }
        FsOp::Write { fd, data, offset } => {
            let res = if *offset < 0 {
                syscall!(write(*fd, data.as_ptr() as *const libc::c_void, data.len()))
            } else {
                syscall!(pwrite(
                    *fd,
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                    *offset
                ))
            };
            errno_result(res, |n| FsValue::Int(n as i64))
        }
        FsOp::Stat { path } => {
            let mut st: libc::stat = unsafe { mem::zeroed() };
            errno_result(syscall!(stat(path.as_ptr(), &mut st)), |_| {
                FsValue::Stat(Stat::from(st))
            })
        }
        FsOp::Lstat { path } => {
            let mut st: libc::stat = unsafe { mem::zeroed() };
            errno_result(syscall!(lstat(path.as_ptr(), &mut st)), |_| {
                FsValue::Stat(Stat::from(st))
            })
        }
        FsOp::Fstat { fd } => {
            let mut st: libc::stat = unsafe { mem::zeroed() };
            errno_result(syscall!(fstat(*fd, &mut st)), |_| FsValue::Stat(Stat::from(st)))
        }
        FsOp::Unlink { path } => errno_result(syscall!(unlink(path.as_ptr())), |_| FsValue::None),
        FsOp::Mkdir { path, mode } => errno_result(
            syscall!(mkdir(path.as_ptr(), *mode as libc::mode_t)),
            |_| FsValue::None,
        ),
        FsOp::Rmdir { path } => errno_result(syscall!(rmdir(path.as_ptr())), |_| FsValue::None),
        FsOp::Readdir { path } => read_dir_entries(path),
        FsOp::Rename { from, to } => errno_result(
            syscall!(rename(from.as_ptr(), to.as_ptr())),
            |_| FsValue::None,
        ),
        FsOp::Fsync { fd } => errno_result(syscall!(fsync(*fd)), |_| FsValue::None),
        FsOp::Fdatasync { fd } => errno_result(syscall!(fdatasync(*fd)), |_| FsValue::None),
        FsOp::Ftruncate { fd, len } => {
            errno_result(syscall!(ftruncate(*fd, *len)), |_| FsValue::None)
        }
        FsOp::Sendfile {
            out_fd,
            in_fd,
            offset,
            len,
        } => {
            let mut off = *offset;
            errno_result(syscall!(sendfile(*out_fd, *in_fd, &mut off, *len)), |n| {
                FsValue::Int(n as i64)
            })
        }
        FsOp::Chmod { path, mode } => errno_result(
            syscall!(chmod(path.as_ptr(), *mode as libc::mode_t)),
            |_| FsValue::None,
        ),
        FsOp::Fchmod { fd, mode } => errno_result(
            syscall!(fchmod(*fd, *mode as libc::mode_t)),
            |_| FsValue::None,
        ),
        FsOp::Utime { path, atime, mtime } => {
            let times = timespec_pair(*atime, *mtime);
            errno_result(
                syscall!(utimensat(libc::AT_FDCWD, path.as_ptr(), times.as_ptr(), 0)),
                |_| FsValue::None,
            )
        }
        FsOp::Futime { fd, atime, mtime } => {
            let times = timespec_pair(*atime, *mtime);
            errno_result(syscall!(futimens(*fd, times.as_ptr())), |_| FsValue::None)
        }
        FsOp::Link { from, to } => {
            errno_result(syscall!(link(from.as_ptr(), to.as_ptr())), |_| FsValue::None)
        }
        FsOp::Symlink { from, to } => errno_result(
            syscall!(symlink(from.as_ptr(), to.as_ptr())),
            |_| FsValue::None,
        ),
        FsOp::Readlink { path } => {
            let mut buf = vec![0u8; libc::PATH_MAX as usize];
            errno_result(
                syscall!(readlink(
                    path.as_ptr(),
                    buf.as_mut_ptr() as *mut libc::c_char,
                    buf.len()
                )),
                |n| {
                    buf.truncate(n as usize);
                    FsValue::Path(String::from_utf8_lossy(&buf).into_owned())
                },
            )
        }
        FsOp::Chown { path, uid, gid } => errno_result(
            syscall!(chown(path.as_ptr(), *uid, *gid)),
            |_| FsValue::None,
        ),
        FsOp::Fchown { fd, uid, gid } => {
            errno_result(syscall!(fchown(*fd, *uid, *gid)), |_| FsValue::None)
        }
    }
}

fn timespec_pair(atime: f64, mtime: f64) -> [libc::timespec; 2] {
    let split = |t: f64| libc::timespec {
        tv_sec: t as libc::time_t,
        tv_nsec: ((t.fract()) * 1e9) as libc::c_long,
    };
    [split(atime), split(mtime)]
}

fn read_dir_entries(path: &CStr) -> FsResult {
    let dir = unsafe { libc::opendir(path.as_ptr()) };
    if dir.is_null() {
        return Err(Errno::from_io(&std::io::Error::last_os_error()));
    }
    let mut entries = Vec::new();
    loop {
        let entry = unsafe { libc::readdir(dir) };
        if entry.is_null() {
            break;
        }
        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        let name = name.to_string_lossy();
        if name != "." && name != ".." {
            entries.push(name.into_owned());
        }
    }
    unsafe { libc::closedir(dir) };
    Ok(FsValue::Entries(entries))
}
