//! Child processes: spawn with stdio wiring, exit reaping, kill.
//!
//! Exits are observed through a loop-internal `SIGCHLD` watcher plus
//! non-blocking `waitpid`; the exit callback runs on the loop thread with
//! `(status, term_signal)`. Spawning uses the classic fork/exec dance with
//! a close-on-exec error pipe so an exec failure is reported as a plain
//! error from `spawn` instead of a mysteriously dead child.

use std::cell::RefCell;
use std::ffi::CString;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::context::Context;
use crate::error::{Errno, Error, Result};
use crate::handle::{Handle, HandleData};
use crate::signal::SignalSpec;
use crate::sys::fdio;

pub(crate) type ExitCallback = Rc<RefCell<dyn FnMut(&mut Context, i64, i32)>>;

pub(crate) struct ProcessState {
    pub(crate) pid: libc::pid_t,
    pub(crate) exit_cb: Option<ExitCallback>,
    pub(crate) exited: bool,
}

/// One slot of the child's descriptor table.
///
/// The slot index picks the default direction of a fresh pipe: slot 0 feeds
/// the child (parent writes), slots 1 and 2 drain it (parent reads), and
/// anything above is bidirectional.
pub enum StdioEntry {
    /// The child gets `/dev/null`.
    Ignore,
    /// The child inherits this descriptor as-is.
    Inherit(RawFd),
    /// Wire a fresh socketpair between the child slot and this (not yet
    /// opened) pipe handle.
    Stream(Handle),
}

/// Options for [`Context::spawn`]. Unknown concerns of other platforms
/// (`hide`, `verbatim`) are accepted and ignored here.
#[derive(Default)]
pub struct SpawnOptions {
    /// Arguments, not including the executable itself.
    pub args: Vec<String>,
    /// Environment as `KEY=VALUE` strings; `None` inherits.
    pub env: Option<Vec<String>>,
    pub cwd: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Detach into its own session; the child survives the loop.
    pub detached: bool,
    pub hide: bool,
    pub hide_console: bool,
    pub hide_gui: bool,
    pub verbatim: bool,
    pub stdio: Vec<StdioEntry>,
}

impl Context {
    /// Spawn `file`. Returns the process handle and pid; `onexit` fires
    /// with `(status, term_signal)` when the child is reaped.
    pub fn spawn(
        &mut self,
        file: &str,
        options: SpawnOptions,
        onexit: impl FnMut(&mut Context, i64, i32) + 'static,
    ) -> Result<(Handle, i32)> {
        let program = CString::new(file).map_err(|_| Error::arg(1, "program path"))?;
        let mut argv_owned: Vec<CString> = Vec::with_capacity(options.args.len() + 1);
        argv_owned.push(program.clone());
        for (i, arg) in options.args.iter().enumerate() {
            argv_owned.push(
                CString::new(arg.as_str()).map_err(|_| Error::arg(2 + i as u8, "argument string"))?,
            );
        }
        let env_owned: Option<Vec<CString>> = match &options.env {
            Some(env) => {
                let mut out = Vec::with_capacity(env.len());
                for entry in env {
                    out.push(
                        CString::new(entry.as_str())
                            .map_err(|_| Error::arg(2, "environment string"))?,
                    );
                }
                Some(out)
            }
            None => None,
        };
        let cwd_owned = match &options.cwd {
            Some(cwd) => {
                Some(CString::new(cwd.as_str()).map_err(|_| Error::arg(2, "cwd path"))?)
            }
            None => None,
        };

        // Child-side descriptor table indexed by slot, plus the parent ends
        // of freshly created pairs. Only fresh pairs are spawn's to close;
        // inherited descriptors stay the caller's.
        let mut child_fds: Vec<RawFd> = Vec::new();
        let mut parent_ends: Vec<(Handle, RawFd, usize)> = Vec::new();
        let mut fresh_slots: Vec<usize> = Vec::new();
        let close_fresh =
            |child_fds: &[RawFd], parent_ends: &[(Handle, RawFd, usize)], fresh: &[usize]| {
                for &slot in fresh {
                    if child_fds[slot] >= 0 {
                        fdio::close(child_fds[slot]);
                    }
                }
                for &(_, fd, _) in parent_ends {
                    fdio::close(fd);
                }
            };

        for (i, entry) in options.stdio.iter().enumerate() {
            match entry {
                StdioEntry::Ignore => child_fds.push(-1),
                StdioEntry::Inherit(fd) => child_fds.push(*fd),
                StdioEntry::Stream(h) => {
                    let already_open = match self.stream_state(*h) {
                        Ok(state) => state.fd,
                        Err(err) => {
                            close_fresh(&child_fds, &parent_ends, &fresh_slots);
                            return Err(err);
                        }
                    };
                    if let Some(fd) = already_open {
                        child_fds.push(fd);
                        continue;
                    }
                    let (parent_fd, child_fd) = match fdio::socketpair() {
                        Ok(pair) => pair,
                        Err(err) => {
                            close_fresh(&child_fds, &parent_ends, &fresh_slots);
                            return Err(Error::sys(err));
                        }
                    };
                    child_fds.push(child_fd);
                    parent_ends.push((*h, parent_fd, i));
                    fresh_slots.push(i);
                }
            }
        }

        // Slots the caller left unspecified are ignored, stdio included.
        while child_fds.len() < 3 {
            child_fds.push(-1);
        }

        // The reaper must be watching before the child can exit.
        self.ensure_reaper()?;

        let pid = match fork_exec(
            &argv_owned,
            env_owned.as_deref(),
            cwd_owned.as_deref(),
            &options,
            &child_fds,
        ) {
            Ok(pid) => pid,
            Err(err) => {
                close_fresh(&child_fds, &parent_ends, &fresh_slots);
                return Err(err);
            }
        };

        // Child-side ends of fresh pairs are the child's now.
        for &slot in &fresh_slots {
            if child_fds[slot] >= 0 {
                fdio::close(child_fds[slot]);
            }
        }
        for (h, fd, slot) in parent_ends {
            let _ = fdio::set_nonblocking(fd, true);
            let (readable, writable) = match slot {
                0 => (false, true),
                1 | 2 => (true, false),
                _ => (true, true),
            };
            if let Ok(state) = self.stream_state_mut(h) {
                state.adopt_fd(fd, readable, writable);
            }
        }

        let h = self.alloc_handle(HandleData::Process(ProcessState {
            pid,
            exit_cb: Some(Rc::new(RefCell::new(onexit))),
            exited: false,
        }));
        self.process_table.insert(pid, h);
        self.set_active(h, true);
        log::debug!("spawned pid {} for {:?}", pid, file);
        Ok((h, pid))
    }

    pub fn process_get_pid(&self, h: Handle) -> Result<i32> {
        Ok(self.process_state(h)?.pid)
    }

    /// Signal the child behind the handle.
    pub fn process_kill(&mut self, h: Handle, signal: SignalSpec<'_>) -> Result<()> {
        let state = self.process_state(h)?;
        if state.exited {
            return Err(Error::Sys(Errno::ESRCH));
        }
        kill_pid(state.pid, signal)
    }

    pub(crate) fn process_teardown(&mut self, h: Handle) {
        let pid = match self.process_state_mut(h) {
            Ok(state) => {
                state.exit_cb = None;
                state.pid
            }
            Err(_) => return,
        };
        self.process_table.remove(&pid);
    }

    /// `SIGCHLD` arrived: reap every exited child we own.
    pub(crate) fn process_reap(&mut self) {
        loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                return;
            }
            let h = match self.process_table.remove(&pid) {
                Some(h) => h,
                None => continue,
            };
            let cb = match self.process_state_mut(h) {
                Ok(state) => {
                    state.exited = true;
                    state.exit_cb.clone()
                }
                Err(_) => None,
            };
            self.set_active(h, false);
            let (exit_status, term_signal) = if libc::WIFEXITED(status) {
                (libc::WEXITSTATUS(status) as i64, 0)
            } else if libc::WIFSIGNALED(status) {
                (0, libc::WTERMSIG(status))
            } else {
                (0, 0)
            };
            if let Some(cb) = cb {
                self.dispatch(move |ctx| (cb.borrow_mut())(ctx, exit_status, term_signal));
            }
        }
    }

    fn ensure_reaper(&mut self) -> Result<()> {
        if self.reaper.is_some() {
            return Ok(());
        }
        let h = self.signal_watch_internal(libc::SIGCHLD, |ctx, _| ctx.process_reap())?;
        self.reaper = Some(h);
        Ok(())
    }

    fn process_state(&self, h: Handle) -> Result<&ProcessState> {
        match &self.record(h)?.data {
            HandleData::Process(state) => Ok(state),
            _ => Err(Error::arg(1, "process handle")),
        }
    }

    fn process_state_mut(&mut self, h: Handle) -> Result<&mut ProcessState> {
        match &mut self.record_mut(h)?.data {
            HandleData::Process(state) => Ok(state),
            _ => Err(Error::arg(1, "process handle")),
        }
    }
}

/// Signal an arbitrary pid by name or number.
pub fn kill_pid(pid: i32, signal: SignalSpec<'_>) -> Result<()> {
    let signum = match signal {
        SignalSpec::Number(n) => n,
        SignalSpec::Name(name) => {
            crate::signal::parse_signal_name(name).ok_or(Error::arg(2, "valid signal name"))?
        }
    };
    syscall!(kill(pid, signum)).map_err(Error::sys)?;
    Ok(())
}

fn fork_exec(
    argv: &[CString],
    env: Option<&[CString]>,
    cwd: Option<&std::ffi::CStr>,
    options: &SpawnOptions,
    child_fds: &[RawFd],
) -> Result<libc::pid_t> {
    // Exec failure travels back over a close-on-exec pipe: a successful
    // exec closes it silently, a failed one writes errno.
    let (err_read, err_write) = fdio::pipe(false, false).map_err(Error::sys)?;

    let mut argv_ptrs: Vec<*const libc::c_char> =
        argv.iter().map(|arg| arg.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());
    let env_ptrs: Option<Vec<*const libc::c_char>> = env.map(|env| {
        let mut ptrs: Vec<*const libc::c_char> = env.iter().map(|e| e.as_ptr()).collect();
        ptrs.push(std::ptr::null());
        ptrs
    });

    // Staging table allocated before fork; the child must not touch the
    // allocator between fork and exec.
    let mut moved: Vec<RawFd> = vec![-1; child_fds.len()];

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        fdio::close(err_read);
        fdio::close(err_write);
        return Err(Error::sys(std::io::Error::last_os_error()));
    }

    if pid == 0 {
        // Child. Only async-signal-safe calls from here to exec.
        unsafe {
            if options.detached {
                libc::setsid();
            }
            // Move sources clear of the target range, then into place;
            // dup2 clears close-on-exec on the way.
            let count = child_fds.len() as RawFd;
            for (slot, &fd) in child_fds.iter().enumerate() {
                moved[slot] = if fd >= 0 && fd < count {
                    libc::fcntl(fd, libc::F_DUPFD, count)
                } else {
                    fd
                };
            }
            for (i, &fd) in moved.iter().enumerate() {
                if fd >= 0 {
                    libc::dup2(fd, i as RawFd);
                } else {
                    let null = libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR);
                    if null >= 0 && null != i as RawFd {
                        libc::dup2(null, i as RawFd);
                        libc::close(null);
                    }
                }
            }
            if let Some(cwd) = cwd {
                if libc::chdir(cwd.as_ptr()) != 0 {
                    report_exec_error(err_write);
                }
            }
            if let Some(gid) = options.gid {
                if libc::setgid(gid) != 0 {
                    report_exec_error(err_write);
                }
            }
            if let Some(uid) = options.uid {
                if libc::setuid(uid) != 0 {
                    report_exec_error(err_write);
                }
            }
            match env_ptrs {
                Some(env_ptrs) => {
                    libc::execve(argv[0].as_ptr(), argv_ptrs.as_ptr(), env_ptrs.as_ptr());
                }
                None => {
                    libc::execvp(argv[0].as_ptr(), argv_ptrs.as_ptr());
                }
            }
            report_exec_error(err_write);
        }
    }

    // Parent.
    fdio::close(err_write);
    let mut buf = [0u8; 4];
    let result = loop {
        match fdio::read(err_read, &mut buf) {
            // Pipe closed by a successful exec.
            Ok(0) => break Ok(pid),
            Ok(_) => {
                let errno = i32::from_ne_bytes(buf);
                let mut status = 0;
                unsafe { libc::waitpid(pid, &mut status, 0) };
                break Err(Error::Sys(Errno::from_raw(errno)));
            }
            Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => continue,
            Err(err) => {
                break Err(Error::sys(err));
            }
        }
    };
    fdio::close(err_read);
    result
}

/// Child-side: push errno to the parent and die without running any
/// destructors or atexit handlers.
unsafe fn report_exec_error(err_write: RawFd) -> ! {
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
    let buf = errno.to_ne_bytes();
    libc::write(err_write, buf.as_ptr() as *const libc::c_void, buf.len());
    libc::_exit(127);
}
