//! Named pipes (unix domain sockets) and anonymous pipe pairs.

use std::os::fd::RawFd;
use std::path::Path;

use crate::addr::SockName;
use crate::context::Context;
use crate::error::{Errno, Error, Result};
use crate::handle::{Handle, HandleData};
use crate::request::{Continuation, Request, RequestKind};
use crate::stream::{ConnectReq, StreamState, StreamStatus, StreamVariant};
use crate::sys::{fdio, net};

impl Context {
    /// A pipe handle. `ipc` enables descriptor passing over the connection.
    pub fn new_pipe(&mut self, ipc: bool) -> Handle {
        self.alloc_handle(HandleData::Stream(StreamState::new(StreamVariant::Pipe {
            ipc,
        })))
    }

    /// Adopt an existing descriptor (pipe end, socket, or similar byte
    /// stream).
    pub fn pipe_open(&mut self, h: Handle, fd: RawFd) -> Result<()> {
        let state = self.pipe_state_mut(h)?;
        if state.fd.is_some() {
            return Err(Error::Sys(Errno::EBUSY));
        }
        fdio::set_nonblocking(fd, true)?;
        state.adopt_fd(fd, true, true);
        Ok(())
    }

    pub fn pipe_bind(&mut self, h: Handle, path: impl AsRef<Path>) -> Result<()> {
        let fd = self.pipe_maybe_socket(h)?;
        net::bind_unix(fd, path.as_ref())?;
        Ok(())
    }

    pub fn pipe_connect(
        &mut self,
        h: Handle,
        path: impl AsRef<Path>,
        cont: Continuation<StreamStatus>,
    ) -> Result<Request> {
        let fd = self.pipe_maybe_socket(h)?;
        match net::connect_unix(fd, path.as_ref()) {
            Ok(()) => {}
            Err(ref err)
                if matches!(
                    err.raw_os_error(),
                    Some(libc::EINPROGRESS) | Some(libc::EAGAIN)
                ) => {}
            Err(err) => return Err(Error::sys(err)),
        }
        let req = self.alloc_request(
            Some(h),
            RequestKind::Connect(ConnectReq {
                error: None,
                cont,
            }),
        );
        self.pipe_state_mut(h)?.connect_req = Some(req);
        self.stream_update(h);
        Ok(req)
    }

    pub fn pipe_getsockname(&self, h: Handle) -> Result<Option<SockName>> {
        let fd = self.pipe_fd(h)?;
        Ok(net::unix_name(fd, false)?.map(SockName::unix))
    }

    pub fn pipe_getpeername(&self, h: Handle) -> Result<Option<SockName>> {
        let fd = self.pipe_fd(h)?;
        Ok(net::unix_name(fd, true)?.map(SockName::unix))
    }

    /// Queue-depth hint for completion-port backends; accepted and ignored
    /// here.
    pub fn pipe_pending_instances(&mut self, h: Handle, _count: u32) -> Result<()> {
        let _ = self.pipe_state(h)?;
        Ok(())
    }

    /// Received-but-unclaimed descriptors on an IPC pipe.
    pub fn pipe_pending_count(&self, h: Handle) -> Result<usize> {
        Ok(self.pipe_state(h)?.accepted_fds.len())
    }

    /// Handle kind the next [`Context::accept`] on this pipe would produce.
    pub fn pipe_pending_type(&self, h: Handle) -> Result<&'static str> {
        let state = self.pipe_state(h)?;
        let fd = match state.accepted_fds.front() {
            Some(&fd) => fd,
            None => return Err(Error::Sys(Errno::EAGAIN)),
        };
        match net::get_int_opt(fd, libc::SOL_SOCKET, libc::SO_DOMAIN) {
            Ok(libc::AF_UNIX) => Ok("pipe"),
            Ok(_) => Ok("tcp"),
            Err(_) => Ok("pipe"),
        }
    }

    /// Adjust filesystem permissions of a bound pipe: `"r"`, `"w"`, or
    /// `"rw"` grant the respective bits to everyone.
    pub fn pipe_chmod(&mut self, h: Handle, mode: &str) -> Result<()> {
        let (readable, writable) = match mode {
            "r" => (true, false),
            "w" => (false, true),
            "rw" | "wr" => (true, true),
            _ => return Err(Error::arg(2, "\"r\", \"w\" or \"rw\"")),
        };
        let fd = self.pipe_fd(h)?;
        let path = net::unix_name(fd, false)?.ok_or(Error::Sys(Errno::EBADF))?;
        let mut bits: libc::mode_t = 0;
        if readable {
            bits |= libc::S_IRUSR | libc::S_IRGRP | libc::S_IROTH;
        }
        if writable {
            bits |= libc::S_IWUSR | libc::S_IWGRP | libc::S_IWOTH;
        }
        let cpath = std::ffi::CString::new(path).map_err(|_| Error::arg(1, "pipe path"))?;
        syscall!(chmod(cpath.as_ptr(), bits)).map_err(Error::sys)?;
        Ok(())
    }

    // ===== internals =====

    fn pipe_maybe_socket(&mut self, h: Handle) -> Result<RawFd> {
        let state = self.pipe_state_mut(h)?;
        if let Some(fd) = state.fd {
            return Ok(fd);
        }
        let fd = net::new_socket(libc::AF_UNIX, libc::SOCK_STREAM)?;
        state.fd = Some(fd);
        Ok(fd)
    }

    fn pipe_state(&self, h: Handle) -> Result<&StreamState> {
        let state = self.stream_state(h)?;
        match state.variant {
            StreamVariant::Pipe { .. } => Ok(state),
            _ => Err(Error::arg(1, "pipe handle")),
        }
    }

    fn pipe_state_mut(&mut self, h: Handle) -> Result<&mut StreamState> {
        let state = self.stream_state_mut(h)?;
        match state.variant {
            StreamVariant::Pipe { .. } => Ok(state),
            _ => Err(Error::arg(1, "pipe handle")),
        }
    }

    fn pipe_fd(&self, h: Handle) -> Result<RawFd> {
        self.pipe_state(h)?.fd.ok_or(Error::Sys(Errno::EBADF))
    }
}

/// Anonymous pipe pair as `(read_fd, write_fd)`, each end optionally
/// non-blocking. The ends are plain descriptors, ready to be adopted by
/// [`Context::pipe_open`] or wired into a child's stdio.
pub fn pipe_pair(nonblock_read: bool, nonblock_write: bool) -> Result<(RawFd, RawFd)> {
    fdio::pipe(nonblock_read, nonblock_write).map_err(Error::sys)
}
