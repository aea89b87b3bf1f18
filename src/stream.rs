//! The stream engine shared by TCP, pipe, and TTY handles.
//!
//! Writes go through a FIFO of pending requests; the head request is pushed
//! into the kernel with vectored writes, partial progress advances buffer
//! cursors in place, and finished requests move to a completed queue whose
//! callbacks fire in submission order. Reads pull up to a fixed number of
//! chunks per readable event so one busy stream cannot starve the loop.
//! Closing a stream fails every queued request with `ECANCELED` before the
//! close callback runs.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::context::Context;
use crate::error::{Errno, Error, Result};
use crate::handle::{Handle, HandleData, HandleType};
use crate::interest::Interest;
use crate::request::{Continuation, Request, RequestKind};
use crate::sys::fdio;

/// Chunk size handed to the read callback.
pub(crate) const READ_BUF_SIZE: usize = 64 * 1024;
/// Max read iterations per readable event.
const MAX_READS_PER_EVENT: usize = 32;

/// Completion status delivered to write/shutdown/connect continuations.
pub type StreamStatus = std::result::Result<(), Errno>;

/// One read delivery: data, end-of-file (`Ok(None)`), or an error.
pub type ReadResult = std::result::Result<Option<Vec<u8>>, Errno>;

pub(crate) type ReadCallback = Rc<RefCell<dyn FnMut(&mut Context, ReadResult)>>;
pub(crate) type ConnectionCallback = Rc<RefCell<dyn FnMut(&mut Context, StreamStatus)>>;

// Stream state flags.
pub(crate) const READABLE: u16 = 1 << 0;
pub(crate) const WRITABLE: u16 = 1 << 1;
const SHUTTING: u16 = 1 << 2;
const SHUT: u16 = 1 << 3;
const BLOCKING: u16 = 1 << 4;
const READING: u16 = 1 << 5;
const LISTENING: u16 = 1 << 6;
/// Queued on the loop's pending list for completion draining.
const IN_PENDING: u16 = 1 << 7;

pub(crate) enum StreamVariant {
    Tcp,
    Pipe {
        ipc: bool,
    },
    Tty {
        saved: Option<libc::termios>,
    },
}

/// Data accepted by the write operations: one buffer or an ordered sequence.
pub enum WriteData {
    Single(Vec<u8>),
    Multi(Vec<Vec<u8>>),
}

impl WriteData {
    fn into_bufs(self) -> Vec<Vec<u8>> {
        match self {
            WriteData::Single(buf) => vec![buf],
            WriteData::Multi(bufs) => bufs,
        }
    }

    fn len(&self) -> usize {
        match self {
            WriteData::Single(buf) => buf.len(),
            WriteData::Multi(bufs) => bufs.iter().map(Vec::len).sum(),
        }
    }
}

impl From<Vec<u8>> for WriteData {
    fn from(buf: Vec<u8>) -> WriteData {
        WriteData::Single(buf)
    }
}

impl From<&[u8]> for WriteData {
    fn from(buf: &[u8]) -> WriteData {
        WriteData::Single(buf.to_vec())
    }
}

impl From<&str> for WriteData {
    fn from(buf: &str) -> WriteData {
        WriteData::Single(buf.as_bytes().to_vec())
    }
}

impl From<Vec<Vec<u8>>> for WriteData {
    fn from(bufs: Vec<Vec<u8>>) -> WriteData {
        WriteData::Multi(bufs)
    }
}

pub(crate) struct WriteReq {
    /// Input buffers, pinned here until the completion callback has run.
    pub(crate) bufs: Vec<Vec<u8>>,
    pub(crate) idx: usize,
    pub(crate) off: usize,
    /// Descriptor to pass over an IPC pipe alongside the first chunk.
    pub(crate) send_fd: Option<RawFd>,
    pub(crate) error: Option<Errno>,
    pub(crate) cont: Continuation<StreamStatus>,
}

impl WriteReq {
    fn unwritten(&self) -> usize {
        let mut total = 0;
        for (i, buf) in self.bufs.iter().enumerate().skip(self.idx) {
            total += buf.len() - if i == self.idx { self.off } else { 0 };
        }
        total
    }

    fn done(&self) -> bool {
        self.idx >= self.bufs.len()
    }
}

pub(crate) struct ShutdownReq {
    pub(crate) error: Option<Errno>,
    pub(crate) cont: Continuation<StreamStatus>,
}

pub(crate) struct ConnectReq {
    pub(crate) error: Option<Errno>,
    pub(crate) cont: Continuation<StreamStatus>,
}

pub(crate) struct StreamState {
    pub(crate) fd: Option<RawFd>,
    pub(crate) variant: StreamVariant,
    pub(crate) flags: u16,
    pub(crate) interest: Option<Interest>,
    pub(crate) read_cb: Option<ReadCallback>,
    pub(crate) connection_cb: Option<ConnectionCallback>,
    pub(crate) write_queue: VecDeque<Request>,
    pub(crate) completed: VecDeque<Request>,
    pub(crate) write_queue_size: usize,
    pub(crate) shutdown_req: Option<Request>,
    pub(crate) connect_req: Option<Request>,
    /// Accepted-but-unclaimed descriptors; head is what `accept` takes.
    pub(crate) accepted_fds: VecDeque<RawFd>,
}

impl StreamState {
    pub(crate) fn new(variant: StreamVariant) -> StreamState {
        StreamState {
            fd: None,
            variant,
            flags: 0,
            interest: None,
            read_cb: None,
            connection_cb: None,
            write_queue: VecDeque::new(),
            completed: VecDeque::new(),
            write_queue_size: 0,
            shutdown_req: None,
            connect_req: None,
            accepted_fds: VecDeque::new(),
        }
    }

    pub(crate) fn handle_type(&self) -> HandleType {
        match self.variant {
            StreamVariant::Tcp => HandleType::Tcp,
            StreamVariant::Pipe { .. } => HandleType::Pipe,
            StreamVariant::Tty { .. } => HandleType::Tty,
        }
    }

    pub(crate) fn is_ipc(&self) -> bool {
        matches!(self.variant, StreamVariant::Pipe { ipc: true })
    }

    pub(crate) fn set_flag(&mut self, flag: u16, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    /// Mark the descriptor open for byte traffic.
    pub(crate) fn adopt_fd(&mut self, fd: RawFd, readable: bool, writable: bool) {
        self.fd = Some(fd);
        self.set_flag(READABLE, readable);
        self.set_flag(WRITABLE, writable);
    }
}

impl Context {
    // ===== public stream surface =====

    /// Start accepting connections. `onconn` fires once per incoming
    /// connection; the callback must claim it with [`Context::accept`]
    /// before returning to the loop or the descriptor sits unclaimed and
    /// further accepts stall.
    pub fn listen(
        &mut self,
        h: Handle,
        backlog: i32,
        onconn: impl FnMut(&mut Context, StreamStatus) + 'static,
    ) -> Result<()> {
        let fd = self.stream_fd(h)?;
        crate::sys::net::listen(fd, backlog as libc::c_int)?;
        let state = self.stream_state_mut(h)?;
        state.connection_cb = Some(Rc::new(RefCell::new(onconn)));
        state.set_flag(LISTENING, true);
        self.stream_update(h);
        Ok(())
    }

    /// Move the pending accepted descriptor from `server` onto `client`.
    /// `EAGAIN` when no connection is waiting.
    pub fn accept(&mut self, server: Handle, client: Handle) -> Result<()> {
        let fd = {
            let state = self.stream_state_mut(server)?;
            match state.accepted_fds.pop_front() {
                Some(fd) => fd,
                None => return Err(Error::Sys(Errno::EAGAIN)),
            }
        };
        let client_state = match self.stream_state_mut(client) {
            Ok(state) => state,
            Err(err) => {
                fdio::close(fd);
                return Err(err);
            }
        };
        if client_state.fd.is_some() {
            fdio::close(fd);
            return Err(Error::Sys(Errno::EBUSY));
        }
        client_state.adopt_fd(fd, true, true);
        self.stream_update(server);
        Ok(())
    }

    /// Begin reading. `onread` receives data chunks, `Ok(None)` at end of
    /// file, or the error that stopped the stream.
    pub fn read_start(
        &mut self,
        h: Handle,
        onread: impl FnMut(&mut Context, ReadResult) + 'static,
    ) -> Result<()> {
        let state = self.stream_state_mut(h)?;
        if state.fd.is_none() {
            return Err(Error::Sys(Errno::EBADF));
        }
        if !state.has_flag(READABLE) {
            return Err(Error::Sys(Errno::ENOTCONN));
        }
        state.read_cb = Some(Rc::new(RefCell::new(onread)));
        state.set_flag(READING, true);
        self.stream_update(h);
        Ok(())
    }

    /// Stop reading. Idempotent; safe from inside the read callback.
    pub fn read_stop(&mut self, h: Handle) -> Result<()> {
        let state = self.stream_state_mut(h)?;
        state.set_flag(READING, false);
        self.stream_update(h);
        Ok(())
    }

    /// Queue `data` for writing. If nothing was queued, a best-effort write
    /// happens immediately; whatever the kernel does not take waits for the
    /// writable watcher. The continuation fires exactly once, in submission
    /// order relative to other writes on this stream.
    pub fn write(
        &mut self,
        h: Handle,
        data: impl Into<WriteData>,
        cont: Continuation<StreamStatus>,
    ) -> Result<Request> {
        self.stream_write_inner(h, data.into(), None, cont)
    }

    /// Like [`Context::write`], additionally passing `send_handle`'s
    /// descriptor over the stream. Only valid on an IPC pipe.
    pub fn write2(
        &mut self,
        h: Handle,
        data: impl Into<WriteData>,
        send_handle: Handle,
        cont: Continuation<StreamStatus>,
    ) -> Result<Request> {
        if !self.stream_state(h)?.is_ipc() {
            return Err(Error::arg(1, "ipc pipe handle"));
        }
        let send_fd = self
            .record(send_handle)?
            .fd()
            .ok_or(Error::arg(3, "open stream handle"))?;
        self.stream_write_inner(h, data.into(), Some(send_fd), cont)
    }

    /// Non-blocking best-effort write. Returns the bytes taken by the
    /// kernel; never queues anything.
    pub fn try_write(&mut self, h: Handle, data: impl Into<WriteData>) -> Result<usize> {
        let state = self.stream_state(h)?;
        let fd = state.fd.ok_or(Error::Sys(Errno::EBADF))?;
        if !state.has_flag(WRITABLE) || state.has_flag(SHUTTING) {
            return Err(Error::Sys(Errno::EPIPE));
        }
        if !state.write_queue.is_empty() {
            return Err(Error::Sys(Errno::EAGAIN));
        }
        let bufs = data.into().into_bufs();
        fdio::writev(fd, &bufs, 0, 0).map_err(Error::sys)
    }

    /// Half-close the write side once the pending queue drains. The
    /// continuation fires after the `shutdown(2)` has been issued.
    pub fn shutdown(
        &mut self,
        h: Handle,
        cont: Continuation<StreamStatus>,
    ) -> Result<Request> {
        if self.record(h)?.is_closing() {
            return Err(Error::State("shutdown on closing handle"));
        }
        let state = self.stream_state(h)?;
        if state.fd.is_none() {
            return Err(Error::Sys(Errno::EBADF));
        }
        if !state.has_flag(WRITABLE) {
            return Err(Error::Sys(Errno::ENOTCONN));
        }
        if state.has_flag(SHUT) || state.has_flag(SHUTTING) {
            return Err(Error::Sys(Errno::ESHUTDOWN));
        }
        let req = self.alloc_request(
            Some(h),
            RequestKind::Shutdown(ShutdownReq {
                error: None,
                cont,
            }),
        );
        let state = self.stream_state_mut(h)?;
        state.shutdown_req = Some(req);
        state.set_flag(SHUTTING, true);
        self.stream_schedule_drain(h);
        self.stream_update(h);
        Ok(req)
    }

    pub fn is_readable(&self, h: Handle) -> Result<bool> {
        Ok(self.stream_state(h)?.has_flag(READABLE))
    }

    pub fn is_writable(&self, h: Handle) -> Result<bool> {
        Ok(self.stream_state(h)?.has_flag(WRITABLE))
    }

    /// Switch between non-blocking and blocking write semantics. A blocking
    /// stream never leaves queued writes between loop turns, so switching
    /// requires an empty queue.
    pub fn stream_set_blocking(&mut self, h: Handle, blocking: bool) -> Result<()> {
        let state = self.stream_state_mut(h)?;
        if !state.write_queue.is_empty() {
            return Err(Error::Sys(Errno::EBUSY));
        }
        if let Some(fd) = state.fd {
            fdio::set_nonblocking(fd, !blocking)?;
        }
        state.set_flag(BLOCKING, blocking);
        Ok(())
    }

    /// Bytes queued but not yet written, across all pending write requests.
    pub fn write_queue_size(&self, h: Handle) -> Result<usize> {
        Ok(self.stream_state(h)?.write_queue_size)
    }

    // ===== engine internals =====

    fn stream_write_inner(
        &mut self,
        h: Handle,
        data: WriteData,
        send_fd: Option<RawFd>,
        cont: Continuation<StreamStatus>,
    ) -> Result<Request> {
        if self.record(h)?.is_closing() {
            return Err(Error::State("write on closing handle"));
        }
        {
            let state = self.stream_state(h)?;
            if state.fd.is_none() {
                return Err(Error::Sys(Errno::EBADF));
            }
            if !state.has_flag(WRITABLE) || state.has_flag(SHUTTING) {
                return Err(Error::Sys(Errno::EPIPE));
            }
        }
        let size = data.len();
        let req = self.alloc_request(
            Some(h),
            RequestKind::Write(WriteReq {
                bufs: data.into_bufs(),
                idx: 0,
                off: 0,
                send_fd,
                error: None,
                cont,
            }),
        );
        let state = self.stream_state_mut(h)?;
        let first = state.write_queue.is_empty();
        state.write_queue.push_back(req);
        state.write_queue_size += size;
        if first || state.has_flag(BLOCKING) {
            self.stream_flush(h);
            self.stream_schedule_drain(h);
        }
        self.stream_update(h);
        Ok(req)
    }

    /// Push pending write requests into the kernel until it pushes back.
    fn stream_flush(&mut self, h: Handle) {
        loop {
            let (fd, req, blocking) = match self.stream_state(h) {
                Ok(state) => match (state.fd, state.write_queue.front()) {
                    (Some(fd), Some(&req)) => (fd, req, state.has_flag(BLOCKING)),
                    _ => return,
                },
                Err(_) => return,
            };

            let (result, finished, advanced) = {
                let record = match self.requests.get_mut(req.index as usize) {
                    Some(record) => record,
                    None => return,
                };
                let write = match &mut record.kind {
                    RequestKind::Write(write) => write,
                    _ => return,
                };
                let result = match write.send_fd {
                    // The descriptor rides along with the first byte only.
                    Some(send_fd) if write.idx == 0 && write.off == 0 => {
                        fdio::sendmsg_fd(fd, &write.bufs, write.idx, write.off, send_fd)
                    }
                    _ => fdio::writev(fd, &write.bufs, write.idx, write.off),
                };
                match result {
                    Ok(mut n) => {
                        let advanced = n;
                        while n > 0 && write.idx < write.bufs.len() {
                            let left = write.bufs[write.idx].len() - write.off;
                            if n >= left {
                                n -= left;
                                write.idx += 1;
                                write.off = 0;
                            } else {
                                write.off += n;
                                n = 0;
                            }
                        }
                        (Ok(()), write.done(), advanced)
                    }
                    Err(err) => {
                        let errno = Errno::from_io(&err);
                        if !errno.is_would_block() {
                            write.error = Some(errno);
                        }
                        (Err(errno), false, 0)
                    }
                }
            };

            let state = match self.stream_state_mut(h) {
                Ok(state) => state,
                Err(_) => return,
            };
            state.write_queue_size -= advanced;
            match result {
                Ok(()) if finished => {
                    state.write_queue.pop_front();
                    state.completed.push_back(req);
                }
                Ok(()) => {
                    // Partial progress; in blocking mode keep pushing, the
                    // watcher finishes the job otherwise.
                    if !blocking {
                        return;
                    }
                }
                Err(errno) if errno.is_would_block() => {
                    if !blocking {
                        return;
                    }
                }
                Err(_) => {
                    // Failed request carries its error to the completed
                    // queue; remaining bytes are no longer accounted.
                    let remaining = {
                        let record = self.requests.get(req.index as usize);
                        match record.map(|r| &r.kind) {
                            Some(RequestKind::Write(w)) => w.unwritten(),
                            _ => 0,
                        }
                    };
                    let state = match self.stream_state_mut(h) {
                        Ok(state) => state,
                        Err(_) => return,
                    };
                    state.write_queue_size -= remaining;
                    state.write_queue.pop_front();
                    state.completed.push_back(req);
                }
            }
        }
    }

    /// Deliver queued completions in order, then run the drain procedure
    /// (deferred shutdown) once the pending queue is empty.
    pub(crate) fn stream_drain_completed(&mut self, h: Handle) {
        if let Ok(state) = self.stream_state_mut(h) {
            state.set_flag(IN_PENDING, false);
        } else {
            return;
        }
        loop {
            let req = match self.stream_state_mut(h) {
                Ok(state) => match state.completed.pop_front() {
                    Some(req) => req,
                    None => break,
                },
                Err(_) => return,
            };
            if let Some(record) = self.take_request(req) {
                match record.kind {
                    RequestKind::Write(write) => {
                        let status = write.error.map_or(Ok(()), Err);
                        write.cont.fulfill(self, status);
                    }
                    // Cancelled connect/shutdown requests parked here by the
                    // close teardown.
                    RequestKind::Connect(connect) => {
                        let status = connect.error.map_or(Ok(()), Err);
                        connect.cont.fulfill(self, status);
                    }
                    RequestKind::Shutdown(shutdown) => {
                        let status = shutdown.error.map_or(Ok(()), Err);
                        shutdown.cont.fulfill(self, status);
                    }
                    _ => {}
                }
            }
        }

        // Drain procedure: half-close once every pending byte is out.
        let ready = match self.stream_state(h) {
            Ok(state) => {
                state.write_queue.is_empty()
                    && state.has_flag(SHUTTING)
                    && !state.has_flag(SHUT)
                    && state.shutdown_req.is_some()
            }
            Err(_) => false,
        };
        if ready {
            self.stream_do_shutdown(h);
        }
        self.stream_update(h);
    }

    fn stream_do_shutdown(&mut self, h: Handle) {
        let (fd, req) = match self.stream_state_mut(h) {
            Ok(state) => (state.fd, state.shutdown_req.take()),
            Err(_) => return,
        };
        let req = match req {
            Some(req) => req,
            None => return,
        };
        let status = match fd {
            Some(fd) => match syscall!(shutdown(fd, libc::SHUT_WR)) {
                Ok(_) => Ok(()),
                Err(err) => Err(Errno::from_io(&err)),
            },
            None => Err(Errno::ECANCELED),
        };
        if let Ok(state) = self.stream_state_mut(h) {
            state.set_flag(SHUT, status.is_ok());
            state.set_flag(WRITABLE, false);
        }
        if let Some(record) = self.take_request(req) {
            if let RequestKind::Shutdown(shutdown) = record.kind {
                let status = shutdown.error.map_or(status, Err);
                shutdown.cont.fulfill(self, status);
            }
        }
    }

    /// Readiness from the selector.
    pub(crate) fn stream_on_event(&mut self, h: Handle, readable: bool, writable: bool) {
        if writable {
            let connecting = self
                .stream_state(h)
                .map(|s| s.connect_req.is_some())
                .unwrap_or(false);
            if connecting {
                self.stream_finish_connect(h);
            } else {
                self.stream_flush(h);
                self.stream_drain_completed(h);
            }
        }
        if readable {
            let listening = self
                .stream_state(h)
                .map(|s| s.has_flag(LISTENING))
                .unwrap_or(false);
            if listening {
                self.stream_do_accept(h);
            } else {
                self.stream_do_read(h);
            }
        }
        self.stream_update(h);
    }

    fn stream_finish_connect(&mut self, h: Handle) {
        let (fd, req) = match self.stream_state_mut(h) {
            Ok(state) => match (state.fd, state.connect_req.take()) {
                (Some(fd), Some(req)) => (fd, req),
                _ => return,
            },
            Err(_) => return,
        };
        let status = match crate::sys::net::take_socket_error(fd) {
            Ok(()) => Ok(()),
            Err(err) => Err(Errno::from_io(&err)),
        };
        if status.is_ok() {
            if let Ok(state) = self.stream_state_mut(h) {
                state.set_flag(READABLE, true);
                state.set_flag(WRITABLE, true);
            }
        }
        if let Some(record) = self.take_request(req) {
            if let RequestKind::Connect(connect) = record.kind {
                let status = connect.error.map_or(status, Err);
                connect.cont.fulfill(self, status);
            }
        }
        self.stream_update(h);
    }

    fn stream_do_accept(&mut self, h: Handle) {
        loop {
            let (fd, pending) = match self.stream_state(h) {
                Ok(state) => match state.fd {
                    Some(fd) => (fd, !state.accepted_fds.is_empty()),
                    None => return,
                },
                Err(_) => return,
            };
            if pending {
                // Previous connection unclaimed; interest update below stops
                // the watcher until `accept` runs.
                return;
            }
            match crate::sys::net::accept(fd) {
                Ok(cfd) => {
                    if let Ok(state) = self.stream_state_mut(h) {
                        state.accepted_fds.push_back(cfd);
                    }
                    self.stream_fire_connection(h, Ok(()));
                    if self.single_accept {
                        return;
                    }
                }
                Err(err) => {
                    let errno = Errno::from_io(&err);
                    if errno.is_would_block() {
                        return;
                    }
                    if errno == Errno::ECONNABORTED {
                        // The peer gave up between SYN and accept; take the
                        // next one.
                        continue;
                    }
                    if (errno == Errno::EMFILE || errno == Errno::from_raw(libc::ENFILE))
                        && self.emfile_trick
                    {
                        self.accept_emfile_trick(fd);
                        continue;
                    }
                    self.stream_fire_connection(h, Err(errno));
                    return;
                }
            }
        }
    }

    /// Out of descriptors: momentarily give back the spare fd, drain the
    /// backlog by closing every waiting connection (signalling overload to
    /// clients), then re-arm the spare.
    fn accept_emfile_trick(&mut self, listen_fd: RawFd) {
        let spare = match self.spare_fd.take() {
            Some(fd) => fd,
            None => return,
        };
        fdio::close(spare);
        loop {
            match crate::sys::net::accept(listen_fd) {
                Ok(cfd) => fdio::close(cfd),
                Err(ref err) if err.raw_os_error() == Some(libc::ECONNABORTED) => continue,
                Err(_) => break,
            }
        }
        self.spare_fd = fdio::open_spare_fd();
    }

    fn stream_fire_connection(&mut self, h: Handle, status: StreamStatus) {
        let cb = match self.stream_state(h) {
            Ok(state) => state.connection_cb.clone(),
            Err(_) => None,
        };
        if let Some(cb) = cb {
            self.dispatch(move |ctx| (cb.borrow_mut())(ctx, status));
        }
    }

    fn stream_do_read(&mut self, h: Handle) {
        for _ in 0..MAX_READS_PER_EVENT {
            let (fd, ipc) = match self.stream_state(h) {
                Ok(state) if state.has_flag(READING) => match state.fd {
                    Some(fd) => (fd, state.is_ipc()),
                    None => return,
                },
                _ => return,
            };
            let mut buf = vec![0u8; READ_BUF_SIZE];
            let result = if ipc {
                let mut fds = Vec::new();
                let result = fdio::recvmsg_fds(fd, &mut buf, &mut fds);
                if !fds.is_empty() {
                    if let Ok(state) = self.stream_state_mut(h) {
                        state.accepted_fds.extend(fds);
                    }
                }
                result
            } else {
                fdio::read(fd, &mut buf)
            };
            match result {
                Ok(0) => {
                    // EOF: reading stops, the callback learns last.
                    if let Ok(state) = self.stream_state_mut(h) {
                        state.set_flag(READING, false);
                        state.set_flag(READABLE, false);
                    }
                    self.stream_update(h);
                    self.stream_fire_read(h, Ok(None));
                    return;
                }
                Ok(n) => {
                    buf.truncate(n);
                    self.stream_fire_read(h, Ok(Some(buf)));
                    if n < READ_BUF_SIZE {
                        // Short read drained the socket; don't burn a
                        // syscall confirming it.
                        return;
                    }
                }
                Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) => {
                    let errno = Errno::from_io(&err);
                    if errno.is_would_block() {
                        self.stream_update(h);
                        return;
                    }
                    if let Ok(state) = self.stream_state_mut(h) {
                        state.set_flag(READING, false);
                    }
                    self.stream_update(h);
                    self.stream_fire_read(h, Err(errno));
                    return;
                }
            }
        }
    }

    fn stream_fire_read(&mut self, h: Handle, result: ReadResult) {
        let cb = match self.stream_state(h) {
            Ok(state) => state.read_cb.clone(),
            Err(_) => None,
        };
        if let Some(cb) = cb {
            self.dispatch(move |ctx| (cb.borrow_mut())(ctx, result));
        }
    }

    /// Recompute selector interest and the handle's active flag from state.
    pub(crate) fn stream_update(&mut self, h: Handle) {
        let (fd, desired, registered, active) = match self.stream_state(h) {
            Ok(state) => {
                let fd = match state.fd {
                    Some(fd) => fd,
                    None => return,
                };
                let want_read = (state.has_flag(READING) && !state.has_flag(BLOCKING))
                    || (state.has_flag(LISTENING) && state.accepted_fds.is_empty());
                let want_write = (!state.write_queue.is_empty() && !state.has_flag(BLOCKING))
                    || state.connect_req.is_some();
                let mut desired: Option<Interest> = None;
                if want_read {
                    desired = Some(Interest::READABLE);
                }
                if want_write {
                    desired = Some(desired.map_or(Interest::WRITABLE, |i| i | Interest::WRITABLE));
                }
                let active = desired.is_some()
                    || !state.completed.is_empty()
                    || state.shutdown_req.is_some()
                    || !state.write_queue.is_empty();
                (fd, desired, state.interest, active)
            }
            Err(_) => return,
        };
        if desired != registered {
            let token = h.token();
            let result = match (registered, desired) {
                (None, Some(interest)) => self.selector.register(fd, token, interest),
                (Some(_), Some(interest)) => self.selector.reregister(fd, token, interest),
                (Some(_), None) => self.selector.deregister(fd),
                (None, None) => Ok(()),
            };
            match result {
                Ok(()) => {
                    if let Ok(state) = self.stream_state_mut(h) {
                        state.interest = desired;
                    }
                }
                Err(err) => log::warn!("stream interest update failed: {}", err),
            }
        }
        self.set_active(h, active);
    }

    /// Queue the handle on the loop's pending list for completion delivery.
    pub(crate) fn stream_schedule_drain(&mut self, h: Handle) {
        if let Ok(state) = self.stream_state_mut(h) {
            if !state.has_flag(IN_PENDING) {
                state.set_flag(IN_PENDING, true);
                self.pending.push_back(h);
            }
        }
    }

    /// Close-time destruction: cancel the connect, fail every queued write,
    /// cancel a pending shutdown, release descriptors. The completions fire
    /// from the close phase, right before the CLOSED callback.
    pub(crate) fn stream_teardown(&mut self, h: Handle) {
        let (fd, interest, reqs, connect, shutdown, accepted) = match self.stream_state_mut(h) {
            Ok(state) => {
                state.read_cb = None;
                state.connection_cb = None;
                state.set_flag(READING, false);
                state.set_flag(LISTENING, false);
                state.set_flag(READABLE, false);
                state.set_flag(WRITABLE, false);
                state.write_queue_size = 0;
                (
                    state.fd.take(),
                    state.interest.take(),
                    std::mem::take(&mut state.write_queue),
                    state.connect_req.take(),
                    state.shutdown_req.take(),
                    std::mem::take(&mut state.accepted_fds),
                )
            }
            Err(_) => return,
        };
        for req in reqs {
            if let Some(record) = self.requests.get_mut(req.index as usize) {
                if let RequestKind::Write(write) = &mut record.kind {
                    write.error = Some(Errno::ECANCELED);
                }
            }
            if let Ok(state) = self.stream_state_mut(h) {
                state.completed.push_back(req);
            }
        }
        for req in connect.into_iter().chain(shutdown) {
            if let Some(record) = self.requests.get_mut(req.index as usize) {
                match &mut record.kind {
                    RequestKind::Connect(connect) => connect.error = Some(Errno::ECANCELED),
                    RequestKind::Shutdown(shutdown) => shutdown.error = Some(Errno::ECANCELED),
                    _ => {}
                }
            }
            if let Ok(state) = self.stream_state_mut(h) {
                state.completed.push_back(req);
            }
        }
        if let Some(fd) = fd {
            if interest.is_some() {
                let _ = self.selector.deregister(fd);
            }
            fdio::close(fd);
        }
        for fd in accepted {
            fdio::close(fd);
        }
    }

    // ===== state accessors =====

    pub(crate) fn stream_state(&self, h: Handle) -> Result<&StreamState> {
        match &self.record(h)?.data {
            HandleData::Stream(state) => Ok(state),
            _ => Err(Error::arg(1, "stream handle")),
        }
    }

    pub(crate) fn stream_state_mut(&mut self, h: Handle) -> Result<&mut StreamState> {
        match &mut self.record_mut(h)?.data {
            HandleData::Stream(state) => Ok(state),
            _ => Err(Error::arg(1, "stream handle")),
        }
    }

    pub(crate) fn stream_fd(&self, h: Handle) -> Result<RawFd> {
        self.stream_state(h)?.fd.ok_or(Error::Sys(Errno::EBADF))
    }
}
