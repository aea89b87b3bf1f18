//! Handle registry: the arena of live handles and the operations common to
//! every handle kind.
//!
//! A handle record owns the kind-specific state (a tagged union, one variant
//! per handle type) plus the close-callback slot and lifecycle flags. The
//! record stays in the arena — pinned — from creation until after the close
//! callback has fired; a generation counter makes stale [`Handle`] ids and
//! stale selector events detectable instead of dangerous.

use std::os::fd::RawFd;

use crate::context::Context;
use crate::error::{Errno, Error, Result};
use crate::token::Token;

/// Identifier of a live handle.
///
/// Plain data: copying it never extends the handle's lifetime. All
/// operations go through the owning [`Context`], which validates the
/// generation on every access.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl Handle {
    pub(crate) fn token(self) -> Token {
        Token::new(self.index as usize, self.generation)
    }
}

/// The kind of a handle, as reported by `handle_type`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandleType {
    Async,
    Check,
    FsEvent,
    FsPoll,
    Idle,
    Pipe,
    Poll,
    Prepare,
    Process,
    Signal,
    Tcp,
    Timer,
    Tty,
    Udp,
}

impl HandleType {
    pub fn name(self) -> &'static str {
        match self {
            HandleType::Async => "async",
            HandleType::Check => "check",
            HandleType::FsEvent => "fs_event",
            HandleType::FsPoll => "fs_poll",
            HandleType::Idle => "idle",
            HandleType::Pipe => "pipe",
            HandleType::Poll => "poll",
            HandleType::Prepare => "prepare",
            HandleType::Process => "process",
            HandleType::Signal => "signal",
            HandleType::Tcp => "tcp",
            HandleType::Timer => "timer",
            HandleType::Tty => "tty",
            HandleType::Udp => "udp",
        }
    }
}

pub(crate) const ACTIVE: u8 = 0b0001;
pub(crate) const CLOSING: u8 = 0b0010;
pub(crate) const REFED: u8 = 0b0100;
/// Loop-internal handle (e.g. the child-reaper signal watcher); hidden from
/// `walk` and never keeps the loop alive.
pub(crate) const INTERNAL: u8 = 0b1000;

pub(crate) enum HandleData {
    Timer(crate::timer::TimerState),
    Idle(crate::phase::PhaseState),
    Prepare(crate::phase::PhaseState),
    Check(crate::phase::PhaseState),
    Signal(crate::signal::SignalState),
    Poll(crate::pollfd::PollState),
    Stream(crate::stream::StreamState),
    Udp(crate::udp::UdpState),
    Process(crate::process::ProcessState),
    FsEvent(crate::fs_event::FsEventState),
    FsPoll(crate::fs_poll::FsPollState),
    Async(crate::asynch::AsyncState),
}

pub(crate) struct HandleRecord {
    pub(crate) generation: u32,
    pub(crate) flags: u8,
    pub(crate) data: HandleData,
    pub(crate) closed_cb: Option<Box<dyn FnOnce(&mut Context)>>,
}

impl HandleRecord {
    pub(crate) fn is_active(&self) -> bool {
        self.flags & ACTIVE != 0
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.flags & CLOSING != 0
    }

    pub(crate) fn handle_type(&self) -> HandleType {
        match &self.data {
            HandleData::Timer(_) => HandleType::Timer,
            HandleData::Idle(_) => HandleType::Idle,
            HandleData::Prepare(_) => HandleType::Prepare,
            HandleData::Check(_) => HandleType::Check,
            HandleData::Signal(_) => HandleType::Signal,
            HandleData::Poll(_) => HandleType::Poll,
            HandleData::Stream(s) => s.handle_type(),
            HandleData::Udp(_) => HandleType::Udp,
            HandleData::Process(_) => HandleType::Process,
            HandleData::FsEvent(_) => HandleType::FsEvent,
            HandleData::FsPoll(_) => HandleType::FsPoll,
            HandleData::Async(_) => HandleType::Async,
        }
    }

    /// Underlying descriptor, for the kinds that have one.
    pub(crate) fn fd(&self) -> Option<RawFd> {
        match &self.data {
            HandleData::Stream(s) => s.fd,
            HandleData::Udp(u) => u.fd,
            HandleData::Poll(p) => Some(p.fd),
            _ => None,
        }
    }
}

impl Context {
    /// Whether the handle has started an operation that may deliver future
    /// callbacks.
    pub fn is_active(&self, h: Handle) -> Result<bool> {
        Ok(self.record(h)?.is_active())
    }

    pub fn is_closing(&self, h: Handle) -> Result<bool> {
        Ok(self.record(h)?.is_closing())
    }

    /// Request the handle be closed. `cb` fires from the close phase of the
    /// loop, after every other pending callback of this handle, and then the
    /// handle is released.
    ///
    /// Closing a handle that is already closing is a caller error, distinct
    /// from idempotent close.
    pub fn close(
        &mut self,
        h: Handle,
        cb: Option<Box<dyn FnOnce(&mut Context)>>,
    ) -> Result<()> {
        let record = self.record_mut(h)?;
        if record.is_closing() {
            return Err(Error::State("handle is already closing"));
        }
        if cb.is_some() {
            record.closed_cb = cb;
        }
        self.start_close(h);
        Ok(())
    }

    /// Reference the handle: while active it keeps the loop alive.
    pub fn ref_handle(&mut self, h: Handle) -> Result<()> {
        let record = self.record_mut(h)?;
        if record.flags & REFED == 0 {
            record.flags |= REFED;
            if record.is_active() && record.flags & INTERNAL == 0 {
                self.active_handles += 1;
            }
        }
        Ok(())
    }

    /// Unreference the handle: it may stay active without keeping the loop
    /// alive.
    pub fn unref_handle(&mut self, h: Handle) -> Result<()> {
        let record = self.record_mut(h)?;
        if record.flags & REFED != 0 {
            record.flags &= !REFED;
            if record.is_active() && record.flags & INTERNAL == 0 {
                self.active_handles -= 1;
            }
        }
        Ok(())
    }

    pub fn has_ref(&self, h: Handle) -> Result<bool> {
        Ok(self.record(h)?.flags & REFED != 0)
    }

    pub fn handle_type(&self, h: Handle) -> Result<HandleType> {
        Ok(self.record(h)?.handle_type())
    }

    /// The descriptor behind the handle, when it has one.
    pub fn fileno(&self, h: Handle) -> Result<RawFd> {
        self.record(h)?.fd().ok_or(Error::Sys(Errno::EINVAL))
    }

    /// Get (`None`) or set the kernel send buffer size.
    pub fn send_buffer_size(&mut self, h: Handle, value: Option<i32>) -> Result<i32> {
        self.socket_buffer_size(h, libc::SO_SNDBUF, value)
    }

    /// Get (`None`) or set the kernel receive buffer size.
    pub fn recv_buffer_size(&mut self, h: Handle, value: Option<i32>) -> Result<i32> {
        self.socket_buffer_size(h, libc::SO_RCVBUF, value)
    }

    fn socket_buffer_size(&mut self, h: Handle, opt: libc::c_int, value: Option<i32>) -> Result<i32> {
        let fd = self.fileno(h)?;
        match value {
            None | Some(0) => {
                crate::sys::net::get_int_opt(fd, libc::SOL_SOCKET, opt).map_err(Error::from)
            }
            Some(n) => {
                crate::sys::net::set_opt(fd, libc::SOL_SOCKET, opt, n as libc::c_int)?;
                Ok(0)
            }
        }
    }

    /// Best guess at the handle kind an arbitrary descriptor would get.
    pub fn guess_handle(&self, fd: RawFd) -> &'static str {
        if unsafe { libc::isatty(fd) } == 1 {
            return "tty";
        }
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            return "unknown";
        }
        match stat.st_mode & libc::S_IFMT {
            libc::S_IFREG | libc::S_IFCHR | libc::S_IFBLK => "file",
            libc::S_IFIFO => "pipe",
            libc::S_IFSOCK => match crate::sys::net::get_int_opt(fd, libc::SOL_SOCKET, libc::SO_TYPE)
            {
                Ok(libc::SOCK_DGRAM) => "udp",
                Ok(libc::SOCK_STREAM) => "tcp",
                _ => "unknown",
            },
            _ => "unknown",
        }
    }

    // ===== arena internals =====

    pub(crate) fn alloc_handle(&mut self, data: HandleData) -> Handle {
        let generation = self.bump_generation();
        let index = self.handles.insert(HandleRecord {
            generation,
            flags: REFED,
            data,
            closed_cb: None,
        }) as u32;
        log::trace!("allocated handle {}/{}", index, generation);
        Handle { index, generation }
    }

    pub(crate) fn record(&self, h: Handle) -> Result<&HandleRecord> {
        match self.handles.get(h.index as usize) {
            Some(record) if record.generation == h.generation => Ok(record),
            _ => Err(Error::arg(1, "live handle")),
        }
    }

    pub(crate) fn record_mut(&mut self, h: Handle) -> Result<&mut HandleRecord> {
        match self.handles.get_mut(h.index as usize) {
            Some(record) if record.generation == h.generation => Ok(record),
            _ => Err(Error::arg(1, "live handle")),
        }
    }

    /// Resolve a selector token back to the handle it was registered for,
    /// dropping events for slots that died while the event was in flight.
    pub(crate) fn handle_for_token(&self, token: Token) -> Option<Handle> {
        let h = Handle {
            index: token.index() as u32,
            generation: token.generation(),
        };
        self.record(h).ok().map(|_| h)
    }

    /// Flip the active flag, maintaining the loop-alive accounting.
    pub(crate) fn set_active(&mut self, h: Handle, active: bool) {
        if let Ok(record) = self.record_mut(h) {
            let was = record.is_active();
            if was == active {
                return;
            }
            if active {
                record.flags |= ACTIVE;
            } else {
                record.flags &= !ACTIVE;
            }
            let counted = record.flags & REFED != 0 && record.flags & INTERNAL == 0;
            if counted {
                if active {
                    self.active_handles += 1;
                } else {
                    self.active_handles -= 1;
                }
            }
        }
    }

    /// Kind-specific teardown, then queue the handle for the close phase.
    pub(crate) fn start_close(&mut self, h: Handle) {
        self.set_active(h, false);
        if let Ok(record) = self.record_mut(h) {
            record.flags |= CLOSING;
        }
        match self.record(h).map(|r| r.handle_type()) {
            Ok(HandleType::Timer) => self.timer_teardown(h),
            Ok(HandleType::FsPoll) => self.fs_poll_teardown(h),
            Ok(HandleType::Idle) | Ok(HandleType::Prepare) | Ok(HandleType::Check) => {
                self.phase_teardown(h)
            }
            Ok(HandleType::Signal) => self.signal_teardown(h),
            Ok(HandleType::Poll) => self.pollfd_teardown(h),
            Ok(HandleType::Tcp) | Ok(HandleType::Pipe) | Ok(HandleType::Tty) => {
                self.stream_teardown(h)
            }
            Ok(HandleType::Udp) => self.udp_teardown(h),
            Ok(HandleType::Process) => self.process_teardown(h),
            Ok(HandleType::FsEvent) => self.fs_event_teardown(h),
            Ok(HandleType::Async) => self.async_teardown(h),
            Err(_) => return,
        }
        self.closing.push_back(h);
    }

    /// Run the CLOSED callback and release the record. The close callback is
    /// the last the handle ever fires: completions the teardown cancelled
    /// are delivered first.
    pub(crate) fn finish_close(&mut self, h: Handle) {
        match self.record(h).map(|r| r.handle_type()) {
            Ok(HandleType::Tcp) | Ok(HandleType::Pipe) | Ok(HandleType::Tty) => {
                self.stream_drain_completed(h)
            }
            Ok(HandleType::Udp) => self.udp_drain_completed(h),
            _ => {}
        }
        let cb = match self.record_mut(h) {
            Ok(record) => record.closed_cb.take(),
            Err(_) => return,
        };
        if let Some(cb) = cb {
            self.dispatch(cb);
        }
        if self.record(h).is_ok() {
            log::trace!("released handle {}/{}", h.index, h.generation);
            self.handles.remove(h.index as usize);
        }
    }
}
