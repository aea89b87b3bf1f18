//! Filesystem event watchers, backed by inotify.

use std::cell::RefCell;
use std::ffi::CString;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::context::Context;
use crate::error::{Errno, Error, Result};
use crate::handle::{Handle, HandleData};
use crate::interest::Interest;
use crate::sys::fdio;

/// What happened to the watched path.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FsEventFlags {
    /// Contents changed.
    pub change: bool,
    /// The entry itself appeared, disappeared, or moved.
    pub rename: bool,
}

/// One delivery: the affected filename (when the kernel reports one) plus
/// the event class, or the error that broke the watch.
pub type FsEvent = std::result::Result<(Option<String>, FsEventFlags), Errno>;

pub(crate) type FsEventCallback = Rc<RefCell<dyn FnMut(&mut Context, FsEvent)>>;

pub(crate) struct FsEventState {
    pub(crate) inotify_fd: RawFd,
    pub(crate) wd: i32,
    pub(crate) cb: Option<FsEventCallback>,
}

impl Context {
    pub fn new_fs_event(&mut self) -> Handle {
        self.alloc_handle(HandleData::FsEvent(FsEventState {
            inotify_fd: -1,
            wd: -1,
            cb: None,
        }))
    }

    /// Watch `path`. Recursive watching is not provided by the backend and
    /// the flag is ignored, matching the platform-dependent contract.
    pub fn fs_event_start(
        &mut self,
        h: Handle,
        path: &str,
        _recursive: bool,
        cb: impl FnMut(&mut Context, FsEvent) + 'static,
    ) -> Result<()> {
        {
            let state = self.fs_event_state(h)?;
            if state.inotify_fd >= 0 {
                return Err(Error::Sys(Errno::EBUSY));
            }
        }
        let cpath = CString::new(path).map_err(|_| Error::arg(2, "path without interior nul"))?;
        let fd = syscall!(inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC))
            .map_err(Error::sys)?;
        let mask = libc::IN_ATTRIB
            | libc::IN_CREATE
            | libc::IN_MODIFY
            | libc::IN_DELETE
            | libc::IN_DELETE_SELF
            | libc::IN_MOVE_SELF
            | libc::IN_MOVED_FROM
            | libc::IN_MOVED_TO;
        let wd = match syscall!(inotify_add_watch(fd, cpath.as_ptr(), mask)) {
            Ok(wd) => wd,
            Err(err) => {
                fdio::close(fd);
                return Err(Error::sys(err));
            }
        };
        if let Err(err) = self.selector.register(fd, h.token(), Interest::READABLE) {
            fdio::close(fd);
            return Err(Error::sys(err));
        }
        let state = self.fs_event_state_mut(h)?;
        state.inotify_fd = fd;
        state.wd = wd;
        state.cb = Some(Rc::new(RefCell::new(cb)));
        self.set_active(h, true);
        Ok(())
    }

    /// Idempotent.
    pub fn fs_event_stop(&mut self, h: Handle) -> Result<()> {
        let (fd, wd) = {
            let state = self.fs_event_state_mut(h)?;
            let pair = (state.inotify_fd, state.wd);
            state.inotify_fd = -1;
            state.wd = -1;
            pair
        };
        if fd >= 0 {
            if wd >= 0 {
                let _ = syscall!(inotify_rm_watch(fd, wd));
            }
            let _ = self.selector.deregister(fd);
            fdio::close(fd);
        }
        self.set_active(h, false);
        Ok(())
    }

    pub(crate) fn fs_event_teardown(&mut self, h: Handle) {
        let _ = self.fs_event_stop(h);
        if let Ok(state) = self.fs_event_state_mut(h) {
            state.cb = None;
        }
    }

    pub(crate) fn fs_event_on_event(&mut self, h: Handle) {
        let mut buf = [0u8; 4096];
        loop {
            // Re-check each pass: a callback may have stopped the watch and
            // closed the descriptor.
            let fd = match self.fs_event_state(h) {
                Ok(state) if state.inotify_fd >= 0 => state.inotify_fd,
                _ => return,
            };
            let n = match fdio::read(fd, &mut buf) {
                Ok(n) => n,
                Err(_) => return,
            };
            let mut offset = 0;
            while offset + std::mem::size_of::<libc::inotify_event>() <= n {
                // SAFETY: the kernel lays out complete events in the buffer.
                let event = unsafe {
                    &*(buf.as_ptr().add(offset) as *const libc::inotify_event)
                };
                let name_len = event.len as usize;
                let name = if name_len > 0 {
                    let start = offset + std::mem::size_of::<libc::inotify_event>();
                    let raw = &buf[start..start + name_len];
                    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                    Some(String::from_utf8_lossy(&raw[..end]).into_owned())
                } else {
                    None
                };
                let rename_mask = libc::IN_CREATE
                    | libc::IN_DELETE
                    | libc::IN_DELETE_SELF
                    | libc::IN_MOVE_SELF
                    | libc::IN_MOVED_FROM
                    | libc::IN_MOVED_TO;
                let flags = FsEventFlags {
                    change: event.mask & (libc::IN_ATTRIB | libc::IN_MODIFY) != 0,
                    rename: event.mask & rename_mask != 0,
                };
                self.fs_event_fire(h, Ok((name, flags)));
                offset += std::mem::size_of::<libc::inotify_event>() + name_len;
            }
            if n < buf.len() {
                return;
            }
        }
    }

    fn fs_event_fire(&mut self, h: Handle, event: FsEvent) {
        let cb = match self.fs_event_state(h) {
            Ok(state) => state.cb.clone(),
            Err(_) => None,
        };
        if let Some(cb) = cb {
            self.dispatch(move |ctx| (cb.borrow_mut())(ctx, event));
        }
    }

    fn fs_event_state(&self, h: Handle) -> Result<&FsEventState> {
        match &self.record(h)?.data {
            HandleData::FsEvent(state) => Ok(state),
            _ => Err(Error::arg(1, "fs_event handle")),
        }
    }

    fn fs_event_state_mut(&mut self, h: Handle) -> Result<&mut FsEventState> {
        match &mut self.record_mut(h)?.data {
            HandleData::FsEvent(state) => Ok(state),
            _ => Err(Error::arg(1, "fs_event handle")),
        }
    }
}
