//! Terminal handles.

use std::os::fd::RawFd;

use crate::context::Context;
use crate::error::{Errno, Error, Result};
use crate::handle::{Handle, HandleData};
use crate::stream::{StreamState, StreamVariant};
use crate::sys::fdio;

/// Terminal mode for [`Context::tty_set_mode`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TtyMode {
    /// Initial (cooked) mode.
    Normal,
    /// Raw input mode: no echo, no line editing, no signal characters.
    Raw,
}

impl Context {
    /// Wrap a terminal descriptor. `readable` marks the handle as the input
    /// side (stdin) rather than an output side.
    pub fn new_tty(&mut self, fd: RawFd, readable: bool) -> Result<Handle> {
        if unsafe { libc::isatty(fd) } != 1 {
            return Err(Error::Sys(Errno::EINVAL));
        }
        fdio::set_nonblocking(fd, true)?;
        let mut state = StreamState::new(StreamVariant::Tty { saved: None });
        state.adopt_fd(fd, readable, !readable);
        Ok(self.alloc_handle(HandleData::Stream(state)))
    }

    pub fn tty_set_mode(&mut self, h: Handle, mode: TtyMode) -> Result<()> {
        let fd = self.tty_fd(h)?;
        let mut termios: libc::termios = unsafe { std::mem::zeroed() };
        syscall!(tcgetattr(fd, &mut termios)).map_err(Error::sys)?;

        // First mode change records the state `tty_reset_mode` restores.
        if let StreamVariant::Tty { saved } = &mut self.stream_state_mut(h)?.variant {
            if saved.is_none() {
                *saved = Some(termios);
            }
        }

        match mode {
            TtyMode::Normal => {
                if let StreamVariant::Tty { saved: Some(saved) } = &self.stream_state(h)?.variant {
                    termios = *saved;
                }
            }
            TtyMode::Raw => unsafe {
                libc::cfmakeraw(&mut termios);
            },
        }
        syscall!(tcsetattr(fd, libc::TCSADRAIN, &termios)).map_err(Error::sys)?;
        Ok(())
    }

    /// Restore the terminal state captured by the first `tty_set_mode`.
    pub fn tty_reset_mode(&mut self, h: Handle) -> Result<()> {
        let fd = self.tty_fd(h)?;
        let saved = match &self.stream_state(h)?.variant {
            StreamVariant::Tty { saved } => *saved,
            _ => None,
        };
        if let Some(termios) = saved {
            syscall!(tcsetattr(fd, libc::TCSADRAIN, &termios)).map_err(Error::sys)?;
        }
        Ok(())
    }

    /// Terminal dimensions as `(width, height)`.
    pub fn tty_get_winsize(&self, h: Handle) -> Result<(u16, u16)> {
        let fd = self.tty_fd(h)?;
        let mut size: libc::winsize = unsafe { std::mem::zeroed() };
        syscall!(ioctl(fd, libc::TIOCGWINSZ, &mut size)).map_err(Error::sys)?;
        Ok((size.ws_col, size.ws_row))
    }

    fn tty_fd(&self, h: Handle) -> Result<RawFd> {
        let state = self.stream_state(h)?;
        match state.variant {
            StreamVariant::Tty { .. } => state.fd.ok_or(Error::Sys(Errno::EBADF)),
            _ => Err(Error::arg(1, "tty handle")),
        }
    }
}
