//! Poll handles: readiness callbacks for descriptors the loop does not
//! otherwise own.

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::context::Context;
use crate::error::{Errno, Error, Result};
use crate::handle::{Handle, HandleData};
use crate::interest::Interest;

/// Event set for a poll handle, both as requested and as delivered.
///
/// The string form uses `r` (readable), `w` (writable), `d` (disconnect)
/// and `p` (prioritized), in that order.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PollEvents {
    pub readable: bool,
    pub writable: bool,
    pub disconnect: bool,
    pub prioritized: bool,
}

impl PollEvents {
    /// Parse an event string such as `"rw"` or `"rdp"`. Order-insensitive;
    /// anything outside the alphabet is an error.
    pub fn parse(s: &str) -> Result<PollEvents> {
        let mut events = PollEvents::default();
        for c in s.chars() {
            match c {
                'r' => events.readable = true,
                'w' => events.writable = true,
                'd' => events.disconnect = true,
                'p' => events.prioritized = true,
                _ => return Err(Error::arg(2, "poll event string")),
            }
        }
        if events == PollEvents::default() {
            return Err(Error::arg(2, "poll event string"));
        }
        Ok(events)
    }

    pub fn as_str(self) -> &'static str {
        const TABLE: [&str; 16] = [
            "", "r", "w", "rw", "d", "rd", "wd", "rwd", "p", "rp", "wp", "rwp", "dp", "rdp",
            "wdp", "rwdp",
        ];
        let idx = self.readable as usize
            | (self.writable as usize) << 1
            | (self.disconnect as usize) << 2
            | (self.prioritized as usize) << 3;
        TABLE[idx]
    }

    // Callers guarantee a non-empty set (`parse` rejects empty strings).
    fn to_interest(self) -> Interest {
        let mut interest: Option<Interest> = None;
        for (on, flag) in [
            (self.readable, Interest::READABLE),
            (self.writable, Interest::WRITABLE),
            (self.disconnect, Interest::DISCONNECT),
            (self.prioritized, Interest::PRIORITY),
        ] {
            if on {
                interest = Some(interest.map_or(flag, |i| i | flag));
            }
        }
        interest.unwrap_or(Interest::READABLE)
    }
}

pub(crate) type PollCallback =
    Rc<RefCell<dyn FnMut(&mut Context, std::result::Result<PollEvents, Errno>)>>;

pub(crate) struct PollState {
    pub(crate) fd: RawFd,
    pub(crate) wanted: PollEvents,
    pub(crate) registered: bool,
    pub(crate) cb: Option<PollCallback>,
}

impl Context {
    /// Watch an arbitrary descriptor. The handle takes no ownership of the
    /// fd; the caller closes it after closing the handle.
    pub fn new_poll(&mut self, fd: RawFd) -> Result<Handle> {
        Ok(self.alloc_handle(HandleData::Poll(PollState {
            fd,
            wanted: PollEvents::default(),
            registered: false,
            cb: None,
        })))
    }

    /// Start watching for `events` (see [`PollEvents::parse`]). Restarting
    /// with a different set is allowed and atomic with respect to delivery.
    pub fn poll_start(
        &mut self,
        h: Handle,
        events: &str,
        cb: impl FnMut(&mut Context, std::result::Result<PollEvents, Errno>) + 'static,
    ) -> Result<()> {
        let wanted = PollEvents::parse(events)?;
        let (fd, registered) = {
            let state = self.poll_state_mut(h)?;
            state.wanted = wanted;
            state.cb = Some(Rc::new(RefCell::new(cb)));
            (state.fd, state.registered)
        };
        let token = h.token();
        if registered {
            self.selector.reregister(fd, token, wanted.to_interest())?;
        } else {
            self.selector.register(fd, token, wanted.to_interest())?;
            self.poll_state_mut(h)?.registered = true;
        }
        self.set_active(h, true);
        Ok(())
    }

    /// Idempotent.
    pub fn poll_stop(&mut self, h: Handle) -> Result<()> {
        let (fd, registered) = {
            let state = self.poll_state_mut(h)?;
            let registered = state.registered;
            state.registered = false;
            (state.fd, registered)
        };
        if registered {
            let _ = self.selector.deregister(fd);
        }
        self.set_active(h, false);
        Ok(())
    }

    pub(crate) fn pollfd_teardown(&mut self, h: Handle) {
        let _ = self.poll_stop(h);
        if let Ok(state) = self.poll_state_mut(h) {
            state.cb = None;
        }
    }

    pub(crate) fn pollfd_on_event(
        &mut self,
        h: Handle,
        readable: bool,
        writable: bool,
        hup: bool,
        priority: bool,
        error: bool,
    ) {
        let (wanted, cb) = match self.poll_state(h) {
            Ok(state) if state.registered => (state.wanted, state.cb.clone()),
            _ => return,
        };
        let cb = match cb {
            Some(cb) => cb,
            None => return,
        };
        if error && !(readable || writable || hup || priority) {
            self.dispatch(move |ctx| (cb.borrow_mut())(ctx, Err(Errno::EBADF)));
            return;
        }
        let got = PollEvents {
            readable: readable && wanted.readable,
            writable: writable && wanted.writable,
            disconnect: hup && wanted.disconnect,
            prioritized: priority && wanted.prioritized,
        };
        if got == PollEvents::default() {
            return;
        }
        self.dispatch(move |ctx| (cb.borrow_mut())(ctx, Ok(got)));
    }

    fn poll_state(&self, h: Handle) -> Result<&PollState> {
        match &self.record(h)?.data {
            HandleData::Poll(state) => Ok(state),
            _ => Err(Error::arg(1, "poll handle")),
        }
    }

    fn poll_state_mut(&mut self, h: Handle) -> Result<&mut PollState> {
        match &mut self.record_mut(h)?.data {
            HandleData::Poll(state) => Ok(state),
            _ => Err(Error::arg(1, "poll handle")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PollEvents;

    #[test]
    fn parse_and_print() {
        for s in [
            "r", "w", "rw", "d", "rd", "wd", "rwd", "p", "rp", "wp", "rwp", "dp", "rdp", "wdp",
            "rwdp",
        ] {
            assert_eq!(PollEvents::parse(s).unwrap().as_str(), s);
        }
        assert!(PollEvents::parse("x").is_err());
        assert!(PollEvents::parse("").is_err());
        // Order-insensitive in, canonical order out.
        assert_eq!(PollEvents::parse("pr").unwrap().as_str(), "rp");
    }
}
