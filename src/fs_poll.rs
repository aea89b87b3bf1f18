//! Stat pollers: watch a path by comparing periodic `stat` snapshots.
//!
//! Rides the timer heap; each tick stats the path inline (the snapshot is
//! cheap and the comparison happens on the loop thread anyway).

use std::cell::RefCell;
use std::rc::Rc;

use crate::context::Context;
use crate::error::{Errno, Error, Result};
use crate::fs::Stat;
use crate::handle::{Handle, HandleData};
use crate::timer::TimerEntry;

/// One delivery: previous and current stat on change, or the stat error.
pub type FsPollEvent = std::result::Result<(Stat, Stat), Errno>;

pub(crate) type FsPollCallback = Rc<RefCell<dyn FnMut(&mut Context, FsPollEvent)>>;

pub(crate) struct FsPollState {
    pub(crate) path: String,
    pub(crate) interval: u64,
    pub(crate) prev: Option<Stat>,
    pub(crate) cb: Option<FsPollCallback>,
    pub(crate) seq: u64,
}

impl Context {
    pub fn new_fs_poll(&mut self) -> Handle {
        self.alloc_handle(HandleData::FsPoll(FsPollState {
            path: String::new(),
            interval: 0,
            prev: None,
            cb: None,
            seq: 0,
        }))
    }

    pub fn fs_poll_start(
        &mut self,
        h: Handle,
        path: &str,
        interval_ms: u64,
        cb: impl FnMut(&mut Context, FsPollEvent) + 'static,
    ) -> Result<()> {
        if self.record(h)?.is_active() {
            return Err(Error::Sys(Errno::EBUSY));
        }
        let interval = interval_ms.max(1);
        let due = self.now().saturating_add(interval);
        let seq = {
            self.timer_seq += 1;
            self.timer_seq
        };
        {
            let state = self.fs_poll_state_mut(h)?;
            state.path = path.to_string();
            state.interval = interval;
            state.prev = None;
            state.cb = Some(Rc::new(RefCell::new(cb)));
            state.seq = seq;
        }
        // Baseline snapshot; a failure here is reported on the first tick
        // the way a vanished path would be.
        let baseline = stat_path(path);
        if let Ok(stat) = baseline {
            self.fs_poll_state_mut(h)?.prev = Some(stat);
        }
        self.timer_heap.push(TimerEntry { due, seq, handle: h });
        self.set_active(h, true);
        Ok(())
    }

    /// Idempotent.
    pub fn fs_poll_stop(&mut self, h: Handle) -> Result<()> {
        let seq = {
            self.timer_seq += 1;
            self.timer_seq
        };
        self.fs_poll_state_mut(h)?.seq = seq;
        self.set_active(h, false);
        Ok(())
    }

    pub fn fs_poll_getpath(&self, h: Handle) -> Result<String> {
        Ok(self.fs_poll_state(h)?.path.clone())
    }

    pub(crate) fn fs_poll_teardown(&mut self, h: Handle) {
        let _ = self.fs_poll_stop(h);
        if let Ok(state) = self.fs_poll_state_mut(h) {
            state.cb = None;
        }
    }

    /// Timer-heap tick for a poller: snapshot, compare, re-arm.
    pub(crate) fn fs_poll_tick(&mut self, entry: TimerEntry) {
        let h = entry.handle;
        let (path, interval, prev, cb) = match self.fs_poll_state(h) {
            Ok(state) if state.seq == entry.seq => (
                state.path.clone(),
                state.interval,
                state.prev,
                state.cb.clone(),
            ),
            _ => return,
        };

        // Re-arm before dispatch so a stop inside the callback wins.
        let due = self.now().saturating_add(interval);
        let seq = {
            self.timer_seq += 1;
            self.timer_seq
        };
        if let Ok(state) = self.fs_poll_state_mut(h) {
            state.seq = seq;
        }
        self.timer_heap.push(TimerEntry { due, seq, handle: h });

        let event: Option<FsPollEvent> = match stat_path(&path) {
            Ok(curr) => {
                if let Ok(state) = self.fs_poll_state_mut(h) {
                    state.prev = Some(curr);
                }
                match prev {
                    Some(prev) if prev != curr => Some(Ok((prev, curr))),
                    None => Some(Ok((Stat::default(), curr))),
                    _ => None,
                }
            }
            Err(errno) => {
                if let Ok(state) = self.fs_poll_state_mut(h) {
                    state.prev = None;
                }
                // Only report the transition into the error state.
                if prev.is_some() {
                    Some(Err(errno))
                } else {
                    None
                }
            }
        };
        if let (Some(event), Some(cb)) = (event, cb) {
            self.dispatch(move |ctx| (cb.borrow_mut())(ctx, event));
        }
    }

    fn fs_poll_state(&self, h: Handle) -> Result<&FsPollState> {
        match &self.record(h)?.data {
            HandleData::FsPoll(state) => Ok(state),
            _ => Err(Error::arg(1, "fs_poll handle")),
        }
    }

    fn fs_poll_state_mut(&mut self, h: Handle) -> Result<&mut FsPollState> {
        match &mut self.record_mut(h)?.data {
            HandleData::FsPoll(state) => Ok(state),
            _ => Err(Error::arg(1, "fs_poll handle")),
        }
    }
}

fn stat_path(path: &str) -> std::result::Result<Stat, Errno> {
    let cpath = match std::ffi::CString::new(path) {
        Ok(cpath) => cpath,
        Err(_) => return Err(Errno::EINVAL),
    };
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    match syscall!(stat(cpath.as_ptr(), &mut st)) {
        Ok(_) => Ok(Stat::from(st)),
        Err(err) => Err(Errno::from_io(&err)),
    }
}
