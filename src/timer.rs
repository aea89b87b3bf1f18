//! Timer handles.
//!
//! Due times live in a binary heap ordered by `(due, sequence)`; the
//! sequence both breaks ties in start order and invalidates heap entries
//! left behind by `stop` — a popped entry whose sequence no longer matches
//! the timer's state is discarded. The stat poller piggybacks on the same
//! heap (see `fs_poll`).

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use crate::context::Context;
use crate::error::{Errno, Error, Result};
use crate::handle::{Handle, HandleData};

pub(crate) type TimerCallback = Rc<RefCell<dyn FnMut(&mut Context)>>;

pub(crate) struct TimerState {
    pub(crate) cb: Option<TimerCallback>,
    pub(crate) timeout: u64,
    pub(crate) repeat: u64,
    pub(crate) due: u64,
    /// Matches the heap entry that currently arms this timer.
    pub(crate) seq: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct TimerEntry {
    pub(crate) due: u64,
    pub(crate) seq: u64,
    pub(crate) handle: Handle,
}

// `BinaryHeap` is a max-heap; order entries so the earliest due time (and
// among equals, the earliest start) pops first.
impl Ord for TimerEntry {
    fn cmp(&self, other: &TimerEntry) -> Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &TimerEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Context {
    pub fn new_timer(&mut self) -> Handle {
        self.alloc_handle(HandleData::Timer(TimerState {
            cb: None,
            timeout: 0,
            repeat: 0,
            due: 0,
            seq: 0,
        }))
    }

    /// Arm the timer: fire `cb` after `timeout` ms, then every `repeat` ms
    /// while `repeat` is non-zero. Starting an armed timer re-arms it and
    /// replaces the callback slot.
    pub fn timer_start(
        &mut self,
        h: Handle,
        timeout: u64,
        repeat: u64,
        cb: impl FnMut(&mut Context) + 'static,
    ) -> Result<()> {
        if self.record(h)?.is_closing() {
            return Err(Error::Sys(Errno::EINVAL));
        }
        self.timer_stop(h)?;
        let due = self.now().saturating_add(timeout);
        let seq = self.next_seq();
        let state = self.timer_state_mut(h)?;
        state.cb = Some(Rc::new(RefCell::new(cb)));
        state.timeout = timeout;
        state.repeat = repeat;
        state.due = due;
        state.seq = seq;
        self.timer_heap.push(TimerEntry { due, seq, handle: h });
        self.set_active(h, true);
        Ok(())
    }

    /// Disarm. Idempotent; heap entries are invalidated lazily.
    pub fn timer_stop(&mut self, h: Handle) -> Result<()> {
        let seq = self.next_seq();
        let state = self.timer_state_mut(h)?;
        state.seq = seq;
        self.set_active(h, false);
        Ok(())
    }

    /// Re-arm using the repeat value. Errs if the timer has never been
    /// started (no callback to fire).
    pub fn timer_again(&mut self, h: Handle) -> Result<()> {
        let state = self.timer_state(h)?;
        if state.cb.is_none() {
            return Err(Error::Sys(Errno::EINVAL));
        }
        let repeat = state.repeat;
        if repeat == 0 {
            self.timer_stop(h)?;
            return Ok(());
        }
        let due = self.now().saturating_add(repeat);
        let seq = self.next_seq();
        let state = self.timer_state_mut(h)?;
        state.due = due;
        state.seq = seq;
        self.timer_heap.push(TimerEntry { due, seq, handle: h });
        self.set_active(h, true);
        Ok(())
    }

    pub fn timer_set_repeat(&mut self, h: Handle, repeat: u64) -> Result<()> {
        self.timer_state_mut(h)?.repeat = repeat;
        Ok(())
    }

    pub fn timer_get_repeat(&self, h: Handle) -> Result<u64> {
        Ok(self.timer_state(h)?.repeat)
    }

    /// Milliseconds until the next firing; 0 when disarmed or overdue.
    pub fn timer_get_due_in(&self, h: Handle) -> Result<u64> {
        let state = self.timer_state(h)?;
        if !self.record(h)?.is_active() {
            return Ok(0);
        }
        Ok(state.due.saturating_sub(self.now()))
    }

    pub(crate) fn timer_teardown(&mut self, h: Handle) {
        let _ = self.timer_stop(h);
        if let Ok(state) = self.timer_state_mut(h) {
            state.cb = None;
        }
    }

    // ===== loop integration =====

    pub(crate) fn next_timer_due(&self) -> Option<u64> {
        self.timer_heap.peek().map(|entry| entry.due)
    }

    pub(crate) fn run_timers(&mut self) {
        let now = self.now();
        while let Some(&entry) = self.timer_heap.peek() {
            if entry.due > now {
                break;
            }
            self.timer_heap.pop();
            match self.record(entry.handle).map(|r| r.handle_type()) {
                Ok(crate::HandleType::Timer) => self.timer_fire(entry),
                Ok(crate::HandleType::FsPoll) => self.fs_poll_tick(entry),
                _ => {}
            }
        }
    }

    fn timer_fire(&mut self, entry: TimerEntry) {
        let h = entry.handle;
        let (cb, repeat) = match self.timer_state(h) {
            Ok(state) if state.seq == entry.seq => (state.cb.clone(), state.repeat),
            _ => return,
        };
        // Re-arm before the callback so a closing callback observes the
        // final state and `again` inside the callback behaves.
        if repeat > 0 {
            let due = self.now().saturating_add(repeat);
            let seq = self.next_seq();
            if let Ok(state) = self.timer_state_mut(h) {
                state.due = due;
                state.seq = seq;
            }
            self.timer_heap.push(TimerEntry { due, seq, handle: h });
        } else {
            let _ = self.timer_stop(h);
        }
        if let Some(cb) = cb {
            self.dispatch(move |ctx| (cb.borrow_mut())(ctx));
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.timer_seq += 1;
        self.timer_seq
    }

    fn timer_state(&self, h: Handle) -> Result<&TimerState> {
        match &self.record(h)?.data {
            HandleData::Timer(state) => Ok(state),
            _ => Err(Error::arg(1, "timer handle")),
        }
    }

    fn timer_state_mut(&mut self, h: Handle) -> Result<&mut TimerState> {
        match &mut self.record_mut(h)?.data {
            HandleData::Timer(state) => Ok(state),
            _ => Err(Error::arg(1, "timer handle")),
        }
    }
}
