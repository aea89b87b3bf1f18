//! Async handles: cross-thread wakeup with typed argument transfer.
//!
//! Every handle owns one mutex-protected cell holding the latest
//! undelivered payload. A send never blocks: it replaces whatever the cell
//! held (freeing the older payload) and wakes the owning loop. Rapid sends
//! therefore coalesce — the callback observes the newest payload at least
//! once, but not necessarily one invocation per send. Callers needing
//! per-send delivery must serialize their sends against the callback.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::Context;
use crate::error::{Errno, Error, Result};
use crate::handle::{Handle, HandleData};
use crate::sys::Waker;
use crate::value::{check_args, Value};

pub(crate) type AsyncCallback = Rc<RefCell<dyn FnMut(&mut Context, Vec<Value>)>>;

/// The payload cell, shared between the handle and every sender.
pub(crate) struct AsyncCell {
    pending: Mutex<Option<Vec<Value>>>,
    waker: Arc<Waker>,
    alive: AtomicBool,
}

pub(crate) struct AsyncState {
    pub(crate) cell: Arc<AsyncCell>,
    pub(crate) cb: Option<AsyncCallback>,
}

/// Cloneable, `Send` handle for waking the owning loop from any thread.
#[derive(Clone)]
pub struct AsyncSender {
    cell: Arc<AsyncCell>,
}

impl AsyncSender {
    /// Post `args` and wake the loop. Replaces any undelivered payload.
    /// Fails once the handle has been closed.
    pub fn send(&self, args: Vec<Value>) -> Result<()> {
        check_args(&args)?;
        if !self.cell.alive.load(Ordering::Acquire) {
            return Err(Error::Sys(Errno::EINVAL));
        }
        {
            let mut pending = self.cell.pending.lock().unwrap();
            // Older payload, if any, is dropped here — latest wins.
            *pending = Some(args);
        }
        self.cell.waker.wake().map_err(Error::sys)?;
        Ok(())
    }
}

impl Context {
    /// An async handle firing `cb` on this loop whenever a sender posts.
    /// The handle counts as active until closed; unreference it if it must
    /// not keep the loop alive.
    pub fn new_async(
        &mut self,
        cb: impl FnMut(&mut Context, Vec<Value>) + 'static,
    ) -> (Handle, AsyncSender) {
        let cell = Arc::new(AsyncCell {
            pending: Mutex::new(None),
            waker: Arc::clone(&self.waker),
            alive: AtomicBool::new(true),
        });
        let h = self.alloc_handle(HandleData::Async(AsyncState {
            cell: Arc::clone(&cell),
            cb: Some(Rc::new(RefCell::new(cb))),
        }));
        self.async_handles.push(h);
        self.set_active(h, true);
        (h, AsyncSender { cell })
    }

    /// Deliver pending payloads after a wakeup. Sends landing during
    /// delivery wake the loop again, so nothing is lost.
    pub(crate) fn drain_async_cells(&mut self) {
        let handles = self.async_handles.clone();
        for h in handles {
            let (payload, cb) = match self.async_state(h) {
                Ok(state) => {
                    let payload = state.cell.pending.lock().unwrap().take();
                    (payload, state.cb.clone())
                }
                Err(_) => continue,
            };
            if let (Some(args), Some(cb)) = (payload, cb) {
                self.dispatch(move |ctx| (cb.borrow_mut())(ctx, args));
            }
        }
    }

    pub(crate) fn async_teardown(&mut self, h: Handle) {
        self.async_handles.retain(|&x| x != h);
        if let Ok(state) = self.async_state_mut(h) {
            state.cell.alive.store(false, Ordering::Release);
            state.cell.pending.lock().unwrap().take();
            state.cb = None;
        }
    }

    fn async_state(&self, h: Handle) -> Result<&AsyncState> {
        match &self.record(h)?.data {
            HandleData::Async(state) => Ok(state),
            _ => Err(Error::arg(1, "async handle")),
        }
    }

    fn async_state_mut(&mut self, h: Handle) -> Result<&mut AsyncState> {
        match &mut self.record_mut(h)?.data {
            HandleData::Async(state) => Ok(state),
            _ => Err(Error::arg(1, "async handle")),
        }
    }
}
