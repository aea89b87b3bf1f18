//! Idle, prepare, and check handles.
//!
//! All three are the same machine pointed at different loop phases: idle
//! runs before prepare and forces a zero poll timeout while active, prepare
//! runs right before the poll phase, check right after. Callbacks run in
//! registration order.

use std::cell::RefCell;
use std::rc::Rc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleData};

pub(crate) struct PhaseState {
    pub(crate) cb: Option<Rc<RefCell<dyn FnMut(&mut Context)>>>,
}

macro_rules! phase_impl {
    ($new:ident, $start:ident, $stop:ident, $run:ident, $variant:ident, $list:ident, $expected:expr) => {
        impl Context {
            pub fn $new(&mut self) -> Handle {
                self.alloc_handle(HandleData::$variant(PhaseState { cb: None }))
            }

            pub fn $start(
                &mut self,
                h: Handle,
                cb: impl FnMut(&mut Context) + 'static,
            ) -> Result<()> {
                {
                    let state = match &mut self.record_mut(h)?.data {
                        HandleData::$variant(state) => state,
                        _ => return Err(Error::arg(1, $expected)),
                    };
                    state.cb = Some(Rc::new(RefCell::new(cb)));
                }
                if !self.$list.contains(&h) {
                    self.$list.push(h);
                }
                self.set_active(h, true);
                Ok(())
            }

            /// Idempotent; safe from inside the phase callback itself.
            pub fn $stop(&mut self, h: Handle) -> Result<()> {
                match &self.record(h)?.data {
                    HandleData::$variant(_) => {}
                    _ => return Err(Error::arg(1, $expected)),
                }
                self.set_active(h, false);
                Ok(())
            }

            pub(crate) fn $run(&mut self) {
                let list = self.$list.clone();
                for h in list {
                    let cb = match self.record(h) {
                        Ok(record) if record.is_active() && !record.is_closing() => {
                            match &record.data {
                                HandleData::$variant(state) => state.cb.clone(),
                                _ => None,
                            }
                        }
                        _ => continue,
                    };
                    if let Some(cb) = cb {
                        self.dispatch(move |ctx| (cb.borrow_mut())(ctx));
                    }
                }
            }
        }
    };
}

phase_impl!(new_idle, idle_start, idle_stop, run_idle, Idle, idle_handles, "idle handle");
phase_impl!(
    new_prepare,
    prepare_start,
    prepare_stop,
    run_prepare,
    Prepare,
    prepare_handles,
    "prepare handle"
);
phase_impl!(new_check, check_start, check_stop, run_check, Check, check_handles, "check handle");

impl Context {
    /// Drop a closing phase handle from its registration list.
    pub(crate) fn phase_teardown(&mut self, h: Handle) {
        self.idle_handles.retain(|&x| x != h);
        self.prepare_handles.retain(|&x| x != h);
        self.check_handles.retain(|&x| x != h);
        if let Ok(record) = self.record_mut(h) {
            match &mut record.data {
                HandleData::Idle(state)
                | HandleData::Prepare(state)
                | HandleData::Check(state) => state.cb = None,
                _ => {}
            }
        }
    }
}
