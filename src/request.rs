//! Requests and continuations.
//!
//! A request is a one-shot operation attached to a handle or the loop
//! (write, shutdown, connect, datagram send, filesystem op). Its record pins
//! the input buffers and the continuation until the completion callback has
//! run, then everything is released in one place.
//!
//! A continuation is what the caller wants invoked on completion: nothing, a
//! callable, or a suspended coroutine to resume. The three cases are one sum
//! type so every completion site handles all of them.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::handle::Handle;

/// Identifier of an outstanding request.
///
/// Stale ids are detected by generation, so holding on to a completed
/// request id is harmless.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Request {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Execution state of a cooperative micro-thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CoState {
    Suspended,
    Running,
    Done,
}

/// Outcome of a resume.
pub enum CoResume {
    /// The coroutine suspended again; the completion side has no further
    /// bookkeeping.
    Yield,
    /// The coroutine finished.
    Return,
    /// The coroutine failed; the message is re-raised through the loop's
    /// uncaught-error channel.
    Fail(String),
}

/// A cooperative micro-thread that can be parked on a request and resumed
/// with the completion value.
pub trait Coroutine<T> {
    fn state(&self) -> CoState;
    fn resume(&mut self, ctx: &mut Context, value: T) -> CoResume;
}

/// What to do when a request completes.
pub enum Continuation<T> {
    /// Discard the completion arguments.
    None,
    /// Invoke a callable through the loop's protected dispatch.
    Callback(Box<dyn FnOnce(&mut Context, T)>),
    /// Resume a suspended coroutine with the completion value.
    Coroutine(Rc<RefCell<dyn Coroutine<T>>>),
}

impl<T> Continuation<T> {
    pub fn none() -> Continuation<T> {
        Continuation::None
    }

    pub fn callback(f: impl FnOnce(&mut Context, T) + 'static) -> Continuation<T> {
        Continuation::Callback(Box::new(f))
    }

    /// Shorthand for [`Continuation::callback`].
    pub fn call(f: impl FnOnce(&mut Context, T) + 'static) -> Continuation<T> {
        Continuation::callback(f)
    }

    /// Park `co` as the continuation. Fails unless the coroutine is
    /// currently suspended: a running or finished one can never be resumed
    /// with a completion.
    pub fn coroutine(co: Rc<RefCell<dyn Coroutine<T>>>) -> Result<Continuation<T>> {
        let state = co.borrow().state();
        match state {
            CoState::Suspended => Ok(Continuation::Coroutine(co)),
            _ => Err(Error::arg(2, "non-suspended coroutine")),
        }
    }

    /// Deliver the completion value. Consumes the continuation: a request
    /// completes at most once.
    pub(crate) fn fulfill(self, ctx: &mut Context, value: T) {
        match self {
            Continuation::None => drop(value),
            Continuation::Callback(f) => ctx.dispatch(move |ctx| f(ctx, value)),
            Continuation::Coroutine(co) => {
                if co.borrow().state() != CoState::Suspended {
                    ctx.report_uncaught("cannot resume non-suspended coroutine");
                    return;
                }
                let outcome = co.borrow_mut().resume(ctx, value);
                match outcome {
                    // Control went back to the host; nothing to do here.
                    CoResume::Yield | CoResume::Return => {}
                    CoResume::Fail(msg) => ctx.report_uncaught(&msg),
                }
            }
        }
    }
}

impl<T> fmt::Debug for Continuation<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Continuation::None => "Continuation::None",
            Continuation::Callback(_) => "Continuation::Callback",
            Continuation::Coroutine(_) => "Continuation::Coroutine",
        })
    }
}

pub(crate) struct RequestRecord {
    pub(crate) generation: u32,
    /// The handle this request targets, when any.
    pub(crate) handle: Option<Handle>,
    pub(crate) kind: RequestKind,
}

pub(crate) enum RequestKind {
    Write(crate::stream::WriteReq),
    Shutdown(crate::stream::ShutdownReq),
    Connect(crate::stream::ConnectReq),
    UdpSend(crate::udp::SendReq),
    Fs(crate::fs::FsReq),
}

impl Context {
    pub(crate) fn alloc_request(&mut self, handle: Option<Handle>, kind: RequestKind) -> Request {
        let generation = self.bump_generation();
        let index = self.requests.insert(RequestRecord {
            generation,
            handle,
            kind,
        }) as u32;
        self.active_reqs += 1;
        Request { index, generation }
    }

    /// Remove the record for a completed request, releasing its pins. `None`
    /// for a stale id.
    pub(crate) fn take_request(&mut self, req: Request) -> Option<RequestRecord> {
        match self.requests.get(req.index as usize) {
            Some(record) if record.generation == req.generation => {
                self.active_reqs -= 1;
                let record = self.requests.remove(req.index as usize);
                if let Some(h) = record.handle {
                    log::trace!(
                        "{} request completed on handle {}/{}",
                        record.kind_name(),
                        h.index,
                        h.generation
                    );
                }
                Some(record)
            }
            _ => None,
        }
    }

    /// The operation kind of an outstanding request.
    pub fn request_type(&self, req: Request) -> Result<&'static str> {
        match self.requests.get(req.index as usize) {
            Some(record) if record.generation == req.generation => Ok(record.kind_name()),
            _ => Err(Error::arg(1, "live request")),
        }
    }

    /// Attempt to cancel an outstanding request. Only requests still queued
    /// for the thread pool can be cancelled; everything else reports `EBUSY`.
    /// A successful cancel fires the completion with `ECANCELED`.
    pub fn cancel(&mut self, req: Request) -> Result<()> {
        let record = match self.requests.get(req.index as usize) {
            Some(record) if record.generation == req.generation => record,
            _ => return Err(Error::arg(1, "live request")),
        };
        match &record.kind {
            RequestKind::Fs(fs) => {
                if fs.cancel() {
                    Ok(())
                } else {
                    Err(Error::Sys(crate::error::Errno::EBUSY))
                }
            }
            _ => Err(Error::Sys(crate::error::Errno::EBUSY)),
        }
    }
}

impl RequestRecord {
    pub(crate) fn kind_name(&self) -> &'static str {
        match self.kind {
            RequestKind::Write(_) => "write",
            RequestKind::Shutdown(_) => "shutdown",
            RequestKind::Connect(_) => "connect",
            RequestKind::UdpSend(_) => "udp_send",
            RequestKind::Fs(_) => "fs",
        }
    }
}
