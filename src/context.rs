//! The loop context: owns every handle and request, drives the multi-phase
//! event loop, and funnels every callback through the protected dispatch
//! policy.
//!
//! One `Context` per embedding. Contexts share nothing; the only sanctioned
//! cross-context (and cross-thread) channels are async handles and the
//! thread-pool marshalling path.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

use slab::Slab;

use crate::error::{Errno, Error, Result};
use crate::handle::{Handle, HandleRecord, INTERNAL};
use crate::request::RequestRecord;
use crate::sys;
use crate::timer::TimerEntry;
use crate::token::Token;
use crate::work::{PoolMsg, ThreadPool, WorkCtx};

/// How [`Context::run`] should drive the loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Run until no referenced handle or request keeps the loop alive.
    Default,
    /// One iteration; block for I/O if nothing is immediately due.
    Once,
    /// One iteration; never block.
    NoWait,
}

impl RunMode {
    pub fn name(self) -> &'static str {
        match self {
            RunMode::Default => "default",
            RunMode::Once => "once",
            RunMode::NoWait => "nowait",
        }
    }
}

/// Options accepted by [`Context::configure`].
pub enum LoopOption {
    /// Block delivery of the named signal while the loop polls.
    BlockSignal(&'static str),
    /// Account time the loop spends blocked waiting for events.
    MetricsIdleTime(bool),
}

/// Flags adjusting the protected-dispatch policy.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchFlags(pub(crate) u8);

impl DispatchFlags {
    /// Keep the process alive even on allocation failure inside a callback.
    pub const NO_EXIT: DispatchFlags = DispatchFlags(0b001);
    /// Skip traceback capture on callback failure.
    pub const NO_TRACEBACK: DispatchFlags = DispatchFlags(0b010);
    /// Skip writing the error message to the uncaught channel.
    pub const NO_ERRMSG: DispatchFlags = DispatchFlags(0b100);

    pub const fn union(self, other: DispatchFlags) -> DispatchFlags {
        DispatchFlags(self.0 | other.0)
    }

    fn contains(self, other: DispatchFlags) -> bool {
        self.0 & other.0 != 0
    }
}

/// Counters exposed by [`Context::metrics_info`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricsInfo {
    /// Completed loop iterations.
    pub loop_count: u64,
    /// Events processed by the poll phase.
    pub events: u64,
    /// Events that were already waiting when the poll phase ran.
    pub events_waiting: u64,
}

#[derive(Default)]
pub(crate) struct Metrics {
    pub(crate) info: MetricsInfo,
    pub(crate) idle_time: Duration,
    pub(crate) enabled: bool,
}

pub(crate) const WAKER_TOKEN: Token = Token(u64::MAX);
pub(crate) const SIGNAL_TOKEN: Token = Token(u64::MAX - 1);

/// The event loop and everything it owns.
pub struct Context {
    pub(crate) selector: sys::Selector,
    events: sys::Events,
    pub(crate) waker: Arc<sys::Waker>,

    pub(crate) handles: Slab<HandleRecord>,
    pub(crate) requests: Slab<RequestRecord>,
    next_generation: u32,

    pub(crate) timer_heap: BinaryHeap<TimerEntry>,
    pub(crate) timer_seq: u64,

    pub(crate) idle_handles: Vec<Handle>,
    pub(crate) prepare_handles: Vec<Handle>,
    pub(crate) check_handles: Vec<Handle>,
    pub(crate) closing: VecDeque<Handle>,
    pub(crate) pending: VecDeque<Handle>,
    pub(crate) async_handles: Vec<Handle>,

    pub(crate) active_handles: u32,
    pub(crate) active_reqs: u32,
    stop_flag: bool,
    mode: Option<RunMode>,
    loop_closed: bool,

    time: u64,
    clock: Instant,

    dispatch_flags: DispatchFlags,
    uncaught: Option<Box<dyn FnMut(&str)>>,

    pool: Option<(ThreadPool, Receiver<PoolMsg>)>,
    pub(crate) works: Slab<WorkCtx>,

    pub(crate) process_table: HashMap<i32, Handle>,
    pub(crate) reaper: Option<Handle>,
    pub(crate) signal_hub: crate::signal::SignalHub,

    pub(crate) emfile_trick: bool,
    pub(crate) single_accept: bool,
    pub(crate) spare_fd: Option<RawFd>,

    pub(crate) metrics: Metrics,
}

impl Context {
    /// Create a loop. Environment toggles (`UV_ACCEPT_EMFILE_TRICK`,
    /// `UV_TCP_SINGLE_ACCEPT`, `UV_THREADPOOL_SIZE`) are read once here and
    /// cached for the lifetime of the context.
    pub fn new() -> Result<Context> {
        let selector = sys::Selector::new()?;
        let waker = Arc::new(sys::Waker::new()?);
        selector.register(waker.as_raw_fd(), WAKER_TOKEN, crate::Interest::READABLE)?;

        let emfile_trick = env_toggle("UV_ACCEPT_EMFILE_TRICK", true);
        let single_accept = env_toggle("UV_TCP_SINGLE_ACCEPT", true);
        let spare_fd = if emfile_trick {
            sys::fdio::open_spare_fd()
        } else {
            None
        };

        Ok(Context {
            selector,
            events: Vec::with_capacity(1024),
            waker,
            handles: Slab::new(),
            requests: Slab::new(),
            next_generation: 0,
            timer_heap: BinaryHeap::new(),
            timer_seq: 0,
            idle_handles: Vec::new(),
            prepare_handles: Vec::new(),
            check_handles: Vec::new(),
            closing: VecDeque::new(),
            pending: VecDeque::new(),
            async_handles: Vec::new(),
            active_handles: 0,
            active_reqs: 0,
            stop_flag: false,
            mode: None,
            loop_closed: false,
            time: 0,
            clock: Instant::now(),
            dispatch_flags: DispatchFlags::default(),
            uncaught: None,
            pool: None,
            works: Slab::new(),
            process_table: HashMap::new(),
            reaper: None,
            signal_hub: crate::signal::SignalHub::default(),
            emfile_trick,
            single_accept,
            spare_fd,
            metrics: Metrics::default(),
        })
    }

    /// Drive the loop. Returns whether work is still pending when the call
    /// hands control back.
    ///
    /// Re-entrant `run` is a state error; while a run is active the mode is
    /// observable through [`Context::mode`].
    pub fn run(&mut self, mode: RunMode) -> Result<bool> {
        if self.mode.is_some() {
            return Err(Error::State("loop is already running"));
        }
        if self.loop_closed {
            return Err(Error::Sys(Errno::EINVAL));
        }
        self.mode = Some(mode);

        let mut alive = self.loop_alive();
        if !alive {
            self.update_time();
        }
        while alive && !self.stop_flag {
            self.update_time();
            self.run_timers();
            let ran_pending = self.run_pending();
            self.run_idle();
            self.run_prepare();

            let timeout = match mode {
                RunMode::NoWait => Some(Duration::ZERO),
                RunMode::Once if ran_pending => Some(Duration::ZERO),
                _ => self.poll_timeout(),
            };
            self.poll_io(timeout);

            self.run_check();
            self.run_closing();
            self.metrics.info.loop_count += 1;

            if mode == RunMode::Once {
                // One blocking pass may have consumed the timeout without an
                // I/O event; timers due now must still fire before returning.
                self.update_time();
                self.run_timers();
            }

            alive = self.loop_alive();
            if mode != RunMode::Default {
                break;
            }
        }
        self.stop_flag = false;
        self.mode = None;
        Ok(self.loop_alive())
    }

    /// Whether anything referenced keeps the loop alive.
    pub fn loop_alive(&self) -> bool {
        self.active_handles > 0 || self.active_reqs > 0 || !self.closing.is_empty()
    }

    /// Ask a running loop to hand control back as soon as possible.
    pub fn stop(&mut self) {
        self.stop_flag = true;
    }

    /// The mode of the currently active `run`, if one is active.
    pub fn mode(&self) -> Option<RunMode> {
        self.mode
    }

    /// Cached loop time in milliseconds, monotonic from context creation.
    pub fn now(&self) -> u64 {
        self.time
    }

    /// Refresh the cached loop time.
    pub fn update_time(&mut self) {
        self.time = self.clock.elapsed().as_millis() as u64;
    }

    /// Descriptor of the backing selector.
    pub fn backend_fd(&self) -> Option<RawFd> {
        Some(self.selector.as_raw_fd())
    }

    /// The poll timeout the next iteration would use, in milliseconds.
    /// `-1` means "block indefinitely".
    pub fn backend_timeout(&self) -> i32 {
        match self.backend_timeout_inner() {
            None => -1,
            Some(to) => to.as_millis() as i32,
        }
    }

    fn backend_timeout_inner(&self) -> Option<Duration> {
        if self.stop_flag
            || !self.loop_alive()
            || !self.pending.is_empty()
            || !self.closing.is_empty()
            || self.idle_active()
        {
            return Some(Duration::ZERO);
        }
        match self.next_timer_due() {
            Some(due) => Some(Duration::from_millis(due.saturating_sub(self.time))),
            None => None,
        }
    }

    fn poll_timeout(&self) -> Option<Duration> {
        self.backend_timeout_inner()
    }

    /// Invoke `f` on every live handle this context owns. Loop-internal
    /// handles are filtered out, as are records belonging to anything other
    /// than this context by construction of the arena.
    pub fn walk(&mut self, mut f: impl FnMut(&mut Context, Handle)) {
        let snapshot: Vec<Handle> = self
            .handles
            .iter()
            .filter(|(_, record)| record.flags & INTERNAL == 0)
            .map(|(index, record)| Handle {
                index: index as u32,
                generation: record.generation,
            })
            .collect();
        for h in snapshot {
            if self.record(h).is_ok() {
                self.dispatch(|ctx| f(ctx, h));
            }
        }
    }

    pub fn configure(&mut self, option: LoopOption) -> Result<()> {
        match option {
            LoopOption::BlockSignal(name) => {
                let signum = crate::signal::parse_signal_name(name)
                    .ok_or(Error::arg(2, "signal name"))?;
                let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
                unsafe {
                    libc::sigemptyset(&mut set);
                    libc::sigaddset(&mut set, signum);
                }
                // Returns the error number directly instead of setting errno.
                let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
                if rc != 0 {
                    return Err(Error::Sys(Errno::from_raw(rc)));
                }
                Ok(())
            }
            LoopOption::MetricsIdleTime(enabled) => {
                self.metrics.enabled = enabled;
                Ok(())
            }
        }
    }

    /// Nanoseconds the loop has spent blocked waiting for events. Requires
    /// `configure(LoopOption::MetricsIdleTime(true))`.
    pub fn metrics_idle_time(&self) -> u64 {
        self.metrics.idle_time.as_nanos() as u64
    }

    pub fn metrics_info(&self) -> MetricsInfo {
        self.metrics.info
    }

    /// Release loop resources. Fails with `EBUSY` while any caller-owned
    /// handle is live.
    pub fn loop_close(&mut self) -> Result<()> {
        // Loop-internal handles (the child reaper) are ours to retire.
        if let Some(reaper) = self.reaper.take() {
            if self.record(reaper).map(|r| !r.is_closing()).unwrap_or(false) {
                self.start_close(reaper);
            }
            self.run_closing();
        }
        if !self.handles.is_empty() || self.loop_alive() {
            return Err(Error::Sys(Errno::EBUSY));
        }
        if let Some(fd) = self.spare_fd.take() {
            sys::fdio::close(fd);
        }
        self.signal_hub.teardown();
        self.pool = None;
        self.loop_closed = true;
        Ok(())
    }

    // ===== dispatch policy =====

    /// Run a callback under the protected-dispatch policy: a panic inside
    /// the callback is caught, optionally annotated with a traceback, and
    /// routed to the uncaught-error channel instead of unwinding the loop.
    pub(crate) fn dispatch<F: FnOnce(&mut Context)>(&mut self, f: F) {
        let result = catch_unwind(AssertUnwindSafe(|| f(self)));
        if let Err(panic) = result {
            let msg = panic_message(&panic);
            let flags = self.dispatch_flags;
            if flags.contains(DispatchFlags::NO_ERRMSG) {
                return;
            }
            if flags.contains(DispatchFlags::NO_TRACEBACK) {
                self.report_uncaught(&msg);
            } else {
                let trace = std::backtrace::Backtrace::force_capture();
                self.report_uncaught(&format!("{}\nstack traceback:\n{}", msg, trace));
            }
        }
    }

    /// Surface an error raised inside a callback or a failed coroutine
    /// resume through the embedder's uncaught-error channel.
    pub(crate) fn report_uncaught(&mut self, msg: &str) {
        if let Some(mut sink) = self.uncaught.take() {
            sink(msg);
            // Keep a replacement handler if the sink installed one.
            if self.uncaught.is_none() {
                self.uncaught = Some(sink);
            }
        } else {
            log::error!("uncaught error in callback: {}", msg);
        }
    }

    /// Install the uncaught-error channel. The default logs at error level.
    pub fn set_uncaught_handler(&mut self, f: impl FnMut(&str) + 'static) {
        self.uncaught = Some(Box::new(f));
    }

    pub fn set_dispatch_flags(&mut self, flags: DispatchFlags) {
        self.dispatch_flags = flags;
    }

    // ===== loop phases =====

    fn run_pending(&mut self) -> bool {
        let mut ran = false;
        while let Some(h) = self.pending.pop_front() {
            ran = true;
            match self.record(h).map(|r| r.handle_type()) {
                Ok(crate::HandleType::Udp) => self.udp_drain_completed(h),
                Ok(crate::HandleType::Tcp)
                | Ok(crate::HandleType::Pipe)
                | Ok(crate::HandleType::Tty) => self.stream_drain_completed(h),
                _ => {}
            }
        }
        ran
    }

    fn run_closing(&mut self) {
        while let Some(h) = self.closing.pop_front() {
            self.finish_close(h);
        }
    }

    fn poll_io(&mut self, timeout: Option<Duration>) {
        let mut events = std::mem::take(&mut self.events);

        let blocked = timeout.map_or(true, |to| !to.is_zero());
        let entry = (self.metrics.enabled && blocked).then(Instant::now);
        if let Err(err) = self.selector.select(&mut events, timeout) {
            log::warn!("selector error: {}", err);
            self.events = events;
            return;
        }
        if let Some(entry) = entry {
            self.metrics.idle_time += entry.elapsed();
        }
        self.update_time();

        self.metrics.info.events += events.len() as u64;
        self.metrics.info.events_waiting += events.len() as u64;

        for event in &events {
            let token = sys::token(event);
            if token == WAKER_TOKEN {
                let _ = self.waker.reset();
                self.drain_pool_completions();
                self.drain_async_cells();
                continue;
            }
            if token == SIGNAL_TOKEN {
                self.signal_drain();
                continue;
            }
            let h = match self.handle_for_token(token) {
                Some(h) => h,
                None => continue,
            };
            let readable = sys::is_readable(event) || sys::is_hup(event) || sys::is_error(event);
            let writable = sys::is_writable(event) || sys::is_error(event);
            match self.record(h).map(|r| r.handle_type()) {
                Ok(crate::HandleType::Tcp)
                | Ok(crate::HandleType::Pipe)
                | Ok(crate::HandleType::Tty) => self.stream_on_event(h, readable, writable),
                Ok(crate::HandleType::Udp) => self.udp_on_event(h, readable, writable),
                Ok(crate::HandleType::FsEvent) => self.fs_event_on_event(h),
                Ok(crate::HandleType::Poll) => self.pollfd_on_event(
                    h,
                    sys::is_readable(event),
                    sys::is_writable(event),
                    sys::is_hup(event),
                    sys::is_priority(event),
                    sys::is_error(event),
                ),
                _ => {}
            }
        }

        self.events = events;
    }

    // ===== thread pool =====

    pub(crate) fn pool(&mut self) -> &ThreadPool {
        if self.pool.is_none() {
            let (pool, rx) = ThreadPool::new(Arc::clone(&self.waker));
            self.pool = Some((pool, rx));
        }
        &self.pool.as_ref().unwrap().0
    }

    fn drain_pool_completions(&mut self) {
        loop {
            let msg = match &self.pool {
                Some((_, rx)) => match rx.try_recv() {
                    Ok(msg) => msg,
                    Err(_) => break,
                },
                None => break,
            };
            match msg {
                PoolMsg::Fs { req, outcome } => self.fs_complete(req, outcome),
                PoolMsg::Work { work, results } => self.work_complete(work, results),
            }
        }
    }

    // ===== arena =====

    pub(crate) fn bump_generation(&mut self) -> u32 {
        // Generation 0 is reserved for the fixed loop tokens.
        self.next_generation = self.next_generation.wrapping_add(1).max(1);
        self.next_generation
    }

    fn idle_active(&self) -> bool {
        self.idle_handles
            .iter()
            .any(|&h| self.record(h).map(|r| r.is_active()).unwrap_or(false))
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Force-close anything the embedder leaked, then release the loop.
        let leaked: Vec<Handle> = self
            .handles
            .iter()
            .map(|(index, record)| Handle {
                index: index as u32,
                generation: record.generation,
            })
            .collect();
        for h in leaked {
            if self.record(h).map(|r| !r.is_closing()).unwrap_or(false) {
                self.start_close(h);
            }
        }
        self.run_closing();
        self.signal_hub.teardown();
        if let Some(fd) = self.spare_fd.take() {
            sys::fdio::close(fd);
        }
    }
}

fn env_toggle(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(val) => !matches!(val.as_str(), "0" | "false" | "off" | ""),
        Err(_) => default,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
