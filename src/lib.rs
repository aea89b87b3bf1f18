//! A single-threaded, event-driven I/O runtime with dynamic callback
//! dispatch.
//!
//! One [`Context`] owns an event loop and every handle and request living
//! on it: timers, TCP and pipe streams, terminals, datagram sockets, poll
//! watchers, signal watchers, child processes, filesystem requests and
//! watchers, idle/prepare/check phase hooks, async wakeups, and a thread
//! pool for off-loop work.
//!
//! Handles are plain [`Handle`] ids into the context's arena; every
//! operation goes through the context, which validates liveness on each
//! access, so a stale id is an error, never a dangling pointer. Callbacks
//! run on the loop thread only, from [`Context::run`], through a protected
//! dispatch that turns panics into reports on the uncaught-error channel.
//!
//! # Example
//!
//! ```
//! use evio::{Context, RunMode};
//!
//! let mut ctx = Context::new().unwrap();
//! let timer = ctx.new_timer();
//! ctx.timer_start(timer, 10, 0, move |ctx| {
//!     ctx.close(timer, None).unwrap();
//! })
//! .unwrap();
//! ctx.run(RunMode::Default).unwrap();
//! ```
//!
//! Cross-thread communication happens through exactly two doors: async
//! handles ([`Context::new_async`]) and the work pool
//! ([`Context::new_work`]), both of which copy [`Value`] vectors across the
//! boundary instead of sharing memory.

#![allow(clippy::too_many_arguments)]

#[macro_use]
mod macros;

mod addr;
mod asynch;
mod context;
mod error;
mod fs;
mod fs_event;
mod fs_poll;
mod handle;
mod interest;
mod phase;
mod pipe;
mod pollfd;
mod process;
mod request;
mod signal;
mod stream;
mod sys;
mod tcp;
mod thread;
mod timer;
mod token;
mod tty;
mod udp;
mod value;
mod work;

pub use addr::{Family, SockName};
pub use asynch::AsyncSender;
pub use context::{Context, DispatchFlags, LoopOption, MetricsInfo, RunMode};
pub use error::{Errno, Error, Result};
pub use fs::{FsResult, FsValue, Stat};
pub use fs_event::{FsEvent, FsEventFlags};
pub use fs_poll::FsPollEvent;
pub use handle::{Handle, HandleType};
pub use interest::Interest;
pub use pipe::pipe_pair;
pub use pollfd::PollEvents;
pub use process::{kill_pid, SpawnOptions, StdioEntry};
pub use request::{CoResume, CoState, Continuation, Coroutine, Request};
pub use signal::SignalSpec;
pub use stream::{ReadResult, StreamStatus, WriteData};
pub use tcp::TcpFamily;
pub use thread::{spawn_thread, thread_self, Semaphore, Thread, ThreadOptions};
pub use tty::TtyMode;
pub use udp::{RecvFlags, UdpRecv};
pub use value::{Value, MAX_ARGS};
pub use work::{Work, WorkResult, WorkerEnv};
