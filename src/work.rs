//! The thread pool and the user-facing work queue.
//!
//! Pool threads execute filesystem requests and user work items. A work
//! item runs inside the thread's own worker environment — an isolated
//! execution context that shares nothing with the loop — with its arguments
//! and results copied across the boundary as [`Value`] vectors. Completions
//! travel back over a channel and the loop's waker, and the after-work
//! callback runs on the loop thread in completion order.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::AtomicU8;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::sys::Waker;
use crate::value::{check_args, Value};

const DEFAULT_POOL_SIZE: usize = 4;
const MAX_POOL_SIZE: usize = 1024;

/// Result vector of a work item, or the error text that killed it.
pub type WorkResult = std::result::Result<Vec<Value>, String>;

/// The body of a work item. Must be self-contained (`Send + Sync`), the
/// analogue of a function that survives being dumped and reloaded in
/// another environment.
pub type WorkBody =
    Arc<dyn Fn(&mut WorkerEnv, &[Value]) -> std::result::Result<Vec<Value>, String> + Send + Sync>;

/// Identifier of a registered work context.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Work {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Isolated per-thread execution environment for work items.
///
/// Bodies are cached per environment by identity, the way a dumped chunk is
/// loaded once per worker and reused.
pub struct WorkerEnv {
    /// Set in every pool or user thread environment, never on the loop
    /// thread.
    pub thread: bool,
    cache: HashMap<usize, WorkBody>,
}

impl WorkerEnv {
    pub(crate) fn new() -> WorkerEnv {
        WorkerEnv {
            thread: true,
            cache: HashMap::new(),
        }
    }

    fn load(&mut self, body: &WorkBody) -> WorkBody {
        let key = Arc::as_ptr(body) as *const () as usize;
        self.cache
            .entry(key)
            .or_insert_with(|| Arc::clone(body))
            .clone()
    }
}

pub(crate) type AfterWorkCallback = Rc<RefCell<dyn FnMut(&mut Context, WorkResult)>>;

pub(crate) struct WorkCtx {
    pub(crate) generation: u32,
    pub(crate) body: WorkBody,
    pub(crate) after: AfterWorkCallback,
}

pub(crate) enum PoolMsg {
    Fs {
        req: Request,
        outcome: crate::fs::FsOutcome,
    },
    Work {
        work: Work,
        results: WorkResult,
    },
}

pub(crate) enum Job {
    Fs {
        req: Request,
        op: crate::fs::FsOp,
        state: Arc<AtomicU8>,
    },
    Work {
        work: Work,
        body: WorkBody,
        args: Vec<Value>,
    },
}

struct PoolShared {
    queue: Mutex<(VecDeque<Job>, bool)>,
    available: Condvar,
}

/// Fixed-size worker pool; size comes from `UV_THREADPOOL_SIZE`, clamped to
/// `[1, 1024]`, default 4.
pub(crate) struct ThreadPool {
    shared: Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub(crate) fn new(waker: Arc<Waker>) -> (ThreadPool, Receiver<PoolMsg>) {
        let size = pool_size();
        let (tx, rx) = channel();
        let shared = Arc::new(PoolShared {
            queue: Mutex::new((VecDeque::new(), false)),
            available: Condvar::new(),
        });
        let mut threads = Vec::with_capacity(size);
        for i in 0..size {
            let shared = Arc::clone(&shared);
            let tx = tx.clone();
            let waker = Arc::clone(&waker);
            let thread = std::thread::Builder::new()
                .name(format!("evio-pool-{}", i))
                .spawn(move || worker_main(shared, tx, waker))
                .expect("failed to spawn pool thread");
            threads.push(thread);
        }
        log::debug!("thread pool started with {} workers", size);
        (ThreadPool { shared, threads }, rx)
    }

    pub(crate) fn submit(&self, job: Job) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.0.push_back(job);
        drop(queue);
        self.shared.available.notify_one();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.queue.lock().unwrap().1 = true;
        self.shared.available.notify_all();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn worker_main(shared: Arc<PoolShared>, tx: Sender<PoolMsg>, waker: Arc<Waker>) {
    // The acquire hook: one environment per pool thread, created on first
    // use and torn down when the pool winds the thread up.
    let mut env = WorkerEnv::new();
    loop {
        let job = {
            let mut guard = shared.queue.lock().unwrap();
            loop {
                if let Some(job) = guard.0.pop_front() {
                    break job;
                }
                if guard.1 {
                    return;
                }
                guard = shared.available.wait(guard).unwrap();
            }
        };
        let msg = match job {
            Job::Fs { req, op, state } => {
                let outcome = if crate::fs::fs_claim(&state) {
                    crate::fs::run_fs_op(&op)
                } else {
                    crate::fs::FsOutcome::cancelled()
                };
                PoolMsg::Fs { req, outcome }
            }
            Job::Work { work, body, args } => {
                let results = run_work(&mut env, &body, args);
                PoolMsg::Work { work, results }
            }
        };
        if tx.send(msg).is_err() {
            return;
        }
        let _ = waker.wake();
    }
}

/// Execute a work body under the worker-side protected call: a failure
/// never takes the process down, and both the argument and result vectors
/// are released before the error crosses back to the loop.
fn run_work(env: &mut WorkerEnv, body: &WorkBody, args: Vec<Value>) -> WorkResult {
    let loaded = env.load(body);
    let result = catch_unwind(AssertUnwindSafe(|| loaded(env, &args)));
    drop(args);
    match result {
        Ok(Ok(results)) => Ok(results),
        Ok(Err(msg)) => Err(msg),
        Err(panic) => {
            let msg = if let Some(msg) = panic.downcast_ref::<&str>() {
                (*msg).to_string()
            } else if let Some(msg) = panic.downcast_ref::<String>() {
                msg.clone()
            } else {
                "unknown error in work callback".to_string()
            };
            Err(msg)
        }
    }
}

fn pool_size() -> usize {
    match std::env::var("UV_THREADPOOL_SIZE") {
        Ok(val) => match val.parse::<usize>() {
            Ok(0) | Err(_) => DEFAULT_POOL_SIZE,
            Ok(n) => n.min(MAX_POOL_SIZE),
        },
        Err(_) => DEFAULT_POOL_SIZE,
    }
}

impl Context {
    /// Register a work context: `body` runs on a pool thread, `after` runs
    /// on the loop thread with the marshalled results.
    pub fn new_work(
        &mut self,
        body: impl Fn(&mut WorkerEnv, &[Value]) -> std::result::Result<Vec<Value>, String>
            + Send
            + Sync
            + 'static,
        after: impl FnMut(&mut Context, WorkResult) + 'static,
    ) -> Work {
        let generation = self.bump_generation();
        let index = self.works.insert(WorkCtx {
            generation,
            body: Arc::new(body),
            after: Rc::new(RefCell::new(after)),
        }) as u32;
        Work { index, generation }
    }

    /// Queue one execution of the work context with `args`. Returns `true`
    /// once the item is accepted by the pool.
    pub fn queue_work(&mut self, work: Work, args: Vec<Value>) -> Result<bool> {
        check_args(&args)?;
        let body = match self.works.get(work.index as usize) {
            Some(ctx) if ctx.generation == work.generation => Arc::clone(&ctx.body),
            _ => return Err(Error::arg(1, "live work context")),
        };
        // The in-flight item pins the loop alive like any other request.
        self.active_reqs += 1;
        self.pool().submit(Job::Work { work, body, args });
        Ok(true)
    }

    /// Drop a work context. In-flight items complete; their after-work
    /// callback is gone, so results are discarded.
    pub fn release_work(&mut self, work: Work) -> Result<()> {
        match self.works.get(work.index as usize) {
            Some(ctx) if ctx.generation == work.generation => {
                self.works.remove(work.index as usize);
                Ok(())
            }
            _ => Err(Error::arg(1, "live work context")),
        }
    }

    pub(crate) fn work_complete(&mut self, work: Work, results: WorkResult) {
        self.active_reqs -= 1;
        let after = match self.works.get(work.index as usize) {
            Some(ctx) if ctx.generation == work.generation => Some(Rc::clone(&ctx.after)),
            _ => None,
        };
        if let Some(after) = after {
            self.dispatch(move |ctx| (after.borrow_mut())(ctx, results));
        }
    }
}
