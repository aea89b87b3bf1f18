//! Standalone runtime threads and inter-thread semaphores.
//!
//! A runtime thread runs a self-contained body in its own worker
//! environment, with arguments copied in as [`Value`]s — the same transfer
//! rules as the work pool, without the pool.

use std::sync::{Condvar, Mutex};
use std::thread::JoinHandle;

use crate::error::{Error, Result};
use crate::value::{check_args, Value};
use crate::work::WorkerEnv;

/// Options for [`spawn_thread`].
#[derive(Clone, Debug, Default)]
pub struct ThreadOptions {
    /// Stack size in bytes; 0 or absent uses the platform default.
    pub stack_size: usize,
}

/// A joinable runtime thread.
pub struct Thread {
    id: std::thread::ThreadId,
    handle: JoinHandle<()>,
}

impl Thread {
    /// Wait for the thread to finish. A body that panicked surfaces here.
    pub fn join(self) -> Result<()> {
        self.handle
            .join()
            .map_err(|_| Error::State("thread body failed"))
    }

    pub fn equal(&self, other: &Thread) -> bool {
        self.id == other.id
    }

    pub fn id(&self) -> std::thread::ThreadId {
        self.id
    }
}

/// Launch a thread running `body(env, args)`.
pub fn spawn_thread(
    options: Option<ThreadOptions>,
    body: impl FnOnce(&mut WorkerEnv, Vec<Value>) + Send + 'static,
    args: Vec<Value>,
) -> Result<Thread> {
    check_args(&args)?;
    let mut builder = std::thread::Builder::new().name("evio-thread".to_string());
    if let Some(options) = options {
        if options.stack_size > 0 {
            builder = builder.stack_size(options.stack_size);
        }
    }
    let handle = builder
        .spawn(move || {
            let mut env = WorkerEnv::new();
            body(&mut env, args);
        })
        .map_err(Error::sys)?;
    let id = handle.thread().id();
    Ok(Thread { id, handle })
}

/// Identifier of the calling thread, comparable with [`Thread::id`].
pub fn thread_self() -> std::thread::ThreadId {
    std::thread::current().id()
}

/// Counting semaphore usable across runtime threads.
pub struct Semaphore {
    count: Mutex<u32>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(value: u32) -> Semaphore {
        Semaphore {
            count: Mutex::new(value),
            available: Condvar::new(),
        }
    }

    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        drop(count);
        self.available.notify_one();
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.available.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// `true` when a permit was taken without blocking.
    pub fn trywait(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn semaphore_counts() {
        let sem = Semaphore::new(1);
        assert!(sem.trywait());
        assert!(!sem.trywait());
        sem.post();
        sem.wait();
    }

    #[test]
    fn thread_round_trip() {
        let sem = Arc::new(Semaphore::new(0));
        let posted = Arc::clone(&sem);
        let thread = spawn_thread(
            None,
            move |env, args| {
                assert!(env.thread);
                assert_eq!(args[0], Value::Int(7));
                posted.post();
            },
            vec![Value::Int(7)],
        )
        .unwrap();
        sem.wait();
        thread.join().unwrap();
    }
}
