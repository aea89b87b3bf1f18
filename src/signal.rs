//! Signal handles.
//!
//! Delivery uses the self-pipe pattern: a process-global handler, installed
//! per watched signal number, writes the number to the owning loop's signal
//! pipe; the loop reads the pipe from its poll phase and fires the watchers
//! on the loop thread. The handler itself only ever calls `write(2)`.
//!
//! One loop owns the routing slot of a given signal number at a time; a
//! second context starting a watcher for the same number takes the slot
//! over.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::context::{Context, SIGNAL_TOKEN};
use crate::error::{Errno, Error, Result};
use crate::handle::{Handle, HandleData, INTERNAL};
use crate::interest::Interest;
use crate::sys::fdio;

const MAX_SIGNUM: usize = 65;

// Routing table: `write_fd + 1` of the loop watching each signal number.
// Only ever read from the handler with relaxed loads; 0 means unrouted.
static ROUTE: [AtomicI32; MAX_SIGNUM] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const UNROUTED: AtomicI32 = AtomicI32::new(0);
    [UNROUTED; MAX_SIGNUM]
};

extern "C" fn signal_handler(signum: libc::c_int) {
    let slot = ROUTE[signum as usize].load(Ordering::Relaxed);
    if slot > 0 {
        let fd = slot - 1;
        let buf = (signum as u32).to_ne_bytes();
        // Async-signal-safe; a full pipe just coalesces into pending bytes
        // already queued.
        unsafe {
            libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len());
        }
    }
}

pub(crate) type SignalCallback = Rc<RefCell<dyn FnMut(&mut Context, &'static str)>>;

pub(crate) struct SignalState {
    pub(crate) signum: i32,
    pub(crate) cb: Option<SignalCallback>,
    pub(crate) oneshot: bool,
}

/// Per-context signal plumbing: the self-pipe and the watcher index.
pub(crate) struct SignalHub {
    read_fd: RawFd,
    write_fd: RawFd,
    watchers: HashMap<i32, Vec<Handle>>,
    saved_actions: HashMap<i32, libc::sigaction>,
}

impl Default for SignalHub {
    fn default() -> SignalHub {
        SignalHub {
            read_fd: -1,
            write_fd: -1,
            watchers: HashMap::new(),
            saved_actions: HashMap::new(),
        }
    }
}

impl SignalHub {
    pub(crate) fn teardown(&mut self) {
        let signums: Vec<i32> = self.saved_actions.keys().copied().collect();
        for signum in signums {
            self.uninstall(signum);
        }
        if self.read_fd >= 0 {
            fdio::close(self.read_fd);
            fdio::close(self.write_fd);
            self.read_fd = -1;
            self.write_fd = -1;
        }
    }

    fn install(&mut self, signum: i32) -> Result<()> {
        if self.saved_actions.contains_key(&signum) {
            return Ok(());
        }
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = signal_handler as usize;
        action.sa_flags = libc::SA_RESTART;
        unsafe { libc::sigemptyset(&mut action.sa_mask) };
        let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
        syscall!(sigaction(signum, &action, &mut old)).map_err(Error::sys)?;
        self.saved_actions.insert(signum, old);
        ROUTE[signum as usize].store(self.write_fd + 1, Ordering::Relaxed);
        Ok(())
    }

    fn uninstall(&mut self, signum: i32) {
        if let Some(old) = self.saved_actions.remove(&signum) {
            ROUTE[signum as usize].store(0, Ordering::Relaxed);
            let _ = syscall!(sigaction(signum, &old, std::ptr::null_mut()));
        }
    }
}

impl Context {
    pub fn new_signal(&mut self) -> Handle {
        self.alloc_handle(HandleData::Signal(SignalState {
            signum: 0,
            cb: None,
            oneshot: false,
        }))
    }

    /// Watch for `signal` (a name like `"SIGINT"`/`"int"` or a raw number).
    /// The callback receives the canonical signal name.
    pub fn signal_start(
        &mut self,
        h: Handle,
        signal: SignalSpec<'_>,
        cb: impl FnMut(&mut Context, &'static str) + 'static,
    ) -> Result<()> {
        self.signal_start_inner(h, signal, false, Rc::new(RefCell::new(cb)))
    }

    /// Like [`Context::signal_start`], but the watcher fires exactly once
    /// and stops itself.
    pub fn signal_start_oneshot(
        &mut self,
        h: Handle,
        signal: SignalSpec<'_>,
        cb: impl FnMut(&mut Context, &'static str) + 'static,
    ) -> Result<()> {
        self.signal_start_inner(h, signal, true, Rc::new(RefCell::new(cb)))
    }

    pub(crate) fn signal_start_inner(
        &mut self,
        h: Handle,
        signal: SignalSpec<'_>,
        oneshot: bool,
        cb: SignalCallback,
    ) -> Result<()> {
        let signum = signal.resolve()?;
        self.signal_hub_setup()?;
        self.signal_stop(h)?;
        {
            let state = self.signal_state_mut(h)?;
            state.signum = signum;
            state.cb = Some(cb);
            state.oneshot = oneshot;
        }
        self.signal_hub.install(signum)?;
        self.signal_hub.watchers.entry(signum).or_default().push(h);
        self.set_active(h, true);
        Ok(())
    }

    /// Idempotent. Restores the previous disposition once the last watcher
    /// for the number stops.
    pub fn signal_stop(&mut self, h: Handle) -> Result<()> {
        let signum = self.signal_state(h)?.signum;
        if signum == 0 {
            self.set_active(h, false);
            return Ok(());
        }
        let emptied = match self.signal_hub.watchers.get_mut(&signum) {
            Some(list) => {
                list.retain(|&x| x != h);
                list.is_empty()
            }
            None => false,
        };
        if emptied {
            self.signal_hub.watchers.remove(&signum);
            self.signal_hub.uninstall(signum);
        }
        self.signal_state_mut(h)?.signum = 0;
        self.set_active(h, false);
        Ok(())
    }

    pub(crate) fn signal_teardown(&mut self, h: Handle) {
        let _ = self.signal_stop(h);
        if let Ok(state) = self.signal_state_mut(h) {
            state.cb = None;
        }
    }

    /// Loop-internal watcher used by the process reaper.
    pub(crate) fn signal_watch_internal(
        &mut self,
        signum: i32,
        cb: impl FnMut(&mut Context, &'static str) + 'static,
    ) -> Result<Handle> {
        let h = self.new_signal();
        if let Ok(record) = self.record_mut(h) {
            record.flags |= INTERNAL;
        }
        self.signal_start_inner(h, SignalSpec::Number(signum), false, Rc::new(RefCell::new(cb)))?;
        Ok(h)
    }

    /// Pull queued signal numbers off the self-pipe and fire their watchers.
    pub(crate) fn signal_drain(&mut self) {
        let fd = self.signal_hub.read_fd;
        if fd < 0 {
            return;
        }
        let mut buf = [0u8; 4 * 32];
        loop {
            let n = match fdio::read(fd, &mut buf) {
                Ok(0) => return,
                Ok(n) => n,
                Err(_) => return,
            };
            for chunk in buf[..n].chunks_exact(4) {
                let signum = u32::from_ne_bytes(chunk.try_into().unwrap()) as i32;
                self.signal_fire(signum);
            }
            if n < buf.len() {
                return;
            }
        }
    }

    fn signal_fire(&mut self, signum: i32) {
        let name = signal_name(signum);
        let watchers: Vec<Handle> = self
            .signal_hub
            .watchers
            .get(&signum)
            .cloned()
            .unwrap_or_default();
        for h in watchers {
            let (cb, oneshot) = match self.signal_state(h) {
                Ok(state) if state.signum == signum => (state.cb.clone(), state.oneshot),
                _ => continue,
            };
            if oneshot {
                let _ = self.signal_stop(h);
            }
            if let Some(cb) = cb {
                self.dispatch(move |ctx| (cb.borrow_mut())(ctx, name));
            }
        }
    }

    fn signal_hub_setup(&mut self) -> Result<()> {
        if self.signal_hub.read_fd >= 0 {
            return Ok(());
        }
        let (read_fd, write_fd) = fdio::pipe(true, true)?;
        self.selector
            .register(read_fd, SIGNAL_TOKEN, Interest::READABLE)?;
        self.signal_hub.read_fd = read_fd;
        self.signal_hub.write_fd = write_fd;
        Ok(())
    }

    fn signal_state(&self, h: Handle) -> Result<&SignalState> {
        match &self.record(h)?.data {
            HandleData::Signal(state) => Ok(state),
            _ => Err(Error::arg(1, "signal handle")),
        }
    }

    fn signal_state_mut(&mut self, h: Handle) -> Result<&mut SignalState> {
        match &mut self.record_mut(h)?.data {
            HandleData::Signal(state) => Ok(state),
            _ => Err(Error::arg(1, "signal handle")),
        }
    }
}

/// A signal given by name or number.
pub enum SignalSpec<'a> {
    Name(&'a str),
    Number(i32),
}

impl SignalSpec<'_> {
    fn resolve(&self) -> Result<i32> {
        match self {
            SignalSpec::Number(n) if *n > 0 && (*n as usize) < MAX_SIGNUM => Ok(*n),
            SignalSpec::Number(_) => Err(Error::arg(2, "valid signal number")),
            SignalSpec::Name(name) => {
                parse_signal_name(name).ok_or(Error::arg(2, "valid signal name"))
            }
        }
    }
}

impl<'a> From<&'a str> for SignalSpec<'a> {
    fn from(name: &'a str) -> SignalSpec<'a> {
        SignalSpec::Name(name)
    }
}

impl From<i32> for SignalSpec<'static> {
    fn from(n: i32) -> SignalSpec<'static> {
        SignalSpec::Number(n)
    }
}

/// Signal number for a name, accepted with or without the `SIG` prefix,
/// case-insensitively.
pub(crate) fn parse_signal_name(name: &str) -> Option<i32> {
    let upper = name.to_ascii_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
    match bare {
        "HUP" => Some(libc::SIGHUP),
        "INT" => Some(libc::SIGINT),
        "QUIT" => Some(libc::SIGQUIT),
        "ILL" => Some(libc::SIGILL),
        "TRAP" => Some(libc::SIGTRAP),
        "ABRT" => Some(libc::SIGABRT),
        "BUS" => Some(libc::SIGBUS),
        "FPE" => Some(libc::SIGFPE),
        "KILL" => Some(libc::SIGKILL),
        "USR1" => Some(libc::SIGUSR1),
        "SEGV" => Some(libc::SIGSEGV),
        "USR2" => Some(libc::SIGUSR2),
        "PIPE" => Some(libc::SIGPIPE),
        "ALRM" => Some(libc::SIGALRM),
        "TERM" => Some(libc::SIGTERM),
        "CHLD" => Some(libc::SIGCHLD),
        "CONT" => Some(libc::SIGCONT),
        "STOP" => Some(libc::SIGSTOP),
        "TSTP" => Some(libc::SIGTSTP),
        "TTIN" => Some(libc::SIGTTIN),
        "TTOU" => Some(libc::SIGTTOU),
        "URG" => Some(libc::SIGURG),
        "XCPU" => Some(libc::SIGXCPU),
        "XFSZ" => Some(libc::SIGXFSZ),
        "VTALRM" => Some(libc::SIGVTALRM),
        "PROF" => Some(libc::SIGPROF),
        "WINCH" => Some(libc::SIGWINCH),
        "IO" => Some(libc::SIGIO),
        "POLL" => Some(libc::SIGPOLL),
        "PWR" => Some(libc::SIGPWR),
        "SYS" => Some(libc::SIGSYS),
        "STKFLT" => Some(libc::SIGSTKFLT),
        _ => None,
    }
}

pub(crate) fn signal_name(signum: i32) -> &'static str {
    match signum {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGCHLD => "SIGCHLD",
        libc::SIGCONT => "SIGCONT",
        libc::SIGSTOP => "SIGSTOP",
        libc::SIGTSTP => "SIGTSTP",
        libc::SIGTTIN => "SIGTTIN",
        libc::SIGTTOU => "SIGTTOU",
        libc::SIGURG => "SIGURG",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        libc::SIGVTALRM => "SIGVTALRM",
        libc::SIGPROF => "SIGPROF",
        libc::SIGWINCH => "SIGWINCH",
        libc::SIGIO => "SIGIO",
        libc::SIGPWR => "SIGPWR",
        libc::SIGSYS => "SIGSYS",
        libc::SIGSTKFLT => "SIGSTKFLT",
        _ => "SIGNAL",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_parsing() {
        assert_eq!(parse_signal_name("SIGINT"), Some(libc::SIGINT));
        assert_eq!(parse_signal_name("int"), Some(libc::SIGINT));
        assert_eq!(parse_signal_name("sigusr1"), Some(libc::SIGUSR1));
        assert_eq!(parse_signal_name("NOPE"), None);
    }

    #[test]
    fn names_round_trip() {
        assert_eq!(signal_name(libc::SIGCHLD), "SIGCHLD");
        assert_eq!(
            parse_signal_name(signal_name(libc::SIGWINCH)),
            Some(libc::SIGWINCH)
        );
    }
}
