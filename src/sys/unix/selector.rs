use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use libc::{EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::interest::Interest;
use crate::token::Token;

/// Readiness demultiplexer backed by `epoll(7)`.
///
/// Level-triggered on purpose: the loop re-arms interest per handle state, so
/// a missed drain never loses a wakeup.
#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout
            .map(|to| {
                // `Duration::as_millis` truncates, so round up. This avoids
                // turning sub-millisecond timeouts into a zero timeout, unless
                // the caller explicitly requests that by specifying a zero
                // timeout.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        events.clear();
        loop {
            match syscall!(epoll_wait(
                self.ep.as_raw_fd(),
                events.as_mut_ptr(),
                events.capacity() as i32,
                timeout,
            )) {
                Ok(n_events) => {
                    // SAFETY: `epoll_wait` ensures that `n_events` are assigned.
                    unsafe { events.set_len(n_events as usize) };
                    return Ok(());
                }
                Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    pub(crate) fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: token.0,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: token.0,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut()
        ))
        .map(|_| ())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut kind = 0;
    if interest.is_readable() {
        kind = kind | EPOLLIN | EPOLLRDHUP;
    }
    if interest.is_writable() {
        kind |= EPOLLOUT;
    }
    if interest.is_priority() {
        kind |= EPOLLPRI;
    }
    // EPOLLHUP and EPOLLERR are always reported.
    kind as u32
}

pub(crate) type Event = libc::epoll_event;
pub(crate) type Events = Vec<Event>;

pub(crate) fn token(event: &Event) -> Token {
    Token(event.u64)
}

pub(crate) fn is_readable(event: &Event) -> bool {
    (event.events as libc::c_int & (libc::EPOLLIN | libc::EPOLLPRI)) != 0
}

pub(crate) fn is_writable(event: &Event) -> bool {
    (event.events as libc::c_int & libc::EPOLLOUT) != 0
}

pub(crate) fn is_error(event: &Event) -> bool {
    (event.events as libc::c_int & libc::EPOLLERR) != 0
}

pub(crate) fn is_hup(event: &Event) -> bool {
    (event.events as libc::c_int & (libc::EPOLLHUP | libc::EPOLLRDHUP)) != 0
}

pub(crate) fn is_priority(event: &Event) -> bool {
    (event.events as libc::c_int & libc::EPOLLPRI) != 0
}
