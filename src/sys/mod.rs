//! Platform-specific glue.
//!
//! Everything above this module speaks in terms of the [`Selector`],
//! [`Waker`] and the raw-fd helpers; only this module may name `libc`
//! constants for the demultiplexer itself.

mod unix;

pub(crate) use self::unix::fdio;
pub(crate) use self::unix::net;
pub(crate) use self::unix::selector::{
    is_error, is_hup, is_priority, is_readable, is_writable, token, Events, Selector,
};
pub(crate) use self::unix::waker::Waker;
