use std::fmt;
use std::num::NonZeroU8;
use std::ops;

const READABLE: u8 = 0b0001;
const WRITABLE: u8 = 0b0010;
const DISCONNECT: u8 = 0b0100;
const PRIORITY: u8 = 0b1000;

/// Readiness interest for a registered descriptor.
///
/// The size of `Option<Interest>` is identical to `Interest` itself, so the
/// "not registered" state costs nothing in the handle records.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Interest(NonZeroU8);

impl Interest {
    /// Readable interest.
    pub const READABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(READABLE) });

    /// Writable interest.
    pub const WRITABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(WRITABLE) });

    /// Peer-hangup interest (`EPOLLRDHUP`-style disconnect).
    pub const DISCONNECT: Interest = Interest(unsafe { NonZeroU8::new_unchecked(DISCONNECT) });

    /// Priority-band interest (`EPOLLPRI`).
    pub const PRIORITY: Interest = Interest(unsafe { NonZeroU8::new_unchecked(PRIORITY) });

    /// Add together two `Interest`s. Same as the `BitOr` implementation, but
    /// usable in constants.
    #[allow(clippy::should_implement_trait)]
    pub const fn add(self, other: Interest) -> Interest {
        Interest(unsafe { NonZeroU8::new_unchecked(self.0.get() | other.0.get()) })
    }

    /// Remove `other` from `self`, or `None` when nothing remains.
    pub fn remove(self, other: Interest) -> Option<Interest> {
        NonZeroU8::new(self.0.get() & !other.0.get()).map(Interest)
    }

    pub const fn is_readable(self) -> bool {
        (self.0.get() & READABLE) != 0
    }

    pub const fn is_writable(self) -> bool {
        (self.0.get() & WRITABLE) != 0
    }

    pub const fn is_disconnect(self) -> bool {
        (self.0.get() & DISCONNECT) != 0
    }

    pub const fn is_priority(self) -> bool {
        (self.0.get() & PRIORITY) != 0
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, other: Interest) -> Interest {
        self.add(other)
    }
}

impl ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, other: Interest) {
        *self = self.add(other);
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        for (flag, name) in [
            (Interest::READABLE, "READABLE"),
            (Interest::WRITABLE, "WRITABLE"),
            (Interest::DISCONNECT, "DISCONNECT"),
            (Interest::PRIORITY, "PRIORITY"),
        ] {
            if self.0.get() & flag.0.get() != 0 {
                if one {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", name)?;
                one = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Interest;

    #[test]
    fn combine_and_remove() {
        let rw = Interest::READABLE | Interest::WRITABLE;
        assert!(rw.is_readable());
        assert!(rw.is_writable());
        assert!(!rw.is_priority());

        let r = rw.remove(Interest::WRITABLE).unwrap();
        assert!(r.is_readable());
        assert!(!r.is_writable());
        assert!(r.remove(Interest::READABLE).is_none());
    }
}
