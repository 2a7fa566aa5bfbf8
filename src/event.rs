use std::fmt;
use std::os::fd::RawFd;

use bitflags::bitflags;
use mio::Token;

/// Native handle of a registered event source.
pub type Handle = RawFd;

/// Token reserved for the reactor's waker. File descriptors never reach it.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

bitflags! {
    /// Readiness a caller wants to be notified about.
    ///
    /// `ACCEPT`, `READABLE` and `HANGUP` all arm read readiness at the OS
    /// level; `ACCEPT` additionally marks the handle as a listener so its
    /// notifications arrive as [`EventKind::Accept`]. `TIMER` is serviced by
    /// the reactor's timer queue, never by the multiplexer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        const ACCEPT = 0x01;
        const READABLE = 0x02;
        const WRITABLE = 0x04;
        const HANGUP = 0x08;
        const TIMER = 0x10;
    }
}

impl Interest {
    /// The subset of the mask the OS poller understands.
    pub(crate) fn to_mio(self) -> Option<mio::Interest> {
        let readable = self.intersects(Interest::ACCEPT | Interest::READABLE | Interest::HANGUP);
        let writable = self.contains(Interest::WRITABLE);

        match (readable, writable) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// The notification delivered to an event object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A listening handle has a connection pending.
    Accept,
    /// Data (or end of stream) is pending on a connected handle.
    Readable,
    /// The handle can take more outbound bytes.
    Writable,
    /// A timer scheduled for this handle expired.
    Timer,
}

/// Registration lifecycle of one event object inside the multiplexer.
///
/// `None -> Added` on the first register, `Added -> Added` on every later
/// register (a re-arm), `Added -> None` on unregister. `ModifyPending` is
/// held only while a re-arm is being applied; registration calls made from
/// it are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationState {
    #[default]
    None,
    Added,
    ModifyPending,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Accept => "accept",
            EventKind::Readable => "readable",
            EventKind::Writable => "writable",
            EventKind::Timer => "timer",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_to_mio() {
        assert_eq!(Interest::empty().to_mio(), None);
        assert_eq!(Interest::TIMER.to_mio(), None);
        assert_eq!(Interest::ACCEPT.to_mio(), Some(mio::Interest::READABLE));
        assert_eq!(Interest::HANGUP.to_mio(), Some(mio::Interest::READABLE));
        assert_eq!(Interest::WRITABLE.to_mio(), Some(mio::Interest::WRITABLE));
        assert_eq!(
            (Interest::READABLE | Interest::WRITABLE | Interest::TIMER).to_mio(),
            Some(mio::Interest::READABLE | mio::Interest::WRITABLE)
        );
    }

    #[test]
    fn test_default_state_is_none() {
        assert_eq!(RegistrationState::default(), RegistrationState::None);
    }
}
