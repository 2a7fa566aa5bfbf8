use mio::event::Source;

use crate::event::{EventKind, Handle, RegistrationState};
use crate::reactor::Changes;

/// An entity the reactor can register, poll and notify.
///
/// Listening sockets, connected sockets and anything else backed by a mio
/// [`Source`] implement this. The reactor owns every registered handler and
/// drops it exactly once, when it is removed.
pub trait EventHandler: Send {
    /// The native handle this object is registered under.
    fn handle(&self) -> Handle;

    /// The pollable source behind [`handle`](Self::handle).
    fn source(&mut self) -> &mut dyn Source;

    /// Tells apart successive registrations that reuse the same handle.
    ///
    /// Requests from other threads carry the generation they were issued for
    /// and are dropped once it no longer matches. Objects that are never
    /// addressed from outside the I/O thread can keep the default.
    fn generation(&self) -> u64 {
        0
    }

    fn state(&self) -> RegistrationState;

    fn set_state(&mut self, state: RegistrationState);

    /// Called on the I/O thread for every readiness or timer notification.
    ///
    /// Registration changes (re-arming, removing itself, adding accepted
    /// connections, scheduling timers) are queued on `changes` and applied by
    /// the reactor once the current poll batch has been delivered.
    fn handle_event(&mut self, kind: EventKind, changes: &mut Changes);
}
