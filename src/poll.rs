use std::collections::HashSet;
use std::io;
use std::time::Duration;

use mio::{Events, Poll, Registry, Token};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::event::{EventKind, Handle, Interest, RegistrationState, WAKE_TOKEN};
use crate::handler::EventHandler;
use crate::reactor::Changes;

/// Resolves a ready handle to the event object that owns it.
pub trait HandleResolver {
    fn resolve(&mut self, handle: Handle) -> Option<&mut (dyn EventHandler + 'static)>;
}

/// Readiness multiplexer over [`mio::Poll`].
///
/// Owns the kernel-side registrations and the set of listening handles. It
/// never owns event objects; those stay with the reactor's handle table.
pub struct Multiplexer {
    poller: Poll,
    events: Events,
    listeners: HashSet<Handle>,
}

impl Multiplexer {
    /// Creates the polling context with room for `events_capacity` readiness
    /// entries per poll.
    pub fn new(events_capacity: usize) -> Result<Self> {
        let poller = Poll::new().map_err(Error::ResourceInit)?;
        Ok(Multiplexer {
            poller,
            events: Events::with_capacity(events_capacity.max(1)),
            listeners: HashSet::new(),
        })
    }

    pub(crate) fn registry(&self) -> &Registry {
        self.poller.registry()
    }

    /// Adds `event` to the poller, or re-arms it if it is already added.
    pub fn register(&mut self, event: &mut dyn EventHandler, interest: Interest) -> Result<()> {
        if interest.is_empty() {
            return Err(Error::InvalidArgument("interest mask is empty"));
        }
        let mio_interest = interest
            .to_mio()
            .ok_or(Error::InvalidArgument("interest mask has no I/O readiness"))?;

        let handle = event.handle();
        if handle < 0 {
            return Err(Error::InvalidArgument("handle is negative"));
        }
        let token = Token(handle as usize);

        match event.state() {
            RegistrationState::None => {
                event
                    .source()
                    .register(self.poller.registry(), token, mio_interest)
                    .map_err(|source| syscall_failed(handle, "add", source))?;
                event.set_state(RegistrationState::Added);
                debug!(handle, ?interest, "added event");
            }
            RegistrationState::Added => {
                event.set_state(RegistrationState::ModifyPending);
                let result = event
                    .source()
                    .reregister(self.poller.registry(), token, mio_interest);
                event.set_state(RegistrationState::Added);
                result.map_err(|source| syscall_failed(handle, "modify", source))?;
                debug!(handle, ?interest, "re-armed event");
            }
            state => {
                warn!(handle, ?state, "refusing to register event");
                return Err(Error::InvalidState {
                    handle,
                    state,
                    operation: "register",
                });
            }
        }

        if interest.contains(Interest::ACCEPT) {
            self.listeners.insert(handle);
        }
        Ok(())
    }

    /// Removes `event` from the poller. A no-op unless it is currently added.
    ///
    /// The handle stays in the listening set until [`forget_listener`](Self::forget_listener)
    /// is called.
    pub fn unregister(&mut self, event: &mut dyn EventHandler) {
        if event.state() != RegistrationState::Added {
            return;
        }
        event.set_state(RegistrationState::None);

        let handle = event.handle();
        match event.source().deregister(self.poller.registry()) {
            Ok(()) => debug!(handle, "deleted event"),
            Err(err) => warn!(handle, error = %err, "failed to delete event"),
        }
    }

    pub fn forget_listener(&mut self, handle: Handle) {
        self.listeners.remove(&handle);
    }

    pub fn is_listener(&self, handle: Handle) -> bool {
        self.listeners.contains(&handle)
    }

    /// Waits up to `timeout` (`None` blocks indefinitely) and notifies every
    /// ready event. Returns the number of notifications delivered.
    ///
    /// Handles the resolver does not know, handles that are no longer added
    /// and handles queued for removal earlier in the same batch are skipped.
    pub fn poll<R>(
        &mut self,
        resolver: &mut R,
        changes: &mut Changes,
        timeout: Option<Duration>,
    ) -> Result<usize>
    where
        R: HandleResolver + ?Sized,
    {
        match self.poller.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(Error::Poll(err)),
        }

        let mut delivered = 0;
        for ready in self.events.iter() {
            let token = ready.token();
            if token == WAKE_TOKEN {
                continue;
            }

            let handle = token.0 as Handle;
            if changes.is_removed(handle) {
                trace!(handle, "skipping readiness for removed handle");
                continue;
            }
            let Some(event) = resolver.resolve(handle) else {
                trace!(handle, "skipping readiness for unknown handle");
                continue;
            };
            if event.state() != RegistrationState::Added {
                continue;
            }

            if ready.is_readable() || ready.is_read_closed() || ready.is_error() {
                let kind = if self.listeners.contains(&handle) {
                    EventKind::Accept
                } else {
                    EventKind::Readable
                };
                event.handle_event(kind, changes);
                delivered += 1;
            }

            if ready.is_writable() && !changes.is_removed(handle) {
                event.handle_event(EventKind::Writable, changes);
                delivered += 1;
            }
        }

        Ok(delivered)
    }
}

fn syscall_failed(handle: Handle, operation: &str, source: io::Error) -> Error {
    warn!(handle, operation, error = %source, "registration syscall failed");
    Error::Syscall { handle, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::event::Source;
    use std::collections::HashMap;

    struct TestSource {
        fail: bool,
    }

    impl Source for TestSource {
        fn register(&mut self, _: &Registry, _: Token, _: mio::Interest) -> io::Result<()> {
            if self.fail {
                return Err(io::Error::other("register refused"));
            }
            Ok(())
        }

        fn reregister(&mut self, _: &Registry, _: Token, _: mio::Interest) -> io::Result<()> {
            if self.fail {
                return Err(io::Error::other("reregister refused"));
            }
            Ok(())
        }

        fn deregister(&mut self, _: &Registry) -> io::Result<()> {
            Ok(())
        }
    }

    struct TestEvent {
        handle: Handle,
        source: TestSource,
        state: RegistrationState,
    }

    impl TestEvent {
        fn new(handle: Handle) -> Self {
            TestEvent {
                handle,
                source: TestSource { fail: false },
                state: RegistrationState::None,
            }
        }
    }

    impl EventHandler for TestEvent {
        fn handle(&self) -> Handle {
            self.handle
        }

        fn source(&mut self) -> &mut dyn Source {
            &mut self.source
        }

        fn state(&self) -> RegistrationState {
            self.state
        }

        fn set_state(&mut self, state: RegistrationState) {
            self.state = state;
        }

        fn handle_event(&mut self, _kind: EventKind, _changes: &mut Changes) {}
    }

    struct Table(HashMap<Handle, Box<dyn EventHandler>>);

    impl HandleResolver for Table {
        fn resolve(&mut self, handle: Handle) -> Option<&mut (dyn EventHandler + 'static)> {
            self.0.get_mut(&handle).map(|event| event.as_mut())
        }
    }

    #[test]
    fn test_register_state_machine() {
        let mut mux = Multiplexer::new(16).unwrap();
        let mut event = TestEvent::new(40);

        mux.register(&mut event, Interest::READABLE).unwrap();
        assert_eq!(event.state, RegistrationState::Added);

        // second register is a re-arm, not a duplicate
        mux.register(&mut event, Interest::READABLE | Interest::WRITABLE)
            .unwrap();
        assert_eq!(event.state, RegistrationState::Added);

        mux.unregister(&mut event);
        assert_eq!(event.state, RegistrationState::None);

        // unregister from None does nothing
        mux.unregister(&mut event);
        assert_eq!(event.state, RegistrationState::None);

        mux.register(&mut event, Interest::READABLE).unwrap();
        assert_eq!(event.state, RegistrationState::Added);
    }

    #[test]
    fn test_register_rejects_empty_mask() {
        let mut mux = Multiplexer::new(16).unwrap();
        let mut event = TestEvent::new(41);

        let err = mux.register(&mut event, Interest::empty()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(event.state, RegistrationState::None);

        let err = mux.register(&mut event, Interest::TIMER).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(event.state, RegistrationState::None);
    }

    #[test]
    fn test_register_rejects_negative_handle() {
        let mut mux = Multiplexer::new(16).unwrap();
        let mut event = TestEvent::new(-1);

        let err = mux.register(&mut event, Interest::ACCEPT).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(event.state, RegistrationState::None);
        assert!(!mux.is_listener(-1));
    }

    #[test]
    fn test_register_rejects_pending_state() {
        let mut mux = Multiplexer::new(16).unwrap();
        let mut event = TestEvent::new(42);
        event.state = RegistrationState::ModifyPending;

        let err = mux.register(&mut event, Interest::READABLE).unwrap_err();
        assert!(matches!(err, Error::InvalidState { handle: 42, .. }));
        assert_eq!(event.state, RegistrationState::ModifyPending);

        mux.unregister(&mut event);
        assert_eq!(event.state, RegistrationState::ModifyPending);
    }

    #[test]
    fn test_syscall_failure_keeps_state() {
        let mut mux = Multiplexer::new(16).unwrap();
        let mut event = TestEvent::new(43);
        event.source.fail = true;

        let err = mux.register(&mut event, Interest::READABLE).unwrap_err();
        assert!(matches!(err, Error::Syscall { handle: 43, .. }));
        assert_eq!(event.state, RegistrationState::None);

        event.source.fail = false;
        mux.register(&mut event, Interest::READABLE).unwrap();
        event.source.fail = true;
        let err = mux.register(&mut event, Interest::WRITABLE).unwrap_err();
        assert!(matches!(err, Error::Syscall { .. }));
        assert_eq!(event.state, RegistrationState::Added);
    }

    #[test]
    fn test_accept_interest_marks_listener() {
        let mut mux = Multiplexer::new(16).unwrap();
        let mut listener = TestEvent::new(44);
        let mut stream = TestEvent::new(45);

        mux.register(&mut listener, Interest::ACCEPT).unwrap();
        mux.register(&mut stream, Interest::READABLE).unwrap();
        assert!(mux.is_listener(44));
        assert!(!mux.is_listener(45));

        mux.unregister(&mut listener);
        assert!(mux.is_listener(44));
        mux.forget_listener(44);
        assert!(!mux.is_listener(44));
    }

    #[test]
    fn test_poll_times_out_without_events() {
        let mut mux = Multiplexer::new(16).unwrap();
        let mut table = Table(HashMap::new());
        let mut changes = Changes::default();

        let delivered = mux
            .poll(&mut table, &mut changes, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(delivered, 0);
    }
}
