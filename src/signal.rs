use std::io::{self, Read};
use std::os::fd::AsRawFd;

use mio::event::Source;
use mio::net::UnixStream;
use signal_hook::low_level::{pipe, unregister};
use signal_hook::SigId;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::event::{EventKind, Handle, RegistrationState};
use crate::handler::EventHandler;
use crate::reactor::Changes;

pub(crate) type SignalCallback = Box<dyn FnMut(i32) + Send + 'static>;

/// Turns deliveries of one signal into readiness on a socket pair.
///
/// The signal handler only writes a byte to the pair; the callback runs on
/// the I/O thread when the reading end turns readable.
pub(crate) struct SignalEvent {
    signum: i32,
    id: SigId,
    pipe: UnixStream,
    handle: Handle,
    state: RegistrationState,
    callback: SignalCallback,
}

impl SignalEvent {
    pub(crate) fn new(signum: i32, callback: SignalCallback) -> Result<Self> {
        if signal_hook::consts::FORBIDDEN.contains(&signum) {
            return Err(Error::InvalidArgument("signal cannot be handled"));
        }

        let (read, write) = std::os::unix::net::UnixStream::pair()?;
        read.set_nonblocking(true)?;
        write.set_nonblocking(true)?;
        let id = pipe::register(signum, write)?;

        let pipe = UnixStream::from_std(read);
        let handle = pipe.as_raw_fd();
        debug!(signum, handle, "signal handler installed");

        Ok(SignalEvent {
            signum,
            id,
            pipe,
            handle,
            state: RegistrationState::None,
            callback,
        })
    }

    /// Empties the pipe. Returns whether at least one delivery was pending.
    fn drain(&mut self) -> bool {
        let mut buf = [0u8; 64];
        let mut pending = false;
        loop {
            match self.pipe.read(&mut buf) {
                Ok(0) => return pending,
                Ok(_) => pending = true,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return pending,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(signum = self.signum, error = %e, "failed to drain signal pipe");
                    return pending;
                }
            }
        }
    }
}

impl EventHandler for SignalEvent {
    fn handle(&self) -> Handle {
        self.handle
    }

    fn source(&mut self) -> &mut dyn Source {
        &mut self.pipe
    }

    fn state(&self) -> RegistrationState {
        self.state
    }

    fn set_state(&mut self, state: RegistrationState) {
        self.state = state;
    }

    fn handle_event(&mut self, kind: EventKind, _changes: &mut Changes) {
        if kind == EventKind::Readable && self.drain() {
            debug!(signum = self.signum, "signal received");
            (self.callback)(self.signum);
        }
    }
}

impl Drop for SignalEvent {
    fn drop(&mut self) {
        if !unregister(self.id) {
            debug!(signum = self.signum, "signal handler already gone");
        }
    }
}
