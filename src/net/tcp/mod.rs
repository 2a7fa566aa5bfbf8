//! Framed TCP server on top of the [`Reactor`].
//!
//! ```text
//! 1. Listener (Interest::ACCEPT)
//!    Accept ──> accept() until WouldBlock
//!        - enforce max_connections
//!        - set TCP_NODELAY
//!        - create Session, insert into SessionManager
//!        - queue Connection for registration (Interest::READABLE)
//!
//! 2. Connection
//!    Readable ──> read into pooled scratch buffer until WouldBlock
//!        - charge traffic shapers; out of budget: pause, retry on Timer
//!        - append to inbound BytesMut, Decoder dispatches whole frames
//!        - EOF, read error or protocol violation: remove self
//!    Writable ──> flush Session outbound, drop write interest once empty
//!
//! 3. Teardown
//!    Reactor drops the Connection ──> session leaves the SessionManager
//! ```
//!
//! Sockets are only ever touched on the reactor thread. Message handlers on
//! worker threads reply through their [`Session`], which buffers the frame
//! and asks the reactor for write readiness.

pub mod config;

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::event::{EventKind, Handle, Interest, RegistrationState};
use crate::handler::EventHandler;
use crate::object_pool::ObjectPool;
use crate::protocol::{Decoder, ProtocolRegistry, TypeId};
use crate::reactor::{Changes, Reactor, ReactorHandle};
use crate::session::{Session, SessionId, SessionManager};
use crate::shaper::TrafficShaper;
use crate::thread_pool::DispatchSink;
use config::ServerConfig;

const POOLED_BUFFERS: usize = 32;

/// State shared by a server's listener and all of its connections.
struct Shared {
    config: ServerConfig,
    registry: Arc<ProtocolRegistry>,
    forbidden: Arc<HashSet<TypeId>>,
    sink: Arc<dyn DispatchSink>,
    sessions: Arc<SessionManager>,
    shaper: Option<Arc<TrafficShaper>>,
    buffer_pool: ObjectPool<Vec<u8>>,
    next_session: AtomicU64,
    reactor: ReactorHandle,
}

/// Framed protocol server.
pub struct TcpServer {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    config: ServerConfig,
    registry: Arc<ProtocolRegistry>,
    sink: Arc<dyn DispatchSink>,
    sessions: Arc<SessionManager>,
    shaper: Option<Arc<TrafficShaper>>,
}

impl TcpServer {
    /// Binds the listening socket. Decoded messages go to `sink`.
    pub fn bind(
        config: ServerConfig,
        registry: Arc<ProtocolRegistry>,
        sink: Arc<dyn DispatchSink>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.address)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener: Some(listener),
            local_addr,
            config,
            registry,
            sink,
            sessions: Arc::new(SessionManager::new()),
            shaper: None,
        })
    }

    /// Shares one inbound byte budget across every connection of this server,
    /// on top of any per-connection `read_rate_bps`.
    pub fn with_shaper(mut self, shaper: Arc<TrafficShaper>) -> Self {
        self.shaper = Some(shaper);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        self.sessions.clone()
    }

    /// Registers the listener with `reactor`. Returns the listener's handle.
    pub fn start(&mut self, reactor: &mut Reactor) -> Result<Handle> {
        let listener = self
            .listener
            .take()
            .ok_or(Error::InvalidArgument("server already started"))?;

        let buffer_size = self.config.buffer_size.max(1);
        let shared = Arc::new(Shared {
            forbidden: Arc::new(self.config.forbidden_protocols.iter().copied().collect()),
            config: self.config.clone(),
            registry: self.registry.clone(),
            sink: self.sink.clone(),
            sessions: self.sessions.clone(),
            shaper: self.shaper.clone(),
            buffer_pool: ObjectPool::new(POOLED_BUFFERS, move || vec![0; buffer_size]),
            next_session: AtomicU64::new(1),
            reactor: reactor.handle(),
        });

        let handle = listener.as_raw_fd();
        reactor.add_event(
            Box::new(Listener {
                listener,
                handle,
                state: RegistrationState::None,
                shared,
            }),
            Interest::ACCEPT,
        )?;

        info!(address = %self.local_addr, "server listening");
        Ok(handle)
    }
}

struct Listener {
    listener: TcpListener,
    handle: Handle,
    state: RegistrationState,
    shared: Arc<Shared>,
}

impl EventHandler for Listener {
    fn handle(&self) -> Handle {
        self.handle
    }

    fn source(&mut self) -> &mut dyn Source {
        &mut self.listener
    }

    fn state(&self) -> RegistrationState {
        self.state
    }

    fn set_state(&mut self, state: RegistrationState) {
        self.state = state;
    }

    fn handle_event(&mut self, kind: EventKind, changes: &mut Changes) {
        if kind != EventKind::Accept {
            return;
        }

        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer, changes),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }
}

impl Listener {
    fn admit(&self, stream: TcpStream, peer: SocketAddr, changes: &mut Changes) {
        let shared = &self.shared;
        if let Some(max) = shared.config.max_connections {
            if shared.sessions.count() >= max {
                warn!(%peer, max, "max connections reached, rejecting");
                return;
            }
        }

        if let Err(e) = stream.set_nodelay(shared.config.no_delay) {
            warn!(%peer, error = %e, "failed to set TCP_NODELAY");
        }

        let id = shared.next_session.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(id, stream, peer, shared.clone());
        info!(session = id, %peer, "accepted connection");
        changes.add(Box::new(connection), Interest::READABLE);
    }
}

enum ReadOutcome {
    Drained,
    Throttled,
    Closed,
}

struct Connection {
    stream: TcpStream,
    handle: Handle,
    state: RegistrationState,
    session: Session,
    decoder: Decoder,
    inbound: BytesMut,
    outbound: BytesMut,
    shaper: Option<TrafficShaper>,
    throttled: bool,
    closing: bool,
    shared: Arc<Shared>,
}

impl Connection {
    fn new(id: SessionId, stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) -> Self {
        let handle = stream.as_raw_fd();
        let session = Session::attached(id, peer, shared.reactor.clone(), handle);
        shared.sessions.insert(session.clone());

        Connection {
            stream,
            handle,
            state: RegistrationState::None,
            session,
            decoder: Decoder::new(shared.registry.clone()).with_forbidden(shared.forbidden.clone()),
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            shaper: shared.config.read_rate_bps.map(TrafficShaper::new),
            throttled: false,
            closing: false,
            shared,
        }
    }

    fn on_readable(&mut self, changes: &mut Changes) {
        match self.drain_socket() {
            ReadOutcome::Drained => {}
            ReadOutcome::Throttled => {
                self.throttled = true;
                let retry = Duration::from_millis(self.shared.config.throttle_retry_ms);
                debug!(session = self.session.id(), ?retry, "read throttled");
                changes.schedule(self.handle, retry);
            }
            ReadOutcome::Closed => self.close(changes),
        }
    }

    /// Reads until the socket would block, the byte budget runs out or the
    /// connection has to go.
    fn drain_socket(&mut self) -> ReadOutcome {
        let shared = self.shared.clone();
        let mut scratch = shared.buffer_pool.acquire();

        loop {
            let budget = self.read_budget(scratch.len());
            if budget == 0 {
                return ReadOutcome::Throttled;
            }

            match self.stream.read(&mut scratch[..budget]) {
                Ok(0) => {
                    debug!(session = self.session.id(), "peer closed connection");
                    return ReadOutcome::Closed;
                }
                Ok(n) => {
                    self.charge(n);
                    self.inbound.extend_from_slice(&scratch[..n]);
                    let decoded = self.decoder.decode(
                        &mut self.inbound,
                        &self.session,
                        shared.sink.as_ref(),
                    );
                    if let Err(err) = decoded {
                        warn!(session = self.session.id(), error = %err, "closing connection");
                        return ReadOutcome::Closed;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::Drained,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(session = self.session.id(), error = %e, "read failed");
                    return ReadOutcome::Closed;
                }
            }
        }
    }

    fn read_budget(&self, wanted: usize) -> usize {
        [self.shaper.as_ref(), self.shared.shaper.as_deref()]
            .into_iter()
            .flatten()
            .map(|shaper| shaper.available().min(wanted as u64) as usize)
            .fold(wanted, usize::min)
    }

    fn charge(&self, bytes: usize) {
        for shaper in [self.shaper.as_ref(), self.shared.shaper.as_deref()]
            .into_iter()
            .flatten()
        {
            if !shaper.acquire(bytes) {
                trace!(session = self.session.id(), bytes, "budget overdrawn by a concurrent reader");
            }
        }
    }

    fn on_writable(&mut self, changes: &mut Changes) {
        let queued = self.session.take_outbound();
        self.outbound.extend_from_slice(&queued);

        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    self.close(changes);
                    return;
                }
                Ok(n) => self.outbound.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(session = self.session.id(), error = %e, "write failed");
                    self.close(changes);
                    return;
                }
            }
        }

        // flushed: stop asking for write readiness
        changes.rearm(self.handle, Interest::READABLE);
    }

    fn close(&mut self, changes: &mut Changes) {
        if self.closing {
            return;
        }
        self.closing = true;
        self.session.mark_closed();
        changes.remove(self.handle);
    }
}

impl EventHandler for Connection {
    fn handle(&self) -> Handle {
        self.handle
    }

    fn source(&mut self) -> &mut dyn Source {
        &mut self.stream
    }

    fn generation(&self) -> u64 {
        self.session.id()
    }

    fn state(&self) -> RegistrationState {
        self.state
    }

    fn set_state(&mut self, state: RegistrationState) {
        self.state = state;
    }

    fn handle_event(&mut self, kind: EventKind, changes: &mut Changes) {
        if self.closing {
            return;
        }
        match kind {
            EventKind::Readable if !self.throttled => self.on_readable(changes),
            EventKind::Readable => {}
            EventKind::Timer => {
                self.throttled = false;
                self.on_readable(changes);
            }
            EventKind::Writable => self.on_writable(changes),
            EventKind::Accept => {}
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.session.mark_closed();
        self.shared.sessions.remove(self.session.id());
        info!(session = self.session.id(), "connection closed");
    }
}
