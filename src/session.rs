//! Per-connection session handles.
//!
//! A [`Session`] is what message handlers see of the connection their message
//! arrived on: an id and a way to send replies. Replies are framed into an
//! outbound buffer and the owning connection is re-armed for write readiness;
//! the actual socket write always happens on the I/O thread.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use lockfree::map::Map as LockfreeMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::{Handle, Interest};
use crate::protocol::{encode, Message};
use crate::reactor::ReactorHandle;

pub type SessionId = u64;

struct Link {
    reactor: ReactorHandle,
    handle: Handle,
}

struct Inner {
    id: SessionId,
    peer: Option<SocketAddr>,
    outbound: Mutex<BytesMut>,
    link: Option<Link>,
    closed: AtomicBool,
}

/// Cheaply cloneable handle to one connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// A session with no connection behind it. Sent frames accumulate in the
    /// outbound buffer until [`take_outbound`](Self::take_outbound) is called.
    pub fn detached(id: SessionId) -> Self {
        Self::build(id, None, None)
    }

    pub(crate) fn attached(
        id: SessionId,
        peer: SocketAddr,
        reactor: ReactorHandle,
        handle: Handle,
    ) -> Self {
        Self::build(id, Some(peer), Some(Link { reactor, handle }))
    }

    fn build(id: SessionId, peer: Option<SocketAddr>, link: Option<Link>) -> Self {
        Session {
            inner: Arc::new(Inner {
                id,
                peer,
                outbound: Mutex::new(BytesMut::new()),
                link,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// Frames `message` onto the outbound buffer and asks the reactor to
    /// flush it.
    pub fn send(&self, message: &dyn Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Io(io::ErrorKind::NotConnected.into()));
        }
        encode(message, &mut self.inner.outbound.lock());

        if let Some(link) = &self.inner.link {
            link.reactor
                .rearm(link.handle, self.id(), Interest::READABLE | Interest::WRITABLE)?;
        }
        Ok(())
    }

    /// Drains everything queued by [`send`](Self::send).
    pub fn take_outbound(&self) -> BytesMut {
        self.inner.outbound.lock().split()
    }

    pub fn pending_outbound(&self) -> usize {
        self.inner.outbound.lock().len()
    }

    /// Asks the reactor to drop the connection. Pending outbound bytes are
    /// discarded.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(link) = &self.inner.link {
            if let Err(err) = link.reactor.remove(link.handle, self.id()) {
                debug!(session = self.id(), error = %err, "close after reactor shutdown");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Marks the session closed without touching the reactor. Used by the
    /// connection itself once it is torn down.
    pub(crate) fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

/// Live sessions of a server, keyed by id.
pub struct SessionManager {
    sessions: LockfreeMap<SessionId, Session>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager {
            sessions: LockfreeMap::new(),
        }
    }

    pub(crate) fn insert(&self, session: Session) {
        self.sessions.insert(session.id(), session);
    }

    pub(crate) fn remove(&self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id).map(|removed| removed.val().clone())
    }

    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.sessions.get(&id).map(|entry| entry.val().clone())
    }

    /// Sends to one session. Returns `false` if it is not live.
    pub fn send_to(&self, id: SessionId, message: &dyn Message) -> Result<bool> {
        match self.get(id) {
            Some(session) => session.send(message).map(|()| true),
            None => Ok(false),
        }
    }

    /// Sends to every live session and returns how many accepted the frame.
    pub fn broadcast(&self, message: &dyn Message) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.val().send(message).is_ok())
            .count()
    }

    pub fn close(&self, id: SessionId) -> bool {
        match self.get(id) {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.iter().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::Pong;

    #[test]
    fn test_detached_send_buffers_frames() {
        let session = Session::detached(3);
        session.send(&Pong { seq: 1 }).unwrap();
        session.send(&Pong { seq: 2 }).unwrap();
        assert_eq!(session.pending_outbound(), 32);

        let out = session.take_outbound();
        assert_eq!(out.len(), 32);
        assert_eq!(session.pending_outbound(), 0);
    }

    #[test]
    fn test_closed_session_refuses_send() {
        let session = Session::detached(4);
        let other = session.clone();
        other.close();

        assert!(session.is_closed());
        assert!(session.send(&Pong { seq: 1 }).is_err());
        assert_eq!(session.pending_outbound(), 0);
    }

    #[test]
    fn test_manager_send_and_broadcast() {
        let manager = SessionManager::new();
        let a = Session::detached(1);
        let b = Session::detached(2);
        manager.insert(a.clone());
        manager.insert(b.clone());
        assert_eq!(manager.count(), 2);

        assert!(manager.send_to(1, &Pong { seq: 5 }).unwrap());
        assert!(!manager.send_to(9, &Pong { seq: 5 }).unwrap());
        assert_eq!(a.pending_outbound(), 16);
        assert_eq!(b.pending_outbound(), 0);

        b.close();
        assert_eq!(manager.broadcast(&Pong { seq: 6 }), 1);
        assert_eq!(a.pending_outbound(), 32);

        assert!(manager.close(1));
        assert!(a.is_closed());
        assert!(manager.remove(1).is_some());
        assert!(!manager.close(1));
        assert_eq!(manager.count(), 1);
    }
}
