//! Length-framed message protocol.
//!
//! Every frame on the wire is
//!
//! ```text
//! +-----------------+-----------------+------------------+
//! | type_id: u32 BE | size: u64 BE    | payload (size B) |
//! +-----------------+-----------------+------------------+
//! ```
//!
//! There is no start-of-frame marker, so a stream that breaks policy cannot
//! be resynchronized and the connection that sent it is closed.
//!
//! Message types implement [`Message`] (how to run and serialize a value)
//! and [`Protocol`] (its type id, size limit and how to unpack it), and are
//! registered once at startup in a [`ProtocolRegistry`].

pub mod codec;
pub mod registry;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::session::Session;

pub use codec::{encode, Decoder};
pub use registry::{DecodeFn, ProtocolRegistry, RegistryBuilder};

/// Wire identifier of a message type.
pub type TypeId = u32;

/// `type_id` + `size`.
pub const HEADER_LEN: usize = 12;

/// A decoded, runnable message.
///
/// Each inbound frame produces one fresh boxed value. It is moved into the
/// dispatch task, run once on a worker and dropped right after.
pub trait Message: Send + 'static {
    fn protocol_type(&self) -> TypeId;

    fn name(&self) -> &'static str;

    /// Dispatch lane. Messages with the same group run in arrival order.
    fn thread_group(&self) -> usize {
        0
    }

    /// Writes the payload (no header) to `out`.
    fn pack(&self, out: &mut BytesMut);

    /// Handles the message on a worker thread.
    fn run(&mut self, session: &Session) -> anyhow::Result<()>;
}

/// A registrable message type.
pub trait Protocol: Message + Sized {
    const TYPE: TypeId;
    const NAME: &'static str;
    /// Largest payload a peer may declare for this type.
    const MAX_SIZE: usize;

    /// Builds a value from exactly one frame's payload.
    fn unpack(payload: &mut Bytes) -> Result<Self>;
}

/// Fails with [`Error::Malformed`] unless `payload` holds at least `needed`
/// more bytes.
pub fn ensure_remaining(payload: &impl Buf, needed: usize, what: &str) -> Result<()> {
    if payload.remaining() < needed {
        return Err(Error::Malformed(format!(
            "{what}: need {needed} bytes, {} left",
            payload.remaining()
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Message types shared by the protocol and network tests.

    use super::*;
    use bytes::BufMut;
    use parking_lot::Mutex;
    use std::sync::Arc;

    use crate::thread_pool::{DispatchSink, Task};

    /// Type 7: a `u32` sequence number followed by a `u32` lane.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Ping {
        pub seq: u32,
        pub lane: u32,
    }

    impl Message for Ping {
        fn protocol_type(&self) -> TypeId {
            Self::TYPE
        }

        fn name(&self) -> &'static str {
            Self::NAME
        }

        fn thread_group(&self) -> usize {
            self.lane as usize
        }

        fn pack(&self, out: &mut BytesMut) {
            out.put_u32(self.seq);
            out.put_u32(self.lane);
        }

        fn run(&mut self, session: &Session) -> anyhow::Result<()> {
            session.send(&Pong { seq: self.seq })?;
            Ok(())
        }
    }

    impl Protocol for Ping {
        const TYPE: TypeId = 7;
        const NAME: &'static str = "ping";
        const MAX_SIZE: usize = 64;

        fn unpack(payload: &mut Bytes) -> Result<Self> {
            ensure_remaining(payload, 8, "ping")?;
            Ok(Ping {
                seq: payload.get_u32(),
                lane: payload.get_u32(),
            })
        }
    }

    /// Type 8: reply to [`Ping`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Pong {
        pub seq: u32,
    }

    impl Message for Pong {
        fn protocol_type(&self) -> TypeId {
            Self::TYPE
        }

        fn name(&self) -> &'static str {
            Self::NAME
        }

        fn pack(&self, out: &mut BytesMut) {
            out.put_u32(self.seq);
        }

        fn run(&mut self, _session: &Session) -> anyhow::Result<()> {
            Ok(())
        }
    }

    impl Protocol for Pong {
        const TYPE: TypeId = 8;
        const NAME: &'static str = "pong";
        const MAX_SIZE: usize = 16;

        fn unpack(payload: &mut Bytes) -> Result<Self> {
            ensure_remaining(payload, 4, "pong")?;
            Ok(Pong {
                seq: payload.get_u32(),
            })
        }
    }

    /// Keeps submitted tasks until the test runs them.
    #[derive(Default, Clone)]
    pub struct RecordingSink {
        pub tasks: Arc<Mutex<Vec<(usize, Task)>>>,
    }

    impl RecordingSink {
        pub fn groups(&self) -> Vec<usize> {
            self.tasks.lock().iter().map(|(group, _)| *group).collect()
        }

        pub fn run_all(&self) {
            let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
            for (_, task) in tasks {
                task();
            }
        }
    }

    impl DispatchSink for RecordingSink {
        fn submit(&self, group: usize, task: Task) -> Result<()> {
            self.tasks.lock().push((group, task));
            Ok(())
        }
    }

    pub fn frame(type_id: TypeId, payload: &[u8]) -> BytesMut {
        let mut out = BytesMut::new();
        out.put_u32(type_id);
        out.put_u64(payload.len() as u64);
        out.put_slice(payload);
        out
    }
}
