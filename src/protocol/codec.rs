use std::collections::HashSet;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tracing::{error, trace, warn};

use super::{Message, ProtocolRegistry, TypeId, HEADER_LEN};
use crate::error::{Error, Result, Violation};
use crate::session::Session;
use crate::thread_pool::DispatchSink;

/// Appends one frame for `message` to `out`.
///
/// The size field is written last, from the length the payload actually
/// packed to.
pub fn encode(message: &dyn Message, out: &mut BytesMut) {
    let start = out.len();
    out.put_u32(message.protocol_type());
    out.put_u64(0);
    message.pack(out);

    let size = (out.len() - start - HEADER_LEN) as u64;
    out[start + 4..start + HEADER_LEN].copy_from_slice(&size.to_be_bytes());
}

/// Per-connection frame decoder.
///
/// Pulls complete frames off the front of a connection's inbound buffer and
/// hands each decoded message to a [`DispatchSink`]. The first violation
/// poisons the decoder; the connection is expected to close.
pub struct Decoder {
    registry: Arc<ProtocolRegistry>,
    forbidden: Arc<HashSet<TypeId>>,
    poisoned: bool,
}

impl Decoder {
    pub fn new(registry: Arc<ProtocolRegistry>) -> Self {
        Decoder {
            registry,
            forbidden: Arc::default(),
            poisoned: false,
        }
    }

    /// Rejects these types even if they are registered.
    pub fn with_forbidden(mut self, forbidden: Arc<HashSet<TypeId>>) -> Self {
        self.forbidden = forbidden;
        self
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// The policy check applied to every header.
    pub fn check(&self, type_id: TypeId, size: u64) -> std::result::Result<(), Violation> {
        let Some(max) = self.registry.policy_max_size(type_id) else {
            return Err(Violation::UnknownType { type_id, size });
        };
        if self.forbidden.contains(&type_id) {
            return Err(Violation::Forbidden { type_id });
        }
        if size > max as u64 {
            return Err(Violation::Oversized { type_id, size, max });
        }
        Ok(())
    }

    /// Decodes and dispatches every complete frame in `buf`. Returns how many
    /// messages were submitted.
    ///
    /// A trailing partial frame is left in `buf` untouched, so calling again
    /// after more bytes arrive picks up where this call stopped.
    pub fn decode<S>(&mut self, buf: &mut BytesMut, session: &Session, sink: &S) -> Result<usize>
    where
        S: DispatchSink + ?Sized,
    {
        if self.poisoned {
            return Err(Violation::Closed.into());
        }

        let mut dispatched = 0;
        while buf.len() >= HEADER_LEN {
            let mut header = &buf[..HEADER_LEN];
            let type_id = header.get_u32();
            let size = header.get_u64();

            if let Err(violation) = self.check(type_id, size) {
                return Err(self.poison(session, violation));
            }

            // bounded by the type's max size, which is a usize
            let frame_len = HEADER_LEN.saturating_add(size as usize);
            if buf.len() < frame_len {
                trace!(type_id, size, buffered = buf.len(), "partial frame");
                break;
            }

            let mut payload = buf.split_to(frame_len).freeze();
            payload.advance(HEADER_LEN);

            let message = match self.registry.unpack(type_id, &mut payload) {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    let violation = Violation::Malformed {
                        type_id,
                        reason: err.to_string(),
                    };
                    return Err(self.poison(session, violation));
                }
                None => {
                    return Err(self.poison(session, Violation::UnknownType { type_id, size }));
                }
            };
            if payload.has_remaining() {
                trace!(type_id, unread = payload.remaining(), "payload not fully unpacked");
            }

            let group = message.thread_group();
            let task_session = session.clone();
            sink.submit(group, Box::new(move || run_message(message, &task_session)))?;
            dispatched += 1;
        }

        Ok(dispatched)
    }

    fn poison(&mut self, session: &Session, violation: Violation) -> Error {
        warn!(session = session.id(), %violation, "protocol violation");
        self.poisoned = true;
        violation.into()
    }
}

fn run_message(mut message: Box<dyn Message>, session: &Session) {
    if let Err(err) = message.run(session) {
        error!(
            session = session.id(),
            type_id = message.protocol_type(),
            name = message.name(),
            error = %err,
            "message handler failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::{frame, Ping, Pong, RecordingSink};
    use crate::protocol::Protocol;

    fn decoder() -> Decoder {
        let mut builder = ProtocolRegistry::builder();
        builder.register::<Ping>().unwrap().register::<Pong>().unwrap();
        Decoder::new(builder.build())
    }

    fn ping(seq: u32, lane: u32) -> BytesMut {
        let mut out = BytesMut::new();
        encode(&Ping { seq, lane }, &mut out);
        out
    }

    #[test]
    fn test_encode_layout() {
        let out = ping(1, 3);
        assert_eq!(
            &out[..],
            &[0, 0, 0, 7, 0, 0, 0, 0, 0, 0, 0, 8, 0, 0, 0, 1, 0, 0, 0, 3]
        );

        // appending keeps earlier frames intact
        let mut out = out;
        encode(&Pong { seq: 9 }, &mut out);
        assert_eq!(&out[20..32], &[0, 0, 0, 8, 0, 0, 0, 0, 0, 0, 0, 4]);
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let mut decoder = decoder();
        let session = Session::detached(1);
        let sink = RecordingSink::default();

        let mut buf = ping(1, 3);
        buf.extend_from_slice(&ping(2, 3));

        assert_eq!(decoder.decode(&mut buf, &session, &sink).unwrap(), 2);
        assert!(buf.is_empty());
        assert_eq!(sink.groups(), vec![3, 3]);

        sink.run_all();
        let mut replies = session.take_outbound();
        let mut seqs = Vec::new();
        while !replies.is_empty() {
            let mut header = &replies[..HEADER_LEN];
            assert_eq!(header.get_u32(), Pong::TYPE);
            let size = header.get_u64() as usize;
            let mut payload = replies.split_to(HEADER_LEN + size).freeze();
            payload.advance(HEADER_LEN);
            seqs.push(Pong::unpack(&mut payload).unwrap().seq);
        }
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_split_frame_resumes() {
        let mut decoder = decoder();
        let session = Session::detached(1);
        let sink = RecordingSink::default();
        let whole = ping(5, 0);

        for cut in 0..whole.len() {
            let mut buf = BytesMut::from(&whole[..cut]);
            assert_eq!(decoder.decode(&mut buf, &session, &sink).unwrap(), 0);
            // nothing is consumed from a partial frame
            assert_eq!(buf.len(), cut);

            buf.extend_from_slice(&whole[cut..]);
            assert_eq!(decoder.decode(&mut buf, &session, &sink).unwrap(), 1);
            assert!(buf.is_empty());
        }
        assert_eq!(sink.groups().len(), whole.len());
    }

    #[test]
    fn test_unknown_type_dispatches_nothing() {
        let mut decoder = decoder();
        let session = Session::detached(1);
        let sink = RecordingSink::default();

        let mut buf = ping(1, 0);
        buf.extend_from_slice(&frame(99, &[1, 2, 3]));
        buf.extend_from_slice(&ping(2, 0));

        let err = decoder.decode(&mut buf, &session, &sink).unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolViolation(Violation::UnknownType { type_id: 99, size: 3 })
        ));
        // the frame before the violation was already dispatched
        assert_eq!(sink.groups().len(), 1);
        assert!(decoder.is_poisoned());

        let err = decoder.decode(&mut buf, &session, &sink).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(Violation::Closed)));
        assert_eq!(sink.groups().len(), 1);
    }

    #[test]
    fn test_oversized_rejected_from_header_alone() {
        let mut decoder = decoder();
        let session = Session::detached(1);
        let sink = RecordingSink::default();

        let mut buf = BytesMut::new();
        buf.put_u32(Ping::TYPE);
        buf.put_u64(65);

        let err = decoder.decode(&mut buf, &session, &sink).unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolViolation(Violation::Oversized { type_id: 7, size: 65, max: 64 })
        ));
        assert!(sink.groups().is_empty());
    }

    #[test]
    fn test_forbidden_type() {
        let forbidden: HashSet<TypeId> = [Pong::TYPE].into_iter().collect();
        let mut decoder = decoder().with_forbidden(Arc::new(forbidden));
        let session = Session::detached(1);
        let sink = RecordingSink::default();

        let mut buf = BytesMut::new();
        encode(&Pong { seq: 1 }, &mut buf);

        let err = decoder.decode(&mut buf, &session, &sink).unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolViolation(Violation::Forbidden { type_id: 8 })
        ));
    }

    #[test]
    fn test_malformed_payload_is_violation() {
        let mut decoder = decoder();
        let session = Session::detached(1);
        let sink = RecordingSink::default();

        let mut buf = frame(Ping::TYPE, &[0, 0, 0, 1]);
        let err = decoder.decode(&mut buf, &session, &sink).unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolViolation(Violation::Malformed { type_id: 7, .. })
        ));
        assert!(sink.groups().is_empty());
    }

    #[test]
    fn test_handler_error_still_drops_message() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Failing;

        impl Drop for Failing {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        impl Message for Failing {
            fn protocol_type(&self) -> TypeId {
                Self::TYPE
            }

            fn name(&self) -> &'static str {
                Self::NAME
            }

            fn pack(&self, _out: &mut BytesMut) {}

            fn run(&mut self, _session: &Session) -> anyhow::Result<()> {
                anyhow::bail!("handler refused")
            }
        }

        impl Protocol for Failing {
            const TYPE: TypeId = 40;
            const NAME: &'static str = "failing";
            const MAX_SIZE: usize = 0;

            fn unpack(_payload: &mut bytes::Bytes) -> Result<Self> {
                Ok(Failing)
            }
        }

        let mut builder = ProtocolRegistry::builder();
        builder.register::<Failing>().unwrap();
        let mut decoder = Decoder::new(builder.build());
        let session = Session::detached(1);
        let sink = RecordingSink::default();

        let mut buf = frame(Failing::TYPE, &[]);
        buf.extend_from_slice(&frame(Failing::TYPE, &[]));
        assert_eq!(decoder.decode(&mut buf, &session, &sink).unwrap(), 2);
        assert_eq!(DROPS.load(Ordering::SeqCst), 0);

        sink.run_all();
        assert_eq!(DROPS.load(Ordering::SeqCst), 2);
    }
}
