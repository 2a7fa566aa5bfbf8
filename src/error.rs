//! Error types for mill-wire.

use std::io;

use thiserror::Error;

use crate::event::{Handle, RegistrationState};
use crate::protocol::TypeId;

/// Main error type for reactor, multiplexer and protocol operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The polling context could not be created. Fatal: the reactor cannot run.
    #[error("failed to create polling context: {0}")]
    ResourceInit(#[source] io::Error),

    /// A registration call was made with an empty or unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Registration was attempted from a state that does not allow it.
    #[error("handle {handle} is {state:?}, cannot {operation}")]
    InvalidState {
        handle: Handle,
        state: RegistrationState,
        operation: &'static str,
    },

    /// The OS rejected a registration change.
    #[error("registration syscall failed for handle {handle}: {source}")]
    Syscall {
        handle: Handle,
        #[source]
        source: io::Error,
    },

    /// The peer sent something the protocol policy does not allow.
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] Violation),

    /// A message type was registered twice.
    #[error("protocol type {0} is already registered")]
    DuplicateRegistration(TypeId),

    /// A payload could not be unpacked into its message type.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Waiting for readiness failed for a reason other than an interrupt.
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),

    /// The dispatch sink no longer accepts tasks.
    #[error("dispatch sink is closed")]
    DispatchClosed,

    /// The reactor behind a [`ReactorHandle`](crate::reactor::ReactorHandle)
    /// has been dropped.
    #[error("reactor is gone")]
    ReactorGone,

    /// Configuration could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The ways an inbound frame can break protocol policy.
///
/// Every variant is fatal for the connection that produced it and harmless
/// for the rest of the reactor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("unknown protocol type {type_id} (declared size {size})")]
    UnknownType { type_id: TypeId, size: u64 },

    #[error("protocol type {type_id} declared size {size}, maximum is {max}")]
    Oversized { type_id: TypeId, size: u64, max: usize },

    #[error("protocol type {type_id} is forbidden on this connection")]
    Forbidden { type_id: TypeId },

    #[error("protocol type {type_id} payload is malformed: {reason}")]
    Malformed { type_id: TypeId, reason: String },

    #[error("stream already closed by an earlier violation")]
    Closed,
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
