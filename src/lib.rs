//! # mill-wire
//!
//! A reactor-driven server core for length-framed binary protocols, built
//! directly on [`mio`] without an async runtime.
//!
//! ## Pieces
//!
//! - [`poll::Multiplexer`]: readiness polling with an explicit per-handle
//!   registration state machine and accept-vs-data classification
//! - [`reactor::Reactor`]: owns every registered event object, runs the poll
//!   loop on one thread, applies deferred registration changes and timers,
//!   and stops cooperatively through a [`reactor::ReactorHandle`], which can
//!   also run callbacks for process signals on the I/O thread
//! - [`protocol`]: the type registry, the frame [`protocol::Decoder`] and
//!   the encoder
//! - [`thread_pool::ThreadPool`]: the dispatch sink, ordered per thread group
//! - [`shaper::TrafficShaper`]: a token-bucket byte limiter
//! - [`net::tcp::TcpServer`]: listener and connection events that tie the
//!   above together over TCP
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │ ReactorHandle│───▶│   Reactor    │───▶│ Multiplexer  │
//! └──────────────┘    └──────┬───────┘    └──────────────┘
//!                            │ handle_event
//!                            ▼
//!                     ┌──────────────┐    ┌──────────────┐
//!                     │  Connection  │───▶│   Decoder    │
//!                     └──────────────┘    └──────┬───────┘
//!                                                │ submit(group)
//!                                                ▼
//!                                         ┌──────────────┐
//!                                         │  ThreadPool  │
//!                                         └──────────────┘
//! ```
//!
//! ## Defining a message
//!
//! ```rust
//! use bytes::{Buf, BufMut, Bytes, BytesMut};
//! use mill_wire::error::Result;
//! use mill_wire::prelude::*;
//! use mill_wire::protocol::{ensure_remaining, TypeId};
//!
//! struct Echo(u64);
//!
//! impl Message for Echo {
//!     fn protocol_type(&self) -> TypeId { Self::TYPE }
//!     fn name(&self) -> &'static str { Self::NAME }
//!     fn pack(&self, out: &mut BytesMut) { out.put_u64(self.0) }
//!     fn run(&mut self, session: &Session) -> anyhow::Result<()> {
//!         session.send(&*self)?;
//!         Ok(())
//!     }
//! }
//!
//! impl Protocol for Echo {
//!     const TYPE: TypeId = 1;
//!     const NAME: &'static str = "echo";
//!     const MAX_SIZE: usize = 8;
//!
//!     fn unpack(payload: &mut Bytes) -> Result<Self> {
//!         ensure_remaining(payload, 8, "echo")?;
//!         Ok(Echo(payload.get_u64()))
//!     }
//! }
//!
//! let mut builder = ProtocolRegistry::builder();
//! builder.register::<Echo>()?;
//! let registry = builder.build();
//! assert!(registry.check_policy(1, 8));
//! # Ok::<(), mill_wire::error::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod net;
pub mod object_pool;
pub mod poll;
pub mod protocol;
pub mod reactor;
pub mod session;
pub mod shaper;
mod signal;
pub mod thread_pool;
mod timer;

pub use event::{EventKind, Handle, Interest, RegistrationState};
pub use handler::EventHandler;
pub use object_pool::{ObjectPool, PooledObject};

/// Commonly used types and traits.
///
/// ```rust
/// use mill_wire::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::ReactorConfig;
    pub use crate::event::{EventKind, Handle, Interest};
    pub use crate::handler::EventHandler;
    pub use crate::net::tcp::{config::ServerConfig, TcpServer};
    pub use crate::protocol::{Decoder, Message, Protocol, ProtocolRegistry};
    pub use crate::reactor::{Changes, Reactor, ReactorHandle};
    pub use crate::session::{Session, SessionManager};
    pub use crate::shaper::TrafficShaper;
    pub use crate::thread_pool::{DispatchSink, ThreadPool};
}
