//! Network front end for the framed protocol.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Reactor thread                        │
//! │  ┌──────────┐  accept  ┌────────────┐  bytes  ┌───────────┐  │
//! │  │ Listener │────────▶│ Connection │───────▶│  Decoder  │  │
//! │  └──────────┘          └────────────┘         └─────┬─────┘  │
//! │                              ▲ flush                │        │
//! └──────────────────────────────┼──────────────────────┼────────┘
//!                                │ Session::send        │ submit(group, task)
//! ┌──────────────────────────────┼──────────────────────▼────────┐
//! │                       Dispatch workers                       │
//! │                 Message::run(&Session) per frame             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mill_wire::config::ReactorConfig;
//! use mill_wire::net::tcp::{config::ServerConfig, TcpServer};
//! use mill_wire::protocol::ProtocolRegistry;
//! use mill_wire::reactor::Reactor;
//! use mill_wire::thread_pool::{DispatchSink, ThreadPool};
//!
//! # fn main() -> mill_wire::error::Result<()> {
//! let config = ReactorConfig::default();
//! let registry = ProtocolRegistry::builder().build();
//! let sink: Arc<dyn DispatchSink> = Arc::new(ThreadPool::new(config.workers)?);
//!
//! let mut reactor = Reactor::new(&config)?;
//! let mut server = TcpServer::bind(ServerConfig::default(), registry, sink)?;
//! server.start(&mut reactor)?;
//! reactor.run()?;
//! # Ok(())
//! # }
//! ```

pub mod tcp;
