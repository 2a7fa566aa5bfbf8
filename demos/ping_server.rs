//! Ping/pong server.
//!
//! ```text
//! RUST_LOG=debug cargo run --example ping_server -- [server.toml]
//! ```
//!
//! Clients send `ping` frames (type 1, payload `u64 nonce | u32 shard`) and
//! get a `pong` (type 2, payload `u64 nonce`) back. Pings of the same shard
//! are answered in order. SIGINT or SIGTERM stops the reactor.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mill_wire::error::Result;
use mill_wire::prelude::*;
use mill_wire::protocol::{ensure_remaining, TypeId};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Ping {
    nonce: u64,
    shard: u32,
}

impl Message for Ping {
    fn protocol_type(&self) -> TypeId {
        Self::TYPE
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn thread_group(&self) -> usize {
        self.shard as usize
    }

    fn pack(&self, out: &mut BytesMut) {
        out.put_u64(self.nonce);
        out.put_u32(self.shard);
    }

    fn run(&mut self, session: &Session) -> anyhow::Result<()> {
        session.send(&Pong { nonce: self.nonce })?;
        Ok(())
    }
}

impl Protocol for Ping {
    const TYPE: TypeId = 1;
    const NAME: &'static str = "ping";
    const MAX_SIZE: usize = 12;

    fn unpack(payload: &mut Bytes) -> Result<Self> {
        ensure_remaining(payload, 12, "ping")?;
        Ok(Ping {
            nonce: payload.get_u64(),
            shard: payload.get_u32(),
        })
    }
}

struct Pong {
    nonce: u64,
}

impl Message for Pong {
    fn protocol_type(&self) -> TypeId {
        Self::TYPE
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn pack(&self, out: &mut BytesMut) {
        out.put_u64(self.nonce);
    }

    fn run(&mut self, session: &Session) -> anyhow::Result<()> {
        anyhow::bail!("session {} sent a pong to the server", session.id())
    }
}

impl Protocol for Pong {
    const TYPE: TypeId = 2;
    const NAME: &'static str = "pong";
    const MAX_SIZE: usize = 8;

    fn unpack(payload: &mut Bytes) -> Result<Self> {
        ensure_remaining(payload, 8, "pong")?;
        Ok(Pong {
            nonce: payload.get_u64(),
        })
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let server_config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_toml_str(&std::fs::read_to_string(path)?)?,
        None => ServerConfig::default(),
    };
    let reactor_config = ReactorConfig::default();

    let mut builder = ProtocolRegistry::builder();
    builder.register::<Ping>()?.register::<Pong>()?;
    let registry = builder.build();

    let sink: Arc<dyn DispatchSink> = Arc::new(ThreadPool::new(reactor_config.workers)?);
    let mut reactor = Reactor::new(&reactor_config)?;
    let mut server = TcpServer::bind(server_config, registry, sink)?
        .with_shaper(Arc::new(TrafficShaper::new(16 * 1024 * 1024)));
    server.start(&mut reactor)?;

    let handle = reactor.handle();
    for signum in [SIGINT, SIGTERM] {
        let stopper = handle.clone();
        handle.add_signal(signum, move |signum| {
            info!(signum, "shutting down");
            stopper.stop();
        })?;
    }

    let sessions = server.sessions();
    handle
        .add_timer(Duration::from_secs(10), true, None, move || {
            info!(sessions = sessions.count(), "status");
            true
        })?;

    info!(address = %server.local_addr(), workers = reactor_config.workers, "ping server ready");
    reactor.run()?;
    Ok(())
}
