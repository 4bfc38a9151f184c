//! Ingest adapters
//!
//! An adapter turns a transport into channel writes. Every adapter follows
//! the same contract, enforced by [`ChannelPublisher`](crate::stream::ChannelPublisher):
//! claim a key from the registry, write the stream header once, append
//! packets, then close. How a connection maps to a key is configuration
//! ([`ChannelKeying`](crate::config::ChannelKeying)), not a separate code path.
//!
//! - [`RtmpIngest`]: one channel per publishing RTMP connection; also serves
//!   RTMP players
//! - [`RtpIngest`]: two UDP sockets (video/audio) feeding one fixed channel

pub mod rtmp;
pub mod rtp;

pub use rtmp::RtmpIngest;
pub use rtp::RtpIngest;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::events::IngestKind;

/// A bound ingest listener
#[async_trait]
pub trait IngestAdapter: Send + Sync {
    fn kind(&self) -> IngestKind;

    /// Addresses the adapter is listening on
    fn local_addrs(&self) -> Vec<SocketAddr>;

    /// Serve until `shutdown` fires or the transport fails.
    ///
    /// A transport failure closes the adapter's channels and is returned;
    /// it never affects other adapters or sessions.
    async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Parse `bind_address:port` into a socket address.
pub(crate) fn socket_addr(bind_address: &str, port: u16) -> Result<SocketAddr> {
    let ip: std::net::IpAddr = bind_address.parse().map_err(|_| {
        crate::error::AppError::Config(format!("Invalid bind address: {}", bind_address))
    })?;
    Ok(SocketAddr::new(ip, port))
}
