use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

use beaconet_core::node_record::PeerAddress;
use beaconet_core::PeerId;

pub type BoxStreamRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxStreamWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// One multiplexed stream, already negotiated to a protocol id.
/// Dropping both halves resets the stream; shutting down the write half
/// half-closes it.
pub struct RawStream {
    pub read: BoxStreamRead,
    pub write: BoxStreamWrite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Connection lifecycle notifications from the transport, consumed by the
/// orchestrator's event loop.
pub enum SwitchEvent {
    ConnectionOpened { peer: PeerId, direction: Direction },
    /// Fired per physical connection; the peer record tracks the refcount.
    ConnectionClosed { peer: PeerId },
    InboundStream {
        peer: PeerId,
        protocol: String,
        stream: RawStream,
    },
}

/// The authenticated, encrypted, multiplexed transport. Implementations own
/// dialing, stream negotiation, and connection teardown; everything above
/// (peer lifecycle, scoring, codecs) lives in this crate.
#[async_trait]
pub trait Switch: Send + Sync + 'static {
    fn local_peer_id(&self) -> PeerId;

    /// Establishes a connection; success/failure surfaces both as the return
    /// value and as a `ConnectionOpened` event.
    async fn connect(&self, addr: &PeerAddress) -> anyhow::Result<()>;

    async fn open_stream(&self, peer: PeerId, protocol: &str) -> anyhow::Result<RawStream>;

    /// Closes every physical connection to the peer.
    async fn disconnect(&self, peer: PeerId);

    async fn stop(&self) -> anyhow::Result<()>;
}
