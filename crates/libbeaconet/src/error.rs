use reqresp_protocol::RpcError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("peer {0} is not connected")]
    PeerNotConnected(beaconet_core::PeerId),

    #[error("no peers on topic")]
    NoPeers,

    #[error("topic {0} has no registered validator")]
    TopicNotValidated(String),

    #[error("gossip message of {len} bytes exceeds maximum {max}")]
    GossipOversized { len: usize, max: usize },

    #[error("network is shutting down")]
    ShuttingDown,

    #[error("gossip router error: {0:#}")]
    Router(#[source] anyhow::Error),

    #[error("bug: protocol mount failed: {0}")]
    BugProtocolMount(String),
}

pub type Result<T> = core::result::Result<T, Error>;
