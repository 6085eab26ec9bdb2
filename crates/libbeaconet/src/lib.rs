//!
//! Consensus-layer peer-to-peer networking core for a beacon node.
//!
//! This crate owns the hard parts of the wire: the Req/Resp chunk engine
//! with per-chunk timeouts, the per-peer state machine with scoring, quotas
//! and reconnect back-off, the connection maintenance loops (discovery bias,
//! dial workers, mesh trimming, metadata pinging), and the gossip
//! publish/validate pipeline.
//!
//! The transport ("switch"), the gossip overlay router, and the discovery
//! service are external collaborators behind traits; beacon state transition
//! and payload SSZ schemas stay out entirely, payloads are opaque bytes.
//!
//! The main type to start off with is [`Network`].

pub mod config;
mod connector;
pub mod discovery;
pub mod error;
pub mod gossip;
pub mod mesh;
mod network;
pub mod peer;
pub mod peer_pool;
mod protocols;
pub mod quota;
pub mod registry;
pub mod reqresp;
pub mod score;
pub mod seen_table;
pub mod stats;
pub mod status;
pub mod switch;

pub use config::NetworkConfig;
pub use discovery::Discovery;
pub use error::{Error, Result};
pub use gossip::{
    DecodeOutcome, GossipPipeline, GossipRouter, GossipTopic, TopicMeshStats, TopicValidator,
    Validation,
};
pub use mesh::SubnetNeeds;
pub use network::{EpochClock, Network, NetworkOptions};
pub use peer::{ConnectionState, Peer};
pub use peer_pool::{AdmissionError, PeerPool};
pub use registry::{HandlerError, HandshakeRejected, Protocol, ProtocolContext, Registry};
pub use reqresp::Responder;
pub use score::{ScoreAction, NEW_PEER_SCORE, SCORE_HIGH_LIMIT, SCORE_LOW_LIMIT};
pub use seen_table::{DisconnectReason, SeenTable};
pub use stats::NetworkStats;
pub use status::{StatusHandler, StatusVerdict};
pub use switch::{Direction, RawStream, Switch, SwitchEvent};

pub use beaconet_core::{AgentKind, ForkDigest, ForkSchedule, MetaData, NetworkKeypair, PeerId};
pub use reqresp_protocol::{GoodbyeReason, MessageKind, ResponseChunk, ResponseCode, RpcError};

#[cfg(test)]
mod tests;

/// The cargo version of libbeaconet.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
