use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use beaconet_core::PeerId;

/// Per-topic counters from the router's internal mesh bookkeeping.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct TopicMeshStats {
    /// Peers known to be subscribed to the topic.
    pub topic_peers: usize,
    /// Peers in our mesh for the topic.
    pub mesh_peers: usize,
    /// Outbound-direction peers in our mesh for the topic.
    pub outbound_mesh_peers: usize,
}

/// The gossip overlay router (mesh maintenance, IHAVE/IWANT, fan-out) is an
/// external collaborator; this is the interface the pipeline and the mesh
/// monitor consume.
#[async_trait]
pub trait GossipRouter: Send + Sync + 'static {
    async fn subscribe(&self, topic: &str) -> anyhow::Result<()>;

    async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()>;

    /// Publishes compressed bytes, returns how many peers received them.
    async fn publish(&self, topic: &str, data: Bytes) -> anyhow::Result<usize>;

    fn mesh_stats(&self, topic: &str) -> TopicMeshStats;

    fn mesh_peers(&self, topic: &str) -> Vec<PeerId>;

    fn subscribed_peers(&self, topic: &str) -> Vec<PeerId>;

    /// Down-ranks the sender of an invalid message.
    fn downrank(&self, peer: &PeerId);
}
