use async_trait::async_trait;

use beaconet_core::node_record::NodeRecord;

use crate::mesh::SubnetNeeds;

/// The Kademlia-style discovery service is an external collaborator; only
/// its query/update surface is consumed here.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Returns candidate node records, biased toward nodes advertising the
    /// needed subnets. `min_score` applies the discovery-internal quality
    /// floor and is set exactly when specific subnets are needed.
    async fn find_peers(
        &self,
        needs: &SubnetNeeds,
        min_score: Option<u32>,
        limit: usize,
    ) -> anyhow::Result<Vec<NodeRecord>>;

    /// Republishes our signed record after a metadata change.
    async fn publish_record(&self, record: NodeRecord) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}
