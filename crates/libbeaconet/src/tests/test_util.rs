// In-memory doubles for the external collaborators: a hub-based switch over
// tokio duplex pipes, a scripted gossip router and a scripted discovery.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use beaconet_core::fork::{ForkEntry, ForkSchedule, MetadataVersion};
use beaconet_core::node_record::{NodeRecord, PeerAddress};
use beaconet_core::{ForkDigest, NetworkKeypair, PeerId};

use crate::discovery::Discovery;
use crate::gossip::router::{GossipRouter, TopicMeshStats};
use crate::mesh::SubnetNeeds;
use crate::switch::{Direction, RawStream, Switch, SwitchEvent};

pub const PHASE0_DIGEST: ForkDigest = ForkDigest([0, 0, 0, 1]);
pub const ALTAIR_DIGEST: ForkDigest = ForkDigest([0, 0, 0, 2]);

pub fn fork_schedule() -> ForkSchedule {
    ForkSchedule::new(vec![
        ForkEntry {
            epoch: 0,
            digest: PHASE0_DIGEST,
            metadata_version: MetadataVersion::V1,
        },
        ForkEntry {
            epoch: 10,
            digest: ALTAIR_DIGEST,
            metadata_version: MetadataVersion::V3,
        },
    ])
    .unwrap()
}

pub async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

struct HubNode {
    events: mpsc::Sender<SwitchEvent>,
    connected: HashSet<PeerId>,
}

/// Connects any number of [`HubSwitch`]es; dials create event pairs, streams
/// are duplex pipes delivered to the remote side's event channel.
#[derive(Default)]
pub struct TestHub {
    nodes: Mutex<HashMap<PeerId, HubNode>>,
    connects_in_flight: AtomicUsize,
    pub max_concurrent_connects: AtomicUsize,
    pub connect_delay: Mutex<Duration>,
}

impl TestHub {
    pub fn new() -> Arc<TestHub> {
        Default::default()
    }

    pub fn register(self: &Arc<Self>, peer: PeerId) -> mpsc::Receiver<SwitchEvent> {
        let (tx, rx) = mpsc::channel(256);
        self.nodes.lock().insert(
            peer,
            HubNode {
                events: tx,
                connected: HashSet::new(),
            },
        );
        rx
    }

    pub fn switch(self: &Arc<Self>, local: PeerId) -> Arc<HubSwitch> {
        Arc::new(HubSwitch {
            local,
            hub: self.clone(),
        })
    }

    fn emit(&self, to: &PeerId, event: SwitchEvent) {
        if let Some(node) = self.nodes.lock().get(to) {
            let _ = node.events.try_send(event);
        }
    }

    pub fn are_connected(&self, a: &PeerId, b: &PeerId) -> bool {
        self.nodes
            .lock()
            .get(a)
            .map(|n| n.connected.contains(b))
            .unwrap_or(false)
    }

    async fn connect(&self, from: PeerId, to: PeerId) -> anyhow::Result<()> {
        let in_flight = self.connects_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_connects
            .fetch_max(in_flight, Ordering::SeqCst);
        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = self.connect_inner(from, to);
        self.connects_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn connect_inner(&self, from: PeerId, to: PeerId) -> anyhow::Result<()> {
        {
            let mut nodes = self.nodes.lock();
            if !nodes.contains_key(&to) {
                anyhow::bail!("peer {to} unreachable");
            }
            nodes
                .get_mut(&from)
                .expect("dialer registered")
                .connected
                .insert(to);
            nodes.get_mut(&to).unwrap().connected.insert(from);
        }
        self.emit(
            &from,
            SwitchEvent::ConnectionOpened {
                peer: to,
                direction: Direction::Outgoing,
            },
        );
        self.emit(
            &to,
            SwitchEvent::ConnectionOpened {
                peer: from,
                direction: Direction::Incoming,
            },
        );
        Ok(())
    }

    fn open_stream(&self, from: PeerId, to: PeerId, protocol: &str) -> anyhow::Result<RawStream> {
        if !self.are_connected(&from, &to) {
            anyhow::bail!("not connected to {to}");
        }
        let (client, server) = tokio::io::duplex(1024 * 1024);
        let (cr, cw) = tokio::io::split(client);
        let (sr, sw) = tokio::io::split(server);
        self.emit(
            &to,
            SwitchEvent::InboundStream {
                peer: from,
                protocol: protocol.to_owned(),
                stream: RawStream {
                    read: Box::new(sr),
                    write: Box::new(sw),
                },
            },
        );
        Ok(RawStream {
            read: Box::new(cr),
            write: Box::new(cw),
        })
    }

    fn disconnect(&self, from: PeerId, to: PeerId) {
        let was_connected = {
            let mut nodes = self.nodes.lock();
            let removed = nodes
                .get_mut(&from)
                .map(|n| n.connected.remove(&to))
                .unwrap_or(false);
            if let Some(n) = nodes.get_mut(&to) {
                n.connected.remove(&from);
            }
            removed
        };
        if was_connected {
            self.emit(&from, SwitchEvent::ConnectionClosed { peer: to });
            self.emit(&to, SwitchEvent::ConnectionClosed { peer: from });
        }
    }
}

pub struct HubSwitch {
    local: PeerId,
    hub: Arc<TestHub>,
}

#[async_trait]
impl Switch for HubSwitch {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    async fn connect(&self, addr: &PeerAddress) -> anyhow::Result<()> {
        self.hub.connect(self.local, addr.peer_id).await
    }

    async fn open_stream(&self, peer: PeerId, protocol: &str) -> anyhow::Result<RawStream> {
        self.hub.open_stream(self.local, peer, protocol)
    }

    async fn disconnect(&self, peer: PeerId) {
        self.hub.disconnect(self.local, peer);
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A switch that serves pre-armed streams, for driving the request engine
/// against hand-crafted remote behavior.
pub struct ScriptedSwitch {
    local: PeerId,
    streams: Mutex<Vec<RawStream>>,
}

impl ScriptedSwitch {
    pub fn new(streams: Vec<RawStream>) -> Arc<ScriptedSwitch> {
        Arc::new(ScriptedSwitch {
            local: PeerId::new([0xee; 32]),
            streams: Mutex::new(streams),
        })
    }
}

#[async_trait]
impl Switch for ScriptedSwitch {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    async fn connect(&self, _addr: &PeerAddress) -> anyhow::Result<()> {
        Ok(())
    }

    async fn open_stream(&self, _peer: PeerId, _protocol: &str) -> anyhow::Result<RawStream> {
        self.streams
            .lock()
            .pop()
            .ok_or_else(|| anyhow::anyhow!("no scripted stream left"))
    }

    async fn disconnect(&self, _peer: PeerId) {}

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct TestRouter {
    pub stats: Mutex<HashMap<String, TopicMeshStats>>,
    pub mesh: Mutex<HashMap<String, Vec<PeerId>>>,
    pub topic_subscribers: Mutex<HashMap<String, Vec<PeerId>>>,
    pub subscriptions: Mutex<HashSet<String>>,
    pub published: Mutex<Vec<(String, Bytes)>>,
    /// How many peers `publish` reports reaching, per topic.
    pub peers_reached: Mutex<HashMap<String, usize>>,
}

impl TestRouter {
    pub fn new() -> Arc<TestRouter> {
        Default::default()
    }
}

#[async_trait]
impl GossipRouter for TestRouter {
    async fn subscribe(&self, topic: &str) -> anyhow::Result<()> {
        self.subscriptions.lock().insert(topic.to_owned());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()> {
        self.subscriptions.lock().remove(topic);
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Bytes) -> anyhow::Result<usize> {
        self.published.lock().push((topic.to_owned(), data));
        Ok(self
            .peers_reached
            .lock()
            .get(topic)
            .copied()
            .unwrap_or(0))
    }

    fn mesh_stats(&self, topic: &str) -> TopicMeshStats {
        self.stats.lock().get(topic).copied().unwrap_or_default()
    }

    fn mesh_peers(&self, topic: &str) -> Vec<PeerId> {
        self.mesh.lock().get(topic).cloned().unwrap_or_default()
    }

    fn subscribed_peers(&self, topic: &str) -> Vec<PeerId> {
        self.topic_subscribers
            .lock()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    fn downrank(&self, _peer: &PeerId) {}
}

/// Scripted discovery: returns a canned record batch and remembers every
/// query's subnet bias.
#[derive(Default)]
pub struct TestDiscovery {
    pub records: Mutex<Vec<NodeRecord>>,
    pub queries: Mutex<Vec<(SubnetNeeds, Option<u32>)>>,
    pub published: Mutex<Vec<NodeRecord>>,
}

impl TestDiscovery {
    pub fn new() -> Arc<TestDiscovery> {
        Default::default()
    }
}

#[async_trait]
impl Discovery for TestDiscovery {
    async fn find_peers(
        &self,
        needs: &SubnetNeeds,
        min_score: Option<u32>,
        _limit: usize,
    ) -> anyhow::Result<Vec<NodeRecord>> {
        self.queries.lock().push((*needs, min_score));
        Ok(self.records.lock().clone())
    }

    async fn publish_record(&self, record: NodeRecord) -> anyhow::Result<()> {
        self.published.lock().push(record);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A signed record with a TCP address, dialable through the hub.
pub fn node_record_for(keypair: &NetworkKeypair, port: u16) -> NodeRecord {
    let mut record = NodeRecord::new(keypair);
    record.update(keypair, |r| {
        r.tcp4 = Some(([127, 0, 0, 1], port).into());
    });
    record
}
