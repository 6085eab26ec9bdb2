use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, debug_span, error_span, info, trace, warn};

use beaconet_core::fork::{ForkSchedule, MetadataVersion};
use beaconet_core::metadata::MetaData;
use beaconet_core::node_record::NodeRecord;
use beaconet_core::spawn_utils::{spawn, spawn_with_cancel};
use beaconet_core::subnets::{AttnetBits, ColnetBits, SyncnetBits};
use beaconet_core::{Epoch, NetworkKeypair, PeerId};

use reqresp_protocol::{write_request, MessageKind, ResponseChunk};

use crate::config::NetworkConfig;
use crate::connector::{Connector, ConnectorShared};
use crate::discovery::Discovery;
use crate::error::{Error, Result};
use crate::gossip::{GossipPipeline, GossipRouter, TopicValidator};
use crate::mesh;
use crate::peer::{ClosedOutcome, ConnectOutcome, ConnectionState, Peer};
use crate::peer_pool::{AdmissionError, PeerPool};
use crate::protocols::CoreProtocol;
use crate::quota::{RequestQuota, ThrottleCounters};
use crate::registry::{Protocol, Registry};
use crate::reqresp::client::send_request;
use crate::reqresp::server::{handle_inbound_stream, InboundCtx};
use crate::score::{ScoreAction, SCORE_LOW_LIMIT};
use crate::seen_table::{DisconnectReason, SeenTable};
use crate::stats::NetworkStats;
use crate::status::{StatusHandler, StatusProtocol};
use crate::switch::{Direction, Switch, SwitchEvent};

pub type EpochClock = Arc<dyn Fn() -> Epoch + Send + Sync>;

const SEEN_TABLE_CAPACITY: usize = 4096;
const GOODBYE_TIMEOUT: Duration = Duration::from_secs(1);
const PINGER_TICK: Duration = Duration::from_secs(30);
const DISCOVERY_BATCH: usize = 32;

pub struct NetworkOptions {
    pub config: NetworkConfig,
    pub keypair: NetworkKeypair,
    pub fork_schedule: ForkSchedule,
    pub epoch_clock: EpochClock,
    pub switch: Arc<dyn Switch>,
    pub router: Arc<dyn GossipRouter>,
    pub discovery: Arc<dyn Discovery>,
    /// Mounts the built-in status exchange when set.
    pub status: Option<Arc<dyn StatusHandler>>,
    pub protocols: Vec<Arc<dyn Protocol>>,
}

pub(crate) struct NetworkInner {
    pub(crate) cfg: NetworkConfig,
    keypair: NetworkKeypair,
    pub(crate) local_peer_id: PeerId,
    fork_schedule: ForkSchedule,
    epoch_clock: EpochClock,

    switch: Arc<dyn Switch>,
    router: Arc<dyn GossipRouter>,
    discovery: Arc<dyn Discovery>,

    registry: Registry,
    pub(crate) pool: Arc<PeerPool>,
    pub(crate) seen: Arc<SeenTable>,
    gossip: GossipPipeline,
    global_quota: RequestQuota,
    pub(crate) throttle: ThrottleCounters,

    metadata: RwLock<MetaData>,
    local_colnets: RwLock<ColnetBits>,
    record: Mutex<NodeRecord>,

    pub(crate) conn_shared: Arc<ConnectorShared>,
    pub(crate) connector: Connector,
    direct_peer_ids: HashSet<PeerId>,
    subscribed_topics: RwLock<HashSet<String>>,
    /// Wakes the maintenance loop out of schedule: peer counts moved past
    /// the target, or a direct peer dropped out and needs re-dialing.
    maintenance_now: Arc<Notify>,

    cancel: CancellationToken,
}

/// The orchestrator: owns the lifecycle of every control loop and exposes
/// the high-level send/subscribe surface.
pub struct Network {
    inner: Arc<NetworkInner>,
    // Dropping the network without stop() still cancels every task.
    _cancel_guard: DropGuard,
}

impl Network {
    /// Wires every component together and launches the control loops:
    /// switch event dispatch, dial workers, discovery, metadata pinger,
    /// mesh maintenance. Only protocol-mount conflicts are fatal.
    pub fn start(
        opts: NetworkOptions,
        events: mpsc::Receiver<SwitchEvent>,
    ) -> Result<Network> {
        let NetworkOptions {
            config: cfg,
            keypair,
            fork_schedule,
            epoch_clock,
            switch,
            router,
            discovery,
            status,
            protocols,
        } = opts;

        let cancel = CancellationToken::new();
        let local_peer_id = keypair.peer_id();

        let maintenance_now = Arc::new(Notify::new());
        let mut pool = PeerPool::new(
            cfg.max_peers,
            Box::new(|p: &Peer| p.score() >= SCORE_LOW_LIMIT),
        );
        {
            let wake = maintenance_now.clone();
            let target = cfg.target_peers;
            pool.set_on_count_changed(Box::new(move |incoming, outgoing| {
                trace!(incoming, outgoing, "peer count changed");
                if incoming + outgoing > target {
                    wake.notify_one();
                }
            }));
            let wake = maintenance_now.clone();
            pool.set_on_delete(Box::new(move |peer| {
                debug!(peer = %peer.peer_id, score = peer.score(), "peer left the pool");
                if peer.is_direct() {
                    wake.notify_one();
                }
            }));
        }
        let pool = Arc::new(pool);
        let seen = Arc::new(SeenTable::new(SEEN_TABLE_CAPACITY));
        let conn_shared = Arc::new(ConnectorShared {
            switch: switch.clone(),
            seen: seen.clone(),
            pool: pool.clone(),
            pending: Default::default(),
            stats: Default::default(),
            connect_timeout: cfg.connect_timeout,
        });
        let connector = Connector::start(
            cfg.dial_queue_size,
            cfg.concurrent_dials,
            conn_shared.clone(),
            &cancel,
        );

        let record = NodeRecord::new(&keypair);
        let direct_peer_ids = cfg.direct_peers.iter().map(|a| a.peer_id).collect();
        let gossip = GossipPipeline::new(fork_schedule.phase0_digest());
        let global_quota = RequestQuota::new(cfg.max_requests_per_peer * 2, cfg.full_replenish_time);

        let mut mount_result: Result<()> = Ok(());
        let inner = Arc::new_cyclic(|weak| {
            let mut registry = Registry::new();
            let mut mount = |p: Arc<dyn Protocol>| {
                if mount_result.is_ok() {
                    if let Err(e) = registry.mount(p) {
                        mount_result = Err(e);
                    }
                }
            };
            mount(Arc::new(CoreProtocol::new(weak.clone())));
            if let Some(handler) = status {
                mount(Arc::new(StatusProtocol::new(weak.clone(), handler)));
            }
            for p in protocols {
                mount(p);
            }

            NetworkInner {
                cfg,
                keypair,
                local_peer_id,
                fork_schedule,
                epoch_clock,
                switch,
                router,
                discovery,
                registry,
                pool,
                seen,
                gossip,
                global_quota,
                throttle: ThrottleCounters::new(),
                metadata: RwLock::new(MetaData::default()),
                local_colnets: RwLock::new(ColnetBits::new()),
                record: Mutex::new(record),
                conn_shared,
                connector,
                direct_peer_ids,
                subscribed_topics: Default::default(),
                maintenance_now,
                cancel: cancel.clone(),
            }
        });
        // Mount conflicts are setup bugs; nothing has been spawned against
        // the registry yet, so failing here is clean.
        mount_result?;

        info!(peer_id = %local_peer_id, protocols = inner.registry.len(), "network starting");

        spawn_with_cancel(
            error_span!("network", peer = %local_peer_id),
            cancel.child_token(),
            event_loop(inner.clone(), events),
        );
        spawn_with_cancel(
            debug_span!("discovery"),
            cancel.child_token(),
            discovery_loop(inner.clone()),
        );
        spawn_with_cancel(
            debug_span!("metadata_pinger"),
            cancel.child_token(),
            pinger_loop(inner.clone()),
        );
        spawn_with_cancel(
            debug_span!("mesh_maintenance"),
            cancel.child_token(),
            maintenance_loop(inner.clone()),
        );

        for addr in &inner.cfg.direct_peers {
            inner.connector.try_enqueue(addr.clone());
        }

        Ok(Network {
            inner,
            _cancel_guard: cancel.drop_guard(),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.inner.local_peer_id
    }

    pub fn metadata(&self) -> MetaData {
        self.inner.own_metadata()
    }

    pub fn node_record(&self) -> NodeRecord {
        self.inner.record.lock().clone()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.pool.len()
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.inner.pool.get(peer_id)
    }

    /// Sends one request and returns the decoded chunks. Typed result,
    /// never panics; scoring feedback is applied internally.
    pub async fn request(
        &self,
        peer_id: PeerId,
        kind: MessageKind,
        payload: &[u8],
    ) -> Result<Vec<ResponseChunk>> {
        self.inner.request(peer_id, kind, payload).await
    }

    /// SSZ-encodes are the caller's job; this compresses and publishes.
    /// "No peers" is a soft error unless the topic is a known thin one.
    pub async fn broadcast(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.inner.broadcast(topic, payload).await
    }

    /// Registering the validator is what makes the topic subscribable;
    /// there is no way to subscribe without one.
    pub async fn subscribe(&self, topic: &str, validator: TopicValidator) -> Result<()> {
        self.inner.subscribe(topic, validator).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.inner.unsubscribe(topic).await
    }

    /// Application-level scoring feedback (status exchange outcomes, data
    /// quality). Low-score disconnects follow automatically.
    pub fn report_peer(&self, peer_id: PeerId, action: ScoreAction) {
        if let Some(peer) = self.inner.pool.get(&peer_id) {
            peer.apply_score(action);
            self.inner.maybe_drop_low_score(&peer);
        }
    }

    /// The peer turned out to be on a different network or fork; long
    /// reconnect suppression.
    pub fn report_irrelevant_network(&self, peer_id: PeerId) {
        self.inner
            .schedule_disconnect(peer_id, DisconnectReason::IrrelevantNetwork, true);
    }

    /// Unspecified peer misbehavior not covered by scoring.
    pub fn report_fault(&self, peer_id: PeerId) {
        self.inner
            .schedule_disconnect(peer_id, DisconnectReason::FaultOrError, true);
    }

    pub fn update_attnets(&self, attnets: AttnetBits) {
        self.inner.update_metadata(
            |md| {
                if md.attnets == attnets {
                    return false;
                }
                md.attnets = attnets;
                true
            },
            move |r| r.attnets = attnets,
        );
    }

    pub fn update_syncnets(&self, syncnets: SyncnetBits) {
        self.inner.update_metadata(
            |md| {
                if md.syncnets == syncnets {
                    return false;
                }
                md.syncnets = syncnets;
                true
            },
            move |r| r.syncnets = syncnets,
        );
    }

    pub fn update_custody(&self, custody_subnet_count: u64, colnets: ColnetBits) {
        *self.inner.local_colnets.write() = colnets;
        self.inner.update_metadata(
            |md| {
                if md.custody_subnet_count == custody_subnet_count {
                    return false;
                }
                md.custody_subnet_count = custody_subnet_count;
                true
            },
            move |r| r.csc = custody_subnet_count,
        );
    }

    /// New fork id after a fork transition; republishes the node record.
    pub fn update_eth2(&self, fork_id: Bytes) {
        let changed = self.inner.record.lock().eth2 != fork_id;
        if changed {
            self.inner.refresh_record(move |r| r.eth2 = fork_id.clone());
        }
    }

    pub fn stats(&self) -> NetworkStats {
        self.inner.stats()
    }

    /// The gossip pipeline, for wiring a router's message-id provider and
    /// validation callbacks to this node.
    pub fn gossip(&self) -> &GossipPipeline {
        self.inner.gossip_pipeline()
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<NetworkInner> {
        &self.inner
    }

    /// Cancels every loop, says goodbye to connected peers, stops the
    /// switch and discovery. Bounded; failures are logged, not raised.
    pub async fn stop(&self) {
        self.inner.stop().await
    }
}

impl NetworkInner {
    pub(crate) fn own_metadata(&self) -> MetaData {
        *self.metadata.read()
    }

    fn update_metadata(
        self: &Arc<Self>,
        apply_md: impl FnOnce(&mut MetaData) -> bool,
        apply_record: impl Fn(&mut NodeRecord) + Send + 'static,
    ) {
        let changed = {
            let mut md = self.metadata.write();
            if apply_md(&mut md) {
                md.seq_number += 1;
                true
            } else {
                false
            }
        };
        if changed {
            self.refresh_record(apply_record);
        }
    }

    fn refresh_record(self: &Arc<Self>, apply: impl Fn(&mut NodeRecord) + Send + 'static) {
        let updated = {
            let mut record = self.record.lock();
            record.update(&self.keypair, |r| apply(r)).then(|| record.clone())
        };
        let Some(record) = updated else { return };
        let inner = self.clone();
        spawn_with_cancel(
            debug_span!("publish_record", seq = record.seq),
            self.cancel.child_token(),
            async move {
                if let Err(e) = inner.discovery.publish_record(record).await {
                    debug!("failed to publish node record: {e:#}");
                }
                Ok(())
            },
        );
    }

    async fn request(
        self: &Arc<Self>,
        peer_id: PeerId,
        kind: MessageKind,
        payload: &[u8],
    ) -> Result<Vec<ResponseChunk>> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let peer = self
            .pool
            .get(&peer_id)
            .ok_or(Error::PeerNotConnected(peer_id))?;
        let result = send_request(
            &*self.switch,
            &self.fork_schedule,
            &peer,
            kind,
            payload,
            self.cfg.stream_open_timeout,
            self.cfg.resp_timeout,
        )
        .await;
        self.maybe_drop_low_score(&peer);
        result.map_err(Error::Rpc)
    }

    async fn broadcast(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let data = self.gossip.prepare_publish(payload)?;
        match self.router.publish(topic, data).await {
            Err(e) => {
                // Router hiccups are not the caller's problem.
                warn!(topic, "gossip publish failed: {e:#}");
                Ok(())
            }
            Ok(0) if !self.gossip.is_low_peer_topic(topic) => Err(Error::NoPeers),
            Ok(n) => {
                trace!(topic, peers = n, "published");
                Ok(())
            }
        }
    }

    async fn subscribe(&self, topic: &str, validator: TopicValidator) -> Result<()> {
        self.gossip.register_validator(topic, validator);
        if let Err(e) = self.router.subscribe(topic).await {
            self.gossip.unregister_validator(topic);
            return Err(Error::Router(e));
        }
        self.subscribed_topics.write().insert(topic.to_owned());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.subscribed_topics.write().remove(topic);
        self.gossip.unregister_validator(topic);
        self.router
            .unsubscribe(topic)
            .await
            .map_err(Error::Router)
    }

    /// Gossip inbound entrypoints for the router integration.
    pub(crate) fn gossip_pipeline(&self) -> &GossipPipeline {
        &self.gossip
    }

    /// Status request on behalf of the built-in status protocol. Scoring of
    /// transport errors already happened inside the engine; the exchange
    /// outcome itself is judged by the caller.
    pub(crate) async fn status_exchange(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        local_status: &[u8],
    ) -> anyhow::Result<Vec<ResponseChunk>> {
        send_request(
            &*self.switch,
            &self.fork_schedule,
            peer,
            MessageKind::Status,
            local_status,
            self.cfg.stream_open_timeout,
            self.cfg.resp_timeout,
        )
        .await
        .map_err(anyhow::Error::from)
    }

    fn get_or_create_peer(&self, peer_id: PeerId, direction: Direction) -> Arc<Peer> {
        if let Some(peer) = self.pool.get(&peer_id) {
            return peer;
        }
        let peer = Arc::new(Peer::new(
            peer_id,
            direction,
            self.cfg.max_requests_per_peer,
            self.cfg.full_replenish_time,
        ));
        self.registry.init_peer(&peer);
        if self.direct_peer_ids.contains(&peer_id) {
            peer.mark_direct();
        }
        peer
    }

    fn on_connection_opened(self: &Arc<Self>, peer_id: PeerId, direction: Direction) {
        if peer_id == self.local_peer_id {
            return;
        }
        let peer = self.get_or_create_peer(peer_id, direction);
        match peer.on_connection_opened(direction) {
            ConnectOutcome::StartHandshake => {
                match self.pool.add(peer.clone(), direction) {
                    Ok(()) | Err(AdmissionError::Duplicate) => {
                        let inner = self.clone();
                        spawn_with_cancel(
                            debug_span!("handshake", peer = %peer_id),
                            self.cancel.child_token(),
                            async move {
                                inner.run_handshake(peer).await;
                                Ok(())
                            },
                        );
                    }
                    Err(e) => {
                        let reason = match e {
                            AdmissionError::LowScore => DisconnectReason::ScoreLow,
                            AdmissionError::NoSpace => DisconnectReason::BenignReconnect,
                            AdmissionError::DeadPeer | AdmissionError::Duplicate => {
                                DisconnectReason::FaultOrError
                            }
                        };
                        debug!(peer = %peer_id, ?e, "admission refused");
                        self.schedule_disconnect_peer(peer, reason, false);
                    }
                }
            }
            ConnectOutcome::Duplicate => {
                // Extra physical connection; first one stays authoritative.
                debug!(peer = %peer_id, connections = peer.connections(), "duplicate connection");
            }
            ConnectOutcome::Ignored => {
                trace!(peer = %peer_id, "connection while disconnecting");
            }
        }
    }

    async fn run_handshake(self: Arc<Self>, peer: Arc<Peer>) {
        for (idx, handler) in self.registry.handlers() {
            if let Err(e) = handler
                .on_peer_connected(self.registry.context(idx), &peer)
                .await
            {
                let reason = e
                    .downcast_ref::<crate::registry::HandshakeRejected>()
                    .map(|r| r.reason)
                    .unwrap_or(DisconnectReason::FaultOrError);
                debug!(peer = %peer.peer_id, protocol = handler.name(), "handshake failed: {e:#}");
                self.schedule_disconnect_peer(peer, reason, true);
                return;
            }
        }
        if peer.mark_connected() {
            trace!(peer = %peer.peer_id, "peer connected");
        }
    }

    fn on_connection_closed(self: &Arc<Self>, peer_id: PeerId) {
        let Some(peer) = self.pool.get(&peer_id) else {
            return;
        };
        if peer.on_connection_closed() == ClosedOutcome::FullyDisconnected {
            let inner = self.clone();
            spawn_with_cancel(
                debug_span!("peer_teardown", peer = %peer_id),
                self.cancel.child_token(),
                async move {
                    // Handlers first; the record leaves the map only after
                    // every one of them has returned. The state check keeps
                    // a reconnect that resurrected the entry meanwhile.
                    for (idx, handler) in inner.registry.handlers() {
                        handler
                            .on_peer_disconnected(inner.registry.context(idx), &peer)
                            .await;
                    }
                    inner.pool.remove_if(&peer_id, |p| {
                        p.connection_state() == ConnectionState::Disconnected
                    });
                    trace!(peer = %peer_id, "peer removed");
                    Ok(())
                },
            );
        }
    }

    fn on_inbound_stream(
        self: &Arc<Self>,
        peer_id: PeerId,
        protocol: String,
        stream: crate::switch::RawStream,
    ) {
        let Some(peer) = self.pool.get(&peer_id) else {
            trace!(peer = %peer_id, protocol, "stream from unknown peer dropped");
            return;
        };
        let inner = self.clone();
        // Plain spawn: cancellation is raced inside the handler so the
        // write half is still shut down when the token fires mid-exchange.
        spawn(
            debug_span!("inbound_stream", peer = %peer_id, protocol = %protocol),
            async move {
                let ctx = InboundCtx {
                    registry: &inner.registry,
                    global_quota: &inner.global_quota,
                    throttle: &inner.throttle,
                    resp_timeout: inner.cfg.resp_timeout,
                    cancel: inner.cancel.child_token(),
                };
                handle_inbound_stream(ctx, &peer, &protocol, stream, |p| {
                    inner.maybe_drop_low_score(p)
                })
                .await;
                Ok(())
            },
        );
    }

    pub(crate) fn maybe_drop_low_score(self: &Arc<Self>, peer: &Arc<Peer>) {
        if peer.take_low_score_trigger() {
            self.schedule_disconnect_peer(peer.clone(), DisconnectReason::ScoreLow, true);
        }
    }

    pub(crate) fn schedule_disconnect(
        self: &Arc<Self>,
        peer_id: PeerId,
        reason: DisconnectReason,
        send_goodbye: bool,
    ) {
        let Some(peer) = self.pool.get(&peer_id) else {
            // Never connected far enough to be pooled; suppress redials anyway.
            self.seen.add(peer_id, reason);
            return;
        };
        self.schedule_disconnect_peer(peer, reason, send_goodbye);
    }

    fn schedule_disconnect_peer(
        self: &Arc<Self>,
        peer: Arc<Peer>,
        reason: DisconnectReason,
        send_goodbye: bool,
    ) {
        let inner = self.clone();
        spawn_with_cancel(
            debug_span!("disconnect", peer = %peer.peer_id, ?reason),
            self.cancel.child_token(),
            async move {
                inner.disconnect_peer(&peer, reason, send_goodbye).await;
                Ok(())
            },
        );
    }

    async fn disconnect_peer(&self, peer: &Arc<Peer>, reason: DisconnectReason, send_goodbye: bool) {
        if !peer.begin_disconnect() {
            return;
        }
        // Seen-table insert precedes the transport call so a reconnect
        // racing the teardown is still suppressed.
        self.seen.add(peer.peer_id, reason);
        if send_goodbye {
            if let Some(code) = reason.goodbye() {
                self.send_goodbye(peer.peer_id, code.code()).await;
            }
        }
        self.switch.disconnect(peer.peer_id).await;
        debug!(peer = %peer.peer_id, ?reason, "disconnecting");
    }

    /// Fire-and-forget: goodbye gets one short-lived stream and no reply.
    async fn send_goodbye(&self, peer_id: PeerId, code: u64) {
        let attempt = async {
            let mut stream = self
                .switch
                .open_stream(peer_id, &MessageKind::Goodbye.protocol_id())
                .await?;
            write_request(&mut stream.write, MessageKind::Goodbye, &code.to_le_bytes()).await?;
            stream.write.shutdown().await?;
            Ok::<_, anyhow::Error>(())
        };
        if let Ok(Err(e)) = timeout(GOODBYE_TIMEOUT, attempt).await {
            trace!(peer = %peer_id, "goodbye not delivered: {e:#}");
        }
    }

    fn stats(&self) -> NetworkStats {
        use std::sync::atomic::Ordering;
        let dial = &self.conn_shared.stats;
        NetworkStats {
            peers: self.pool.len(),
            peers_incoming: self.pool.count(Direction::Incoming),
            peers_outgoing: self.pool.count(Direction::Outgoing),
            peers_connected: self
                .pool
                .snapshot()
                .iter()
                .filter(|p| p.connection_state() == ConnectionState::Connected)
                .count(),
            seen_entries: self.seen.len(),
            pending_dials: self.conn_shared.pending.lock().len(),
            dials_ok: dial.ok.load(Ordering::Relaxed),
            dials_timeout: dial.timeout.load(Ordering::Relaxed),
            dials_failed: dial.failed.load(Ordering::Relaxed),
            dials_skipped: dial.skipped.load(Ordering::Relaxed),
            throttled: self
                .throttle
                .snapshot()
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v))
                .collect(),
            gossip_failed_snappy: self.gossip.failed_snappy_count(),
            gossip_failed_ssz: self.gossip.failed_ssz_count(),
            metadata_seq: self.own_metadata().seq_number,
        }
    }

    async fn stop(&self) {
        info!("network stopping");
        self.cancel.cancel();
        let shutdown = async {
            let peers = self.pool.snapshot();
            let goodbyes = FuturesUnordered::new();
            for peer in &peers {
                goodbyes.push(self.disconnect_peer(
                    peer,
                    DisconnectReason::ClientShutDown,
                    true,
                ));
            }
            goodbyes.collect::<Vec<()>>().await;
            if let Err(e) = self.switch.stop().await {
                warn!("switch stop failed: {e:#}");
            }
            if let Err(e) = self.discovery.close().await {
                warn!("discovery close failed: {e:#}");
            }
        };
        if timeout(self.cfg.shutdown_timeout, shutdown).await.is_err() {
            warn!("shutdown timed out");
        }
    }
}

async fn event_loop(
    inner: Arc<NetworkInner>,
    mut events: mpsc::Receiver<SwitchEvent>,
) -> anyhow::Result<()> {
    // Connection events for one peer are serialized here, which is what
    // keeps the per-peer state machine free of transition races.
    while let Some(ev) = events.recv().await {
        match ev {
            SwitchEvent::ConnectionOpened { peer, direction } => {
                inner.on_connection_opened(peer, direction)
            }
            SwitchEvent::ConnectionClosed { peer } => inner.on_connection_closed(peer),
            SwitchEvent::InboundStream {
                peer,
                protocol,
                stream,
            } => inner.on_inbound_stream(peer, protocol, stream),
        }
    }
    debug!("switch event channel closed");
    Ok(())
}

async fn discovery_loop(inner: Arc<NetworkInner>) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(inner.cfg.discovery_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        inner.seen.sweep();

        let needs = {
            let md = inner.own_metadata();
            let colnets = *inner.local_colnets.read();
            let digest = inner
                .fork_schedule
                .digest_at_epoch((inner.epoch_clock)());
            mesh::scan_needy_subnets(&*inner.router, digest, &md, &colnets, &inner.cfg)
        };
        let deficit = inner.cfg.target_peers.saturating_sub(inner.pool.len());
        if deficit == 0 && needs.is_empty() {
            continue;
        }

        // A concrete subnet gap justifies being picky about candidates.
        let min_score = (!needs.is_empty()).then_some(1);
        let records = match inner
            .discovery
            .find_peers(&needs, min_score, DISCOVERY_BATCH)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                debug!("discovery query failed: {e:#}");
                continue;
            }
        };

        let mut enqueued = 0usize;
        for record in records {
            if !record.verify() {
                continue;
            }
            let addr = record.peer_address();
            if addr.peer_id == inner.local_peer_id || addr.addresses.is_empty() {
                continue;
            }
            if inner.pool.len() + enqueued >= inner.cfg.max_peers {
                // Budget exhausted: make room before dialing further.
                inner.maintenance_now.notify_one();
                break;
            }
            if inner.connector.try_enqueue(addr) {
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            trace!(enqueued, "discovery candidates queued");
        }
    }
}

async fn pinger_loop(inner: Arc<NetworkInner>) -> anyhow::Result<()> {
    let tick = PINGER_TICK.min(inner.cfg.metadata_request_frequency);
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let due: Vec<Arc<Peer>> = inner
            .pool
            .connected()
            .into_iter()
            .filter(|p| {
                p.metadata_age()
                    .map(|age| age >= inner.cfg.metadata_request_frequency)
                    .unwrap_or(true)
            })
            .collect();
        if due.is_empty() {
            continue;
        }
        trace!(peers = due.len(), "refreshing metadata");
        let mut requests: FuturesUnordered<_> = due
            .into_iter()
            .map(|peer| refresh_metadata(inner.clone(), peer))
            .collect();
        while requests.next().await.is_some() {}
    }
}

async fn refresh_metadata(inner: Arc<NetworkInner>, peer: Arc<Peer>) {
    let version = inner
        .fork_schedule
        .metadata_version_at_epoch((inner.epoch_clock)());
    let kind = match version {
        MetadataVersion::V1 => MessageKind::MetadataV1,
        MetadataVersion::V2 => MessageKind::MetadataV2,
        MetadataVersion::V3 => MessageKind::MetadataV3,
    };
    let result = send_request(
        &*inner.switch,
        &inner.fork_schedule,
        &peer,
        kind,
        &[],
        inner.cfg.stream_open_timeout,
        inner.cfg.resp_timeout,
    )
    .await;

    match result {
        Ok(chunks) => match chunks
            .first()
            .ok_or(())
            .and_then(|c| MetaData::ssz_decode(version, &c.payload).map_err(|_| ()))
        {
            Ok(md) => {
                peer.set_metadata(md);
                peer.reset_metadata_failures();
            }
            Err(()) => {
                // Decoded chunk that isn't metadata is a violation.
                peer.apply_score(ScoreAction::InvalidRequest);
                note_metadata_failure(&inner, &peer);
            }
        },
        Err(_) => note_metadata_failure(&inner, &peer),
    }
    inner.maybe_drop_low_score(&peer);
}

fn note_metadata_failure(inner: &Arc<NetworkInner>, peer: &Arc<Peer>) {
    let failures = peer.record_metadata_failure();
    if failures >= inner.cfg.metadata_max_failures {
        debug!(peer = %peer.peer_id, failures, "metadata refresh keeps failing");
        inner.schedule_disconnect_peer(peer.clone(), DisconnectReason::ScoreLow, true);
    }
}

async fn maintenance_loop(inner: Arc<NetworkInner>) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(inner.cfg.mesh_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = inner.maintenance_now.notified() => {}
        }

        // Configured peers are kept connected no matter how they left.
        for addr in &inner.cfg.direct_peers {
            if !inner.pool.contains(&addr.peer_id) {
                inner.seen.remove(&addr.peer_id);
                inner.connector.try_enqueue(addr.clone());
            }
        }

        let excess = inner.pool.excess(inner.cfg.target_peers);
        if excess == 0 {
            continue;
        }
        let topics: Vec<String> = inner.subscribed_topics.read().iter().cloned().collect();
        let peers = inner.pool.connected();
        let victims = mesh::select_trim_candidates(
            &peers,
            &*inner.router,
            &topics,
            excess,
            inner.cfg.new_peer_grace,
        );
        if !victims.is_empty() {
            debug!(count = victims.len(), "trimming excess peers");
        }
        for peer in victims {
            inner.schedule_disconnect_peer(peer, DisconnectReason::BenignReconnect, true);
        }
    }
}
