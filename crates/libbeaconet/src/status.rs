use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use reqresp_protocol::MessageKind;

use crate::network::NetworkInner;
use crate::peer::Peer;
use crate::registry::{HandlerError, HandshakeRejected, Protocol, ProtocolContext};
use crate::reqresp::server::Responder;
use crate::score::ScoreAction;
use crate::seen_table::DisconnectReason;

/// The application's judgement of a remote status payload. Status SSZ stays
/// opaque here; the handler owns encoding and comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusVerdict {
    /// Same network, viable head.
    Good,
    /// Behind what the peer previously reported.
    Stale,
    /// Same network, but a fork we consider non-viable.
    UnviableFork,
    /// Wrong network entirely.
    IrrelevantNetwork,
}

pub trait StatusHandler: Send + Sync + 'static {
    /// Our current status, SSZ-encoded.
    fn local_status(&self) -> Bytes;

    fn judge(&self, peer: &Arc<Peer>, remote_status: &[u8]) -> StatusVerdict;
}

/// Built-in status exchange: the dialer initiates during the handshake, the
/// responder answers inbound requests. Verdicts feed scoring directly; a
/// wrong-network peer aborts the handshake with the long suppression TTL.
pub(crate) struct StatusProtocol {
    network: Weak<NetworkInner>,
    handler: Arc<dyn StatusHandler>,
}

impl StatusProtocol {
    pub fn new(network: Weak<NetworkInner>, handler: Arc<dyn StatusHandler>) -> StatusProtocol {
        StatusProtocol { network, handler }
    }

    fn apply_verdict(&self, peer: &Arc<Peer>, verdict: StatusVerdict) -> anyhow::Result<()> {
        match verdict {
            StatusVerdict::Good => {
                peer.apply_score(ScoreAction::GoodStatus);
                Ok(())
            }
            StatusVerdict::Stale => {
                peer.apply_score(ScoreAction::StaleStatus);
                Ok(())
            }
            StatusVerdict::UnviableFork => {
                peer.apply_score(ScoreAction::UnviableFork);
                Ok(())
            }
            StatusVerdict::IrrelevantNetwork => Err(HandshakeRejected {
                reason: DisconnectReason::IrrelevantNetwork,
            }
            .into()),
        }
    }
}

#[async_trait]
impl Protocol for StatusProtocol {
    fn name(&self) -> &'static str {
        "status"
    }

    fn messages(&self) -> Vec<MessageKind> {
        vec![MessageKind::Status]
    }

    async fn on_peer_connected(
        &self,
        _ctx: ProtocolContext<'_>,
        peer: &Arc<Peer>,
    ) -> anyhow::Result<()> {
        use crate::switch::Direction;
        // The dialer speaks first; the inbound side answers via the request
        // handler below.
        if peer.direction() != Direction::Outgoing {
            return Ok(());
        }
        let Some(network) = self.network.upgrade() else {
            anyhow::bail!("network stopped");
        };
        let chunks = network
            .status_exchange(peer, &self.handler.local_status())
            .await?;
        let Some(first) = chunks.first() else {
            anyhow::bail!("empty status response");
        };
        self.apply_verdict(peer, self.handler.judge(peer, &first.payload))
    }

    async fn handle_request(
        &self,
        _ctx: ProtocolContext<'_>,
        peer: &Arc<Peer>,
        _kind: MessageKind,
        request: Bytes,
        responder: &mut Responder<'_>,
    ) -> Result<(), HandlerError> {
        responder
            .send_chunk(None, &self.handler.local_status())
            .await
            .map_err(|e| HandlerError::Other(e.into()))?;

        let verdict = self.handler.judge(peer, &request);
        if let Err(e) = self.apply_verdict(peer, verdict) {
            debug!(peer = %peer.peer_id, ?verdict, "status exchange: {e:#}");
            if let Some(network) = self.network.upgrade() {
                network.schedule_disconnect(
                    peer.peer_id,
                    DisconnectReason::IrrelevantNetwork,
                    true,
                );
            }
        }
        Ok(())
    }
}
