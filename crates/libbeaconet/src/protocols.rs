use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use beaconet_core::fork::MetadataVersion;
use reqresp_protocol::{GoodbyeReason, MessageKind};

use crate::network::NetworkInner;
use crate::peer::Peer;
use crate::registry::{HandlerError, Protocol, ProtocolContext};
use crate::reqresp::server::Responder;
use crate::seen_table::DisconnectReason;

/// Built-in control protocols every node serves: ping, metadata, goodbye.
/// Holds a weak back reference; the network owns the registry which owns us.
pub(crate) struct CoreProtocol {
    network: Weak<NetworkInner>,
}

impl CoreProtocol {
    pub fn new(network: Weak<NetworkInner>) -> CoreProtocol {
        CoreProtocol { network }
    }

    fn metadata_version(kind: MessageKind) -> MetadataVersion {
        match kind {
            MessageKind::MetadataV1 => MetadataVersion::V1,
            MessageKind::MetadataV2 => MetadataVersion::V2,
            _ => MetadataVersion::V3,
        }
    }
}

fn decode_u64(request: &[u8]) -> Result<u64, HandlerError> {
    let bytes: [u8; 8] = request
        .as_ref()
        .try_into()
        .map_err(|_| HandlerError::InvalidInputs("expected 8 bytes".to_owned()))?;
    Ok(u64::from_le_bytes(bytes))
}

/// Maps the remote's stated goodbye reason to our reconnect cooldown.
fn seen_reason_for(goodbye: Option<GoodbyeReason>) -> DisconnectReason {
    match goodbye {
        Some(GoodbyeReason::ClientShutDown) => DisconnectReason::ClientShutDown,
        Some(GoodbyeReason::IrrelevantNetwork) => DisconnectReason::IrrelevantNetwork,
        Some(GoodbyeReason::TooManyPeers) => DisconnectReason::BenignReconnect,
        Some(GoodbyeReason::FaultOrError) | Some(GoodbyeReason::PeerScoreLow) | None => {
            DisconnectReason::FaultOrError
        }
    }
}

#[async_trait]
impl Protocol for CoreProtocol {
    fn name(&self) -> &'static str {
        "core"
    }

    fn messages(&self) -> Vec<MessageKind> {
        vec![
            MessageKind::Ping,
            MessageKind::Goodbye,
            MessageKind::MetadataV1,
            MessageKind::MetadataV2,
            MessageKind::MetadataV3,
        ]
    }

    async fn handle_request(
        &self,
        _ctx: ProtocolContext<'_>,
        peer: &Arc<Peer>,
        kind: MessageKind,
        request: Bytes,
        responder: &mut Responder<'_>,
    ) -> Result<(), HandlerError> {
        let Some(network) = self.network.upgrade() else {
            return Err(HandlerError::Other(anyhow::anyhow!("network stopped")));
        };
        match kind {
            MessageKind::Ping => {
                let their_seq = decode_u64(&request)?;
                let our_seq = network.own_metadata().seq_number;
                responder
                    .send_chunk(None, &our_seq.to_le_bytes())
                    .await
                    .map_err(|e| HandlerError::Other(e.into()))?;
                // A seq ahead of what we stored means our copy went stale.
                if peer
                    .metadata()
                    .map(|m| their_seq > m.seq_number)
                    .unwrap_or(false)
                {
                    peer.mark_metadata_stale();
                }
                Ok(())
            }
            MessageKind::MetadataV1 | MessageKind::MetadataV2 | MessageKind::MetadataV3 => {
                let md = network.own_metadata();
                let encoded = md.ssz_encode(Self::metadata_version(kind));
                responder
                    .send_chunk(None, &encoded)
                    .await
                    .map_err(|e| HandlerError::Other(e.into()))?;
                Ok(())
            }
            MessageKind::Goodbye => {
                let code = decode_u64(&request)?;
                let reason = GoodbyeReason::from_code(code);
                debug!(peer = %peer.peer_id, code, "received goodbye");
                network.schedule_disconnect(peer.peer_id, seen_reason_for(reason), false);
                Ok(())
            }
            other => Err(HandlerError::Other(anyhow::anyhow!(
                "core protocol got unexpected {other}"
            ))),
        }
    }
}
