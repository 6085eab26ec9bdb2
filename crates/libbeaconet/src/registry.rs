use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use reqresp_protocol::MessageKind;

use crate::error::Error;
use crate::peer::Peer;
use crate::reqresp::server::Responder;

/// Failure modes a request handler can express; each maps to a wire
/// response code.
#[derive(Debug)]
pub enum HandlerError {
    /// Payload decoded but its content is unacceptable -> InvalidRequest.
    InvalidInputs(String),
    /// We don't have what was asked for -> ResourceUnavailable.
    ResourceUnavailable(String),
    /// Anything else -> ServerError.
    Other(anyhow::Error),
}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> Self {
        HandlerError::Other(e)
    }
}

/// Returned (inside `anyhow::Error`) from `on_peer_connected` to abort the
/// handshake with a specific disconnect reason instead of the generic fault.
#[derive(thiserror::Error, Debug, Clone, Copy)]
#[error("handshake rejected: {reason:?}")]
pub struct HandshakeRejected {
    pub reason: crate::seen_table::DisconnectReason,
}

/// Access to the registry-assigned slots from within protocol hooks.
pub struct ProtocolContext<'a> {
    pub index: usize,
    network_state: Option<&'a (dyn Any + Send + Sync)>,
}

impl ProtocolContext<'_> {
    pub fn network_state<T: 'static>(&self) -> Option<&T> {
        self.network_state.and_then(|s| s.downcast_ref::<T>())
    }
}

/// One mountable protocol: its message set, state initializers, and hooks.
///
/// A protocol gets a densely assigned index at mount time; per-peer and
/// per-network state live in parallel slots indexed by it, so hot-path
/// access is an array index rather than a map lookup.
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Message types this protocol serves inbound.
    fn messages(&self) -> Vec<MessageKind>;

    fn init_peer_state(&self) -> Option<Box<dyn Any + Send + Sync>> {
        None
    }

    fn init_network_state(&self) -> Option<Box<dyn Any + Send + Sync>> {
        None
    }

    /// Runs as part of the handshake; an error aborts the connection.
    async fn on_peer_connected(
        &self,
        _ctx: ProtocolContext<'_>,
        _peer: &Arc<Peer>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_peer_disconnected(&self, _ctx: ProtocolContext<'_>, _peer: &Arc<Peer>) {}

    /// Serves one inbound request. Success chunks go through the responder;
    /// returning an error sends the mapped failure response instead.
    async fn handle_request(
        &self,
        ctx: ProtocolContext<'_>,
        peer: &Arc<Peer>,
        kind: MessageKind,
        request: Bytes,
        responder: &mut Responder<'_>,
    ) -> Result<(), HandlerError>;
}

struct Mounted {
    handler: Arc<dyn Protocol>,
    network_state: Option<Box<dyn Any + Send + Sync>>,
}

pub struct ResolvedRoute {
    pub index: usize,
    pub kind: MessageKind,
    pub handler: Arc<dyn Protocol>,
}

/// Declarative mount table: protocol id string -> (protocol index, message
/// kind). Mounting happens once during setup; lookups afterwards are
/// read-only.
#[derive(Default)]
pub struct Registry {
    mounted: Vec<Mounted>,
    routes: HashMap<String, (usize, MessageKind)>,
}

impl Registry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Assigns the next protocol index and installs inbound routes for every
    /// message the protocol serves. Duplicate routes are a setup bug.
    pub fn mount(&mut self, handler: Arc<dyn Protocol>) -> Result<usize, Error> {
        let index = self.mounted.len();
        for kind in handler.messages() {
            let id = kind.protocol_id();
            if self.routes.contains_key(&id) {
                return Err(Error::BugProtocolMount(format!(
                    "duplicate route {id} while mounting {}",
                    handler.name()
                )));
            }
            self.routes.insert(id, (index, kind));
        }
        self.mounted.push(Mounted {
            network_state: handler.init_network_state(),
            handler,
        });
        Ok(index)
    }

    pub fn resolve(&self, protocol_id: &str) -> Option<ResolvedRoute> {
        let (index, kind) = self.routes.get(protocol_id)?;
        Some(ResolvedRoute {
            index: *index,
            kind: *kind,
            handler: self.mounted[*index].handler.clone(),
        })
    }

    pub fn context(&self, index: usize) -> ProtocolContext<'_> {
        ProtocolContext {
            index,
            network_state: self.mounted[index].network_state.as_deref(),
        }
    }

    pub fn len(&self) -> usize {
        self.mounted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounted.is_empty()
    }

    pub fn handlers(&self) -> impl Iterator<Item = (usize, &Arc<dyn Protocol>)> {
        self.mounted.iter().enumerate().map(|(i, m)| (i, &m.handler))
    }

    /// Installs every protocol's per-peer slot on a fresh peer.
    pub fn init_peer(&self, peer: &Peer) {
        for (index, m) in self.mounted.iter().enumerate() {
            peer.init_protocol_state(index, m.handler.init_peer_state());
        }
    }
}
