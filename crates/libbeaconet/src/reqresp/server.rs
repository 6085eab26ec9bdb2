use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use reqresp_protocol::{
    read_request, write_error_response, write_response_chunk, MessageKind, ResponseCode, RpcError,
};

use crate::peer::Peer;
use crate::quota::{RequestQuota, ThrottleCounters};
use crate::registry::{HandlerError, Registry, ResolvedRoute};
use crate::score::ScoreAction;
use crate::switch::{BoxStreamRead, BoxStreamWrite, RawStream};

/// Hands Success chunks to the wire on behalf of a request handler.
pub struct Responder<'a> {
    write: &'a mut BoxStreamWrite,
    kind: MessageKind,
    chunks_sent: u64,
}

impl Responder<'_> {
    pub async fn send_chunk(
        &mut self,
        context: Option<[u8; 4]>,
        payload: &[u8],
    ) -> Result<(), RpcError> {
        debug_assert!(self.chunks_sent < self.kind.max_response_chunks());
        write_response_chunk(self.write, self.kind, context, payload).await?;
        self.chunks_sent += 1;
        Ok(())
    }

    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent
    }
}

/// Shared context for inbound dispatch, owned by the orchestrator.
pub struct InboundCtx<'a> {
    pub registry: &'a Registry,
    pub global_quota: &'a RequestQuota,
    pub throttle: &'a ThrottleCounters,
    pub resp_timeout: Duration,
    /// Cancelling this aborts the exchange but still half-closes the stream.
    pub cancel: CancellationToken,
}

/// Maps a request decode failure to the wire response, or None for a silent
/// drop. Requester-induced timeouts count as InvalidRequest: the remote went
/// quiet, we did not fail.
fn decode_failure_response(e: &RpcError) -> Option<(ResponseCode, String)> {
    match e {
        RpcError::BrokenConnection(_) => None,
        RpcError::InvalidContextBytes(_) => Some((
            ResponseCode::ServerError,
            "Unrecognized context bytes".to_owned(),
        )),
        RpcError::UnexpectedEof
        | RpcError::PotentiallyExpectedEof
        | RpcError::StreamOpenTimeout
        | RpcError::ReadResponseTimeout
        | RpcError::InvalidSnappyBytes(_)
        | RpcError::InvalidSszBytes
        | RpcError::InvalidSizePrefix { .. }
        | RpcError::ZeroSizePrefix
        | RpcError::SizePrefixOverflow { .. }
        | RpcError::ResponseChunkOverflow { .. }
        | RpcError::Unknown(_) => Some((ResponseCode::InvalidRequest, format!("{e}"))),
        // Not producible while reading a request; treat like any bad input.
        RpcError::InvalidResponseCode(_) | RpcError::ReceivedErrorResponse { .. } => {
            Some((ResponseCode::InvalidRequest, format!("{e}")))
        }
    }
}

fn handler_failure_response(e: &HandlerError) -> (ResponseCode, String) {
    match e {
        HandlerError::InvalidInputs(msg) => (ResponseCode::InvalidRequest, msg.clone()),
        HandlerError::ResourceUnavailable(msg) => (ResponseCode::ResourceUnavailable, msg.clone()),
        HandlerError::Other(e) => {
            debug!("request handler failed: {e:#}");
            (ResponseCode::ServerError, "internal error".to_owned())
        }
    }
}

/// Charges one token from both buckets, waiting (and counting the throttle)
/// when a bucket is empty. Loop attackers pay this even for garbage requests.
async fn charge_quota(
    peer: &Peer,
    global: &RequestQuota,
    throttle: &ThrottleCounters,
    kind: MessageKind,
) {
    if !peer.quota.try_consume() {
        throttle.increment(kind.short_id());
        peer.quota.consume().await;
    }
    if !global.try_consume() {
        throttle.increment(kind.short_id());
        global.consume().await;
    }
}

/// Services one accepted inbound stream.
///
/// Cancellation is raced *inside*: a cancelled exchange stops wherever it
/// is, but the write half is still shut down and `on_release` still runs, so
/// the remote always observes a clean EOF. `on_release` lets the caller drop
/// peers whose score bottomed out during the exchange.
pub async fn handle_inbound_stream(
    ctx: InboundCtx<'_>,
    peer: &Arc<Peer>,
    protocol_id: &str,
    mut stream: RawStream,
    on_release: impl FnOnce(&Arc<Peer>),
) {
    if !peer.accepts_streams() {
        trace!(peer = %peer.peer_id, protocol_id, "dropping stream, peer not serviceable");
        return;
    }
    let Some(route) = ctx.registry.resolve(protocol_id) else {
        debug!(peer = %peer.peer_id, protocol_id, "stream for unmounted protocol");
        return;
    };

    tokio::select! {
        _ = ctx.cancel.cancelled() => {
            trace!(peer = %peer.peer_id, protocol_id, "inbound exchange cancelled");
        }
        _ = serve_request(&ctx, peer, &route, &mut stream.read, &mut stream.write) => {}
    }

    let _ = stream.write.shutdown().await;
    on_release(peer);
}

async fn serve_request(
    ctx: &InboundCtx<'_>,
    peer: &Arc<Peer>,
    route: &ResolvedRoute,
    read: &mut BoxStreamRead,
    write: &mut BoxStreamWrite,
) {
    let kind = route.kind;

    let request = match timeout(ctx.resp_timeout, read_request(read, kind)).await {
        Ok(Ok(request)) => Some(request),
        Ok(Err(e)) => {
            peer.apply_score(if e.is_protocol_violation() {
                ScoreAction::InvalidRequest
            } else {
                ScoreAction::PoorRequest
            });
            match decode_failure_response(&e) {
                Some((code, message)) => {
                    let _ = write_error_response(write, code, message.as_bytes()).await;
                }
                None => {
                    // Connection already broken, nothing to say.
                }
            }
            None
        }
        Err(_elapsed) => {
            peer.apply_score(ScoreAction::PoorRequest);
            let _ = write_error_response(
                write,
                ResponseCode::InvalidRequest,
                b"request not received in time",
            )
            .await;
            None
        }
    };

    // Charged regardless of validity, after the stream produced traffic.
    charge_quota(peer, ctx.global_quota, ctx.throttle, kind).await;

    if let Some(request) = request {
        let mut responder = Responder {
            write,
            kind,
            chunks_sent: 0,
        };
        let result = route
            .handler
            .handle_request(
                ctx.registry.context(route.index),
                peer,
                kind,
                request,
                &mut responder,
            )
            .await;
        if let Err(e) = result {
            let (code, message) = handler_failure_response(&e);
            let _ = write_error_response(write, code, message.as_bytes()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;

    use reqresp_protocol::write_request;

    use crate::registry::{Protocol, ProtocolContext};
    use crate::switch::Direction;

    use super::*;

    struct StallingProtocol;

    #[async_trait]
    impl Protocol for StallingProtocol {
        fn name(&self) -> &'static str {
            "stalling"
        }
        fn messages(&self) -> Vec<MessageKind> {
            vec![MessageKind::Ping]
        }
        async fn handle_request(
            &self,
            _ctx: ProtocolContext<'_>,
            _peer: &Arc<Peer>,
            _kind: MessageKind,
            _request: Bytes,
            _responder: &mut Responder<'_>,
        ) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancelled_exchange_still_half_closes() {
        let mut registry = Registry::new();
        registry.mount(Arc::new(StallingProtocol)).unwrap();
        let registry = Arc::new(registry);
        let global = Arc::new(RequestQuota::new(8, Duration::from_secs(60)));
        let throttle = Arc::new(ThrottleCounters::new());
        let cancel = CancellationToken::new();

        let peer = Arc::new(Peer::new(
            beaconet_core::PeerId::new([9; 32]),
            Direction::Incoming,
            8,
            Duration::from_secs(60),
        ));
        peer.on_connection_opened(Direction::Incoming);
        peer.mark_connected();

        let (client, server) = tokio::io::duplex(4096);
        let (mut remote_read, mut remote_write) = tokio::io::split(client);
        let (sr, sw) = tokio::io::split(server);
        let stream = RawStream {
            read: Box::new(sr),
            write: Box::new(sw),
        };

        write_request(&mut remote_write, MessageKind::Ping, &7u64.to_le_bytes())
            .await
            .unwrap();

        let released = Arc::new(AtomicBool::new(false));
        let task = {
            let registry = registry.clone();
            let global = global.clone();
            let throttle = throttle.clone();
            let cancel = cancel.clone();
            let peer = peer.clone();
            let released = released.clone();
            tokio::spawn(async move {
                let ctx = InboundCtx {
                    registry: &registry,
                    global_quota: &global,
                    throttle: &throttle,
                    resp_timeout: Duration::from_secs(5),
                    cancel,
                };
                handle_inbound_stream(
                    ctx,
                    &peer,
                    &MessageKind::Ping.protocol_id(),
                    stream,
                    |_| released.store(true, Ordering::SeqCst),
                )
                .await;
            })
        };

        // Let the handler reach its stall, then cancel mid-request.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();

        // The remote sees a clean EOF with no partial chunk, and the
        // release hook ran.
        let mut leftover = Vec::new();
        remote_read.read_to_end(&mut leftover).await.unwrap();
        assert!(leftover.is_empty(), "partial bytes: {leftover:?}");
        assert!(released.load(Ordering::SeqCst));
    }
}
