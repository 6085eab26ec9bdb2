use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, trace};

use beaconet_core::fork::ForkSchedule;
use reqresp_protocol::{
    read_response_chunk, write_request, MessageKind, ResponseChunk, RpcError,
};

use crate::peer::Peer;
use crate::score::ScoreAction;
use crate::switch::Switch;

/// Sends one request and collects the typed response chunks.
///
/// Never panics and never leaves the peer's score out of sync with what
/// happened: protocol violations descore heavily, benign transport failures
/// lightly, success increments and feeds the throughput estimate.
pub async fn send_request(
    switch: &dyn Switch,
    fork_schedule: &ForkSchedule,
    peer: &Arc<Peer>,
    kind: MessageKind,
    payload: &[u8],
    stream_open_timeout: Duration,
    resp_timeout: Duration,
) -> Result<Vec<ResponseChunk>, RpcError> {
    let started = Instant::now();
    let result = send_request_inner(
        switch,
        fork_schedule,
        peer,
        kind,
        payload,
        stream_open_timeout,
        resp_timeout,
    )
    .await;

    match &result {
        Ok(chunks) => {
            let bytes: u64 = chunks.iter().map(|c| c.payload.len() as u64).sum();
            peer.throughput.record(bytes, started.elapsed());
            peer.apply_score(ScoreAction::GoodValues);
            trace!(peer = %peer.peer_id, %kind, chunks = chunks.len(), bytes, "request served");
        }
        Err(e) if e.is_protocol_violation() => {
            debug!(peer = %peer.peer_id, %kind, error = %e, "protocol violation in response");
            peer.apply_score(ScoreAction::InvalidRequest);
        }
        Err(RpcError::ReceivedErrorResponse { code, message }) => {
            // An application-level refusal; the caller decides what it means.
            debug!(peer = %peer.peer_id, %kind, %code, message, "peer refused request");
        }
        Err(e) => {
            debug!(peer = %peer.peer_id, %kind, error = %e, "request failed");
            peer.apply_score(ScoreAction::PoorRequest);
        }
    }
    result
}

async fn send_request_inner(
    switch: &dyn Switch,
    fork_schedule: &ForkSchedule,
    peer: &Arc<Peer>,
    kind: MessageKind,
    payload: &[u8],
    stream_open_timeout: Duration,
    resp_timeout: Duration,
) -> Result<Vec<ResponseChunk>, RpcError> {
    let protocol_id = kind.protocol_id();
    let mut stream = match timeout(stream_open_timeout, switch.open_stream(peer.peer_id, &protocol_id))
        .await
    {
        Err(_) => return Err(RpcError::StreamOpenTimeout),
        Ok(Err(e)) => {
            return Err(RpcError::BrokenConnection(std::io::Error::other(format!(
                "{e:#}"
            ))))
        }
        Ok(Ok(s)) => s,
    };

    write_request(&mut stream.write, kind, payload).await?;
    // Half-close to signal end-of-request; some peers never respond without it.
    stream
        .write
        .shutdown()
        .await
        .map_err(RpcError::from_write_io)?;

    let max_chunks = kind.max_response_chunks();
    let mut chunks = Vec::new();
    loop {
        // Each chunk gets a fresh timeout so a slow but steady stream is
        // not penalized.
        let chunk = match timeout(resp_timeout, read_response_chunk(&mut stream.read, kind)).await {
            Err(_) => return Err(RpcError::ReadResponseTimeout),
            Ok(Err(RpcError::PotentiallyExpectedEof)) if kind.is_list_response() => break,
            Ok(Err(e)) => return Err(e),
            Ok(Ok(chunk)) => chunk,
        };

        if let Some(ctx) = chunk.context {
            if fork_schedule
                .entry_for_digest(beaconet_core::ForkDigest(ctx))
                .is_none()
            {
                return Err(RpcError::InvalidContextBytes(ctx));
            }
        }

        chunks.push(chunk);
        if !kind.is_list_response() {
            break;
        }
        if chunks.len() as u64 > max_chunks {
            return Err(RpcError::ResponseChunkOverflow { max_chunks });
        }
    }
    Ok(chunks)
}
