// Gossip publish/validate pipeline on top of an external router.
//
// The pipeline owns message ids, the validated-topics set, decompression
// bounds and the decode-failure counters; the router owns the mesh.

pub mod msgid;
pub mod router;
pub mod topics;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::trace;

use beaconet_core::constants::GOSSIP_MAX_SIZE;
use beaconet_core::ForkDigest;

use crate::error::Error;
pub use msgid::{message_id, MESSAGE_ID_LEN};
pub use router::{GossipRouter, TopicMeshStats};
pub use topics::GossipTopic;

/// Verdict of a per-message validator, as understood by the router.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validation {
    /// Deliver locally and propagate.
    Accept,
    /// Deliver nothing, don't penalize.
    Ignore,
    /// Invalid; don't propagate, down-rank the sender.
    Reject,
}

/// What the application's decode+validate step concluded. SSZ schemas are
/// opaque here, so the application reports decode failures explicitly and
/// they feed the failed-ssz counter.
#[derive(Debug)]
pub enum DecodeOutcome {
    InvalidSsz,
    Verdict(Validation),
}

pub type SyncValidatorFn = dyn Fn(&str, &[u8]) -> DecodeOutcome + Send + Sync;
pub type AsyncValidatorFn = dyn Fn(String, Bytes) -> BoxFuture<'static, DecodeOutcome> + Send + Sync;

/// Synchronous validators run on the hot path; the async form exists for
/// heavier checks (signatures, DB lookups).
#[derive(Clone)]
pub enum TopicValidator {
    Sync {
        max_size: usize,
        validate: Arc<SyncValidatorFn>,
    },
    Async {
        max_size: usize,
        validate: Arc<AsyncValidatorFn>,
    },
}

impl TopicValidator {
    pub fn sync(
        max_size: usize,
        f: impl Fn(&str, &[u8]) -> DecodeOutcome + Send + Sync + 'static,
    ) -> TopicValidator {
        TopicValidator::Sync {
            max_size,
            validate: Arc::new(f),
        }
    }

    pub fn max_size(&self) -> usize {
        match self {
            TopicValidator::Sync { max_size, .. } | TopicValidator::Async { max_size, .. } => {
                *max_size
            }
        }
    }
}

fn block_compress(data: &[u8]) -> Bytes {
    snap::raw::Encoder::new()
        .compress_vec(data)
        .expect("raw snappy compression cannot fail")
        .into()
}

fn block_decompress(data: &[u8], max_size: usize) -> Option<Bytes> {
    let len = snap::raw::decompress_len(data).ok()?;
    if len > max_size {
        return None;
    }
    let mut out = vec![0u8; len];
    snap::raw::Decoder::new().decompress(data, &mut out).ok()?;
    Some(out.into())
}

/// Topic-keyed validator registry plus the message-id rule. A topic is
/// *validated* exactly while a validator is registered for it; subscribing
/// to anything else is refused upstream.
pub struct GossipPipeline {
    phase0_prefix: String,
    validators: RwLock<HashMap<String, TopicValidator>>,
    /// Topics expected to be thin (few peers); exempt from the broadcast
    /// "no peers" soft error.
    low_peer_topics: RwLock<HashSet<String>>,
    failed_snappy: AtomicU64,
    failed_ssz: AtomicU64,
}

impl GossipPipeline {
    pub fn new(phase0_digest: ForkDigest) -> GossipPipeline {
        GossipPipeline {
            phase0_prefix: format!("{}/{}/", topics::TOPIC_PREFIX, phase0_digest),
            validators: Default::default(),
            low_peer_topics: Default::default(),
            failed_snappy: Default::default(),
            failed_ssz: Default::default(),
        }
    }

    pub fn register_validator(&self, topic: &str, validator: TopicValidator) {
        self.validators
            .write()
            .insert(topic.to_owned(), validator);
    }

    pub fn unregister_validator(&self, topic: &str) {
        self.validators.write().remove(topic);
    }

    pub fn is_validated(&self, topic: &str) -> bool {
        self.validators.read().contains_key(topic)
    }

    pub fn mark_low_peer_topic(&self, topic: &str) {
        self.low_peer_topics.write().insert(topic.to_owned());
    }

    pub fn is_low_peer_topic(&self, topic: &str) -> bool {
        self.low_peer_topics.read().contains(topic)
    }

    pub fn failed_snappy_count(&self) -> u64 {
        self.failed_snappy.load(Ordering::Relaxed)
    }

    pub fn failed_ssz_count(&self) -> u64 {
        self.failed_ssz.load(Ordering::Relaxed)
    }

    fn max_size_for(&self, topic: &str) -> usize {
        self.validators
            .read()
            .get(topic)
            .map(|v| v.max_size())
            .unwrap_or(GOSSIP_MAX_SIZE)
    }

    /// Message id over the decompressed payload; `None` tells the router the
    /// message is undecodable and the sender should be down-ranked.
    pub fn message_id(&self, topic: &str, compressed: &[u8]) -> Option<[u8; MESSAGE_ID_LEN]> {
        let decompressed = block_decompress(compressed, self.max_size_for(topic))?;
        Some(message_id(&self.phase0_prefix, topic, &decompressed))
    }

    /// Decompress within the topic bound, then run the registered validator.
    pub async fn validate(&self, topic: &str, compressed: &[u8]) -> Validation {
        let Some(validator) = self.validators.read().get(topic).cloned() else {
            trace!(topic, "message on unvalidated topic");
            return Validation::Reject;
        };
        let Some(decompressed) = block_decompress(compressed, validator.max_size()) else {
            self.failed_snappy.fetch_add(1, Ordering::Relaxed);
            return Validation::Reject;
        };
        let outcome = match validator {
            TopicValidator::Sync { validate, .. } => validate(topic, &decompressed),
            TopicValidator::Async { validate, .. } => {
                validate(topic.to_owned(), decompressed).await
            }
        };
        match outcome {
            DecodeOutcome::InvalidSsz => {
                self.failed_ssz.fetch_add(1, Ordering::Relaxed);
                Validation::Reject
            }
            DecodeOutcome::Verdict(v) => v,
        }
    }

    /// Size-checks and compresses an outgoing message. Payloads over the
    /// gossip bound are a programming error surfaced as a typed error.
    pub fn prepare_publish(&self, payload: &[u8]) -> Result<Bytes, Error> {
        if payload.len() > GOSSIP_MAX_SIZE {
            return Err(Error::GossipOversized {
                len: payload.len(),
                max: GOSSIP_MAX_SIZE,
            });
        }
        Ok(block_compress(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> GossipPipeline {
        GossipPipeline::new(ForkDigest([0, 0, 0, 1]))
    }

    fn accept_all() -> TopicValidator {
        TopicValidator::sync(1024, |_, _| DecodeOutcome::Verdict(Validation::Accept))
    }

    #[tokio::test]
    async fn test_validated_topic_accepts() {
        let p = pipeline();
        let topic = "/eth2/044eaf22/beacon_block/ssz_snappy";
        p.register_validator(topic, accept_all());
        assert!(p.is_validated(topic));
        let msg = block_compress(b"a block");
        assert_eq!(p.validate(topic, &msg).await, Validation::Accept);
    }

    #[tokio::test]
    async fn test_unvalidated_topic_rejects() {
        let p = pipeline();
        let msg = block_compress(b"whatever");
        assert_eq!(
            p.validate("/eth2/044eaf22/unknown/ssz_snappy", &msg).await,
            Validation::Reject
        );
    }

    #[tokio::test]
    async fn test_bad_snappy_counted_and_rejected() {
        let p = pipeline();
        let topic = "/eth2/044eaf22/beacon_block/ssz_snappy";
        p.register_validator(topic, accept_all());
        assert_eq!(p.validate(topic, b"\xff\xff garbage").await, Validation::Reject);
        assert_eq!(p.failed_snappy_count(), 1);
        assert_eq!(p.failed_ssz_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_decompression_rejected() {
        let p = pipeline();
        let topic = "/eth2/044eaf22/beacon_block/ssz_snappy";
        p.register_validator(
            topic,
            TopicValidator::sync(8, |_, _| DecodeOutcome::Verdict(Validation::Accept)),
        );
        let msg = block_compress(&[0u8; 64]);
        assert_eq!(p.validate(topic, &msg).await, Validation::Reject);
        assert_eq!(p.failed_snappy_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_ssz_counted() {
        let p = pipeline();
        let topic = "/eth2/044eaf22/beacon_block/ssz_snappy";
        p.register_validator(
            topic,
            TopicValidator::sync(1024, |_, _| DecodeOutcome::InvalidSsz),
        );
        let msg = block_compress(b"not really ssz");
        assert_eq!(p.validate(topic, &msg).await, Validation::Reject);
        assert_eq!(p.failed_ssz_count(), 1);
    }

    #[tokio::test]
    async fn test_async_validator_runs() {
        let p = pipeline();
        let topic = "/eth2/044eaf22/beacon_block/ssz_snappy";
        p.register_validator(
            topic,
            TopicValidator::Async {
                max_size: 1024,
                validate: Arc::new(|_, payload| {
                    Box::pin(async move {
                        if payload.as_ref() == b"good" {
                            DecodeOutcome::Verdict(Validation::Accept)
                        } else {
                            DecodeOutcome::Verdict(Validation::Ignore)
                        }
                    })
                }),
            },
        );
        assert_eq!(
            p.validate(topic, &block_compress(b"good")).await,
            Validation::Accept
        );
        assert_eq!(
            p.validate(topic, &block_compress(b"meh")).await,
            Validation::Ignore
        );
    }

    #[test]
    fn test_message_id_distinguishes_topics() {
        let p = pipeline();
        let payload = block_compress(b"payload");
        let a = p
            .message_id("/eth2/044eaf22/beacon_block/ssz_snappy", &payload)
            .unwrap();
        let b = p
            .message_id("/eth2/044eaf22/voluntary_exit/ssz_snappy", &payload)
            .unwrap();
        assert_ne!(a, b);
        assert!(p.message_id("/eth2/x/y/ssz_snappy", b"garbage").is_none());
    }

    #[test]
    fn test_prepare_publish_bound() {
        let p = pipeline();
        assert!(p.prepare_publish(&[0u8; 1024]).is_ok());
        let huge = vec![0u8; GOSSIP_MAX_SIZE + 1];
        assert!(matches!(
            p.prepare_publish(&huge),
            Err(Error::GossipOversized { .. })
        ));
    }
}
