// Shared vocabulary for the beaconet networking stack.
//
// Everything here is usable without the main library: peer identities,
// fork digests, node metadata, node records, the network keystore.

pub mod agent;
pub mod constants;
pub mod fork;
pub mod keys;
pub mod keystore;
pub mod metadata;
pub mod node_record;
pub mod peer_id;
pub mod spawn_utils;
pub mod subnets;
pub mod throughput;

pub use agent::AgentKind;
pub use fork::{Epoch, ForkDigest, ForkSchedule};
pub use keys::NetworkKeypair;
pub use metadata::MetaData;
pub use peer_id::PeerId;
