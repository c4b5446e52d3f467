#![forbid(unsafe_code)]

pub mod bls;
pub mod chain;
pub mod committee;
pub mod config;
pub mod consensus;
pub mod dkg;
pub mod encoding;
pub mod lagrange;
pub mod logging;
pub mod mailbox;
pub mod message;
pub mod node;
pub mod pre;
pub mod seal;
pub mod signer;
pub mod sponsor;
pub mod store;
pub mod transport;
pub mod types;

pub use crate::committee::{CommitteeState, DistKeyShare, Validator};
pub use crate::config::Config;
pub use crate::consensus::{ConsensusEvent, ConsensusSuccess, Dkg, Step};
pub use crate::node::{Callbacks, DkgNode};
pub use crate::signer::{Signature, SigningContext, ThresholdSigner};
pub use crate::types::{Error, NodeId, PublicKey, Result};
