//! Common types and error handling.

use std::fmt;

use blstrs::G2Projective;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::bls::{g2_from_bytes, g2_to_bytes};

pub type NodeId = u64;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("a consensus round is already in flight")]
    ConsensusBusy,
    #[error("epoch {requested} is not newer than committed epoch {current}")]
    EpochStale { requested: u32, current: u32 },
    #[error("{available} peers reachable, {required} required")]
    InsufficientNodes { available: usize, required: usize },
    #[error("{0} dealers produced invalid deals")]
    TooManyFaultyDealers(usize),
    #[error("processing deals failed: {0}")]
    ProcessDealsFailed(String),
    #[error("processing responses failed: {0}")]
    ProcessResponsesFailed(String),
    #[error("complaints need a justification round, which is not supported")]
    JustificationRequired,
    #[error("need more than {threshold} partial signatures, have {got}")]
    InsufficientPartialSignatures { got: usize, threshold: usize },
    #[error("need {required} valid re-encrypted shares, have {got}")]
    InsufficientShares { got: usize, required: usize },
    #[error("re-encryption proof of share {0} does not verify")]
    InvalidReencryptionProof(u32),
    #[error("timed out waiting for quorum")]
    TimeoutWaitingForQuorum,
    #[error("consensus round for epoch {0} timed out")]
    RoundTimeout(u32),
    #[error("no committee key has been generated yet")]
    NotInitialized,
    #[error("this node holds no share of the committee key")]
    NotCommitteeMember,
    #[error("invalid parameters")]
    InvalidParams,
    #[error("invalid encoding")]
    InvalidEncoding,
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("invalid share")]
    InvalidShare,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("cryptographic operation failed")]
    CryptoError,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("storage: {0}")]
    Storage(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("chain: {0}")]
    Chain(String),
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("config: {0}")]
    Config(String),
}

impl Error {
    /// Errors a caller should simply retry later rather than report.
    pub fn is_guard(&self) -> bool {
        matches!(self, Error::ConsensusBusy | Error::EpochStale { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<hkdf::InvalidLength> for Error {
    fn from(_: hkdf::InvalidLength) -> Self {
        Error::CryptoError
    }
}

/// Compressed G2 point identifying a key holder.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 96]);

impl PublicKey {
    pub fn from_point(point: &G2Projective) -> Self {
        Self(g2_to_bytes(point))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let point = g2_from_bytes(bytes)?;
        Ok(Self::from_point(&point))
    }

    pub fn to_point(&self) -> Result<G2Projective> {
        g2_from_bytes(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 96] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Skip the flag byte; the next few bytes are enough to tell keys apart in logs.
        for b in &self.0[1..7] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        crate::encoding::b64::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw: Vec<u8> = crate::encoding::b64::deserialize(d)?;
        PublicKey::from_bytes(&raw).map_err(serde::de::Error::custom)
    }
}
