//! JSON wire envelope exchanged between committee nodes.

use blstrs::G2Projective;
use serde::{Deserialize, Serialize};

use crate::committee::Validator;
use crate::dkg::{DealBundle, ResponseBundle};
use crate::pre::{EncryptedSecret, ReencryptedShare};
use crate::sponsor::NewEpochMessage;
use crate::types::PublicKey;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "nodes", rename_all = "snake_case")]
pub enum Destination {
    All,
    Nodes(Vec<PublicKey>),
    Node(PublicKey),
}

/// Round description carried by `consensus` relays and by every deal, so a
/// node that has not started the round yet can build its side of it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusEnvelope {
    pub epoch: u32,
    pub validators: Vec<Validator>,
    #[serde(default)]
    pub old_validators: Vec<Validator>,
    #[serde(default, with = "crate::encoding::g2_vec")]
    pub share_commitments: Vec<G2Projective>,
    pub consensus_node_count: usize,
    /// Committee key the trigger had committed when the round started.
    #[serde(default)]
    pub prior_key: Option<PublicKey>,
    #[serde(default)]
    pub deal: Option<DealBundle>,
    #[serde(default)]
    pub sponsor: Option<Validator>,
    pub sponsor_time: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub epoch: u32,
    pub bundle: ResponseBundle,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReencryptRequest {
    pub secret: EncryptedSecret,
    pub requester: PublicKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReencryptResponse {
    pub share: Option<ReencryptedShare>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Payload {
    Consensus(ConsensusEnvelope),
    Deal(ConsensusEnvelope),
    DealResp(ResponseMessage),
    ConsensusToNewepoch(NewEpochMessage),
    Reencrypt(ReencryptRequest),
    ReencryptResp(ReencryptResponse),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Consensus(_) => "consensus",
            Payload::Deal(_) => "deal",
            Payload::DealResp(_) => "deal_resp",
            Payload::ConsensusToNewepoch(_) => "consensus_to_newepoch",
            Payload::Reencrypt(_) => "reencrypt",
            Payload::ReencryptResp(_) => "reencrypt_resp",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sender's `p2p_key`.
    pub from: PublicKey,
    pub to: Destination,
    #[serde(flatten)]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    pub fn new(from: PublicKey, to: Destination, payload: Payload) -> Self {
        Self {
            from,
            to,
            payload,
            msg_id: None,
            error: None,
        }
    }

    pub fn with_msg_id(mut self, msg_id: impl Into<String>) -> Self {
        self.msg_id = Some(msg_id.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn to_json(&self) -> crate::types::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(raw: &[u8]) -> crate::types::Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}
