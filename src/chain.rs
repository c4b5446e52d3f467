//! Boundary to the main chain that receives the committee's aggregated
//! signatures. Calls are opaque byte strings built by the chain client.

use std::collections::BTreeSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::encoding::enc_tuple;
use crate::signer::{PartialSignature, Signature, ThresholdSigner, verify_signature};
use crate::types::{Error, NodeId, PublicKey, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpaqueCall(#[serde(with = "crate::encoding::b64")] pub Vec<u8>);

/// What an aggregated committee signature is spent on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainCall {
    /// Maps the committee key to an on-chain account. Needed once before
    /// any designation can be submitted.
    RegisterKey { call: OpaqueCall },
    SetNextEpoch { node_id: NodeId, call: OpaqueCall },
}

impl ChainCall {
    pub fn call(&self) -> &OpaqueCall {
        match self {
            ChainCall::RegisterKey { call } | ChainCall::SetNextEpoch { call, .. } => call,
        }
    }
}

#[async_trait]
pub trait MainChain: Send + Sync {
    async fn build_set_next_epoch_call(&self, node_id: NodeId, account: &PublicKey) -> Result<OpaqueCall>;

    async fn build_register_key_call(&self, account: &PublicKey) -> Result<OpaqueCall>;

    /// Bytes the committee must sign for `call` to be accepted from `account`.
    async fn signing_payload(&self, call: &OpaqueCall, account: &PublicKey) -> Result<Vec<u8>>;

    async fn sign_and_submit(&self, call: &OpaqueCall, account: &PublicKey, signature: &Signature) -> Result<()>;

    async fn account_is_registered(&self, account: &PublicKey) -> Result<bool>;
}

/// The call an epoch transition signs next: the designation itself, or the
/// key registration when the committee key is not known to the chain yet.
pub async fn next_epoch_call(chain: &dyn MainChain, node_id: NodeId, account: &PublicKey) -> Result<ChainCall> {
    if chain.account_is_registered(account).await? {
        let call = chain.build_set_next_epoch_call(node_id, account).await?;
        Ok(ChainCall::SetNextEpoch { node_id, call })
    } else {
        let call = chain.build_register_key_call(account).await?;
        Ok(ChainCall::RegisterKey { call })
    }
}

pub async fn partial_sign(chain: &dyn MainChain, signer: &ThresholdSigner, call: &ChainCall) -> Result<PartialSignature> {
    let payload = chain.signing_payload(call.call(), &signer.public_key()).await?;
    Ok(signer.partial_sign(&payload))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
enum MemoryCallBody {
    RegisterKey { account: PublicKey },
    SetNextEpoch { node_id: NodeId, account: PublicKey },
}

/// In-process chain that checks signatures and records what was accepted.
#[derive(Default)]
pub struct MemoryChain {
    registered: Mutex<BTreeSet<PublicKey>>,
    submitted: Mutex<Vec<ChainCall>>,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<ChainCall> {
        self.submitted.lock().clone()
    }

    pub fn designations(&self) -> Vec<NodeId> {
        self.submitted
            .lock()
            .iter()
            .filter_map(|c| match c {
                ChainCall::SetNextEpoch { node_id, .. } => Some(*node_id),
                ChainCall::RegisterKey { .. } => None,
            })
            .collect()
    }

    fn encode(body: &MemoryCallBody) -> Result<OpaqueCall> {
        Ok(OpaqueCall(serde_json::to_vec(body)?))
    }
}

#[async_trait]
impl MainChain for MemoryChain {
    async fn build_set_next_epoch_call(&self, node_id: NodeId, account: &PublicKey) -> Result<OpaqueCall> {
        Self::encode(&MemoryCallBody::SetNextEpoch {
            node_id,
            account: *account,
        })
    }

    async fn build_register_key_call(&self, account: &PublicKey) -> Result<OpaqueCall> {
        Self::encode(&MemoryCallBody::RegisterKey { account: *account })
    }

    async fn signing_payload(&self, call: &OpaqueCall, account: &PublicKey) -> Result<Vec<u8>> {
        enc_tuple(&[b"memory-chain", account.as_bytes(), &call.0])
    }

    async fn sign_and_submit(&self, call: &OpaqueCall, account: &PublicKey, signature: &Signature) -> Result<()> {
        let payload = self.signing_payload(call, account).await?;
        if !verify_signature(account, &payload, signature) {
            return Err(Error::Chain("signature does not verify".into()));
        }
        let body: MemoryCallBody = serde_json::from_slice(&call.0)?;
        let accepted = match body {
            MemoryCallBody::RegisterKey { account: target } => {
                if &target != account {
                    return Err(Error::Chain("registration for another account".into()));
                }
                self.registered.lock().insert(target);
                info!(account = %target, "committee key registered");
                ChainCall::RegisterKey { call: call.clone() }
            }
            MemoryCallBody::SetNextEpoch { node_id, account: target } => {
                if &target != account || !self.registered.lock().contains(account) {
                    return Err(Error::Chain("account is not registered".into()));
                }
                info!(node_id, "next epoch sponsor designated");
                ChainCall::SetNextEpoch {
                    node_id,
                    call: call.clone(),
                }
            }
        };
        self.submitted.lock().push(accepted);
        Ok(())
    }

    async fn account_is_registered(&self, account: &PublicKey) -> Result<bool> {
        Ok(self.registered.lock().contains(account))
    }
}
