//! Sponsor-side collection of partial signatures for an epoch transition.
//!
//! After a successful round every member of the new committee signs the
//! transition call and sends its partial to the sponsor. The sponsor keeps
//! one pending transition keyed by `(epoch, sponsor_time)`; partials from an
//! older transition are dropped and partials for a newer one are held until
//! the sponsor's own round completes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chain::ChainCall;
use crate::signer::{PartialSignature, Signature, SigningContext};
use crate::types::{Error, PublicKey};

const MAX_EARLY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEpochPartial {
    pub epoch: u32,
    pub sponsor_time: i64,
    pub call: ChainCall,
    pub partial: PartialSignature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NewEpochMessage {
    /// Sponsor asks the committee to sign the next call of the transition.
    SignRequest { epoch: u32, sponsor_time: i64 },
    Partial(NewEpochPartial),
}

/// A combined signature ready for submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Aggregate {
    pub epoch: u32,
    pub sponsor_time: i64,
    pub account: PublicKey,
    pub call: ChainCall,
    pub signature: Signature,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Current(PublicKey),
    Early,
    Stale,
}

struct Bucket {
    call: ChainCall,
    partials: BTreeMap<u32, PartialSignature>,
}

struct Transition {
    epoch: u32,
    sponsor_time: i64,
    context: SigningContext,
    buckets: BTreeMap<[u8; 32], Bucket>,
    done: BTreeSet<[u8; 32]>,
}

impl Transition {
    fn key(&self) -> (u32, i64) {
        (self.epoch, self.sponsor_time)
    }
}

#[derive(Default)]
pub struct SponsorAggregator {
    pending: Option<Transition>,
    early: Vec<NewEpochPartial>,
}

impl SponsorAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the transition this node sponsors. Returns partials that arrived
    /// before it was opened and now belong to it.
    pub fn begin(&mut self, context: SigningContext, sponsor_time: i64) -> Vec<NewEpochPartial> {
        let key = (context.epoch, sponsor_time);
        info!(epoch = context.epoch, sponsor_time, "collecting transition signatures");
        self.pending = Some(Transition {
            epoch: context.epoch,
            sponsor_time,
            context,
            buckets: BTreeMap::new(),
            done: BTreeSet::new(),
        });
        let early = std::mem::take(&mut self.early);
        let (ready, later): (Vec<_>, Vec<_>) = early
            .into_iter()
            .filter(|p| (p.epoch, p.sponsor_time) >= key)
            .partition(|p| (p.epoch, p.sponsor_time) == key);
        self.early = later;
        ready
    }

    pub fn pending(&self) -> Option<(u32, i64)> {
        self.pending.as_ref().map(Transition::key)
    }

    pub fn admission(&self, msg: &NewEpochPartial) -> Admission {
        let key = (msg.epoch, msg.sponsor_time);
        match &self.pending {
            Some(t) if t.key() == key => Admission::Current(t.context.public_key),
            Some(t) if key < t.key() => Admission::Stale,
            _ => Admission::Early,
        }
    }

    /// Add one partial over `payload`, the chain's signing payload for
    /// `msg.call`. Returns the aggregate once more than `threshold` valid
    /// partials agree on the same payload.
    pub fn receive_partial_signature(
        &mut self,
        payload: &[u8],
        msg: NewEpochPartial,
    ) -> Result<Option<Aggregate>, Error> {
        match self.admission(&msg) {
            Admission::Current(_) => {}
            Admission::Early => {
                if self.early.len() < MAX_EARLY {
                    self.early.push(msg);
                }
                return Ok(None);
            }
            Admission::Stale => {
                debug!(epoch = msg.epoch, sponsor_time = msg.sponsor_time, "dropping stale partial");
                return Ok(None);
            }
        }
        let Some(t) = self.pending.as_mut() else {
            return Ok(None);
        };

        let digest = *blake3::hash(payload).as_bytes();
        if t.done.contains(&digest) {
            return Ok(None);
        }
        t.context.verify_partial(payload, &msg.partial)?;
        let bucket = t.buckets.entry(digest).or_insert_with(|| Bucket {
            call: msg.call.clone(),
            partials: BTreeMap::new(),
        });
        bucket.partials.insert(msg.partial.share.index, msg.partial);
        if bucket.partials.len() <= t.context.threshold {
            return Ok(None);
        }

        let partials: Vec<PartialSignature> = bucket.partials.values().cloned().collect();
        let signature = t.context.combine(payload, &partials)?;
        let call = bucket.call.clone();
        t.buckets.remove(&digest);
        t.done.insert(digest);
        Ok(Some(Aggregate {
            epoch: t.epoch,
            sponsor_time: t.sponsor_time,
            account: t.context.public_key,
            call,
            signature,
        }))
    }

    /// Close the transition once its designation has been submitted.
    pub fn finish(&mut self, epoch: u32, sponsor_time: i64) {
        if self.pending() == Some((epoch, sponsor_time)) {
            self.pending = None;
        }
    }
}
