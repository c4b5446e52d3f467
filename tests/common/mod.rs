#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use rand_chacha::ChaCha20Rng;
use rand_core::SeedableRng;
use secret_committee::bls::Keypair;
use secret_committee::committee::Validator;
use secret_committee::config::Config;
use secret_committee::consensus::{ConsensusEvent, ConsensusSuccess, Dkg, Step};
use secret_committee::message::Payload;
use secret_committee::store::{MemoryStore, Store};
use secret_committee::types::{Error, PublicKey};

pub struct Member {
    pub keypair: Keypair,
    pub validator: Validator,
}

/// Deterministic identities; a longer list extends a shorter one with the same seed.
pub fn members(n: usize, seed: u64) -> Vec<Member> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let keypair = Keypair::generate(&mut rng);
            let p2p = Keypair::generate(&mut rng);
            Member {
                validator: Validator {
                    node_id: 100 + i as u64,
                    validator_key: keypair.public(),
                    p2p_key: p2p.public(),
                },
                keypair,
            }
        })
        .collect()
}

/// Synchronous cluster of coordinators wired through a FIFO queue.
pub struct Cluster {
    pub members: Vec<Member>,
    pub stores: Vec<Arc<MemoryStore>>,
    pub nodes: Vec<Dkg>,
    pub events: Vec<Vec<ConsensusEvent>>,
    pub errors: Vec<Vec<Error>>,
    pub offline: Vec<bool>,
    queue: VecDeque<(PublicKey, PublicKey, Payload)>,
}

impl Cluster {
    pub fn new(members: Vec<Member>) -> Self {
        secret_committee::logging::init_tracing(Some("warn"));
        let config = Config::default();
        let stores: Vec<Arc<MemoryStore>> = members.iter().map(|_| Arc::new(MemoryStore::new())).collect();
        let nodes = members
            .iter()
            .zip(stores.iter())
            .map(|(m, store)| {
                let store: Arc<dyn Store> = store.clone();
                Dkg::load(m.validator.clone(), m.keypair.clone(), store, &config).expect("load")
            })
            .collect();
        let n = members.len();
        Self {
            members,
            stores,
            nodes,
            events: vec![Vec::new(); n],
            errors: vec![Vec::new(); n],
            offline: vec![false; n],
            queue: VecDeque::new(),
        }
    }

    pub fn validators(&self, indices: &[usize]) -> Vec<Validator> {
        indices.iter().map(|i| self.members[*i].validator.clone()).collect()
    }

    pub fn available(&self, i: usize) -> Vec<PublicKey> {
        self.members
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i && !self.offline[*j])
            .map(|(_, m)| m.validator.p2p_key)
            .collect()
    }

    fn index_of(&self, p2p: &PublicKey) -> Option<usize> {
        self.members.iter().position(|m| &m.validator.p2p_key == p2p)
    }

    pub fn trigger(&mut self, i: usize, epoch: u32, validators: Vec<Validator>, now: i64) -> Result<(), Error> {
        let available = self.available(i);
        let step = self.nodes[i].try_consensus(epoch, validators, &available, now)?;
        self.absorb(i, step);
        Ok(())
    }

    pub fn absorb(&mut self, i: usize, step: Step) {
        let from = self.members[i].validator.p2p_key;
        for out in step.outbound {
            for to in out.to {
                self.queue.push_back((to, from, out.payload.clone()));
            }
        }
        self.events[i].extend(step.events);
    }

    pub fn run(&mut self) {
        self.run_with(|_, _, _| true);
    }

    /// Deliver queued messages until quiet. `filter` may rewrite a payload
    /// in flight, or drop it by returning false.
    pub fn run_with(&mut self, mut filter: impl FnMut(usize, usize, &mut Payload) -> bool) {
        while let Some((to, from, mut payload)) = self.queue.pop_front() {
            let (Some(j), Some(k)) = (self.index_of(&to), self.index_of(&from)) else {
                continue;
            };
            if self.offline[j] || !filter(j, k, &mut payload) {
                continue;
            }
            let available = self.available(j);
            match self.nodes[j].handle_message(&from, payload, &available) {
                Ok(step) => self.absorb(j, step),
                Err(err) => self.errors[j].push(err),
            }
        }
    }

    pub fn successes(&self, i: usize) -> Vec<&ConsensusSuccess> {
        self.events[i]
            .iter()
            .filter_map(|e| match e {
                ConsensusEvent::Succeeded(s) => Some(s),
                ConsensusEvent::Failed { .. } => None,
            })
            .collect()
    }

    pub fn failures(&self, i: usize) -> Vec<(u32, &Error)> {
        self.events[i]
            .iter()
            .filter_map(|e| match e {
                ConsensusEvent::Failed { epoch, error } => Some((*epoch, error)),
                ConsensusEvent::Succeeded(_) => None,
            })
            .collect()
    }
}
