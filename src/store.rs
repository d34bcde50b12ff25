//! Persistence of objectives, channels and consensus channels, plus the
//! channel-ownership index.

use std::collections::HashMap;

use secp256k1::SecretKey;
use thiserror::Error;
use tracing::debug;

use crate::abiencode::types::Address;
use crate::channel::Channel;
use crate::consensus_channel::ConsensusChannel;
use crate::crypto;
use crate::protocols::{Objective, ObjectiveId};
use crate::types::Destination;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no objective with id {0}")]
    NoSuchObjective(ObjectiveId),
    #[error("no channel with id {0}")]
    NoSuchChannel(Destination),
    #[error("channel {channel} is already owned by objective {existing}")]
    OwnershipConflict {
        channel: Destination,
        existing: ObjectiveId,
    },
}

/// The engine's persistence contract.
///
/// Objectives are stored with their working copies of channels; the store
/// keeps the canonical channel values and re-hydrates embedded copies on
/// every read, so objectives sharing a ledger observe each other's
/// progress.
pub trait Store {
    fn get_address(&self) -> Address;
    fn get_channel_secret_key(&self) -> SecretKey;

    fn get_objective_by_id(&self, id: &str) -> Result<Objective, StoreError>;
    fn get_objective_by_channel_id(&self, channel_id: Destination) -> Option<Objective>;
    /// Upsert an objective, re-indexing its owned channel and writing its
    /// channel copies back to the canonical maps.
    fn set_objective(&mut self, objective: &Objective) -> Result<(), StoreError>;
    fn release_channel_from_ownership(&mut self, channel_id: Destination);

    fn get_channel_by_id(&self, id: Destination) -> Option<Channel>;
    fn set_channel(&mut self, channel: &Channel);
    fn destroy_channel(&mut self, id: Destination);
    fn get_channels_by_participant(&self, participant: Address) -> Vec<Channel>;

    fn get_consensus_channel_by_id(&self, id: Destination) -> Option<ConsensusChannel>;
    /// The two-party ledger shared with `counterparty`, if any.
    fn get_consensus_channel(&self, counterparty: Address) -> Option<ConsensusChannel>;
    fn set_consensus_channel(&mut self, channel: &ConsensusChannel);
    fn destroy_consensus_channel(&mut self, id: Destination);
}

/// In-memory [Store]. Durable deployments can wrap this with a write-through
/// encoding; the protocol core only relies on the semantics below.
pub struct MemStore {
    sk: SecretKey,
    address: Address,
    objectives: HashMap<ObjectiveId, Objective>,
    channels: HashMap<Destination, Channel>,
    consensus_channels: HashMap<Destination, ConsensusChannel>,
    /// owned channel id → owning objective id; at most one owner per channel
    ownership: HashMap<Destination, ObjectiveId>,
}

impl MemStore {
    pub fn new(sk: SecretKey) -> MemStore {
        let address = crypto::address_from_secret_key(&sk);
        MemStore {
            sk,
            address,
            objectives: HashMap::new(),
            channels: HashMap::new(),
            consensus_channels: HashMap::new(),
            ownership: HashMap::new(),
        }
    }

    /// Replace the objective's embedded channel copies with the canonical
    /// values.
    fn hydrate(&self, objective: &mut Objective) {
        match objective {
            Objective::DirectFund(o) => {
                if let Some(c) = self.channels.get(&o.c.id) {
                    o.c = c.clone();
                }
            }
            Objective::VirtualFund(o) => {
                if let Some(c) = self.channels.get(&o.v.id) {
                    o.v = c.clone();
                }
                for conn in [&mut o.to_my_left, &mut o.to_my_right].into_iter().flatten() {
                    if let Some(l) = self.consensus_channels.get(&conn.channel.id) {
                        conn.channel = l.clone();
                    }
                }
            }
            Objective::VirtualDefund(o) => {
                if let Some(c) = self.channels.get(&o.v.id) {
                    o.v = c.clone();
                }
                for ledger in [&mut o.to_my_left, &mut o.to_my_right].into_iter().flatten() {
                    if let Some(l) = self.consensus_channels.get(&ledger.id) {
                        *ledger = l.clone();
                    }
                }
            }
            Objective::DirectDefund(o) => {
                if let Some(c) = self.channels.get(&o.c.id) {
                    o.c = c.clone();
                }
            }
        }
    }

    /// Write the objective's channel copies back to the canonical maps.
    fn persist_channels(&mut self, objective: &Objective) {
        match objective {
            Objective::DirectFund(o) => self.set_channel(&o.c),
            Objective::VirtualFund(o) => {
                self.set_channel(&o.v);
                for conn in [&o.to_my_left, &o.to_my_right].into_iter().flatten() {
                    self.set_consensus_channel(&conn.channel);
                }
            }
            Objective::VirtualDefund(o) => {
                self.set_channel(&o.v);
                for ledger in [&o.to_my_left, &o.to_my_right].into_iter().flatten() {
                    self.set_consensus_channel(ledger);
                }
            }
            Objective::DirectDefund(o) => self.set_channel(&o.c),
        }
    }
}

impl Store for MemStore {
    fn get_address(&self) -> Address {
        self.address
    }

    fn get_channel_secret_key(&self) -> SecretKey {
        self.sk
    }

    fn get_objective_by_id(&self, id: &str) -> Result<Objective, StoreError> {
        let mut objective = self
            .objectives
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NoSuchObjective(id.to_string()))?;
        self.hydrate(&mut objective);
        Ok(objective)
    }

    fn get_objective_by_channel_id(&self, channel_id: Destination) -> Option<Objective> {
        let id = self.ownership.get(&channel_id)?;
        self.get_objective_by_id(id).ok()
    }

    fn set_objective(&mut self, objective: &Objective) -> Result<(), StoreError> {
        let id = objective.id();
        let owned = objective.owned_channel_id();
        if let Some(existing) = self.ownership.get(&owned) {
            if *existing != id {
                return Err(StoreError::OwnershipConflict {
                    channel: owned,
                    existing: existing.clone(),
                });
            }
        }
        self.ownership.insert(owned, id.clone());
        self.persist_channels(objective);
        debug!(objective = %id, "stored objective");
        self.objectives.insert(id, objective.clone());
        Ok(())
    }

    fn release_channel_from_ownership(&mut self, channel_id: Destination) {
        self.ownership.remove(&channel_id);
    }

    fn get_channel_by_id(&self, id: Destination) -> Option<Channel> {
        self.channels.get(&id).cloned()
    }

    fn set_channel(&mut self, channel: &Channel) {
        self.channels.insert(channel.id, channel.clone());
    }

    fn destroy_channel(&mut self, id: Destination) {
        self.channels.remove(&id);
    }

    fn get_channels_by_participant(&self, participant: Address) -> Vec<Channel> {
        self.channels
            .values()
            .filter(|c| c.participants().contains(&participant))
            .cloned()
            .collect()
    }

    fn get_consensus_channel_by_id(&self, id: Destination) -> Option<ConsensusChannel> {
        self.consensus_channels.get(&id).cloned()
    }

    fn get_consensus_channel(&self, counterparty: Address) -> Option<ConsensusChannel> {
        self.consensus_channels
            .values()
            .find(|l| {
                l.participants().contains(&self.address)
                    && l.participants().contains(&counterparty)
            })
            .cloned()
    }

    fn set_consensus_channel(&mut self, channel: &ConsensusChannel) {
        self.consensus_channels.insert(channel.id, channel.clone());
    }

    fn destroy_consensus_channel(&mut self, id: Destination) {
        self.consensus_channels.remove(&id);
    }
}
