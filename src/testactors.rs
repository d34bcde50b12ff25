//! Deterministic identities and fixtures shared by the test modules.
//!
//! Addresses are always derived from the secret keys at runtime so the
//! fixtures cannot drift out of sync with the signing code.

use secp256k1::SecretKey;

use crate::abiencode::types::{Address, U256};
use crate::consensus_channel::{Balance, ConsensusChannel, LedgerOutcome, Vars};
use crate::crypto;
use crate::outcome::{Allocation, Allocations, Exit, SingleAssetExit};
use crate::state::{FixedPart, State};
use crate::types::Destination;

#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub name: &'static str,
    sk: [u8; 32],
}

impl Actor {
    pub fn secret_key(&self) -> SecretKey {
        SecretKey::from_slice(&self.sk).unwrap()
    }

    pub fn address(&self) -> Address {
        crypto::address_from_secret_key(&self.secret_key())
    }

    pub fn destination(&self) -> Destination {
        Destination::from(self.address())
    }
}

pub fn alice() -> Actor {
    Actor {
        name: "alice",
        sk: [0xaa; 32],
    }
}

pub fn irene() -> Actor {
    Actor {
        name: "irene",
        sk: [0x11; 32],
    }
}

pub fn bob() -> Actor {
    Actor {
        name: "bob",
        sk: [0xbb; 32],
    }
}

/// A prefund-style state allocating 5 units to every participant.
pub fn test_state(participants: Vec<Address>, turn_num: u64) -> State {
    let allocations = participants
        .iter()
        .map(|p| Allocation::simple(Destination::from(*p), U256::from(5)))
        .collect();
    State {
        chain_id: 9001,
        participants,
        channel_nonce: 37140676580,
        app_definition: Address::default(),
        challenge_duration: 60,
        app_data: Vec::new(),
        outcome: Exit(vec![SingleAssetExit {
            asset: Address::default(),
            metadata: Vec::new(),
            allocations: Allocations(allocations),
        }]),
        turn_num,
        is_final: false,
    }
}

/// Both views of a freshly funded ledger at turn 1, `amount` on each side.
/// `nonce` varies the channel id.
pub fn ledger_pair(
    leader: &Actor,
    follower: &Actor,
    amount: u64,
    nonce: u64,
) -> (ConsensusChannel, ConsensusChannel) {
    let fp = FixedPart {
        chain_id: 9001,
        participants: vec![leader.address(), follower.address()],
        channel_nonce: nonce,
        app_definition: Address::default(),
        challenge_duration: 60,
    };
    let outcome = LedgerOutcome::new(
        Address::default(),
        Balance::new(leader.destination(), U256::from(amount)),
        Balance::new(follower.destination(), U256::from(amount)),
        vec![],
    );
    let vars = Vars {
        turn_num: 1,
        outcome: outcome.clone(),
    };
    let state = vars.as_state(&fp).unwrap();
    let sigs = [
        state.sign(&leader.secret_key()).unwrap(),
        state.sign(&follower.secret_key()).unwrap(),
    ];
    (
        ConsensusChannel::new_leader_channel(fp.clone(), 1, outcome.clone(), sigs).unwrap(),
        ConsensusChannel::new_follower_channel(fp, 1, outcome, sigs).unwrap(),
    )
}
