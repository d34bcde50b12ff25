//! A channel's mutable history of signed states and its on-chain holdings.

use std::collections::BTreeMap;

use secp256k1::SecretKey;
use thiserror::Error;

use crate::abiencode::types::Address;
use crate::state::{FixedPart, SignedState, State, StateError};
use crate::types::{Destination, Funds};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("prefund state must have turn number 0")]
    PrefundTurnNumNotZero,
    #[error("prefund state must not be final")]
    PrefundIsFinal,
    #[error("participant index {0} out of bounds for {1} participants")]
    IndexOutOfBounds(usize, usize),
    #[error("state belongs to a different channel")]
    FixedPartMismatch,
    #[error("no state stored for turn {0}")]
    NoStateForTurn(u64),
    #[error("channel has no supported state")]
    NoSupportedState,
    #[error("state is not signed by every participant")]
    NotFullySigned,
    #[error(transparent)]
    State(#[from] StateError),
}

/// The engine-side view of one channel: every signed state seen so far, the
/// latest state supported by all participants, and the funds the chain holds
/// for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: Destination,
    pub my_index: usize,
    /// Updated only from chain events.
    pub on_chain_funding: Funds,
    fixed_part: FixedPart,
    signed_states: BTreeMap<u64, SignedState>,
    latest_supported_turn_num: Option<u64>,
}

impl Channel {
    /// Open a channel around its prefund (turn 0) state.
    pub fn new(prefund: State, my_index: usize) -> Result<Channel, ChannelError> {
        if prefund.turn_num != 0 {
            return Err(ChannelError::PrefundTurnNumNotZero);
        }
        if prefund.is_final {
            return Err(ChannelError::PrefundIsFinal);
        }
        if my_index >= prefund.participants.len() {
            return Err(ChannelError::IndexOutOfBounds(
                my_index,
                prefund.participants.len(),
            ));
        }

        let fixed_part = prefund.fixed_part();
        let id = fixed_part.channel_id()?;
        let mut signed_states = BTreeMap::new();
        signed_states.insert(0, SignedState::new(prefund));

        Ok(Channel {
            id,
            my_index,
            on_chain_funding: Funds::new(),
            fixed_part,
            signed_states,
            latest_supported_turn_num: None,
        })
    }

    /// Build a channel from a single fully-signed state, as when a consensus
    /// ledger hands governance back for defunding.
    pub fn from_signed_state(ss: SignedState, my_index: usize) -> Result<Channel, ChannelError> {
        if !ss.has_all_signatures() {
            return Err(ChannelError::NotFullySigned);
        }
        let state = ss.state();
        if my_index >= state.participants.len() {
            return Err(ChannelError::IndexOutOfBounds(
                my_index,
                state.participants.len(),
            ));
        }
        let fixed_part = state.fixed_part();
        let id = fixed_part.channel_id()?;
        let turn = state.turn_num;
        let mut signed_states = BTreeMap::new();
        signed_states.insert(turn, ss);
        Ok(Channel {
            id,
            my_index,
            on_chain_funding: Funds::new(),
            fixed_part,
            signed_states,
            latest_supported_turn_num: Some(turn),
        })
    }

    pub fn fixed_part(&self) -> &FixedPart {
        &self.fixed_part
    }

    pub fn participants(&self) -> &[Address] {
        &self.fixed_part.participants
    }

    pub fn my_address(&self) -> Address {
        self.fixed_part.participants[self.my_index]
    }

    pub fn my_destination(&self) -> Destination {
        Destination::from(self.my_address())
    }

    pub fn pre_fund_state(&self) -> Result<&State, ChannelError> {
        self.signed_states
            .get(&0)
            .map(SignedState::state)
            .ok_or(ChannelError::NoStateForTurn(0))
    }

    /// The postfund state is the prefund state at turn 1.
    pub fn post_fund_state(&self) -> Result<State, ChannelError> {
        Ok(self.pre_fund_state()?.next())
    }

    pub fn signed_state_for_turn(&self, turn_num: u64) -> Option<&SignedState> {
        self.signed_states.get(&turn_num)
    }

    /// Merge a signed state received from a peer (or signed locally) into the
    /// history. Returns whether anything new was learned.
    pub fn add_signed_state(&mut self, ss: SignedState) -> Result<bool, ChannelError> {
        if ss.state().fixed_part() != self.fixed_part {
            return Err(ChannelError::FixedPartMismatch);
        }
        let turn = ss.state().turn_num;
        let news = match self.signed_states.get_mut(&turn) {
            Some(existing) => existing.merge(&ss)?,
            None => {
                self.signed_states.insert(turn, ss);
                true
            }
        };
        self.recompute_support();
        Ok(news)
    }

    /// Sign `state` and fold the signature into the stored entry for its
    /// turn. The returned entry carries every signature known for that turn.
    pub fn sign_and_add_state(
        &mut self,
        state: State,
        sk: &SecretKey,
    ) -> Result<SignedState, ChannelError> {
        if state.fixed_part() != self.fixed_part {
            return Err(ChannelError::FixedPartMismatch);
        }
        let turn = state.turn_num;
        let mut ss = match self.signed_states.get(&turn) {
            Some(existing) => {
                if *existing.state() != state {
                    return Err(ChannelError::State(StateError::StateMismatch));
                }
                existing.clone()
            }
            None => SignedState::new(state),
        };
        ss.sign_and_add(sk)?;
        self.signed_states.insert(turn, ss.clone());
        self.recompute_support();
        Ok(ss)
    }

    pub fn sign_and_add_prefund(&mut self, sk: &SecretKey) -> Result<SignedState, ChannelError> {
        let prefund = self.pre_fund_state()?.clone();
        self.sign_and_add_state(prefund, sk)
    }

    pub fn sign_and_add_postfund(&mut self, sk: &SecretKey) -> Result<SignedState, ChannelError> {
        let postfund = self.post_fund_state()?;
        self.sign_and_add_state(postfund, sk)
    }

    pub fn pre_fund_signed_by_me(&self) -> bool {
        self.signed_by_me_at(0)
    }

    pub fn post_fund_signed_by_me(&self) -> bool {
        self.signed_by_me_at(1)
    }

    pub fn signed_by_me_at(&self, turn_num: u64) -> bool {
        self.signed_states
            .get(&turn_num)
            .map(|ss| ss.has_signature_for(self.my_index))
            .unwrap_or(false)
    }

    pub fn pre_fund_complete(&self) -> bool {
        self.fully_signed_at(0)
    }

    pub fn post_fund_complete(&self) -> bool {
        self.fully_signed_at(1)
    }

    pub fn fully_signed_at(&self, turn_num: u64) -> bool {
        self.signed_states
            .get(&turn_num)
            .map(SignedState::has_all_signatures)
            .unwrap_or(false)
    }

    pub fn latest_supported_turn_num(&self) -> Option<u64> {
        self.latest_supported_turn_num
    }

    /// The state at the highest turn number signed by every participant.
    pub fn latest_supported_state(&self) -> Result<&State, ChannelError> {
        let turn = self
            .latest_supported_turn_num
            .ok_or(ChannelError::NoSupportedState)?;
        Ok(self.signed_states[&turn].state())
    }

    pub fn latest_supported_signed_state(&self) -> Result<&SignedState, ChannelError> {
        let turn = self
            .latest_supported_turn_num
            .ok_or(ChannelError::NoSupportedState)?;
        Ok(&self.signed_states[&turn])
    }

    /// Total funds allocated by the latest supported outcome, per asset.
    pub fn total(&self) -> Result<Funds, ChannelError> {
        Ok(self.latest_supported_state()?.total())
    }

    fn recompute_support(&mut self) {
        self.latest_supported_turn_num = self
            .signed_states
            .iter()
            .filter(|(_, ss)| ss.has_all_signatures())
            .map(|(turn, _)| *turn)
            .max();
    }
}
