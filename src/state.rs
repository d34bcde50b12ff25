//! The canonical channel state, its hash, and signature collection.

use std::collections::BTreeMap;

use secp256k1::SecretKey;
use serde::Serialize;
use thiserror::Error;

use crate::abiencode::{
    self, as_bytes,
    types::{Address, Hash, Signature},
};
use crate::crypto;
use crate::outcome::Exit;
use crate::types::Destination;

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Encoding(#[from] abiencode::Error),
    #[error("could not recover signer: {0}")]
    Recovery(#[from] crypto::Error),
    #[error("recovered signer {0} is not a participant")]
    SignerNotParticipant(Address),
    #[error("signature for participant {0} already present")]
    AlreadySigned(usize),
    #[error("signed states are for different states")]
    StateMismatch,
}

/// The channel state as hashed and signed by every participant.
///
/// Field order matters: it is the ABI encoding order the adjudicator
/// expects.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct State {
    pub chain_id: u64,
    pub participants: Vec<Address>,
    pub channel_nonce: u64,
    pub app_definition: Address,
    pub challenge_duration: u32,
    #[serde(with = "as_bytes")]
    pub app_data: Vec<u8>,
    pub outcome: Exit,
    pub turn_num: u64,
    pub is_final: bool,
}

/// The fields identical across every state of a channel. Hashing it yields
/// the channel id.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FixedPart {
    pub chain_id: u64,
    pub participants: Vec<Address>,
    pub channel_nonce: u64,
    pub app_definition: Address,
    pub challenge_duration: u32,
}

impl FixedPart {
    /// `keccak256(abi.encode(fixedPart))` as a 32-byte [Destination].
    pub fn channel_id(&self) -> Result<Destination, StateError> {
        let hash = abiencode::to_hash(self)?;
        Ok(Destination(hash.0))
    }

    /// A turn-0 state with the given variable part.
    pub fn state_with(&self, app_data: Vec<u8>, outcome: Exit) -> State {
        State {
            chain_id: self.chain_id,
            participants: self.participants.clone(),
            channel_nonce: self.channel_nonce,
            app_definition: self.app_definition,
            challenge_duration: self.challenge_duration,
            app_data,
            outcome,
            turn_num: 0,
            is_final: false,
        }
    }
}

/// The fields that change from turn to turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariablePart {
    pub app_data: Vec<u8>,
    pub outcome: Exit,
    pub turn_num: u64,
    pub is_final: bool,
}

impl State {
    pub fn fixed_part(&self) -> FixedPart {
        FixedPart {
            chain_id: self.chain_id,
            participants: self.participants.clone(),
            channel_nonce: self.channel_nonce,
            app_definition: self.app_definition,
            challenge_duration: self.challenge_duration,
        }
    }

    pub fn variable_part(&self) -> VariablePart {
        VariablePart {
            app_data: self.app_data.clone(),
            outcome: self.outcome.clone(),
            turn_num: self.turn_num,
            is_final: self.is_final,
        }
    }

    pub fn channel_id(&self) -> Result<Destination, StateError> {
        self.fixed_part().channel_id()
    }

    /// `keccak256(abi.encode(state))`, the digest participants sign.
    pub fn hash(&self) -> Result<Hash, StateError> {
        Ok(abiencode::to_hash(self)?)
    }

    pub fn sign(&self, sk: &SecretKey) -> Result<Signature, StateError> {
        Ok(crypto::sign_eth(self.hash()?, sk))
    }

    pub fn recover_signer(&self, sig: &Signature) -> Result<Address, StateError> {
        Ok(crypto::recover_signer(self.hash()?, sig)?)
    }

    /// Total funds the outcome pays out, per asset.
    pub fn total(&self) -> crate::types::Funds {
        self.outcome.total_allocated()
    }

    /// The state's successor with the same variable part and `turn_num + 1`.
    pub fn next(&self) -> State {
        let mut next = self.clone();
        next.turn_num += 1;
        next
    }
}

/// A state plus the signatures collected for it so far, keyed by participant
/// index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedState {
    state: State,
    signatures: BTreeMap<usize, Signature>,
}

impl SignedState {
    pub fn new(state: State) -> SignedState {
        SignedState {
            state,
            signatures: BTreeMap::new(),
        }
    }

    pub(crate) fn with_signatures(
        state: State,
        signatures: BTreeMap<usize, Signature>,
    ) -> SignedState {
        SignedState { state, signatures }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Sign the state with `sk` and record the signature. Fails if the key
    /// does not belong to a participant or that participant already signed.
    pub fn sign_and_add(&mut self, sk: &SecretKey) -> Result<Signature, StateError> {
        let sig = self.state.sign(sk)?;
        self.add_signature(sig)?;
        Ok(sig)
    }

    /// Record a signature after recovering and validating its signer.
    pub fn add_signature(&mut self, sig: Signature) -> Result<(), StateError> {
        let signer = self.state.recover_signer(&sig)?;
        let index = self
            .state
            .participants
            .iter()
            .position(|p| *p == signer)
            .ok_or(StateError::SignerNotParticipant(signer))?;
        if self.signatures.contains_key(&index) {
            return Err(StateError::AlreadySigned(index));
        }
        self.signatures.insert(index, sig);
        Ok(())
    }

    /// Fold the signatures of `other` (for the same state) into this entry.
    /// Returns whether any new signature was learned.
    pub fn merge(&mut self, other: &SignedState) -> Result<bool, StateError> {
        if self.state != other.state {
            return Err(StateError::StateMismatch);
        }
        let mut news = false;
        for (index, sig) in &other.signatures {
            if self.signatures.insert(*index, *sig).is_none() {
                news = true;
            }
        }
        Ok(news)
    }

    pub fn has_signature_for(&self, participant_index: usize) -> bool {
        self.signatures.contains_key(&participant_index)
    }

    pub fn has_all_signatures(&self) -> bool {
        self.signatures.len() == self.state.participants.len()
    }

    pub fn signature_for(&self, participant_index: usize) -> Option<Signature> {
        self.signatures.get(&participant_index).copied()
    }

    pub fn signatures(&self) -> &BTreeMap<usize, Signature> {
        &self.signatures
    }

    /// The support proof the adjudicator accepts for this state: one
    /// signature per participant in participant order, plus the
    /// `whoSignedWhat` vector mapping each participant to the candidate
    /// state they signed. A single fully-signed state is the minimal proof,
    /// so every entry maps to candidate 0.
    pub fn support_proof(&self) -> Option<(Vec<Signature>, Vec<usize>)> {
        if !self.has_all_signatures() {
            return None;
        }
        let signatures = self.signatures.values().copied().collect();
        let who_signed_what = vec![0; self.state.participants.len()];
        Some((signatures, who_signed_what))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testactors::{self, test_state};

    #[test]
    fn equal_states_have_equal_ids_and_hashes() {
        let participants = vec![testactors::alice().address(), testactors::bob().address()];
        let a = test_state(participants.clone(), 0);
        let b = test_state(participants, 0);

        assert_eq!(a.channel_id().unwrap(), b.channel_id().unwrap());
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn variable_part_does_not_change_channel_id() {
        let participants = vec![testactors::alice().address(), testactors::bob().address()];
        let a = test_state(participants.clone(), 0);
        let mut b = test_state(participants, 3);
        b.is_final = true;

        assert_eq!(a.channel_id().unwrap(), b.channel_id().unwrap());
        assert_ne!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn signature_round_trip() {
        let alice = testactors::alice();
        let state = test_state(vec![alice.address(), testactors::bob().address()], 0);
        let sig = state.sign(&alice.secret_key()).unwrap();
        assert_eq!(state.recover_signer(&sig).unwrap(), alice.address());
    }

    #[test]
    fn signed_state_collects_signatures() {
        let alice = testactors::alice();
        let bob = testactors::bob();
        let state = test_state(vec![alice.address(), bob.address()], 0);

        let mut ss = SignedState::new(state.clone());
        ss.sign_and_add(&alice.secret_key()).unwrap();
        assert!(ss.has_signature_for(0));
        assert!(!ss.has_all_signatures());

        // double-signing is rejected
        assert!(matches!(
            ss.sign_and_add(&alice.secret_key()),
            Err(StateError::AlreadySigned(0))
        ));

        // a stranger's signature is rejected
        let mut other = SignedState::new(state.clone());
        assert!(matches!(
            other.sign_and_add(&testactors::irene().secret_key()),
            Err(StateError::SignerNotParticipant(_))
        ));

        let mut bobs = SignedState::new(state);
        bobs.sign_and_add(&bob.secret_key()).unwrap();
        assert!(bobs.support_proof().is_none());
        assert!(ss.merge(&bobs).unwrap());
        assert!(ss.has_all_signatures());
        // merging again learns nothing new
        assert!(!ss.merge(&bobs).unwrap());

        let (signatures, who_signed_what) = ss.support_proof().unwrap();
        assert_eq!(signatures.len(), 2);
        assert_eq!(who_signed_what, vec![0, 0]);
        assert_eq!(ss.state().recover_signer(&signatures[0]).unwrap(), alice.address());
        assert_eq!(ss.state().recover_signer(&signatures[1]).unwrap(), bob.address());
    }

    #[test]
    fn merge_rejects_different_states() {
        let alice = testactors::alice();
        let bob = testactors::bob();
        let s0 = test_state(vec![alice.address(), bob.address()], 0);
        let s1 = test_state(vec![alice.address(), bob.address()], 1);

        let mut a = SignedState::new(s0);
        let b = SignedState::new(s1);
        assert!(matches!(a.merge(&b), Err(StateError::StateMismatch)));
    }
}
