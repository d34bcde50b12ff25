//! The two-party ledger channel: a consensus outcome plus an ordered queue
//! of singly-signed proposals.
//!
//! The ledger is strictly leader/follower. The leader (participant 0) is the
//! only party that may originate proposals; the follower counter-signs them
//! in turn order. Signatures are always over the *resulting* ledger state,
//! so a counter-signed proposal immediately yields a fully-signed consensus
//! state.

use std::collections::BTreeMap;

use secp256k1::SecretKey;
use thiserror::Error;

use crate::abiencode::types::{Address, Signature, U256};
use crate::channel::{Channel, ChannelError};
use crate::outcome::{
    Allocation, AllocationType, Allocations, Exit, GuaranteeMetadata, OutcomeError,
    SingleAssetExit,
};
use crate::state::{FixedPart, SignedState, State, StateError};
use crate::types::{Destination, Funds};

#[derive(Debug, Error)]
pub enum ProposalError {
    #[error("only the leader may perform this operation")]
    NotLeader,
    #[error("only the follower may perform this operation")]
    NotFollower,
    #[error("proposal is for a different ledger channel")]
    WrongLedger,
    #[error("expected proposal for turn {expected}, got {got}")]
    InvalidTurnNum { expected: u64, got: u64 },
    #[error("no proposals pending")]
    NoProposals,
    #[error("received proposal does not match the pending one")]
    ProposalMismatch,
    #[error("proposal signed by {got}, expected {want}")]
    WrongSigner { want: Address, got: Address },
    #[error("a guarantee for {0} already exists")]
    DuplicateTarget(Destination),
    #[error("no guarantee for {0}")]
    UnknownTarget(Destination),
    #[error("left deposit exceeds the guarantee amount")]
    InvalidDeposit,
    #[error("removal amount exceeds the guarantee amount")]
    InvalidAmount,
    #[error("guarantee sides do not match the ledger participants")]
    MismatchedSides,
    #[error("balance cannot afford the requested deduction")]
    InsufficientFunds,
    #[error("a ledger channel has exactly two participants")]
    NotTwoParty,
    #[error(transparent)]
    Outcome(#[from] OutcomeError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Which side of the ledger this node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerIndex {
    Leader,
    Follower,
}

/// One party's balance in the ledger outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Balance {
    pub destination: Destination,
    pub amount: U256,
}

impl Balance {
    pub fn new(destination: Destination, amount: U256) -> Balance {
        Balance {
            destination,
            amount,
        }
    }

    fn as_allocation(&self) -> Allocation {
        Allocation::simple(self.destination, self.amount)
    }
}

/// Funds reserved out of the ledger balances for a target (virtual) channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guarantee {
    pub amount: U256,
    pub target: Destination,
    pub left: Destination,
    pub right: Destination,
}

impl Guarantee {
    pub fn new(amount: U256, target: Destination, left: Destination, right: Destination) -> Self {
        Guarantee {
            amount,
            target,
            left,
            right,
        }
    }

    fn as_allocation(&self) -> Result<Allocation, OutcomeError> {
        Ok(Allocation {
            destination: self.target,
            amount: self.amount,
            allocation_type: AllocationType::Guarantee,
            metadata: GuaranteeMetadata {
                left: self.left,
                right: self.right,
            }
            .encode()?,
        })
    }
}

/// The ledger's single-asset outcome: two balances plus the live guarantees
/// keyed by target channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerOutcome {
    pub asset: Address,
    pub leader: Balance,
    pub follower: Balance,
    pub guarantees: BTreeMap<Destination, Guarantee>,
}

impl LedgerOutcome {
    pub fn new(
        asset: Address,
        leader: Balance,
        follower: Balance,
        guarantees: Vec<Guarantee>,
    ) -> LedgerOutcome {
        LedgerOutcome {
            asset,
            leader,
            follower,
            guarantees: guarantees.into_iter().map(|g| (g.target, g)).collect(),
        }
    }

    pub fn includes(&self, g: &Guarantee) -> bool {
        self.guarantees.get(&g.target) == Some(g)
    }

    pub fn includes_target(&self, target: Destination) -> bool {
        self.guarantees.contains_key(&target)
    }

    /// Leader balance, follower balance and all guarantees combined. Legal
    /// proposals never change this sum.
    pub fn total(&self) -> U256 {
        self.guarantees
            .values()
            .fold(self.leader.amount + self.follower.amount, |acc, g| {
                acc + g.amount
            })
    }

    /// Render as an [Exit]: both balances followed by the guarantees in
    /// target order.
    fn as_outcome(&self) -> Result<Exit, OutcomeError> {
        let mut allocations = vec![self.leader.as_allocation(), self.follower.as_allocation()];
        for g in self.guarantees.values() {
            allocations.push(g.as_allocation()?);
        }
        Ok(Exit(vec![SingleAssetExit {
            asset: self.asset,
            metadata: Vec::new(),
            allocations: Allocations(allocations),
        }]))
    }

    /// Map the guarantee's left/right sides onto this outcome's balances.
    fn sides_mut(&mut self, g: &Guarantee) -> Result<(&mut U256, &mut U256), ProposalError> {
        if g.left == self.leader.destination && g.right == self.follower.destination {
            Ok((&mut self.leader.amount, &mut self.follower.amount))
        } else if g.left == self.follower.destination && g.right == self.leader.destination {
            Ok((&mut self.follower.amount, &mut self.leader.amount))
        } else {
            Err(ProposalError::MismatchedSides)
        }
    }
}

/// Reserve a new guarantee out of the two balances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Add {
    pub guarantee: Guarantee,
    /// Portion of the guarantee amount funded by the guarantee's left side;
    /// the right side funds the remainder.
    pub left_deposit: U256,
}

impl Add {
    fn right_deposit(&self) -> Result<U256, ProposalError> {
        self.guarantee
            .amount
            .checked_sub(self.left_deposit)
            .ok_or(ProposalError::InvalidDeposit)
    }
}

/// Release a guarantee back into the two balances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remove {
    pub target: Destination,
    /// Portion returned to the guarantee's left side; the remainder goes
    /// right.
    pub left_amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Add(Add),
    Remove(Remove),
}

/// A proposed ledger update, identified by the ledger it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub ledger_id: Destination,
    pub change: Change,
}

impl Proposal {
    pub fn add(ledger_id: Destination, guarantee: Guarantee, left_deposit: U256) -> Proposal {
        Proposal {
            ledger_id,
            change: Change::Add(Add {
                guarantee,
                left_deposit,
            }),
        }
    }

    pub fn remove(ledger_id: Destination, target: Destination, left_amount: U256) -> Proposal {
        Proposal {
            ledger_id,
            change: Change::Remove(Remove {
                target,
                left_amount,
            }),
        }
    }

    /// The virtual channel this proposal funds or defunds.
    pub fn target(&self) -> Destination {
        match &self.change {
            Change::Add(add) => add.guarantee.target,
            Change::Remove(remove) => remove.target,
        }
    }
}

/// A proposal carrying one signature over the ledger state that results from
/// applying it at `turn_num`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedProposal {
    pub proposal: Proposal,
    pub turn_num: u64,
    pub signature: Signature,
}

/// The variable part of the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vars {
    pub turn_num: u64,
    pub outcome: LedgerOutcome,
}

impl Vars {
    /// Apply a proposal, bumping the turn number. Rejects anything that
    /// would break conservation or overdraw a balance; on error the vars are
    /// left untouched by the caller discarding them.
    pub fn apply(&mut self, p: &Proposal) -> Result<(), ProposalError> {
        self.turn_num += 1;
        match &p.change {
            Change::Add(add) => self.add(add),
            Change::Remove(remove) => self.remove(remove),
        }
    }

    fn add(&mut self, add: &Add) -> Result<(), ProposalError> {
        let g = &add.guarantee;
        if self.outcome.includes_target(g.target) {
            return Err(ProposalError::DuplicateTarget(g.target));
        }
        let right_deposit = add.right_deposit()?;

        let (left_balance, right_balance) = self.outcome.sides_mut(g)?;
        let new_left = left_balance
            .checked_sub(add.left_deposit)
            .ok_or(ProposalError::InsufficientFunds)?;
        let new_right = right_balance
            .checked_sub(right_deposit)
            .ok_or(ProposalError::InsufficientFunds)?;
        *left_balance = new_left;
        *right_balance = new_right;

        self.outcome.guarantees.insert(g.target, g.clone());
        Ok(())
    }

    fn remove(&mut self, remove: &Remove) -> Result<(), ProposalError> {
        let g = self
            .outcome
            .guarantees
            .get(&remove.target)
            .cloned()
            .ok_or(ProposalError::UnknownTarget(remove.target))?;
        let right_amount = g
            .amount
            .checked_sub(remove.left_amount)
            .ok_or(ProposalError::InvalidAmount)?;

        let (left_balance, right_balance) = self.outcome.sides_mut(&g)?;
        *left_balance = *left_balance + remove.left_amount;
        *right_balance = *right_balance + right_amount;

        self.outcome.guarantees.remove(&remove.target);
        Ok(())
    }

    /// The ledger state this outcome corresponds to under `fp`.
    pub fn as_state(&self, fp: &FixedPart) -> Result<State, ProposalError> {
        let mut state = fp.state_with(Vec::new(), self.outcome.as_outcome()?);
        state.turn_num = self.turn_num;
        Ok(state)
    }
}

/// Consensus vars together with both parties' signatures on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedVars {
    pub vars: Vars,
    pub signatures: [Signature; 2],
}

/// A running two-party ledger channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusChannel {
    pub id: Destination,
    pub my_index: LedgerIndex,
    pub on_chain_funding: Funds,
    fp: FixedPart,
    current: SignedVars,
    proposal_queue: Vec<SignedProposal>,
}

impl ConsensusChannel {
    fn new(
        fp: FixedPart,
        my_index: LedgerIndex,
        turn_num: u64,
        outcome: LedgerOutcome,
        signatures: [Signature; 2],
    ) -> Result<ConsensusChannel, ProposalError> {
        if fp.participants.len() != 2 {
            return Err(ProposalError::NotTwoParty);
        }
        let vars = Vars { turn_num, outcome };
        let state = vars.as_state(&fp)?;
        for (i, sig) in signatures.iter().enumerate() {
            let signer = state.recover_signer(sig)?;
            if signer != fp.participants[i] {
                return Err(ProposalError::WrongSigner {
                    want: fp.participants[i],
                    got: signer,
                });
            }
        }
        let id = fp.channel_id()?;
        Ok(ConsensusChannel {
            id,
            my_index,
            on_chain_funding: Funds::new(),
            fp,
            current: SignedVars { vars, signatures },
            proposal_queue: Vec::new(),
        })
    }

    pub fn new_leader_channel(
        fp: FixedPart,
        turn_num: u64,
        outcome: LedgerOutcome,
        signatures: [Signature; 2],
    ) -> Result<ConsensusChannel, ProposalError> {
        Self::new(fp, LedgerIndex::Leader, turn_num, outcome, signatures)
    }

    pub fn new_follower_channel(
        fp: FixedPart,
        turn_num: u64,
        outcome: LedgerOutcome,
        signatures: [Signature; 2],
    ) -> Result<ConsensusChannel, ProposalError> {
        Self::new(fp, LedgerIndex::Follower, turn_num, outcome, signatures)
    }

    pub fn is_leader(&self) -> bool {
        self.my_index == LedgerIndex::Leader
    }

    pub fn leader(&self) -> Address {
        self.fp.participants[0]
    }

    pub fn follower(&self) -> Address {
        self.fp.participants[1]
    }

    pub fn my_address(&self) -> Address {
        match self.my_index {
            LedgerIndex::Leader => self.leader(),
            LedgerIndex::Follower => self.follower(),
        }
    }

    /// The other party to this ledger.
    pub fn counterparty(&self) -> Address {
        match self.my_index {
            LedgerIndex::Leader => self.follower(),
            LedgerIndex::Follower => self.leader(),
        }
    }

    pub fn fixed_part(&self) -> &FixedPart {
        &self.fp
    }

    pub fn participants(&self) -> &[Address] {
        &self.fp.participants
    }

    pub fn consensus_vars(&self) -> &Vars {
        &self.current.vars
    }

    pub fn proposal_queue(&self) -> &[SignedProposal] {
        &self.proposal_queue
    }

    /// The consensus vars with every queued proposal applied in order.
    pub fn latest_proposed_vars(&self) -> Result<Vars, ProposalError> {
        let mut vars = self.current.vars.clone();
        for sp in &self.proposal_queue {
            vars.apply(&sp.proposal)?;
        }
        Ok(vars)
    }

    /// Whether the consensus outcome carries exactly this guarantee.
    pub fn includes(&self, g: &Guarantee) -> bool {
        self.current.vars.outcome.includes(g)
    }

    pub fn includes_target(&self, target: Destination) -> bool {
        self.current.vars.outcome.includes_target(target)
    }

    /// Whether the guarantee is present once all queued proposals apply.
    pub fn is_proposed(&self, g: &Guarantee) -> Result<bool, ProposalError> {
        Ok(self.latest_proposed_vars()?.outcome.includes(g))
    }

    /// Whether counter-signing the queue head would make this guarantee
    /// consensus.
    pub fn is_proposed_next(&self, g: &Guarantee) -> Result<bool, ProposalError> {
        let Some(head) = self.proposal_queue.first() else {
            return Ok(false);
        };
        let mut vars = self.current.vars.clone();
        vars.apply(&head.proposal)?;
        Ok(vars.outcome.includes(g))
    }

    /// Whether a removal of `target` is sitting in the proposal queue.
    pub fn has_removal_been_proposed(&self, target: Destination) -> bool {
        self.proposal_queue.iter().any(|sp| {
            matches!(&sp.proposal.change, Change::Remove(r) if r.target == target)
        })
    }

    /// The consensus state with both signatures, for handing governance back
    /// to a plain [Channel].
    pub fn supported_signed_state(&self) -> Result<SignedState, ProposalError> {
        let state = self.current.vars.as_state(&self.fp)?;
        let signatures: BTreeMap<usize, Signature> = [
            (0, self.current.signatures[0]),
            (1, self.current.signatures[1]),
        ]
        .into_iter()
        .collect();
        Ok(SignedState::with_signatures(state, signatures))
    }

    /// Convert into a [Channel] governed by the consensus state, used when a
    /// defund takes over.
    pub fn as_channel(&self) -> Result<Channel, ProposalError> {
        let my_index = match self.my_index {
            LedgerIndex::Leader => 0,
            LedgerIndex::Follower => 1,
        };
        let mut channel = Channel::from_signed_state(self.supported_signed_state()?, my_index)?;
        channel.on_chain_funding = self.on_chain_funding.clone();
        Ok(channel)
    }

    /// Leader only: sign and queue a proposal extending the current queue.
    /// Returns the signed proposal to send to the follower.
    pub fn propose(
        &mut self,
        proposal: Proposal,
        sk: &SecretKey,
    ) -> Result<SignedProposal, ProposalError> {
        if !self.is_leader() {
            return Err(ProposalError::NotLeader);
        }
        if proposal.ledger_id != self.id {
            return Err(ProposalError::WrongLedger);
        }

        let mut vars = self.latest_proposed_vars()?;
        vars.apply(&proposal)?;

        let signature = vars.as_state(&self.fp)?.sign(sk)?;
        let signed = SignedProposal {
            proposal,
            turn_num: vars.turn_num,
            signature,
        };
        self.proposal_queue.push(signed.clone());
        Ok(signed)
    }

    /// Handle a proposal arriving from the wire: the follower's counter-sign
    /// if we lead, a fresh leader proposal if we follow.
    pub fn receive(&mut self, sp: SignedProposal) -> Result<(), ProposalError> {
        match self.my_index {
            LedgerIndex::Leader => self.leader_receive(sp),
            LedgerIndex::Follower => self.follower_receive(sp),
        }
    }

    /// Leader side: the follower counter-signed the head of our queue. On
    /// success the head's effect becomes consensus.
    fn leader_receive(&mut self, sp: SignedProposal) -> Result<(), ProposalError> {
        let head = self.proposal_queue.first().ok_or(ProposalError::NoProposals)?;

        let expected_turn = self.current.vars.turn_num + 1;
        if sp.turn_num != expected_turn || head.turn_num != expected_turn {
            return Err(ProposalError::InvalidTurnNum {
                expected: expected_turn,
                got: sp.turn_num,
            });
        }
        if sp.proposal != head.proposal {
            return Err(ProposalError::ProposalMismatch);
        }

        let mut candidate = self.current.vars.clone();
        candidate.apply(&head.proposal)?;

        let signer = candidate.as_state(&self.fp)?.recover_signer(&sp.signature)?;
        if signer != self.follower() {
            return Err(ProposalError::WrongSigner {
                want: self.follower(),
                got: signer,
            });
        }

        let our_signature = head.signature;
        self.current = SignedVars {
            vars: candidate,
            signatures: [our_signature, sp.signature],
        };
        self.proposal_queue.remove(0);
        Ok(())
    }

    /// Follower side: queue a leader proposal, enforcing exact turn order.
    fn follower_receive(&mut self, sp: SignedProposal) -> Result<(), ProposalError> {
        if sp.proposal.ledger_id != self.id {
            return Err(ProposalError::WrongLedger);
        }

        let mut vars = self.latest_proposed_vars()?;
        let expected_turn = vars.turn_num + 1;
        if sp.turn_num != expected_turn {
            return Err(ProposalError::InvalidTurnNum {
                expected: expected_turn,
                got: sp.turn_num,
            });
        }

        vars.apply(&sp.proposal)?;

        let signer = vars.as_state(&self.fp)?.recover_signer(&sp.signature)?;
        if signer != self.leader() {
            return Err(ProposalError::WrongSigner {
                want: self.leader(),
                got: signer,
            });
        }

        self.proposal_queue.push(sp);
        Ok(())
    }

    /// Follower only: counter-sign the queue head if it matches `expected`.
    /// On success the head's effect becomes consensus and the signed copy is
    /// returned for sending back to the leader.
    pub fn sign_next_proposal(
        &mut self,
        expected: &Proposal,
        sk: &SecretKey,
    ) -> Result<SignedProposal, ProposalError> {
        if self.is_leader() {
            return Err(ProposalError::NotFollower);
        }
        let head = self
            .proposal_queue
            .first()
            .ok_or(ProposalError::NoProposals)?
            .clone();
        if head.proposal != *expected {
            return Err(ProposalError::ProposalMismatch);
        }

        let mut candidate = self.current.vars.clone();
        candidate.apply(&head.proposal)?;

        let signature = candidate.as_state(&self.fp)?.sign(sk)?;
        self.current = SignedVars {
            vars: candidate,
            signatures: [head.signature, signature],
        };
        self.proposal_queue.remove(0);
        Ok(SignedProposal {
            proposal: head.proposal,
            turn_num: head.turn_num,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testactors::{alice, bob, irene, Actor};

    const AMOUNT: u64 = 10;

    fn ledger_fixed_part(leader: &Actor, follower: &Actor) -> FixedPart {
        FixedPart {
            chain_id: 9001,
            participants: vec![leader.address(), follower.address()],
            channel_nonce: 7,
            app_definition: Address::default(),
            challenge_duration: 60,
        }
    }

    fn ledger_outcome(leader: &Actor, follower: &Actor) -> LedgerOutcome {
        LedgerOutcome::new(
            Address::default(),
            Balance::new(leader.destination(), U256::from(AMOUNT)),
            Balance::new(follower.destination(), U256::from(AMOUNT)),
            vec![],
        )
    }

    /// A leader/follower pair over the same freshly-funded ledger.
    fn ledger_pair(leader: &Actor, follower: &Actor) -> (ConsensusChannel, ConsensusChannel) {
        let fp = ledger_fixed_part(leader, follower);
        let outcome = ledger_outcome(leader, follower);
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

    fn guarantee(leader: &Actor, follower: &Actor, target: Destination, amount: u64) -> Guarantee {
        Guarantee::new(
            U256::from(amount),
            target,
            leader.destination(),
            follower.destination(),
        )
    }

    #[test]
    fn constructor_checks_signatures() {
        let a = alice();
        let b = bob();
        let fp = ledger_fixed_part(&a, &b);
        let outcome = ledger_outcome(&a, &b);
        let vars = Vars {
            turn_num: 0,
            outcome: outcome.clone(),
        };
        let state = vars.as_state(&fp).unwrap();
        // follower slot signed by the wrong actor
        let sigs = [
            state.sign(&a.secret_key()).unwrap(),
            state.sign(&irene().secret_key()).unwrap(),
        ];
        assert!(matches!(
            ConsensusChannel::new_leader_channel(fp, 0, outcome, sigs),
            Err(ProposalError::WrongSigner { .. })
        ));
    }

    #[test]
    fn add_then_counter_sign_reaches_consensus() {
        let a = alice();
        let b = bob();
        let (mut leader, mut follower) = ledger_pair(&a, &b);
        let target = Destination([9; 32]);
        let g = guarantee(&a, &b, target, 10);

        let proposal = Proposal::add(leader.id, g.clone(), U256::from(10));
        let sp = leader.propose(proposal.clone(), &a.secret_key()).unwrap();
        assert_eq!(sp.turn_num, 2);
        assert!(leader.is_proposed(&g).unwrap());
        assert!(!leader.includes(&g));

        follower.receive(sp).unwrap();
        assert!(follower.is_proposed_next(&g).unwrap());
        let counter = follower.sign_next_proposal(&proposal, &b.secret_key()).unwrap();
        assert!(follower.includes(&g));
        assert_eq!(follower.consensus_vars().turn_num, 2);
        // alice fronted the full amount
        assert_eq!(follower.consensus_vars().outcome.leader.amount, U256::from(0));
        assert_eq!(follower.consensus_vars().outcome.follower.amount, U256::from(10));

        leader.receive(counter).unwrap();
        assert!(leader.includes(&g));
        assert!(leader.proposal_queue().is_empty());
        assert_eq!(leader.consensus_vars(), follower.consensus_vars());
    }

    #[test]
    fn conservation_holds_across_proposals() {
        let a = alice();
        let b = bob();
        let (mut leader, mut follower) = ledger_pair(&a, &b);
        let target = Destination([9; 32]);
        let g = guarantee(&a, &b, target, 6);

        let before = leader.consensus_vars().outcome.total();

        let add = Proposal::add(leader.id, g.clone(), U256::from(4));
        let sp = leader.propose(add.clone(), &a.secret_key()).unwrap();
        assert_eq!(leader.latest_proposed_vars().unwrap().outcome.total(), before);
        follower.receive(sp).unwrap();
        let counter = follower.sign_next_proposal(&add, &b.secret_key()).unwrap();
        assert_eq!(follower.consensus_vars().outcome.total(), before);
        leader.receive(counter).unwrap();
        assert_eq!(leader.consensus_vars().outcome.total(), before);

        let remove = Proposal::remove(leader.id, target, U256::from(2));
        let sp = leader.propose(remove.clone(), &a.secret_key()).unwrap();
        assert_eq!(leader.latest_proposed_vars().unwrap().outcome.total(), before);
        follower.receive(sp).unwrap();
        let counter = follower.sign_next_proposal(&remove, &b.secret_key()).unwrap();
        leader.receive(counter).unwrap();
        assert_eq!(leader.consensus_vars().outcome.total(), before);
        assert_eq!(follower.consensus_vars().outcome.total(), before);
    }

    #[test]
    fn illegal_adds_are_rejected() {
        let a = alice();
        let b = bob();
        let (mut leader, _) = ledger_pair(&a, &b);
        let target = Destination([9; 32]);

        // deposit larger than the guarantee amount
        let g = guarantee(&a, &b, target, 4);
        let p = Proposal::add(leader.id, g, U256::from(5));
        assert!(matches!(
            leader.propose(p, &a.secret_key()),
            Err(ProposalError::InvalidDeposit)
        ));

        // guarantee larger than the combined balances
        let g = guarantee(&a, &b, target, 25);
        let p = Proposal::add(leader.id, g, U256::from(12));
        assert!(matches!(
            leader.propose(p, &a.secret_key()),
            Err(ProposalError::InsufficientFunds)
        ));

        // duplicate target
        let g = guarantee(&a, &b, target, 4);
        leader
            .propose(Proposal::add(leader.id, g.clone(), U256::from(4)), &a.secret_key())
            .unwrap();
        assert!(matches!(
            leader.propose(Proposal::add(leader.id, g, U256::from(0)), &a.secret_key()),
            Err(ProposalError::DuplicateTarget(_))
        ));

        // follower may not originate proposals
        let (_, mut follower) = ledger_pair(&a, &b);
        let g = guarantee(&a, &b, target, 4);
        assert!(matches!(
            follower.propose(Proposal::add(follower.id, g, U256::from(4)), &b.secret_key()),
            Err(ProposalError::NotLeader)
        ));
    }

    #[test]
    fn out_of_order_proposal_is_rejected_without_state_change() {
        let a = alice();
        let b = bob();
        let (mut leader, mut follower) = ledger_pair(&a, &b);

        let g1 = guarantee(&a, &b, Destination([1; 32]), 2);
        let g2 = guarantee(&a, &b, Destination([2; 32]), 2);

        let sp1 = leader
            .propose(Proposal::add(leader.id, g1, U256::from(1)), &a.secret_key())
            .unwrap();
        let sp2 = leader
            .propose(Proposal::add(leader.id, g2, U256::from(1)), &a.secret_key())
            .unwrap();
        assert_eq!(sp1.turn_num, 2);
        assert_eq!(sp2.turn_num, 3);

        // delivering turn 3 before turn 2 fails and leaves the follower
        // untouched
        let snapshot = follower.clone();
        assert!(matches!(
            follower.receive(sp2.clone()),
            Err(ProposalError::InvalidTurnNum { expected: 2, got: 3 })
        ));
        assert_eq!(follower, snapshot);

        follower.receive(sp1.clone()).unwrap();
        // duplicate delivery also fails
        assert!(matches!(
            follower.receive(sp1),
            Err(ProposalError::InvalidTurnNum { expected: 3, got: 2 })
        ));
        follower.receive(sp2).unwrap();
        assert_eq!(follower.proposal_queue().len(), 2);
    }

    #[test]
    fn removals_release_guarantees() {
        let a = alice();
        let b = bob();
        let (mut leader, mut follower) = ledger_pair(&a, &b);
        let target = Destination([9; 32]);
        let g = guarantee(&a, &b, target, 10);

        let add = Proposal::add(leader.id, g.clone(), U256::from(10));
        let sp = leader.propose(add.clone(), &a.secret_key()).unwrap();
        follower.receive(sp).unwrap();
        let counter = follower.sign_next_proposal(&add, &b.secret_key()).unwrap();
        leader.receive(counter).unwrap();

        // 6 paid to bob's side, 4 back to alice
        let remove = Proposal::remove(leader.id, target, U256::from(4));
        assert!(!leader.has_removal_been_proposed(target));
        let sp = leader.propose(remove.clone(), &a.secret_key()).unwrap();
        assert!(leader.has_removal_been_proposed(target));
        follower.receive(sp).unwrap();
        let counter = follower.sign_next_proposal(&remove, &b.secret_key()).unwrap();
        leader.receive(counter).unwrap();

        for ledger in [&leader, &follower] {
            assert!(!ledger.includes_target(target));
            assert_eq!(ledger.consensus_vars().outcome.leader.amount, U256::from(4));
            assert_eq!(ledger.consensus_vars().outcome.follower.amount, U256::from(16));
        }

        // removing again fails
        let p = Proposal::remove(leader.id, target, U256::from(1));
        assert!(matches!(
            leader.propose(p, &a.secret_key()),
            Err(ProposalError::UnknownTarget(_))
        ));
    }

    #[test]
    fn ledger_converts_to_channel() {
        let a = alice();
        let b = bob();
        let (leader, _) = ledger_pair(&a, &b);
        let channel = leader.as_channel().unwrap();
        assert_eq!(channel.id, leader.id);
        assert_eq!(channel.my_index, 0);
        assert_eq!(channel.latest_supported_turn_num(), Some(1));
    }
}
