//! Directly fund (and thereby open) a channel with on-chain deposits.

use secp256k1::SecretKey;

use crate::abiencode::types::Address;
use crate::chain::{ChainEvent, ChainTransaction};
use crate::channel::Channel;
use crate::consensus_channel::{
    Balance, ConsensusChannel, LedgerOutcome,
};
use crate::outcome::Exit;
use crate::state::State;
use crate::types::{Destination, Funds};

use super::{
    create_signed_state_messages, ObjectiveError, ObjectiveId, ObjectivePayload, ObjectiveStatus,
    SideEffects, WaitingFor,
};

pub const OBJECTIVE_PREFIX: &str = "DirectFunding-";

pub fn is_direct_fund_objective(id: &str) -> bool {
    id.starts_with(OBJECTIVE_PREFIX)
}

/// API request to directly fund a channel with `counterparty`.
#[derive(Debug, Clone)]
pub struct ObjectiveRequest {
    pub counterparty: Address,
    pub chain_id: u64,
    pub challenge_duration: u32,
    pub outcome: Exit,
    pub app_definition: Address,
    pub app_data: Vec<u8>,
    pub nonce: u64,
}

impl ObjectiveRequest {
    fn prefund_state(&self, my_address: Address) -> State {
        State {
            chain_id: self.chain_id,
            participants: vec![my_address, self.counterparty],
            channel_nonce: self.nonce,
            app_definition: self.app_definition,
            challenge_duration: self.challenge_duration,
            app_data: self.app_data.clone(),
            outcome: self.outcome.clone(),
            turn_num: 0,
            is_final: false,
        }
    }

    pub fn channel_id(&self, my_address: Address) -> Result<Destination, ObjectiveError> {
        Ok(self.prefund_state(my_address).channel_id()?)
    }

    pub fn id(&self, my_address: Address) -> Result<ObjectiveId, ObjectiveError> {
        let channel_id = self.channel_id(my_address)?;
        Ok(format!("{OBJECTIVE_PREFIX}{channel_id}"))
    }
}

/// The direct funding state machine for one channel.
///
/// The deposit thresholds are derived once from the prefund outcome: I may
/// deposit only once everyone allocated before me has (safety threshold),
/// and I stop once my own allocation is covered (target).
#[derive(Debug, Clone, PartialEq)]
pub struct Objective {
    pub status: ObjectiveStatus,
    pub c: Channel,
    my_deposit_safety_threshold: Funds,
    my_deposit_target: Funds,
    fully_funded_threshold: Funds,
}

/// Create an objective from an API request.
///
/// `channel_exists` reports whether the store already tracks a channel or
/// ledger with the counterparty; a second one is refused.
pub fn new_objective(
    request: &ObjectiveRequest,
    pre_approve: bool,
    my_address: Address,
    channel_exists: bool,
) -> Result<Objective, ObjectiveError> {
    if channel_exists {
        return Err(ObjectiveError::ExistingChannel(request.counterparty));
    }
    from_prefund_state(request.prefund_state(my_address), pre_approve, my_address)
}

/// Create an objective from the first incoming payload for its id.
pub fn construct_from_payload(
    payload: &ObjectivePayload,
    my_address: Address,
) -> Result<Objective, ObjectiveError> {
    from_prefund_state(payload.signed_state.state().clone(), false, my_address)
}

fn from_prefund_state(
    prefund: State,
    pre_approve: bool,
    my_address: Address,
) -> Result<Objective, ObjectiveError> {
    prefund.outcome.validate_size()?;

    let my_index = prefund
        .participants
        .iter()
        .position(|p| *p == my_address)
        .ok_or(ObjectiveError::NotParticipant { my_address })?;

    let my_destination = Destination::from(my_address);
    let my_allocated = prefund.outcome.total_allocated_for(my_destination);
    let fully_funded_threshold = prefund.outcome.total_allocated();
    let my_deposit_safety_threshold = prefund.outcome.deposit_safety_threshold(my_destination);
    let my_deposit_target = my_deposit_safety_threshold.add(&my_allocated);

    Ok(Objective {
        status: if pre_approve {
            ObjectiveStatus::Approved
        } else {
            ObjectiveStatus::Unapproved
        },
        c: Channel::new(prefund, my_index)?,
        my_deposit_safety_threshold,
        my_deposit_target,
        fully_funded_threshold,
    })
}

impl Objective {
    pub fn id(&self) -> ObjectiveId {
        format!("{OBJECTIVE_PREFIX}{}", self.c.id)
    }

    /// Merge the signed states of a peer payload.
    pub fn update(&self, payload: &ObjectivePayload) -> Result<Objective, ObjectiveError> {
        let mut updated = self.clone();
        updated.c.add_signed_state(payload.signed_state.clone())?;
        Ok(updated)
    }

    /// Record new on-chain holdings.
    pub fn update_with_chain_event(&self, event: &ChainEvent) -> Result<Objective, ObjectiveError> {
        match event {
            ChainEvent::Deposited {
                asset, now_held, ..
            } => {
                let mut updated = self.clone();
                updated.c.on_chain_funding.insert(*asset, *now_held);
                Ok(updated)
            }
            _ => Err(ObjectiveError::UnhandledChainEvent(
                "direct funding only reacts to deposits",
            )),
        }
    }

    /// Advance the state machine as far as the collected signatures and
    /// holdings allow.
    pub fn crank(
        &self,
        sk: &SecretKey,
    ) -> Result<(Objective, SideEffects, WaitingFor), ObjectiveError> {
        let mut updated = self.clone();
        let mut side_effects = SideEffects::default();

        if updated.status != ObjectiveStatus::Approved {
            return Err(ObjectiveError::NotApproved);
        }

        // Prefunding
        if !updated.c.pre_fund_signed_by_me() {
            let ss = updated.c.sign_and_add_prefund(sk)?;
            side_effects.messages_to_send.extend(create_signed_state_messages(
                &updated.id(),
                &ss,
                updated.c.my_index,
            ));
        }
        if !updated.c.pre_fund_complete() {
            return Ok((updated, side_effects, WaitingFor::CompletePrefund));
        }

        // Funding
        let funding_complete = updated.funding_complete();
        let safe_to_deposit = updated.safe_to_deposit();
        let amount_to_deposit = updated.amount_to_deposit();

        if !funding_complete && !safe_to_deposit {
            return Ok((updated, side_effects, WaitingFor::MyTurnToFund));
        }
        if !funding_complete && safe_to_deposit && amount_to_deposit.is_non_zero() {
            side_effects
                .transactions_to_submit
                .push(ChainTransaction::Deposit {
                    channel_id: updated.c.id,
                    deposit: amount_to_deposit,
                });
        }
        if !funding_complete {
            return Ok((updated, side_effects, WaitingFor::CompleteFunding));
        }

        // Postfunding
        if !updated.c.post_fund_signed_by_me() {
            let ss = updated.c.sign_and_add_postfund(sk)?;
            side_effects.messages_to_send.extend(create_signed_state_messages(
                &updated.id(),
                &ss,
                updated.c.my_index,
            ));
        }
        if !updated.c.post_fund_complete() {
            return Ok((updated, side_effects, WaitingFor::CompletePostFund));
        }

        Ok((updated, side_effects, WaitingFor::Nothing))
    }

    /// After completion, derive the consensus ledger that takes over
    /// governance of the channel.
    pub fn create_consensus_channel(&self) -> Result<ConsensusChannel, ObjectiveError> {
        let ss = self.c.latest_supported_signed_state()?.clone();
        let state = ss.state();

        if state.outcome.0.len() != 1 || state.outcome.0[0].allocations.0.len() != 2 {
            return Err(ObjectiveError::InvalidPaymentOutcome);
        }
        let exit = &state.outcome.0[0];
        let leader_allocation = &exit.allocations.0[0];
        let follower_allocation = &exit.allocations.0[1];
        let outcome = LedgerOutcome::new(
            exit.asset,
            Balance::new(leader_allocation.destination, leader_allocation.amount),
            Balance::new(follower_allocation.destination, follower_allocation.amount),
            vec![],
        );

        let signatures = match (ss.signature_for(0), ss.signature_for(1)) {
            (Some(first), Some(second)) => [first, second],
            _ => return Err(ObjectiveError::Channel(
                crate::channel::ChannelError::NotFullySigned,
            )),
        };

        let mut ledger = if self.c.my_index == 0 {
            ConsensusChannel::new_leader_channel(
                self.c.fixed_part().clone(),
                state.turn_num,
                outcome,
                signatures,
            )?
        } else {
            ConsensusChannel::new_follower_channel(
                self.c.fixed_part().clone(),
                state.turn_num,
                outcome,
                signatures,
            )?
        };
        ledger.on_chain_funding = self.c.on_chain_funding.clone();
        Ok(ledger)
    }

    fn funding_complete(&self) -> bool {
        self.c.on_chain_funding.covers(&self.fully_funded_threshold)
    }

    fn safe_to_deposit(&self) -> bool {
        self.c
            .on_chain_funding
            .covers(&self.my_deposit_safety_threshold)
    }

    fn amount_to_deposit(&self) -> Funds {
        self.my_deposit_target
            .saturating_sub(&self.c.on_chain_funding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abiencode::types::U256;
    use crate::testactors::{alice, bob, irene, test_state};

    fn request_for(counterparty: Address, outcome: Exit) -> ObjectiveRequest {
        ObjectiveRequest {
            counterparty,
            chain_id: 9001,
            challenge_duration: 60,
            outcome,
            app_definition: Address::default(),
            app_data: Vec::new(),
            nonce: 37140676580,
        }
    }

    fn alice_bob_objective(pre_approve: bool) -> Objective {
        let state = test_state(vec![alice().address(), bob().address()], 0);
        let request = request_for(bob().address(), state.outcome);
        new_objective(&request, pre_approve, alice().address(), false).unwrap()
    }

    #[test]
    fn construction_computes_thresholds() {
        let o = alice_bob_objective(true);
        let asset = Address::default();
        assert_eq!(o.fully_funded_threshold.get(asset), U256::from(10));
        assert_eq!(o.my_deposit_safety_threshold.get(asset), U256::from(0));
        assert_eq!(o.my_deposit_target.get(asset), U256::from(5));

        // bob deposits second: he must wait for alice's 5
        let state = test_state(vec![alice().address(), bob().address()], 0);
        let payload = ObjectivePayload {
            objective_id: format!("{OBJECTIVE_PREFIX}{}", state.channel_id().unwrap()),
            signed_state: crate::state::SignedState::new(state),
        };
        let o = construct_from_payload(&payload, bob().address()).unwrap();
        assert_eq!(o.my_deposit_safety_threshold.get(asset), U256::from(5));
        assert_eq!(o.my_deposit_target.get(asset), U256::from(10));
        assert_eq!(o.status, ObjectiveStatus::Unapproved);
    }

    #[test]
    fn refuses_second_channel_with_counterparty() {
        let state = test_state(vec![alice().address(), bob().address()], 0);
        let request = request_for(bob().address(), state.outcome);
        assert!(matches!(
            new_objective(&request, true, alice().address(), true),
            Err(ObjectiveError::ExistingChannel(_))
        ));
    }

    #[test]
    fn crank_requires_approval() {
        let o = alice_bob_objective(false);
        assert!(matches!(
            o.crank(&alice().secret_key()),
            Err(ObjectiveError::NotApproved)
        ));
    }

    #[test]
    fn crank_walks_through_all_phases() {
        let sk_a = alice().secret_key();
        let sk_b = bob().secret_key();
        let asset = Address::default();

        let a0 = alice_bob_objective(true);
        let state = test_state(vec![alice().address(), bob().address()], 0);
        let payload = ObjectivePayload {
            objective_id: a0.id(),
            signed_state: crate::state::SignedState::new(state),
        };
        let b0 = construct_from_payload(&payload, bob().address())
            .unwrap();
        let b0 = Objective {
            status: ObjectiveStatus::Approved,
            ..b0
        };

        // 1. alice signs the prefund and emits it
        let (a1, se, wf) = a0.crank(&sk_a).unwrap();
        assert_eq!(wf, WaitingFor::CompletePrefund);
        assert_eq!(se.messages_to_send.len(), 1);
        assert_eq!(se.messages_to_send[0].to, bob().address());

        // 2. bob folds it in, signs, emits; his prefund is complete
        let payload = &se.messages_to_send[0].objective_payloads[0];
        let b1 = b0.update(payload).unwrap();
        let (b2, se_b, wf) = b1.crank(&sk_b).unwrap();
        assert_eq!(wf, WaitingFor::MyTurnToFund);
        assert_eq!(se_b.messages_to_send.len(), 1);

        // 3. alice folds bob's signature in and deposits (safety 0)
        let a2 = a1
            .update(&se_b.messages_to_send[0].objective_payloads[0])
            .unwrap();
        let (a3, se, wf) = a2.crank(&sk_a).unwrap();
        assert_eq!(wf, WaitingFor::CompleteFunding);
        assert_eq!(se.transactions_to_submit.len(), 1);
        match &se.transactions_to_submit[0] {
            ChainTransaction::Deposit { deposit, .. } => {
                assert_eq!(deposit.get(asset), U256::from(5))
            }
            tx => panic!("expected a deposit, got {tx:?}"),
        }

        // 4. alice's deposit lands; bob sees it and deposits his share
        let deposited = ChainEvent::Deposited {
            channel_id: a3.c.id,
            asset,
            amount: U256::from(5),
            now_held: U256::from(5),
            block_num: 1,
        };
        let b3 = b2.update_with_chain_event(&deposited).unwrap();
        let (b4, se_b, wf) = b3.crank(&sk_b).unwrap();
        assert_eq!(wf, WaitingFor::CompleteFunding);
        assert_eq!(se_b.transactions_to_submit.len(), 1);

        // 5. full funding lands on both; postfund exchange begins
        let funded = ChainEvent::Deposited {
            channel_id: a3.c.id,
            asset,
            amount: U256::from(5),
            now_held: U256::from(10),
            block_num: 2,
        };
        let a4 = a3.update_with_chain_event(&funded).unwrap();
        let (a5, se, wf) = a4.crank(&sk_a).unwrap();
        assert_eq!(wf, WaitingFor::CompletePostFund);
        assert_eq!(se.messages_to_send.len(), 1);

        let b5 = b4.update_with_chain_event(&funded).unwrap();
        let b5 = b5.update(&se.messages_to_send[0].objective_payloads[0]).unwrap();
        let (b6, se_b, wf) = b5.crank(&sk_b).unwrap();
        assert_eq!(wf, WaitingFor::Nothing);

        let a6 = a5.update(&se_b.messages_to_send[0].objective_payloads[0]).unwrap();
        let (a7, se, wf) = a6.crank(&sk_a).unwrap();
        assert_eq!(wf, WaitingFor::Nothing);
        assert!(se.messages_to_send.is_empty());
        assert!(se.transactions_to_submit.is_empty());

        // crank is idempotent once a phase's side effects are out
        let (_, se, wf) = a7.crank(&sk_a).unwrap();
        assert!(se.messages_to_send.is_empty() && se.transactions_to_submit.is_empty());
        assert_eq!(wf, WaitingFor::Nothing);

        // 6. the completed channel spawns a consensus ledger
        let ledger = a7.create_consensus_channel().unwrap();
        assert!(ledger.is_leader());
        assert_eq!(ledger.consensus_vars().turn_num, 1);
        assert!(ledger.proposal_queue().is_empty());
        assert_eq!(ledger.consensus_vars().outcome.leader.amount, U256::from(5));
        assert_eq!(ledger.consensus_vars().outcome.follower.amount, U256::from(5));

        let ledger_b = b6.create_consensus_channel().unwrap();
        assert!(!ledger_b.is_leader());
        assert_eq!(ledger.consensus_vars(), ledger_b.consensus_vars());
    }

    #[test]
    fn payload_for_wrong_objective_is_rejected() {
        let o = alice_bob_objective(true);
        let foreign = test_state(vec![alice().address(), irene().address()], 0);
        let payload = ObjectivePayload {
            objective_id: o.id(),
            signed_state: crate::state::SignedState::new(foreign),
        };
        assert!(o.update(&payload).is_err());
    }
}
