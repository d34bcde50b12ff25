//! Close a directly-funded channel: agree on a final state, after which the
//! on-chain withdrawal can be triggered externally.

use secp256k1::SecretKey;

use crate::chain::ChainEvent;
use crate::channel::Channel;
use crate::consensus_channel::ConsensusChannel;
use crate::state::State;
use crate::types::Destination;

use super::{
    create_signed_state_messages, ObjectiveError, ObjectiveId, ObjectivePayload, ObjectiveStatus,
    SideEffects, WaitingFor,
};

pub const OBJECTIVE_PREFIX: &str = "DirectDefunding-";

pub fn is_direct_defund_objective(id: &str) -> bool {
    id.starts_with(OBJECTIVE_PREFIX)
}

/// API request to close a ledger channel.
#[derive(Debug, Clone)]
pub struct ObjectiveRequest {
    pub channel_id: Destination,
}

impl ObjectiveRequest {
    pub fn id(&self) -> ObjectiveId {
        format!("{OBJECTIVE_PREFIX}{}", self.channel_id)
    }
}

/// The direct defunding state machine.
///
/// Governance moves from the [ConsensusChannel] back to a plain [Channel]
/// at construction time; the engine destroys the consensus channel so no
/// further proposals can race the close.
#[derive(Debug, Clone, PartialEq)]
pub struct Objective {
    pub status: ObjectiveStatus,
    pub c: Channel,
    final_turn_num: u64,
}

/// Create an objective from an API request and the ledger it closes.
pub fn new_objective(
    pre_approve: bool,
    ledger: ConsensusChannel,
) -> Result<Objective, ObjectiveError> {
    let channel = channel_from_ledger(ledger)?;
    let final_turn_num = channel.latest_supported_state()?.turn_num + 1;
    Ok(Objective {
        status: if pre_approve {
            ObjectiveStatus::Approved
        } else {
            ObjectiveStatus::Unapproved
        },
        c: channel,
        final_turn_num,
    })
}

/// Create an objective from the first incoming payload, validating the
/// proposed final state against the ledger's consensus.
pub fn construct_from_payload(
    payload: &ObjectivePayload,
    ledger: ConsensusChannel,
) -> Result<Objective, ObjectiveError> {
    let objective = new_objective(false, ledger)?;
    let proposed: &State = payload.signed_state.state();
    let supported = objective.c.latest_supported_state()?;
    if !proposed.is_final {
        return Err(ObjectiveError::InvalidFinalOutcome("state is not final"));
    }
    if proposed.fixed_part() != supported.fixed_part() {
        return Err(ObjectiveError::InvalidFinalOutcome("wrong channel"));
    }
    if proposed.turn_num != objective.final_turn_num {
        return Err(ObjectiveError::InvalidFinalOutcome("wrong turn number"));
    }
    if proposed.outcome != supported.outcome {
        return Err(ObjectiveError::InvalidFinalOutcome(
            "outcome differs from consensus",
        ));
    }
    Ok(objective)
}

/// A ledger can only be closed when nothing is in flight on it.
fn channel_from_ledger(ledger: ConsensusChannel) -> Result<Channel, ObjectiveError> {
    if !ledger.proposal_queue().is_empty() {
        return Err(ObjectiveError::LedgerBusy("proposals are pending"));
    }
    if !ledger.consensus_vars().outcome.guarantees.is_empty() {
        return Err(ObjectiveError::LedgerBusy(
            "guarantees are still collateralized",
        ));
    }
    Ok(ledger.as_channel()?)
}

impl Objective {
    pub fn id(&self) -> ObjectiveId {
        format!("{OBJECTIVE_PREFIX}{}", self.c.id)
    }

    fn final_state(&self) -> Result<State, ObjectiveError> {
        // the final state carries the supported outcome forward unchanged
        let supported = self.c.latest_supported_state()?;
        if supported.is_final {
            return Ok(supported.clone());
        }
        let mut fin = supported.clone();
        fin.turn_num = self.final_turn_num;
        fin.is_final = true;
        Ok(fin)
    }

    pub fn update(&self, payload: &ObjectivePayload) -> Result<Objective, ObjectiveError> {
        let mut updated = self.clone();
        updated.c.add_signed_state(payload.signed_state.clone())?;
        Ok(updated)
    }

    /// Track holdings so an external withdrawal can be observed.
    pub fn update_with_chain_event(&self, event: &ChainEvent) -> Result<Objective, ObjectiveError> {
        match event {
            ChainEvent::Deposited {
                asset, now_held, ..
            }
            | ChainEvent::AllocationUpdated {
                asset, now_held, ..
            } => {
                let mut updated = self.clone();
                updated.c.on_chain_funding.insert(*asset, *now_held);
                Ok(updated)
            }
            ChainEvent::Concluded { .. } => Ok(self.clone()),
            ChainEvent::ChallengeRegistered { .. } => Err(ObjectiveError::UnhandledChainEvent(
                "challenges are not part of the cooperative close",
            )),
        }
    }

    pub fn crank(
        &self,
        sk: &SecretKey,
    ) -> Result<(Objective, SideEffects, WaitingFor), ObjectiveError> {
        let mut updated = self.clone();
        let mut side_effects = SideEffects::default();

        if updated.status != ObjectiveStatus::Approved {
            return Err(ObjectiveError::NotApproved);
        }

        if !updated.c.signed_by_me_at(updated.final_turn_num) {
            let fin = updated.final_state()?;
            let ss = updated.c.sign_and_add_state(fin, sk)?;
            side_effects.messages_to_send.extend(create_signed_state_messages(
                &updated.id(),
                &ss,
                updated.c.my_index,
            ));
        }
        if !updated.c.fully_signed_at(updated.final_turn_num) {
            return Ok((updated, side_effects, WaitingFor::CompleteFinal));
        }

        Ok((updated, side_effects, WaitingFor::Nothing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abiencode::types::U256;
    use crate::consensus_channel::{Guarantee, Proposal};
    use crate::testactors::{alice, bob, ledger_pair};
    use crate::types::Destination;

    #[test]
    fn busy_ledgers_cannot_be_closed() {
        let a = alice();
        let b = bob();

        // pending proposal
        let (mut leader, _) = ledger_pair(&a, &b, 10, 50);
        let g = Guarantee::new(
            U256::from(2),
            Destination([9; 32]),
            a.destination(),
            b.destination(),
        );
        leader
            .propose(Proposal::add(leader.id, g, U256::from(1)), &a.secret_key())
            .unwrap();
        assert!(matches!(
            new_objective(true, leader),
            Err(ObjectiveError::LedgerBusy(_))
        ));

        // live guarantee
        let (mut leader, mut follower) = ledger_pair(&a, &b, 10, 51);
        let g = Guarantee::new(
            U256::from(2),
            Destination([9; 32]),
            a.destination(),
            b.destination(),
        );
        let add = Proposal::add(leader.id, g, U256::from(1));
        let sp = leader.propose(add.clone(), &a.secret_key()).unwrap();
        follower.receive(sp).unwrap();
        follower.sign_next_proposal(&add, &b.secret_key()).unwrap();
        assert!(matches!(
            new_objective(true, follower),
            Err(ObjectiveError::LedgerBusy(_))
        ));
    }

    #[test]
    fn cooperative_close_signs_a_final_state() {
        let a = alice();
        let b = bob();
        let (leader, follower) = ledger_pair(&a, &b, 10, 52);

        let oa = new_objective(true, leader).unwrap();
        let (oa, se_a, wf) = oa.crank(&a.secret_key()).unwrap();
        assert_eq!(wf, WaitingFor::CompleteFinal);
        assert_eq!(se_a.messages_to_send.len(), 1);
        let payload = &se_a.messages_to_send[0].objective_payloads[0];
        assert!(payload.signed_state.state().is_final);

        // re-cranking does not sign or send twice
        let (oa, se_again, _) = oa.crank(&a.secret_key()).unwrap();
        assert!(se_again.messages_to_send.is_empty());

        // the peer adopts the proposed final state
        let ob = construct_from_payload(payload, follower).unwrap();
        let ob = Objective {
            status: ObjectiveStatus::Approved,
            ..ob
        };
        let ob = ob.update(payload).unwrap();
        let (ob, se_b, wf) = ob.crank(&b.secret_key()).unwrap();
        assert_eq!(wf, WaitingFor::Nothing);

        let oa = oa
            .update(&se_b.messages_to_send[0].objective_payloads[0])
            .unwrap();
        let (oa, se, wf) = oa.crank(&a.secret_key()).unwrap();
        assert_eq!(wf, WaitingFor::Nothing);
        assert!(se.messages_to_send.is_empty());
        assert!(oa.c.latest_supported_state().unwrap().is_final);
        assert_eq!(
            oa.c.latest_supported_state().unwrap().turn_num,
            ob.c.latest_supported_state().unwrap().turn_num
        );
    }

    #[test]
    fn tampered_final_state_is_rejected() {
        let a = alice();
        let b = bob();
        let (leader, follower) = ledger_pair(&a, &b, 10, 53);

        let oa = new_objective(true, leader).unwrap();
        let (_, se_a, _) = oa.crank(&a.secret_key()).unwrap();
        let payload = &se_a.messages_to_send[0].objective_payloads[0];

        // shift funds in the proposed final state
        let mut state = payload.signed_state.state().clone();
        state.outcome.0[0].allocations.0[0].amount = U256::from(9);
        state.outcome.0[0].allocations.0[1].amount = U256::from(11);
        let tampered = ObjectivePayload {
            objective_id: payload.objective_id.clone(),
            signed_state: crate::state::SignedState::new(state),
        };
        assert!(matches!(
            construct_from_payload(&tampered, follower),
            Err(ObjectiveError::InvalidFinalOutcome(_))
        ));
    }
}
