//! Collapse a virtual channel: agree on a final outcome reflecting the
//! payments made, then release the guarantees on every hop's ledger.

use secp256k1::SecretKey;

use crate::abiencode::types::{Address, U256};
use crate::channel::Channel;
use crate::consensus_channel::{ConsensusChannel, Proposal, SignedProposal};
use crate::state::State;
use crate::types::Destination;

use super::{
    create_proposal_message, create_signed_state_messages, ObjectiveError, ObjectiveId,
    ObjectivePayload, ObjectiveStatus, SideEffects, WaitingFor,
};

pub const OBJECTIVE_PREFIX: &str = "VirtualDefund-";

pub fn is_virtual_defund_objective(id: &str) -> bool {
    id.starts_with(OBJECTIVE_PREFIX)
}

/// The virtual channel named by an objective id, if it is a virtual defund
/// id.
pub fn virtual_channel_from_objective_id(id: &str) -> Option<Destination> {
    let hex_part = id.strip_prefix(OBJECTIVE_PREFIX)?.strip_prefix("0x")?;
    let bytes = hex::decode(hex_part).ok()?;
    let bytes: [u8; 32] = bytes.try_into().ok()?;
    Some(Destination(bytes))
}

/// API request to settle and close a virtual channel.
#[derive(Debug, Clone)]
pub struct ObjectiveRequest {
    pub channel_id: Destination,
}

impl ObjectiveRequest {
    pub fn id(&self) -> ObjectiveId {
        format!("{OBJECTIVE_PREFIX}{}", self.channel_id)
    }
}

/// The virtual defunding state machine for one virtual channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Objective {
    pub status: ObjectiveStatus,
    pub v: Channel,
    pub to_my_left: Option<ConsensusChannel>,
    pub to_my_right: Option<ConsensusChannel>,
    pub my_role: usize,
    final_state: State,
    minimum_payment_amount: U256,
}

/// Create an objective from an API request. `paid` is the largest voucher
/// amount this node has observed for the channel (zero for intermediaries).
pub fn new_objective(
    v: Channel,
    pre_approve: bool,
    paid: U256,
    left_ledger: Option<ConsensusChannel>,
    right_ledger: Option<ConsensusChannel>,
) -> Result<Objective, ObjectiveError> {
    let final_state = settled_final_state(&v, paid)?;
    build(v, pre_approve, final_state, paid, left_ledger, right_ledger)
}

/// Create an objective from the first incoming payload, adopting the final
/// state it proposes after validating it against our own view.
pub fn construct_from_payload(
    payload: &ObjectivePayload,
    v: Channel,
    paid: U256,
    left_ledger: Option<ConsensusChannel>,
    right_ledger: Option<ConsensusChannel>,
) -> Result<Objective, ObjectiveError> {
    let final_state = payload.signed_state.state().clone();
    validate_final_state(&v, &final_state, paid)?;
    build(v, false, final_state, paid, left_ledger, right_ledger)
}

fn build(
    v: Channel,
    pre_approve: bool,
    final_state: State,
    paid: U256,
    left_ledger: Option<ConsensusChannel>,
    right_ledger: Option<ConsensusChannel>,
) -> Result<Objective, ObjectiveError> {
    let my_role = v.my_index;
    let participants = v.participants().to_vec();
    let my_address = participants[my_role];

    let to_my_left = if my_role > 0 {
        Some(validated_ledger(
            left_ledger,
            my_address,
            participants[my_role - 1],
        )?)
    } else {
        None
    };
    let to_my_right = if my_role < participants.len() - 1 {
        Some(validated_ledger(
            right_ledger,
            my_address,
            participants[my_role + 1],
        )?)
    } else {
        None
    };

    Ok(Objective {
        status: if pre_approve {
            ObjectiveStatus::Approved
        } else {
            ObjectiveStatus::Unapproved
        },
        v,
        to_my_left,
        to_my_right,
        my_role,
        final_state,
        minimum_payment_amount: paid,
    })
}

fn validated_ledger(
    ledger: Option<ConsensusChannel>,
    my_address: Address,
    neighbour: Address,
) -> Result<ConsensusChannel, ObjectiveError> {
    let ledger = ledger.ok_or(ObjectiveError::MissingLedger(neighbour))?;
    let parties = ledger.participants();
    if !parties.contains(&my_address) || !parties.contains(&neighbour) {
        return Err(ObjectiveError::MissingLedger(neighbour));
    }
    Ok(ledger)
}

/// Compute the final state from the channel's latest supported state: the
/// payee receives the paid amount (clamped to the payer's balance), the
/// payer keeps the rest.
fn settled_final_state(v: &Channel, paid: U256) -> Result<State, ObjectiveError> {
    let latest = v.latest_supported_state()?;
    if latest.outcome.0.len() != 1 || latest.outcome.0[0].allocations.0.len() != 2 {
        return Err(ObjectiveError::InvalidPaymentOutcome);
    }

    let mut final_state = latest.clone();
    final_state.turn_num += 1;
    final_state.is_final = true;

    let allocations = &mut final_state.outcome.0[0].allocations.0;
    let paid_to_payee = paid.min(allocations[0].amount);
    allocations[0].amount = allocations[0].amount - paid_to_payee;
    allocations[1].amount = allocations[1].amount + paid_to_payee;

    Ok(final_state)
}

/// Check a peer-proposed final state against our latest supported state and
/// recorded payments.
fn validate_final_state(v: &Channel, final_state: &State, paid: U256) -> Result<(), ObjectiveError> {
    let latest = v.latest_supported_state()?;
    if final_state.fixed_part() != latest.fixed_part() {
        return Err(ObjectiveError::InvalidFinalOutcome("wrong channel"));
    }
    if !final_state.is_final {
        return Err(ObjectiveError::InvalidFinalOutcome("state is not final"));
    }
    if final_state.turn_num != latest.turn_num + 1 {
        return Err(ObjectiveError::InvalidFinalOutcome("wrong turn number"));
    }
    if final_state.outcome.0.len() != 1
        || final_state.outcome.0[0].allocations.0.len() != 2
        || latest.outcome.0.len() != 1
        || latest.outcome.0[0].allocations.0.len() != 2
    {
        return Err(ObjectiveError::InvalidPaymentOutcome);
    }

    let initial = &latest.outcome.0[0].allocations.0;
    let settled = &final_state.outcome.0[0].allocations.0;
    if settled[0].destination != initial[0].destination
        || settled[1].destination != initial[1].destination
    {
        return Err(ObjectiveError::InvalidFinalOutcome("allocations moved"));
    }
    let payee_gain = settled[1]
        .amount
        .checked_sub(initial[1].amount)
        .ok_or(ObjectiveError::InvalidFinalOutcome("payee balance shrank"))?;
    if settled[0].amount + payee_gain != initial[0].amount {
        return Err(ObjectiveError::InvalidFinalOutcome("funds not conserved"));
    }

    let n = v.participants().len();
    match v.my_index {
        0 if payee_gain > paid => Err(ObjectiveError::InvalidFinalOutcome(
            "payee claims more than was paid",
        )),
        role if role == n - 1 && payee_gain < paid => Err(ObjectiveError::InvalidFinalOutcome(
            "final outcome under-pays the payee",
        )),
        _ => Ok(()),
    }
}

impl Objective {
    pub fn id(&self) -> ObjectiveId {
        format!("{OBJECTIVE_PREFIX}{}", self.v.id)
    }

    fn final_turn_num(&self) -> u64 {
        self.final_state.turn_num
    }

    /// The payer's residual in the final outcome; each hop's removal
    /// returns this to the guarantee's left side.
    fn left_amount(&self) -> U256 {
        self.final_state.outcome.0[0].allocations.0[0].amount
    }

    pub fn update(&self, payload: &ObjectivePayload) -> Result<Objective, ObjectiveError> {
        let mut updated = self.clone();
        updated.v.add_signed_state(payload.signed_state.clone())?;
        Ok(updated)
    }

    pub fn receive_proposal(&self, sp: SignedProposal) -> Result<Objective, ObjectiveError> {
        let mut updated = self.clone();
        let ledger = [&mut updated.to_my_left, &mut updated.to_my_right]
            .into_iter()
            .flatten()
            .find(|ledger| ledger.id == sp.proposal.ledger_id)
            .ok_or(ObjectiveError::UnknownLedger)?;
        ledger.receive(sp)?;
        Ok(updated)
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

        // Final state signatures
        let final_turn = updated.final_turn_num();
        if !updated.v.signed_by_me_at(final_turn) {
            let ss = updated
                .v
                .sign_and_add_state(updated.final_state.clone(), sk)?;
            side_effects.messages_to_send.extend(create_signed_state_messages(
                &updated.id(),
                &ss,
                updated.my_role,
            ));
        }
        if !updated.v.fully_signed_at(final_turn) {
            return Ok((updated, side_effects, WaitingFor::CompleteFinal));
        }

        // Release the guarantees on the adjacent ledgers
        let target = updated.v.id;
        let left_amount = updated.left_amount();
        let mut defunded = true;
        for ledger in [&mut updated.to_my_left, &mut updated.to_my_right]
            .into_iter()
            .flatten()
        {
            let (se, complete) = crank_ledger(ledger, target, left_amount, sk)?;
            side_effects.merge(se);
            defunded &= complete;
        }
        if !defunded {
            return Ok((updated, side_effects, WaitingFor::CompleteLedgerDefunding));
        }

        Ok((updated, side_effects, WaitingFor::Nothing))
    }
}

/// Drive one ledger towards removing the guarantee for `target`.
fn crank_ledger(
    ledger: &mut ConsensusChannel,
    target: Destination,
    left_amount: U256,
    sk: &SecretKey,
) -> Result<(SideEffects, bool), ObjectiveError> {
    let mut side_effects = SideEffects::default();

    if !ledger.includes_target(target) {
        return Ok((side_effects, true));
    }

    let expected = Proposal::remove(ledger.id, target, left_amount);
    if ledger.is_leader() {
        if !ledger.has_removal_been_proposed(target) {
            let sp = ledger.propose(expected, sk)?;
            side_effects
                .messages_to_send
                .push(create_proposal_message(ledger.counterparty(), sp));
        }
        Ok((side_effects, false))
    } else {
        let head_matches = ledger
            .proposal_queue()
            .first()
            .map(|sp| sp.proposal == expected)
            .unwrap_or(false);
        if head_matches {
            let sp = ledger.sign_next_proposal(&expected, sk)?;
            side_effects
                .messages_to_send
                .push(create_proposal_message(ledger.counterparty(), sp));
            if let Some(head) = ledger.proposal_queue().first() {
                side_effects
                    .proposals_to_process
                    .push(head.proposal.clone());
            }
            return Ok((side_effects, !ledger.includes_target(target)));
        }
        Ok((side_effects, false))
    }
}
