//! Fund a virtual channel through guarantees on each hop's ledger channel.

use secp256k1::SecretKey;

use crate::abiencode::types::{Address, U256};
use crate::channel::Channel;
use crate::consensus_channel::{ConsensusChannel, Guarantee, Proposal, SignedProposal};
use crate::outcome::Exit;
use crate::state::State;
use crate::types::Destination;

use super::{
    create_proposal_message, create_signed_state_messages, ObjectiveError, ObjectiveId,
    ObjectivePayload, ObjectiveStatus, SideEffects, WaitingFor,
};

pub const OBJECTIVE_PREFIX: &str = "VirtualFund-";

pub fn is_virtual_fund_objective(id: &str) -> bool {
    id.starts_with(OBJECTIVE_PREFIX)
}

/// API request by the payer to open a virtual channel to `counterparty`
/// through the listed intermediaries.
#[derive(Debug, Clone)]
pub struct ObjectiveRequest {
    pub intermediaries: Vec<Address>,
    pub counterparty: Address,
    pub chain_id: u64,
    pub challenge_duration: u32,
    pub outcome: Exit,
    pub app_definition: Address,
    pub nonce: u64,
}

impl ObjectiveRequest {
    pub fn prefund_state(&self, my_address: Address) -> State {
        let mut participants = vec![my_address];
        participants.extend(&self.intermediaries);
        participants.push(self.counterparty);
        State {
            chain_id: self.chain_id,
            participants,
            channel_nonce: self.nonce,
            app_definition: self.app_definition,
            challenge_duration: self.challenge_duration,
            app_data: Vec::new(),
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

/// One adjacent ledger plus the guarantee it is expected to end up holding.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub channel: ConsensusChannel,
    pub expected_guarantee: Guarantee,
}

impl Connection {
    fn expected_proposal(&self, left_deposit: U256) -> Proposal {
        Proposal::add(
            self.channel.id,
            self.expected_guarantee.clone(),
            left_deposit,
        )
    }
}

/// The virtual funding state machine for one virtual channel.
///
/// Role 0 is the payer, the last role the payee; everyone in between
/// intermediates one hop. Each node only touches the ledgers it is party
/// to.
#[derive(Debug, Clone, PartialEq)]
pub struct Objective {
    pub status: ObjectiveStatus,
    pub v: Channel,
    pub to_my_left: Option<Connection>,
    pub to_my_right: Option<Connection>,
    pub my_role: usize,
    asset: Address,
    a0: U256,
    b0: U256,
}

pub fn new_objective(
    request: &ObjectiveRequest,
    pre_approve: bool,
    my_address: Address,
    left_ledger: Option<ConsensusChannel>,
    right_ledger: Option<ConsensusChannel>,
) -> Result<Objective, ObjectiveError> {
    from_prefund_state(
        request.prefund_state(my_address),
        pre_approve,
        my_address,
        left_ledger,
        right_ledger,
    )
}

pub fn construct_from_payload(
    payload: &ObjectivePayload,
    my_address: Address,
    left_ledger: Option<ConsensusChannel>,
    right_ledger: Option<ConsensusChannel>,
) -> Result<Objective, ObjectiveError> {
    from_prefund_state(
        payload.signed_state.state().clone(),
        false,
        my_address,
        left_ledger,
        right_ledger,
    )
}

fn from_prefund_state(
    prefund: State,
    pre_approve: bool,
    my_address: Address,
    left_ledger: Option<ConsensusChannel>,
    right_ledger: Option<ConsensusChannel>,
) -> Result<Objective, ObjectiveError> {
    if prefund.participants.len() < 3 {
        return Err(ObjectiveError::NoIntermediaries);
    }
    prefund.outcome.validate_size()?;

    let my_role = prefund
        .participants
        .iter()
        .position(|p| *p == my_address)
        .ok_or(ObjectiveError::NotParticipant { my_address })?;

    // The payment outcome is a single asset allocated to payer then payee.
    if prefund.outcome.0.len() != 1 || prefund.outcome.0[0].allocations.0.len() != 2 {
        return Err(ObjectiveError::InvalidPaymentOutcome);
    }
    let exit = &prefund.outcome.0[0];
    let payer_allocation = &exit.allocations.0[0];
    let payee_allocation = &exit.allocations.0[1];
    let payer = prefund.participants[0];
    let payee = prefund.participants[prefund.participants.len() - 1];
    if payer_allocation.destination != Destination::from(payer)
        || payee_allocation.destination != Destination::from(payee)
    {
        return Err(ObjectiveError::InvalidPaymentOutcome);
    }

    let asset = exit.asset;
    let a0 = payer_allocation.amount;
    let b0 = payee_allocation.amount;

    let participants = prefund.participants.clone();
    let v = Channel::new(prefund, my_role)?;
    let total = a0 + b0;

    let to_my_left = if my_role > 0 {
        let neighbour = participants[my_role - 1];
        let ledger = validated_ledger(left_ledger, my_address, neighbour)?;
        Some(Connection {
            expected_guarantee: Guarantee::new(
                total,
                v.id,
                Destination::from(neighbour),
                Destination::from(my_address),
            ),
            channel: ledger,
        })
    } else {
        None
    };

    let to_my_right = if my_role < participants.len() - 1 {
        let neighbour = participants[my_role + 1];
        let ledger = validated_ledger(right_ledger, my_address, neighbour)?;
        Some(Connection {
            expected_guarantee: Guarantee::new(
                total,
                v.id,
                Destination::from(my_address),
                Destination::from(neighbour),
            ),
            channel: ledger,
        })
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
        asset,
        a0,
        b0,
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

impl Objective {
    pub fn id(&self) -> ObjectiveId {
        format!("{OBJECTIVE_PREFIX}{}", self.v.id)
    }

    /// The amount the payer starts with; the voucher manager registers this
    /// as the channel's starting balance.
    pub fn payer_balance(&self) -> U256 {
        self.a0
    }

    pub fn update(&self, payload: &ObjectivePayload) -> Result<Objective, ObjectiveError> {
        let mut updated = self.clone();
        updated.v.add_signed_state(payload.signed_state.clone())?;
        Ok(updated)
    }

    /// Fold an incoming proposal (or counter-signature) into the adjacent
    /// ledger it belongs to.
    pub fn receive_proposal(&self, sp: SignedProposal) -> Result<Objective, ObjectiveError> {
        let mut updated = self.clone();
        let conn = [&mut updated.to_my_left, &mut updated.to_my_right]
            .into_iter()
            .flatten()
            .find(|conn| conn.channel.id == sp.proposal.ledger_id)
            .ok_or(ObjectiveError::UnknownLedger)?;
        conn.channel.receive(sp)?;
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

        // Prefunding
        if !updated.v.pre_fund_signed_by_me() {
            let ss = updated.v.sign_and_add_prefund(sk)?;
            side_effects.messages_to_send.extend(create_signed_state_messages(
                &updated.id(),
                &ss,
                updated.my_role,
            ));
        }
        if !updated.v.pre_fund_complete() {
            return Ok((updated, side_effects, WaitingFor::CompletePrefund));
        }

        // Funding: drive every adjacent ledger towards holding the
        // guarantee in consensus.
        let left_deposit = updated.a0;
        let mut funded = true;
        for conn in [&mut updated.to_my_left, &mut updated.to_my_right]
            .into_iter()
            .flatten()
        {
            let (se, complete) = crank_connection(conn, left_deposit, sk)?;
            side_effects.merge(se);
            funded &= complete;
        }
        if !funded {
            return Ok((updated, side_effects, WaitingFor::CompleteFunding));
        }

        // Postfunding
        if !updated.v.post_fund_signed_by_me() {
            let ss = updated.v.sign_and_add_postfund(sk)?;
            side_effects.messages_to_send.extend(create_signed_state_messages(
                &updated.id(),
                &ss,
                updated.my_role,
            ));
        }
        if !updated.v.post_fund_complete() {
            return Ok((updated, side_effects, WaitingFor::CompletePostFund));
        }

        Ok((updated, side_effects, WaitingFor::Nothing))
    }
}

/// Advance one adjacent ledger: the leader proposes the guarantee, the
/// follower counter-signs it once it is next in line. Returns whether the
/// guarantee has reached consensus.
fn crank_connection(
    conn: &mut Connection,
    left_deposit: U256,
    sk: &SecretKey,
) -> Result<(SideEffects, bool), ObjectiveError> {
    let mut side_effects = SideEffects::default();
    let g = conn.expected_guarantee.clone();

    if conn.channel.includes(&g) {
        return Ok((side_effects, true));
    }

    if conn.channel.is_leader() {
        if !conn.channel.is_proposed(&g)? {
            let sp = conn
                .channel
                .propose(conn.expected_proposal(left_deposit), sk)?;
            side_effects
                .messages_to_send
                .push(create_proposal_message(conn.channel.counterparty(), sp));
        }
        Ok((side_effects, false))
    } else {
        if conn.channel.is_proposed_next(&g)? {
            let sp = conn
                .channel
                .sign_next_proposal(&conn.expected_proposal(left_deposit), sk)?;
            side_effects
                .messages_to_send
                .push(create_proposal_message(conn.channel.counterparty(), sp));
            // Consensus moved forward; if more proposals are queued behind
            // ours, wake the objective waiting on the new head.
            if let Some(head) = conn.channel.proposal_queue().first() {
                side_effects
                    .proposals_to_process
                    .push(head.proposal.clone());
            }
            return Ok((side_effects, conn.channel.includes(&g)));
        }
        Ok((side_effects, false))
    }
}
