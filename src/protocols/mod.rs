//! The objective state machines and the types they share: side effects,
//! messages, waiting conditions and the polymorphic [Objective] wrapper.

pub mod directdefund;
pub mod directfund;
pub mod virtualdefund;
pub mod virtualfund;

use core::fmt::{self, Display};

use secp256k1::SecretKey;
use thiserror::Error;

use crate::abiencode::types::Address;
use crate::chain::{ChainEvent, ChainTransaction};
use crate::channel::ChannelError;
use crate::consensus_channel::{Proposal, ProposalError, SignedProposal};
use crate::outcome::OutcomeError;
use crate::payments::Voucher;
use crate::state::{SignedState, StateError};
use crate::types::Destination;

/// Prefix-tagged identifier of a protocol instance, e.g.
/// `DirectFunding-0x…`.
pub type ObjectiveId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectiveStatus {
    Unapproved,
    Approved,
    Rejected,
    Completed,
}

/// The condition an objective is blocked on, reported by every crank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitingFor {
    CompletePrefund,
    MyTurnToFund,
    CompleteFunding,
    CompletePostFund,
    CompleteFinal,
    CompleteLedgerDefunding,
    Nothing,
}

impl Display for WaitingFor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WaitingFor::CompletePrefund => "WaitingForCompletePrefund",
            WaitingFor::MyTurnToFund => "WaitingForMyTurnToFund",
            WaitingFor::CompleteFunding => "WaitingForCompleteFunding",
            WaitingFor::CompletePostFund => "WaitingForCompletePostFund",
            WaitingFor::CompleteFinal => "WaitingForCompleteFinal",
            WaitingFor::CompleteLedgerDefunding => "WaitingForCompleteLedgerDefunding",
            WaitingFor::Nothing => "WaitingForNothing",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum ObjectiveError {
    #[error("objective is not approved")]
    NotApproved,
    #[error("payload is for objective {got}, expected {expected}")]
    IdMismatch { expected: ObjectiveId, got: ObjectiveId },
    #[error("{my_address} is not a participant of the channel")]
    NotParticipant { my_address: Address },
    #[error("a channel with {0} already exists")]
    ExistingChannel(Address),
    #[error("no ledger channel with {0}")]
    MissingLedger(Address),
    #[error("objective does not handle chain events")]
    NotChainEventHandler,
    #[error("chain event cannot be applied: {0}")]
    UnhandledChainEvent(&'static str),
    #[error("objective does not receive ledger proposals")]
    NotProposalReceiver,
    #[error("proposal is for a ledger this objective does not manage")]
    UnknownLedger,
    #[error("virtual channels need at least one intermediary")]
    NoIntermediaries,
    #[error("outcome must allocate a single asset to payer then payee")]
    InvalidPaymentOutcome,
    #[error("final outcome is inconsistent: {0}")]
    InvalidFinalOutcome(&'static str),
    #[error("ledger channel is busy: {0}")]
    LedgerBusy(&'static str),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Proposal(#[from] ProposalError),
    #[error(transparent)]
    Outcome(#[from] OutcomeError),
}

/// One protocol payload addressed to an objective. All four protocols carry
/// signed states as their payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectivePayload {
    pub objective_id: ObjectiveId,
    pub signed_state: SignedState,
}

/// Everything one node tells another in a single delivery.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub to: Address,
    pub objective_payloads: Vec<ObjectivePayload>,
    pub ledger_proposals: Vec<SignedProposal>,
    pub payments: Vec<Voucher>,
    pub rejected_objectives: Vec<ObjectiveId>,
}

impl Message {
    /// One-line description for the engine log.
    pub fn summarize(&self) -> String {
        format!(
            "to {} ({} payloads, {} proposals, {} payments, {} rejections)",
            self.to,
            self.objective_payloads.len(),
            self.ledger_proposals.len(),
            self.payments.len(),
            self.rejected_objectives.len(),
        )
    }
}

/// What a crank asks the engine to do on its behalf, in dispatch order.
#[derive(Debug, Clone, Default)]
pub struct SideEffects {
    pub messages_to_send: Vec<Message>,
    pub transactions_to_submit: Vec<ChainTransaction>,
    pub proposals_to_process: Vec<Proposal>,
}

impl SideEffects {
    pub fn merge(&mut self, other: SideEffects) {
        self.messages_to_send.extend(other.messages_to_send);
        self.transactions_to_submit
            .extend(other.transactions_to_submit);
        self.proposals_to_process.extend(other.proposals_to_process);
    }
}

/// A signed-state payload for every participant except the sender.
pub fn create_signed_state_messages(
    objective_id: &ObjectiveId,
    ss: &SignedState,
    my_index: usize,
) -> Vec<Message> {
    ss.state()
        .participants
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != my_index)
        .map(|(_, peer)| Message {
            to: *peer,
            objective_payloads: vec![ObjectivePayload {
                objective_id: objective_id.clone(),
                signed_state: ss.clone(),
            }],
            ..Message::default()
        })
        .collect()
}

pub fn create_proposal_message(to: Address, sp: SignedProposal) -> Message {
    Message {
        to,
        ledger_proposals: vec![sp],
        ..Message::default()
    }
}

pub fn create_voucher_message(to: Address, voucher: Voucher) -> Message {
    Message {
        to,
        payments: vec![voucher],
        ..Message::default()
    }
}

/// A rejection notice for every participant except the rejecting node.
pub fn create_rejection_notices(
    objective_id: &ObjectiveId,
    participants: &[Address],
    my_index: usize,
) -> Vec<Message> {
    participants
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != my_index)
        .map(|(_, peer)| Message {
            to: *peer,
            rejected_objectives: vec![objective_id.clone()],
            ..Message::default()
        })
        .collect()
}

/// A protocol instance. Every variant is a deterministic state machine
/// driven by [Objective::crank].
#[derive(Debug, Clone, PartialEq)]
pub enum Objective {
    DirectFund(directfund::Objective),
    VirtualFund(virtualfund::Objective),
    VirtualDefund(virtualdefund::Objective),
    DirectDefund(directdefund::Objective),
}

impl Objective {
    pub fn id(&self) -> ObjectiveId {
        match self {
            Objective::DirectFund(o) => o.id(),
            Objective::VirtualFund(o) => o.id(),
            Objective::VirtualDefund(o) => o.id(),
            Objective::DirectDefund(o) => o.id(),
        }
    }

    pub fn status(&self) -> ObjectiveStatus {
        match self {
            Objective::DirectFund(o) => o.status,
            Objective::VirtualFund(o) => o.status,
            Objective::VirtualDefund(o) => o.status,
            Objective::DirectDefund(o) => o.status,
        }
    }

    fn set_status(&mut self, status: ObjectiveStatus) {
        match self {
            Objective::DirectFund(o) => o.status = status,
            Objective::VirtualFund(o) => o.status = status,
            Objective::VirtualDefund(o) => o.status = status,
            Objective::DirectDefund(o) => o.status = status,
        }
    }

    pub fn approve(&self) -> Objective {
        let mut updated = self.clone();
        updated.set_status(ObjectiveStatus::Approved);
        updated
    }

    pub(crate) fn with_status(&self, status: ObjectiveStatus) -> Objective {
        let mut updated = self.clone();
        updated.set_status(status);
        updated
    }

    /// Reject the objective and notify every other participant. The engine
    /// suppresses the notices when the rejection itself came from a peer.
    pub fn reject(&self) -> (Objective, SideEffects) {
        let mut updated = self.clone();
        updated.set_status(ObjectiveStatus::Rejected);
        let side_effects = SideEffects {
            messages_to_send: create_rejection_notices(
                &self.id(),
                self.participants(),
                self.my_index(),
            ),
            ..SideEffects::default()
        };
        (updated, side_effects)
    }

    pub fn participants(&self) -> &[Address] {
        match self {
            Objective::DirectFund(o) => o.c.participants(),
            Objective::VirtualFund(o) => o.v.participants(),
            Objective::VirtualDefund(o) => o.v.participants(),
            Objective::DirectDefund(o) => o.c.participants(),
        }
    }

    fn my_index(&self) -> usize {
        match self {
            Objective::DirectFund(o) => o.c.my_index,
            Objective::VirtualFund(o) => o.v.my_index,
            Objective::VirtualDefund(o) => o.v.my_index,
            Objective::DirectDefund(o) => o.c.my_index,
        }
    }

    /// Fold a peer payload into the objective.
    pub fn update(&self, payload: &ObjectivePayload) -> Result<Objective, ObjectiveError> {
        if payload.objective_id != self.id() {
            return Err(ObjectiveError::IdMismatch {
                expected: self.id(),
                got: payload.objective_id.clone(),
            });
        }
        match self {
            Objective::DirectFund(o) => Ok(Objective::DirectFund(o.update(payload)?)),
            Objective::VirtualFund(o) => Ok(Objective::VirtualFund(o.update(payload)?)),
            Objective::VirtualDefund(o) => Ok(Objective::VirtualDefund(o.update(payload)?)),
            Objective::DirectDefund(o) => Ok(Objective::DirectDefund(o.update(payload)?)),
        }
    }

    /// Fold an incoming ledger proposal into the objective (virtual
    /// protocols only).
    pub fn receive_proposal(&self, sp: SignedProposal) -> Result<Objective, ObjectiveError> {
        match self {
            Objective::VirtualFund(o) => Ok(Objective::VirtualFund(o.receive_proposal(sp)?)),
            Objective::VirtualDefund(o) => Ok(Objective::VirtualDefund(o.receive_proposal(sp)?)),
            _ => Err(ObjectiveError::NotProposalReceiver),
        }
    }

    pub fn is_chain_event_handler(&self) -> bool {
        matches!(self, Objective::DirectFund(_) | Objective::DirectDefund(_))
    }

    /// Fold a chain event into the objective (directly-funded protocols
    /// only).
    pub fn update_with_chain_event(&self, event: &ChainEvent) -> Result<Objective, ObjectiveError> {
        match self {
            Objective::DirectFund(o) => {
                Ok(Objective::DirectFund(o.update_with_chain_event(event)?))
            }
            Objective::DirectDefund(o) => {
                Ok(Objective::DirectDefund(o.update_with_chain_event(event)?))
            }
            _ => Err(ObjectiveError::NotChainEventHandler),
        }
    }

    /// One transition of the state machine. Pure: reads nothing and writes
    /// nothing outside the returned values.
    pub fn crank(
        &self,
        sk: &SecretKey,
    ) -> Result<(Objective, SideEffects, WaitingFor), ObjectiveError> {
        match self {
            Objective::DirectFund(o) => {
                let (o, se, wf) = o.crank(sk)?;
                Ok((Objective::DirectFund(o), se, wf))
            }
            Objective::VirtualFund(o) => {
                let (o, se, wf) = o.crank(sk)?;
                Ok((Objective::VirtualFund(o), se, wf))
            }
            Objective::VirtualDefund(o) => {
                let (o, se, wf) = o.crank(sk)?;
                Ok((Objective::VirtualDefund(o), se, wf))
            }
            Objective::DirectDefund(o) => {
                let (o, se, wf) = o.crank(sk)?;
                Ok((Objective::DirectDefund(o), se, wf))
            }
        }
    }

    /// Every channel this objective references, for store indexing.
    pub fn related_channel_ids(&self) -> Vec<Destination> {
        match self {
            Objective::DirectFund(o) => vec![o.c.id],
            Objective::VirtualFund(o) => {
                let mut ids = vec![o.v.id];
                if let Some(conn) = &o.to_my_left {
                    ids.push(conn.channel.id);
                }
                if let Some(conn) = &o.to_my_right {
                    ids.push(conn.channel.id);
                }
                ids
            }
            Objective::VirtualDefund(o) => {
                let mut ids = vec![o.v.id];
                if let Some(ledger) = &o.to_my_left {
                    ids.push(ledger.id);
                }
                if let Some(ledger) = &o.to_my_right {
                    ids.push(ledger.id);
                }
                ids
            }
            Objective::DirectDefund(o) => vec![o.c.id],
        }
    }

    /// The channel this objective exclusively governs.
    pub fn owned_channel_id(&self) -> Destination {
        match self {
            Objective::DirectFund(o) => o.c.id,
            Objective::VirtualFund(o) => o.v.id,
            Objective::VirtualDefund(o) => o.v.id,
            Objective::DirectDefund(o) => o.c.id,
        }
    }
}

/// An API request to spawn a new objective.
#[derive(Debug, Clone)]
pub enum ObjectiveRequest {
    DirectFund(directfund::ObjectiveRequest),
    VirtualFund(virtualfund::ObjectiveRequest),
    VirtualDefund(virtualdefund::ObjectiveRequest),
    DirectDefund(directdefund::ObjectiveRequest),
}

impl ObjectiveRequest {
    /// The id the spawned objective will carry.
    pub fn id(&self, my_address: Address) -> Result<ObjectiveId, ObjectiveError> {
        match self {
            ObjectiveRequest::DirectFund(r) => r.id(my_address),
            ObjectiveRequest::VirtualFund(r) => r.id(my_address),
            ObjectiveRequest::VirtualDefund(r) => Ok(r.id()),
            ObjectiveRequest::DirectDefund(r) => Ok(r.id()),
        }
    }
}
