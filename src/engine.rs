//! The single event loop at the heart of a node: multiplexes API requests,
//! peer messages, chain events and internal ledger proposals, routes them to
//! objectives, and dispatches the side effects each crank declares.

use std::collections::VecDeque;

use futures::channel::mpsc;
use futures::stream::{BoxStream, SelectAll, StreamExt};
use futures::SinkExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::abiencode::types::{Address, U256};
use crate::chain::{ChainError, ChainEvent, ChainService};
use crate::consensus_channel::{Change, ConsensusChannel, Proposal};
use crate::messages::WireError;
use crate::payments::{self, Voucher, VoucherError, VoucherManager};
use crate::protocols::{
    create_voucher_message, directdefund, directfund, virtualdefund, virtualfund, Message,
    Objective, ObjectiveError, ObjectiveId, ObjectivePayload, ObjectiveRequest, ObjectiveStatus,
    SideEffects, WaitingFor,
};
use crate::state::StateError;
use crate::store::{Store, StoreError};
use crate::types::Destination;
use crate::wire::MessageBus;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Objective(#[from] ObjectiveError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Voucher(#[from] VoucherError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("cannot determine objective kind from id {0}")]
    UnknownObjectiveKind(ObjectiveId),
    #[error("this node is not the payer on channel {0}")]
    NotPayer(Destination),
}

/// Decides whether an objective created by a peer should run.
pub trait PolicyMaker: Send {
    fn should_approve(&self, objective: &Objective) -> bool;
}

/// Approves everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissivePolicy;

impl PolicyMaker for PermissivePolicy {
    fn should_approve(&self, _objective: &Objective) -> bool {
        true
    }
}

/// API request to pay over a virtual channel.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub channel_id: Destination,
    pub amount: U256,
}

/// What one handled input changed, reported to the API when non-empty.
#[derive(Debug, Default)]
pub struct EngineEvent {
    pub completed_objectives: Vec<Objective>,
    pub failed_objectives: Vec<ObjectiveId>,
    pub received_vouchers: Vec<Voucher>,
}

impl EngineEvent {
    pub fn is_empty(&self) -> bool {
        self.completed_objectives.is_empty()
            && self.failed_objectives.is_empty()
            && self.received_vouchers.is_empty()
    }

    fn merge(&mut self, other: EngineEvent) {
        self.completed_objectives.extend(other.completed_objectives);
        self.failed_objectives.extend(other.failed_objectives);
        self.received_vouchers.extend(other.received_vouchers);
    }
}

/// The API half of an engine: request senders plus the event feed.
pub struct EngineHandle {
    pub objective_requests: mpsc::Sender<ObjectiveRequest>,
    pub payment_requests: mpsc::Sender<PaymentRequest>,
    pub engine_events: mpsc::Receiver<EngineEvent>,
}

enum Input {
    Request(ObjectiveRequest),
    Payment(PaymentRequest),
    Chain(ChainEvent),
    Peer(Message),
    Proposal(Proposal),
}

pub struct Engine<S, C, M, P> {
    store: S,
    chain: C,
    msg: M,
    policymaker: P,
    vm: VoucherManager,
    inputs: SelectAll<BoxStream<'static, Input>>,
    /// FIFO queue of proposals emitted by cranks, drained before any new
    /// external input is taken.
    internal_proposals: VecDeque<Proposal>,
    to_api: mpsc::Sender<EngineEvent>,
}

const API_QUEUE_DEPTH: usize = 100;

impl<S, C, M, P> Engine<S, C, M, P>
where
    S: Store + Send,
    C: ChainService,
    M: MessageBus,
    P: PolicyMaker,
{
    pub fn new(
        store: S,
        mut chain: C,
        msg: M,
        peer_inbox: mpsc::UnboundedReceiver<Message>,
        policymaker: P,
    ) -> (Engine<S, C, M, P>, EngineHandle) {
        let (objective_tx, objective_rx) = mpsc::channel(API_QUEUE_DEPTH);
        let (payment_tx, payment_rx) = mpsc::channel(API_QUEUE_DEPTH);
        let (api_tx, api_rx) = mpsc::channel(API_QUEUE_DEPTH);

        let chain_events = chain.event_feed();
        let vm = VoucherManager::new(store.get_address());

        let mut inputs = SelectAll::new();
        inputs.push(objective_rx.map(Input::Request).boxed());
        inputs.push(payment_rx.map(Input::Payment).boxed());
        inputs.push(chain_events.map(Input::Chain).boxed());
        inputs.push(peer_inbox.map(Input::Peer).boxed());

        let engine = Engine {
            store,
            chain,
            msg,
            policymaker,
            vm,
            inputs,
            internal_proposals: VecDeque::new(),
            to_api: api_tx,
        };
        let handle = EngineHandle {
            objective_requests: objective_tx,
            payment_requests: payment_tx,
            engine_events: api_rx,
        };
        (engine, handle)
    }

    /// Process inputs until every input source has closed. Exactly one input
    /// is handled to completion at a time, so handlers never race on the
    /// store.
    pub async fn run(mut self) {
        info!(address = %self.store.get_address(), "engine started");
        loop {
            let input = if let Some(p) = self.internal_proposals.pop_front() {
                Input::Proposal(p)
            } else {
                match self.inputs.next().await {
                    Some(input) => input,
                    None => break,
                }
            };

            let result = match input {
                Input::Request(request) => self.handle_objective_request(request),
                Input::Payment(request) => self.handle_payment_request(request),
                Input::Chain(event) => self.handle_chain_event(event),
                Input::Peer(message) => self.handle_message(message),
                Input::Proposal(proposal) => self.handle_proposal(proposal),
            };

            match result {
                Ok(event) if !event.is_empty() => {
                    for objective in &event.completed_objectives {
                        info!(objective = %objective.id(), "objective returned to API");
                    }
                    // Bounded: a slow API consumer backpressures the loop.
                    if self.to_api.send(event).await.is_err() {
                        debug!("API consumer gone, dropping engine event");
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "error in engine loop"),
            }
        }
        info!(address = %self.store.get_address(), "engine stopped");
    }

    fn handle_objective_request(
        &mut self,
        request: ObjectiveRequest,
    ) -> Result<EngineEvent, EngineError> {
        let my_address = self.store.get_address();
        let id = request.id(my_address)?;
        info!(objective = %id, "handling objective request");

        match self.construct_objective_from_request(request, my_address) {
            Ok(objective) => self.attempt_progress(objective),
            Err(err) => {
                warn!(objective = %id, %err, "could not create objective");
                Ok(EngineEvent {
                    failed_objectives: vec![id],
                    ..EngineEvent::default()
                })
            }
        }
    }

    fn construct_objective_from_request(
        &mut self,
        request: ObjectiveRequest,
        my_address: Address,
    ) -> Result<Objective, EngineError> {
        match request {
            ObjectiveRequest::DirectFund(req) => {
                let channel_exists = self.store.get_consensus_channel(req.counterparty).is_some()
                    || !self
                        .store
                        .get_channels_by_participant(req.counterparty)
                        .is_empty();
                Ok(Objective::DirectFund(directfund::new_objective(
                    &req,
                    true,
                    my_address,
                    channel_exists,
                )?))
            }
            ObjectiveRequest::VirtualFund(req) => {
                let first_hop = req
                    .intermediaries
                    .first()
                    .copied()
                    .ok_or(ObjectiveError::NoIntermediaries)?;
                let right = self.store.get_consensus_channel(first_hop);
                let vfo = virtualfund::new_objective(&req, true, my_address, None, right)?;
                self.register_payment_channel(&vfo)?;
                Ok(Objective::VirtualFund(vfo))
            }
            ObjectiveRequest::VirtualDefund(req) => {
                let channel = self
                    .store
                    .get_channel_by_id(req.channel_id)
                    .ok_or(StoreError::NoSuchChannel(req.channel_id))?;
                let paid = self.paid_so_far(req.channel_id)?;
                let (left, right) = self.neighbour_ledgers(channel.participants(), my_address)?;
                Ok(Objective::VirtualDefund(virtualdefund::new_objective(
                    channel, true, paid, left, right,
                )?))
            }
            ObjectiveRequest::DirectDefund(req) => {
                let ledger = self
                    .store
                    .get_consensus_channel_by_id(req.channel_id)
                    .ok_or(StoreError::NoSuchChannel(req.channel_id))?;
                let ddfo = directdefund::new_objective(true, ledger)?;
                // a Channel takes over governance of the ledger
                self.store.destroy_consensus_channel(req.channel_id);
                Ok(Objective::DirectDefund(ddfo))
            }
        }
    }

    fn handle_payment_request(
        &mut self,
        request: PaymentRequest,
    ) -> Result<EngineEvent, EngineError> {
        let channel = self
            .store
            .get_channel_by_id(request.channel_id)
            .ok_or(StoreError::NoSuchChannel(request.channel_id))?;
        if payments::payer(channel.participants()) != self.store.get_address() {
            return Err(EngineError::NotPayer(request.channel_id));
        }
        let sk = self.store.get_channel_secret_key();
        let voucher = self.vm.pay(request.channel_id, request.amount, &sk)?;
        let payee = payments::payee(channel.participants());
        self.execute_side_effects(SideEffects {
            messages_to_send: vec![create_voucher_message(payee, voucher)],
            ..SideEffects::default()
        });
        Ok(EngineEvent::default())
    }

    fn handle_chain_event(&mut self, event: ChainEvent) -> Result<EngineEvent, EngineError> {
        debug!(channel = %event.channel_id(), "handling chain event");
        // events for channels no objective owns are not ours to handle
        let Some(objective) = self.store.get_objective_by_channel_id(event.channel_id()) else {
            return Ok(EngineEvent::default());
        };
        if matches!(
            objective.status(),
            ObjectiveStatus::Completed | ObjectiveStatus::Rejected
        ) {
            return Ok(EngineEvent::default());
        }
        if !objective.is_chain_event_handler() {
            return Err(ObjectiveError::NotChainEventHandler.into());
        }
        let updated = objective.update_with_chain_event(&event)?;
        self.attempt_progress(updated)
    }

    fn handle_message(&mut self, message: Message) -> Result<EngineEvent, EngineError> {
        debug!(summary = %message.summarize(), "handling message");
        let mut event = EngineEvent::default();

        for payload in &message.objective_payloads {
            let objective = match self.get_or_create_objective(payload) {
                Ok(objective) => objective,
                Err(err) => {
                    warn!(objective = %payload.objective_id, %err, "dropping payload");
                    continue;
                }
            };

            let objective = if objective.status() == ObjectiveStatus::Unapproved {
                if self.policymaker.should_approve(&objective) {
                    let approved = objective.approve();
                    if let Objective::DirectDefund(ddfo) = &approved {
                        // governance moved to the closing Channel
                        self.store.destroy_consensus_channel(ddfo.c.id);
                    }
                    approved
                } else {
                    let (rejected, side_effects) = objective.reject();
                    self.store.set_objective(&rejected)?;
                    event.completed_objectives.push(rejected);
                    self.execute_side_effects(side_effects);
                    continue;
                }
            } else {
                objective
            };

            match objective.status() {
                ObjectiveStatus::Completed | ObjectiveStatus::Rejected => {
                    debug!(objective = %objective.id(), "ignoring payload for finished objective");
                    continue;
                }
                _ => {}
            }

            let updated = match objective.update(payload) {
                Ok(updated) => updated,
                Err(err) => {
                    warn!(objective = %objective.id(), %err, "payload rejected");
                    continue;
                }
            };
            event.merge(self.attempt_progress(updated)?);
        }

        for sp in &message.ledger_proposals {
            let id = proposal_objective_id(&sp.proposal);
            let objective = match self.store.get_objective_by_id(&id) {
                Ok(objective) => objective,
                Err(err) => {
                    warn!(objective = %id, %err, "proposal for unknown objective");
                    continue;
                }
            };
            if objective.status() == ObjectiveStatus::Completed {
                debug!(objective = %id, "ignoring proposal for completed objective");
                continue;
            }
            // out-of-order or invalid proposals fail here without mutating
            // anything; the sender re-cranks and retries
            let updated = match objective.receive_proposal(sp.clone()) {
                Ok(updated) => updated,
                Err(err) => {
                    warn!(objective = %id, %err, "proposal rejected");
                    continue;
                }
            };
            event.merge(self.attempt_progress(updated)?);
        }

        for rejected_id in &message.rejected_objectives {
            let objective = match self.store.get_objective_by_id(rejected_id) {
                Ok(objective) => objective,
                Err(err) => {
                    warn!(objective = %rejected_id, %err, "rejection for unknown objective");
                    continue;
                }
            };
            if objective.status() == ObjectiveStatus::Rejected {
                continue;
            }
            // the rejecting peer has already notified everyone else, so the
            // outbound notices are dropped
            let (rejected, _) = objective.reject();
            self.store.set_objective(&rejected)?;
            event.completed_objectives.push(rejected);
        }

        for voucher in &message.payments {
            match self.vm.receive(voucher) {
                Ok(total) => {
                    debug!(channel = %voucher.channel_id, %total, "accepted voucher");
                    event.received_vouchers.push(voucher.clone());
                }
                Err(err) => warn!(channel = %voucher.channel_id, %err, "rejected voucher"),
            }
        }

        Ok(event)
    }

    /// A proposal applied locally by one objective re-enters the loop here
    /// so another objective waiting on the same ledger can make progress.
    fn handle_proposal(&mut self, proposal: Proposal) -> Result<EngineEvent, EngineError> {
        let id = proposal_objective_id(&proposal);
        let objective = match self.store.get_objective_by_id(&id) {
            Ok(objective) => objective,
            Err(_) => {
                debug!(objective = %id, "internal proposal for unknown objective");
                return Ok(EngineEvent::default());
            }
        };
        if objective.status() == ObjectiveStatus::Completed {
            return Ok(EngineEvent::default());
        }
        self.attempt_progress(objective)
    }

    /// Crank an objective, persist the result, and dispatch its side
    /// effects.
    fn attempt_progress(&mut self, objective: Objective) -> Result<EngineEvent, EngineError> {
        let mut event = EngineEvent::default();
        let sk = self.store.get_channel_secret_key();

        let (cranked, side_effects, waiting_for) = match objective.crank(&sk) {
            Ok(result) => result,
            Err(err) => {
                warn!(objective = %objective.id(), %err, "crank failed");
                event.failed_objectives.push(objective.id());
                return Ok(event);
            }
        };
        debug!(objective = %cranked.id(), %waiting_for, "cranked objective");

        let cranked = if waiting_for == WaitingFor::Nothing {
            cranked.with_status(ObjectiveStatus::Completed)
        } else {
            cranked
        };
        self.store.set_objective(&cranked)?;

        if waiting_for == WaitingFor::Nothing {
            self.store
                .release_channel_from_ownership(cranked.owned_channel_id());
            match &cranked {
                Objective::DirectFund(dfo) => {
                    // the consensus ledger takes over governance
                    let ledger = dfo.create_consensus_channel()?;
                    self.store.set_consensus_channel(&ledger);
                    self.store.destroy_channel(ledger.id);
                }
                Objective::VirtualDefund(vdfo) => {
                    self.store.destroy_channel(vdfo.v.id);
                }
                _ => {}
            }
            event.completed_objectives.push(cranked);
        }

        self.execute_side_effects(side_effects);
        Ok(event)
    }

    /// Messages first, then transactions, then internal proposals. Send
    /// failures are logged and tolerated: cranks re-emit their effects until
    /// the observable state moves.
    fn execute_side_effects(&mut self, side_effects: SideEffects) {
        for message in side_effects.messages_to_send {
            debug!(summary = %message.summarize(), "sending message");
            if let Err(err) = self.msg.send(message) {
                warn!(%err, "message send failed");
            }
        }
        for tx in side_effects.transactions_to_submit {
            debug!(channel = %tx.channel_id(), "submitting transaction");
            if let Err(err) = self.chain.send_transaction(tx) {
                warn!(%err, "transaction submission failed");
            }
        }
        for proposal in side_effects.proposals_to_process {
            self.internal_proposals.push_back(proposal);
        }
    }

    fn get_or_create_objective(
        &mut self,
        payload: &ObjectivePayload,
    ) -> Result<Objective, EngineError> {
        match self.store.get_objective_by_id(&payload.objective_id) {
            Ok(objective) => Ok(objective),
            Err(StoreError::NoSuchObjective(_)) => {
                let objective = self.construct_objective_from_payload(payload)?;
                self.store.set_objective(&objective)?;
                info!(objective = %objective.id(), "created objective from message");
                Ok(objective)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn construct_objective_from_payload(
        &mut self,
        payload: &ObjectivePayload,
    ) -> Result<Objective, EngineError> {
        let id = &payload.objective_id;
        let my_address = self.store.get_address();

        if directfund::is_direct_fund_objective(id) {
            Ok(Objective::DirectFund(directfund::construct_from_payload(
                payload, my_address,
            )?))
        } else if virtualfund::is_virtual_fund_objective(id) {
            let participants = payload.signed_state.state().participants.clone();
            let (left, right) = self.neighbour_ledgers(&participants, my_address)?;
            let vfo = virtualfund::construct_from_payload(payload, my_address, left, right)?;
            self.register_payment_channel(&vfo)?;
            Ok(Objective::VirtualFund(vfo))
        } else if virtualdefund::is_virtual_defund_objective(id) {
            let v_id = virtualdefund::virtual_channel_from_objective_id(id)
                .ok_or_else(|| EngineError::UnknownObjectiveKind(id.clone()))?;
            let channel = self
                .store
                .get_channel_by_id(v_id)
                .ok_or(StoreError::NoSuchChannel(v_id))?;
            let paid = self.paid_so_far(v_id)?;
            let (left, right) = self.neighbour_ledgers(channel.participants(), my_address)?;
            Ok(Objective::VirtualDefund(
                virtualdefund::construct_from_payload(payload, channel, paid, left, right)?,
            ))
        } else if directdefund::is_direct_defund_objective(id) {
            let channel_id = payload.signed_state.state().channel_id()?;
            let ledger = self
                .store
                .get_consensus_channel_by_id(channel_id)
                .ok_or(StoreError::NoSuchChannel(channel_id))?;
            Ok(Objective::DirectDefund(directdefund::construct_from_payload(
                payload, ledger,
            )?))
        } else {
            Err(EngineError::UnknownObjectiveKind(id.clone()))
        }
    }

    /// The ledgers shared with the previous and next hop of a virtual
    /// channel's participant list, from this node's position in it.
    fn neighbour_ledgers(
        &self,
        participants: &[Address],
        my_address: Address,
    ) -> Result<(Option<ConsensusChannel>, Option<ConsensusChannel>), EngineError> {
        let role = participants
            .iter()
            .position(|p| *p == my_address)
            .ok_or(ObjectiveError::NotParticipant { my_address })?;
        let left = if role > 0 {
            self.store.get_consensus_channel(participants[role - 1])
        } else {
            None
        };
        let right = if role + 1 < participants.len() {
            self.store.get_consensus_channel(participants[role + 1])
        } else {
            None
        };
        Ok((left, right))
    }

    fn paid_so_far(&self, channel_id: Destination) -> Result<U256, EngineError> {
        if self.vm.channel_registered(channel_id) {
            Ok(self.vm.balance(channel_id)?.paid)
        } else {
            Ok(U256::zero())
        }
    }

    /// Payer and payee track the channel balance; intermediaries do not.
    fn register_payment_channel(
        &mut self,
        vfo: &virtualfund::Objective,
    ) -> Result<(), EngineError> {
        let participants = vfo.v.participants();
        let payer = payments::payer(participants);
        let payee = payments::payee(participants);
        let me = self.store.get_address();
        if me == payer || me == payee {
            self.vm
                .register(vfo.v.id, payer, payee, vfo.payer_balance())?;
        }
        Ok(())
    }
}

fn proposal_objective_id(proposal: &Proposal) -> ObjectiveId {
    match &proposal.change {
        Change::Add(_) => format!("{}{}", virtualfund::OBJECTIVE_PREFIX, proposal.target()),
        Change::Remove(_) => format!("{}{}", virtualdefund::OBJECTIVE_PREFIX, proposal.target()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChain;
    use crate::store::MemStore;
    use crate::testactors::{alice, bob, test_state, Actor};
    use crate::wire::TestMessageBus;
    use futures::executor::block_on;
    use std::sync::{Arc, Mutex};

    /// A [MemStore] that stays inspectable after the engine takes it.
    #[derive(Clone)]
    struct SharedStore(Arc<Mutex<MemStore>>);

    impl SharedStore {
        fn new(actor: &Actor) -> SharedStore {
            SharedStore(Arc::new(Mutex::new(MemStore::new(actor.secret_key()))))
        }
    }

    impl Store for SharedStore {
        fn get_address(&self) -> Address {
            self.0.lock().unwrap().get_address()
        }
        fn get_channel_secret_key(&self) -> secp256k1::SecretKey {
            self.0.lock().unwrap().get_channel_secret_key()
        }
        fn get_objective_by_id(&self, id: &str) -> Result<Objective, StoreError> {
            self.0.lock().unwrap().get_objective_by_id(id)
        }
        fn get_objective_by_channel_id(&self, channel_id: Destination) -> Option<Objective> {
            self.0.lock().unwrap().get_objective_by_channel_id(channel_id)
        }
        fn set_objective(&mut self, objective: &Objective) -> Result<(), StoreError> {
            self.0.lock().unwrap().set_objective(objective)
        }
        fn release_channel_from_ownership(&mut self, channel_id: Destination) {
            self.0
                .lock()
                .unwrap()
                .release_channel_from_ownership(channel_id)
        }
        fn get_channel_by_id(&self, id: Destination) -> Option<crate::channel::Channel> {
            self.0.lock().unwrap().get_channel_by_id(id)
        }
        fn set_channel(&mut self, channel: &crate::channel::Channel) {
            self.0.lock().unwrap().set_channel(channel)
        }
        fn destroy_channel(&mut self, id: Destination) {
            self.0.lock().unwrap().destroy_channel(id)
        }
        fn get_channels_by_participant(&self, participant: Address) -> Vec<crate::channel::Channel> {
            self.0.lock().unwrap().get_channels_by_participant(participant)
        }
        fn get_consensus_channel_by_id(&self, id: Destination) -> Option<ConsensusChannel> {
            self.0.lock().unwrap().get_consensus_channel_by_id(id)
        }
        fn get_consensus_channel(&self, counterparty: Address) -> Option<ConsensusChannel> {
            self.0.lock().unwrap().get_consensus_channel(counterparty)
        }
        fn set_consensus_channel(&mut self, channel: &ConsensusChannel) {
            self.0.lock().unwrap().set_consensus_channel(channel)
        }
        fn destroy_consensus_channel(&mut self, id: Destination) {
            self.0.lock().unwrap().destroy_consensus_channel(id)
        }
    }

    struct RejectAll;
    impl PolicyMaker for RejectAll {
        fn should_approve(&self, _objective: &Objective) -> bool {
            false
        }
    }

    fn spawn_engine<P: PolicyMaker + Send + 'static>(
        actor: &Actor,
        chain: &MockChain,
        bus: &TestMessageBus,
        policymaker: P,
    ) -> (SharedStore, EngineHandle) {
        let store = SharedStore::new(actor);
        let inbox = bus.register(actor.address());
        let (engine, handle) = Engine::new(
            store.clone(),
            chain.clone(),
            bus.clone(),
            inbox,
            policymaker,
        );
        std::thread::spawn(move || block_on(engine.run()));
        (store, handle)
    }

    fn directfund_request() -> directfund::ObjectiveRequest {
        let state = test_state(vec![alice().address(), bob().address()], 0);
        directfund::ObjectiveRequest {
            counterparty: bob().address(),
            chain_id: state.chain_id,
            challenge_duration: state.challenge_duration,
            outcome: state.outcome,
            app_definition: state.app_definition,
            app_data: Vec::new(),
            nonce: state.channel_nonce,
        }
    }

    fn wait_for_completion(handle: &mut EngineHandle, id: &str) -> Objective {
        loop {
            let event = block_on(handle.engine_events.next()).expect("engine event stream ended");
            assert!(
                event.failed_objectives.is_empty(),
                "objectives failed: {:?}",
                event.failed_objectives
            );
            if let Some(objective) = event
                .completed_objectives
                .into_iter()
                .find(|o| o.id() == id)
            {
                return objective;
            }
        }
    }

    #[test]
    fn two_party_direct_funding() {
        let chain = MockChain::new();
        let bus = TestMessageBus::new();
        let (alice_store, mut alice_handle) =
            spawn_engine(&alice(), &chain, &bus, PermissivePolicy);
        let (bob_store, mut bob_handle) = spawn_engine(&bob(), &chain, &bus, PermissivePolicy);

        let request = directfund_request();
        let id = request.id(alice().address()).unwrap();
        block_on(
            alice_handle
                .objective_requests
                .send(ObjectiveRequest::DirectFund(request)),
        )
        .unwrap();

        let done_a = wait_for_completion(&mut alice_handle, &id);
        let done_b = wait_for_completion(&mut bob_handle, &id);
        assert_eq!(done_a.status(), ObjectiveStatus::Completed);
        assert_eq!(done_b.status(), ObjectiveStatus::Completed);

        // both stores hold a fresh consensus ledger at turn 1, 5/5
        for (store, is_leader) in [(&alice_store, true), (&bob_store, false)] {
            let ledger = store
                .get_consensus_channel(if is_leader {
                    bob().address()
                } else {
                    alice().address()
                })
                .expect("consensus channel missing");
            assert_eq!(ledger.is_leader(), is_leader);
            assert_eq!(ledger.consensus_vars().turn_num, 1);
            assert!(ledger.proposal_queue().is_empty());
            assert_eq!(
                ledger.consensus_vars().outcome.leader.amount,
                U256::from(5)
            );
            assert_eq!(
                ledger.consensus_vars().outcome.follower.amount,
                U256::from(5)
            );
            // the plain channel was destroyed in the hand-over
            assert!(store.get_channel_by_id(ledger.id).is_none());
        }

        // the chain saw both deposits
        let ledger = alice_store.get_consensus_channel(bob().address()).unwrap();
        assert_eq!(chain.holdings(ledger.id, Address::default()), U256::from(10));
    }

    #[test]
    fn rejection_propagates_to_the_initiator() {
        let chain = MockChain::new();
        let bus = TestMessageBus::new();
        let (_, mut alice_handle) = spawn_engine(&alice(), &chain, &bus, PermissivePolicy);
        let (_, mut bob_handle) = spawn_engine(&bob(), &chain, &bus, RejectAll);

        let request = directfund_request();
        let id = request.id(alice().address()).unwrap();
        block_on(
            alice_handle
                .objective_requests
                .send(ObjectiveRequest::DirectFund(request)),
        )
        .unwrap();

        // bob rejects on first sight and tells alice
        let rejected_b = loop {
            let event = block_on(bob_handle.engine_events.next()).unwrap();
            if let Some(o) = event.completed_objectives.into_iter().find(|o| o.id() == id) {
                break o;
            }
        };
        assert_eq!(rejected_b.status(), ObjectiveStatus::Rejected);

        let rejected_a = loop {
            let event = block_on(alice_handle.engine_events.next()).unwrap();
            if let Some(o) = event.completed_objectives.into_iter().find(|o| o.id() == id) {
                break o;
            }
        };
        assert_eq!(rejected_a.status(), ObjectiveStatus::Rejected);
    }

    #[test]
    fn chain_events_for_unknown_channels_are_dropped() {
        let chain = MockChain::new();
        let bus = TestMessageBus::new();
        let (_, mut alice_handle) = spawn_engine(&alice(), &chain, &bus, PermissivePolicy);

        // a deposit to a channel nobody owns
        let mut foreign_chain = chain.clone();
        foreign_chain
            .send_transaction(crate::chain::ChainTransaction::Deposit {
                channel_id: Destination([0x42; 32]),
                deposit: [(Address::default(), U256::from(1))].into_iter().collect(),
            })
            .unwrap();

        // the engine keeps running: a subsequent funding completes normally
        let (_, mut bob_handle) = spawn_engine(&bob(), &chain, &bus, PermissivePolicy);
        let request = directfund_request();
        let id = request.id(alice().address()).unwrap();
        block_on(
            alice_handle
                .objective_requests
                .send(ObjectiveRequest::DirectFund(request)),
        )
        .unwrap();
        wait_for_completion(&mut alice_handle, &id);
        wait_for_completion(&mut bob_handle, &id);
    }
}
