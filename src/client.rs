//! A thin, synchronous API facade over an engine running on its own thread.

use futures::channel::mpsc;
use futures::executor::block_on;
use futures::{SinkExt, StreamExt};
use thiserror::Error;

use crate::abiencode::types::{Address, U256};
use crate::chain::ChainService;
use crate::engine::{Engine, EngineEvent, EngineHandle, PaymentRequest, PolicyMaker};
use crate::protocols::{
    directdefund, directfund, virtualdefund, virtualfund, Message, ObjectiveError, ObjectiveId,
    ObjectiveRequest,
};
use crate::store::Store;
use crate::types::Destination;
use crate::wire::MessageBus;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("the engine has shut down")]
    EngineGone,
    #[error(transparent)]
    Objective(#[from] ObjectiveError),
}

/// One node of the network: owns the engine loop thread and exposes the
/// objective / payment API.
pub struct Client {
    address: Address,
    objective_requests: mpsc::Sender<ObjectiveRequest>,
    payment_requests: mpsc::Sender<PaymentRequest>,
    engine_events: mpsc::Receiver<EngineEvent>,
}

impl Client {
    pub fn new<S, C, M, P>(
        store: S,
        chain: C,
        msg: M,
        peer_inbox: mpsc::UnboundedReceiver<Message>,
        policymaker: P,
    ) -> Client
    where
        S: Store + Send + 'static,
        C: ChainService + 'static,
        M: MessageBus + 'static,
        P: PolicyMaker + 'static,
    {
        let address = store.get_address();
        let (engine, handle) = Engine::new(store, chain, msg, peer_inbox, policymaker);
        std::thread::spawn(move || block_on(engine.run()));
        let EngineHandle {
            objective_requests,
            payment_requests,
            engine_events,
        } = handle;
        Client {
            address,
            objective_requests,
            payment_requests,
            engine_events,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Open a directly-funded ledger channel. Returns the objective id and
    /// the channel id it will produce.
    pub fn create_ledger_channel(
        &mut self,
        request: directfund::ObjectiveRequest,
    ) -> Result<(ObjectiveId, Destination), ClientError> {
        let id = request.id(self.address)?;
        let channel_id = request.channel_id(self.address)?;
        self.send_request(ObjectiveRequest::DirectFund(request))?;
        Ok((id, channel_id))
    }

    /// Cooperatively close a ledger channel.
    pub fn close_ledger_channel(
        &mut self,
        channel_id: Destination,
    ) -> Result<ObjectiveId, ClientError> {
        let request = directdefund::ObjectiveRequest { channel_id };
        let id = request.id();
        self.send_request(ObjectiveRequest::DirectDefund(request))?;
        Ok(id)
    }

    /// Open a virtual payment channel through intermediaries.
    pub fn create_virtual_channel(
        &mut self,
        request: virtualfund::ObjectiveRequest,
    ) -> Result<(ObjectiveId, Destination), ClientError> {
        let id = request.id(self.address)?;
        let channel_id = request.channel_id(self.address)?;
        self.send_request(ObjectiveRequest::VirtualFund(request))?;
        Ok((id, channel_id))
    }

    /// Settle and close a virtual channel.
    pub fn close_virtual_channel(
        &mut self,
        channel_id: Destination,
    ) -> Result<ObjectiveId, ClientError> {
        let request = virtualdefund::ObjectiveRequest { channel_id };
        let id = request.id();
        self.send_request(ObjectiveRequest::VirtualDefund(request))?;
        Ok(id)
    }

    /// Pay `amount` more on a virtual channel.
    pub fn pay(&mut self, channel_id: Destination, amount: U256) -> Result<(), ClientError> {
        block_on(self.payment_requests.send(PaymentRequest { channel_id, amount }))
            .map_err(|_| ClientError::EngineGone)
    }

    /// Block until the engine reports its next batch of changes.
    pub fn next_event(&mut self) -> Result<EngineEvent, ClientError> {
        block_on(self.engine_events.next()).ok_or(ClientError::EngineGone)
    }

    fn send_request(&mut self, request: ObjectiveRequest) -> Result<(), ClientError> {
        block_on(self.objective_requests.send(request)).map_err(|_| ClientError::EngineGone)
    }
}
