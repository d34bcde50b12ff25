//! The adjudicator seen from off-chain: an event feed plus transaction
//! submission. [MockChain] simulates it for tests and local development.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::channel::mpsc;
use thiserror::Error;
use tracing::debug;

use crate::abiencode::{self, types::{Address, U256}};
use crate::outcome::MAX_TX_DATA_SIZE;
use crate::state::SignedState;
use crate::types::{Destination, Funds};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("transaction data of {0} bytes exceeds the limit")]
    TxTooLarge(usize),
    #[error("transaction could not be encoded: {0}")]
    Encoding(#[from] abiencode::Error),
    #[error("chain connection closed")]
    Closed,
}

/// Events emitted by the adjudicator, delivered in block order.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    Deposited {
        channel_id: Destination,
        asset: Address,
        amount: U256,
        now_held: U256,
        block_num: u64,
    },
    AllocationUpdated {
        channel_id: Destination,
        asset: Address,
        now_held: U256,
        block_num: u64,
    },
    Concluded {
        channel_id: Destination,
        block_num: u64,
    },
    ChallengeRegistered {
        channel_id: Destination,
        block_num: u64,
    },
}

impl ChainEvent {
    pub fn channel_id(&self) -> Destination {
        match self {
            ChainEvent::Deposited { channel_id, .. }
            | ChainEvent::AllocationUpdated { channel_id, .. }
            | ChainEvent::Concluded { channel_id, .. }
            | ChainEvent::ChallengeRegistered { channel_id, .. } => *channel_id,
        }
    }
}

/// Transactions the node submits to the adjudicator. The happy-path engine
/// only ever emits deposits; the conclude/withdraw/challenge paths are
/// triggered externally.
#[derive(Debug, Clone)]
pub enum ChainTransaction {
    Deposit {
        channel_id: Destination,
        deposit: Funds,
    },
    Conclude {
        channel_id: Destination,
        candidate: SignedState,
    },
    WithdrawAll {
        channel_id: Destination,
        candidate: SignedState,
    },
    Challenge {
        channel_id: Destination,
        candidate: SignedState,
        proof: Vec<SignedState>,
    },
}

impl ChainTransaction {
    pub fn channel_id(&self) -> Destination {
        match self {
            ChainTransaction::Deposit { channel_id, .. }
            | ChainTransaction::Conclude { channel_id, .. }
            | ChainTransaction::WithdrawAll { channel_id, .. }
            | ChainTransaction::Challenge { channel_id, .. } => *channel_id,
        }
    }

    /// The encoded size of the transaction's state payload(s).
    fn data_size(&self) -> Result<usize, ChainError> {
        let states: Vec<&SignedState> = match self {
            ChainTransaction::Deposit { .. } => vec![],
            ChainTransaction::Conclude { candidate, .. }
            | ChainTransaction::WithdrawAll { candidate, .. } => vec![candidate],
            ChainTransaction::Challenge {
                candidate, proof, ..
            } => std::iter::once(candidate).chain(proof.iter()).collect(),
        };
        let mut size = 0;
        for ss in states {
            size += abiencode::to_bytes(ss.state())?.len();
        }
        Ok(size)
    }
}

/// What the engine needs from a chain connection.
pub trait ChainService: Send {
    /// Subscribe to the adjudicator's events. Every call returns an
    /// independent feed.
    fn event_feed(&mut self) -> mpsc::UnboundedReceiver<ChainEvent>;
    fn send_transaction(&mut self, tx: ChainTransaction) -> Result<(), ChainError>;
}

#[derive(Default)]
struct MockChainState {
    holdings: HashMap<(Destination, Address), U256>,
    block_num: u64,
    subscribers: Vec<mpsc::UnboundedSender<ChainEvent>>,
}

impl MockChainState {
    fn broadcast(&mut self, event: ChainEvent) {
        self.subscribers
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }
}

/// An in-process adjudicator stand-in shared by every node of a test
/// network: deposits accumulate into a holdings map and are broadcast to
/// all subscribers in block order.
#[derive(Clone, Default)]
pub struct MockChain(Arc<Mutex<MockChainState>>);

impl MockChain {
    pub fn new() -> MockChain {
        MockChain::default()
    }

    pub fn holdings(&self, channel_id: Destination, asset: Address) -> U256 {
        let state = self.0.lock().unwrap();
        state
            .holdings
            .get(&(channel_id, asset))
            .copied()
            .unwrap_or_default()
    }
}

impl ChainService for MockChain {
    fn event_feed(&mut self) -> mpsc::UnboundedReceiver<ChainEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.0.lock().unwrap().subscribers.push(tx);
        rx
    }

    fn send_transaction(&mut self, tx: ChainTransaction) -> Result<(), ChainError> {
        let size = tx.data_size()?;
        if size > MAX_TX_DATA_SIZE {
            return Err(ChainError::TxTooLarge(size));
        }

        let mut state = self.0.lock().unwrap();
        state.block_num += 1;
        let block_num = state.block_num;
        debug!(?tx, block_num, "mock chain transaction");

        match tx {
            ChainTransaction::Deposit {
                channel_id,
                deposit,
            } => {
                for (asset, amount) in deposit.0 {
                    let held = state
                        .holdings
                        .entry((channel_id, asset))
                        .or_insert_with(U256::zero);
                    *held = *held + amount;
                    let now_held = *held;
                    state.broadcast(ChainEvent::Deposited {
                        channel_id,
                        asset,
                        amount,
                        now_held,
                        block_num,
                    });
                }
            }
            ChainTransaction::Conclude { channel_id, .. } => {
                state.broadcast(ChainEvent::Concluded {
                    channel_id,
                    block_num,
                });
            }
            ChainTransaction::WithdrawAll { channel_id, candidate } => {
                for exit in &candidate.state().outcome.0 {
                    let asset = exit.asset;
                    state.holdings.insert((channel_id, asset), U256::zero());
                    state.broadcast(ChainEvent::AllocationUpdated {
                        channel_id,
                        asset,
                        now_held: U256::zero(),
                        block_num,
                    });
                }
            }
            ChainTransaction::Challenge { channel_id, .. } => {
                state.broadcast(ChainEvent::ChallengeRegistered {
                    channel_id,
                    block_num,
                });
            }
        }
        Ok(())
    }
}
