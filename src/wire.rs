//! The transport seam between the engine and the peer-to-peer network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::channel::mpsc;
use tracing::debug;

use crate::abiencode::types::Address;
use crate::messages::WireError;
use crate::protocols::Message;

/// Outbound half of the peer transport. The inbound half is a plain
/// [mpsc::UnboundedReceiver] handed to the engine at construction, so a bus
/// implementation decides its own delivery mechanics.
pub trait MessageBus: Send {
    fn send(&mut self, msg: Message) -> Result<(), WireError>;
}

/// An in-process network hub for tests and demos: every registered address
/// gets an inbox, and each message passes through the real JSON wire format
/// on the way.
#[derive(Clone, Default)]
pub struct TestMessageBus(Arc<Mutex<HashMap<Address, mpsc::UnboundedSender<Message>>>>);

impl TestMessageBus {
    pub fn new() -> TestMessageBus {
        TestMessageBus::default()
    }

    /// Register a node and return its inbox.
    pub fn register(&self, address: Address) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded();
        self.0.lock().unwrap().insert(address, tx);
        rx
    }
}

impl MessageBus for TestMessageBus {
    fn send(&mut self, msg: Message) -> Result<(), WireError> {
        // Round-trip through the wire encoding so tests exercise it.
        let raw = msg.serialize()?;
        let parsed = Message::deserialize(&raw)?;
        debug!(summary = %parsed.summarize(), "delivering message");

        let peers = self.0.lock().unwrap();
        let inbox = peers
            .get(&parsed.to)
            .ok_or(WireError::UnknownPeer(parsed.to))?;
        inbox
            .unbounded_send(parsed)
            .map_err(|_| WireError::UnknownPeer(msg.to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testactors::{alice, bob};
    use futures::StreamExt;

    #[test]
    fn messages_are_routed_by_address() {
        let bus = TestMessageBus::new();
        let mut alice_inbox = bus.register(alice().address());
        let mut bob_inbox = bus.register(bob().address());

        let mut sender = bus.clone();
        sender
            .send(Message {
                to: bob().address(),
                rejected_objectives: vec!["DirectFunding-0x01".to_string()],
                ..Message::default()
            })
            .unwrap();

        let got = futures::executor::block_on(bob_inbox.next()).unwrap();
        assert_eq!(got.rejected_objectives, vec!["DirectFunding-0x01".to_string()]);
        assert!(alice_inbox.try_next().is_err()); // nothing for alice

        // unknown peers are an error
        let err = sender.send(Message {
            to: crate::testactors::irene().address(),
            ..Message::default()
        });
        assert!(matches!(err, Err(WireError::UnknownPeer(_))));
    }
}
