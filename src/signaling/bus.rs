//! The `Bus` abstraction (SPEC_FULL.md §4.5) and an in-process
//! [`MemoryBus`] implementation used by every test in this crate.

use crate::error::Result;
use async_trait::async_trait;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

pub type MessageHandler = Rc<dyn Fn(&str, &[u8])>;

/// Connect/disconnect to a pub/sub bus, subscribe to topics, publish
/// framed byte payloads, and receive them. Not `Send`: every implementor
/// lives on the single cooperative event loop described in SPEC_FULL.md §5.
#[async_trait(?Send)]
pub trait Bus {
    async fn connect(&self) -> Result<()>;
    async fn subscribe(&self, topic: &str) -> Result<()>;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
    fn on_message(&self, handler: impl Fn(&str, &[u8]) + 'static)
    where
        Self: Sized;
    async fn disconnect(&self) -> Result<()>;
}

/// A shared in-process broker: every [`MemoryBus`] constructed with a
/// clone of the same `Rc<MemoryBroker>` can see each other's publications,
/// exactly like two WebSocket clients against one real MQTT broker.
#[derive(Default)]
pub struct MemoryBroker {
    topics: RefCell<HashMap<String, Vec<(u64, MessageHandler)>>>,
    next_id: Cell<u64>,
}

impl MemoryBroker {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    fn subscribe(self: &Rc<Self>, topic: &str, handler: MessageHandler) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.topics.borrow_mut().entry(topic.to_string()).or_default().push((id, handler));
        id
    }

    fn publish(&self, topic: &str, payload: &[u8]) {
        if let Some(subscribers) = self.topics.borrow().get(topic) {
            for (_, handler) in subscribers.clone() {
                handler(topic, payload);
            }
        }
    }
}

pub struct MemoryBus {
    broker: Rc<MemoryBroker>,
    message_handler: Rc<RefCell<Option<MessageHandler>>>,
    connected: Cell<bool>,
}

impl MemoryBus {
    pub fn new(broker: Rc<MemoryBroker>) -> Self {
        MemoryBus { broker, message_handler: Rc::new(RefCell::new(None)), connected: Cell::new(false) }
    }
}

#[async_trait(?Send)]
impl Bus for MemoryBus {
    async fn connect(&self) -> Result<()> {
        self.connected.set(true);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        let forwarder = self.message_handler.clone();
        self.broker.subscribe(
            topic,
            Rc::new(move |topic, payload| {
                if let Some(handler) = forwarder.borrow().as_ref() {
                    handler(topic, payload);
                }
            }),
        );
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if !self.connected.get() {
            return Err(crate::error::Error::Disconnected);
        }
        self.broker.publish(topic, &payload);
        Ok(())
    }

    fn on_message(&self, handler: impl Fn(&str, &[u8]) + 'static) {
        *self.message_handler.borrow_mut() = Some(Rc::new(handler));
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.set(false);
        Ok(())
    }
}
