//! In-process publish/subscribe for ephemeral notifications (watch streams,
//! ingress table rebuilds). Durable state changes already live in the log;
//! this bus exists only to wake subscribers promptly. A slow subscriber may
//! miss events and must re-list on reconnect.

use tokio::sync::broadcast;

use crate::model::{ContainerInstance, Ingress, Node, TlsCertificate};

const QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum Event {
    ContainerChanged(ContainerInstance),
    ContainerDeleted(String),
    NodeChanged(Node),
    IngressChanged(Ingress),
    IngressDeleted(String),
    TlsCertificateChanged(TlsCertificate),
}

pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(QUEUE_CAPACITY);
        EventBus { sender }
    }

    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}
