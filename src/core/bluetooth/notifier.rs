//! Fan-out of link events to whoever is presenting them.

use log::debug;
use tokio::sync::broadcast;

use crate::core::bluetooth::constants::EVENT_CHANNEL_CAPACITY;
use crate::core::bluetooth::types::LinkEvent;

#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<LinkEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: LinkEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!("No listener for event {:?}", e.0);
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
