//! Notification handling for the cart
//! Decodes inbound frames and turns tag scans into cart updates.

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::codec::{self, TagEvent};
use crate::core::bluetooth::notifier::Notifier;
use crate::core::bluetooth::types::LinkEvent;
use crate::core::cart::{AddOutcome, SharedLedger};
use crate::core::services::InventoryLookup;

/// What became of one notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Framing was broken
    Malformed,
    /// Not a tag scan, or a tag scan without an id
    Ignored,
    UnknownItem,
    /// The catalogue could not be read
    LookupFailed,
    Added { quantity: u32 },
    StockExhausted,
    /// The session ended while the lookup was running
    Stale,
}

/// Notification handler for cart data
#[derive(Clone)]
pub struct NotificationHandler {
    ledger: SharedLedger,
    inventory: Arc<dyn InventoryLookup>,
    notifier: Notifier,
}

impl NotificationHandler {
    pub fn new(
        ledger: SharedLedger,
        inventory: Arc<dyn InventoryLookup>,
        notifier: Notifier,
    ) -> Self {
        Self {
            ledger,
            inventory,
            notifier,
        }
    }

    /// Starts consuming `notifications` in arrival order until `cancel_token` fires.
    /// The stream, and with it the subscription, is dropped when the task ends.
    pub fn setup_notifications(
        &self,
        notifications: BoxStream<'static, Vec<u8>>,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        info!("Subscribing to notifications...");
        let handler = self.clone();
        tokio::spawn(async move {
            handler.process_notifications(notifications, cancel_token).await;
        })
    }

    async fn process_notifications(
        &self,
        mut notifications: BoxStream<'static, Vec<u8>>,
        cancel_token: CancellationToken,
    ) {
        info!("Listening for cart notifications...");
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                frame = notifications.next() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let outcome = self.handle_frame(&frame, &cancel_token).await;
            debug!("Notification handled: {:?}", outcome);
        }
        info!("Notification stream ended");
    }

    /// Runs one frame through decode, classification, lookup and the ledger.
    pub async fn handle_frame(
        &self,
        frame: &[u8],
        cancel_token: &CancellationToken,
    ) -> FrameOutcome {
        let text = match codec::decode_notification(frame) {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping notification: {}", e);
                return FrameOutcome::Malformed;
            }
        };
        debug!("New cart data: {:?}", text);

        let item_id = match codec::classify(&text) {
            TagEvent::TagScan { item_id } if item_id.is_empty() => {
                warn!("Tag scan without an item id");
                return FrameOutcome::Ignored;
            }
            TagEvent::TagScan { item_id } => item_id,
            TagEvent::Unrecognized { raw } => {
                debug!("Ignoring unrecognized notification: {:?}", raw);
                return FrameOutcome::Ignored;
            }
        };

        let lookup = self.inventory.lookup(&item_id).await;
        // The lookup is a suspension point; the link may have gone meanwhile
        if cancel_token.is_cancelled() {
            info!("Discarding scan of {} for a closed session", item_id);
            return FrameOutcome::Stale;
        }

        let item = match lookup {
            Ok(Some(item)) => item,
            Ok(None) => {
                warn!("Scanned item {} is not recognized", item_id);
                self.notifier.emit(LinkEvent::UnknownItem { item_id });
                return FrameOutcome::UnknownItem;
            }
            Err(e) => {
                error!("Inventory lookup for {} failed: {}", item_id, e);
                self.notifier.emit(LinkEvent::LookupFailed {
                    item_id,
                    reason: e.to_string(),
                });
                return FrameOutcome::LookupFailed;
            }
        };

        match self.ledger.add(&item_id, item.ceiling()) {
            AddOutcome::Added { quantity } => {
                info!(
                    "Added {} ({}) to cart, quantity {}",
                    item.name, item_id, quantity
                );
                self.notifier
                    .emit(LinkEvent::CartUpdated { item_id, quantity });
                FrameOutcome::Added { quantity }
            }
            AddOutcome::Blocked => {
                warn!(
                    "No more stock of {} ({}), ceiling {}",
                    item.name,
                    item_id,
                    item.ceiling()
                );
                self.notifier.emit(LinkEvent::StockExhausted {
                    item_id,
                    name: item.name,
                });
                FrameOutcome::StockExhausted
            }
        }
    }
}
