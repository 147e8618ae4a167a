//! Application state management
//! This module wires the link session to its collaborators and exposes the
//! operations the operator surface needs.

use std::sync::Arc;

use anyhow::Result;
use log::{error, info, warn};

use crate::config::AppConfig;
use crate::core::bill::Bill;
use crate::core::bluetooth::{
    LinkError, LinkHandle, LinkSession, Notifier, PermissionState, Transport,
};
use crate::core::cart::{AddOutcome, SharedLedger};
use crate::core::services::{self, DocumentStore, InventoryItem, InventoryLookup, LocationProvider};

/// Root of the application, owned by `main`
pub struct AppState {
    pub session: LinkSession,
    pub ledger: SharedLedger,
    pub inventory: Arc<dyn InventoryLookup>,
    pub store: Arc<dyn DocumentStore>,
    pub location: Arc<dyn LocationProvider>,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(
        transport: Arc<dyn Transport>,
        inventory: Arc<dyn InventoryLookup>,
        store: Arc<dyn DocumentStore>,
        location: Arc<dyn LocationProvider>,
        config: AppConfig,
    ) -> Self {
        let ledger = SharedLedger::new();
        let session = LinkSession::new(
            transport,
            inventory.clone(),
            ledger.clone(),
            config.link.clone(),
            Notifier::new(),
        );
        Self {
            session,
            ledger,
            inventory,
            store,
            location,
            config,
        }
    }

    /// Asks for location permission and starts scanning when granted
    pub async fn start(&self) -> Result<PermissionState, LinkError> {
        let permission = self.location.request_permission().await;
        self.session.set_permission(permission).await;
        match permission {
            PermissionState::Granted => {
                self.session.start_scan().await?;
            }
            _ => warn!("Location permission is required for Bluetooth scanning."),
        }
        Ok(permission)
    }

    /// Connects to a discovered cart by identifier or name, then starts telemetry
    pub async fn connect(&self, query: &str) -> Result<LinkHandle, LinkError> {
        let peripheral = self
            .session
            .find_peripheral(query)
            .await
            .ok_or_else(|| LinkError::connection_failed(query, "device has not been discovered"))?;
        let handle = self.session.connect(&peripheral).await?;

        if self.session.permission().await == PermissionState::Granted {
            if let Err(e) = self.session.start_telemetry(self.location.samples()).await {
                error!("Failed to start telemetry: {}", e);
            }
        } else {
            info!("Telemetry disabled without location permission");
        }
        Ok(handle)
    }

    /// Adds one unit of `item_id` after checking the catalogue
    pub async fn add_item(&self, item_id: &str) -> Result<u32, LinkError> {
        let item = match self.inventory.lookup(item_id).await {
            Ok(Some(item)) => item,
            Ok(None) => return Err(LinkError::UnknownItem(item_id.to_string())),
            Err(e) => {
                error!("Inventory lookup for {} failed: {}", item_id, e);
                return Err(LinkError::LookupFailed {
                    item_id: item_id.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        match self.ledger.add(item_id, item.ceiling()) {
            AddOutcome::Added { quantity } => Ok(quantity),
            AddOutcome::Blocked => Err(LinkError::StockExhausted(item.name)),
        }
    }

    /// Adds one unit of an item already in the cart
    pub fn increment_item(&self, item_id: &str) -> Result<u32, LinkError> {
        match self.ledger.increment_existing(item_id) {
            Some(AddOutcome::Added { quantity }) => Ok(quantity),
            Some(AddOutcome::Blocked) => Err(LinkError::StockExhausted(item_id.to_string())),
            None => Err(LinkError::UnknownItem(item_id.to_string())),
        }
    }

    pub fn decrement_item(&self, item_id: &str) -> u32 {
        self.ledger.decrement(item_id)
    }

    pub fn remove_item(&self, item_id: &str) {
        self.ledger.remove(item_id)
    }

    pub fn clear_cart(&self) {
        self.ledger.clear()
    }

    pub async fn bill(&self) -> Result<Bill> {
        Bill::build(
            &self.ledger.snapshot(),
            self.inventory.as_ref(),
            &self.config.bill,
        )
        .await
    }

    /// Prices the cart and stores it for bill history
    pub async fn checkout(&self) -> Result<Bill> {
        let bill = self.bill().await?;
        bill.save(self.store.as_ref()).await?;
        Ok(bill)
    }

    /// Catalogue entries whose name contains `query`
    pub async fn search_items(&self, query: &str) -> Result<Vec<(String, InventoryItem)>> {
        self.inventory.search(query).await
    }

    pub async fn map_url(&self) -> Result<Option<String>> {
        services::fetch_map_url(self.store.as_ref()).await
    }
}
