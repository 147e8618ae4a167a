//! Collaborators the cart link consumes: the item catalogue, the document
//! store behind it and the location provider.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result, bail};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::core::bluetooth::{GpsSample, PermissionState};
use crate::core::cart::Ceiling;
use crate::utils::{read_json, write_json};

/// Key of the store map document
pub const STORE_MAP_KEY: &str = "maps/store";

/// A catalogue entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub name: String,
    pub price: f64,
    /// Units in stock; unknown when absent
    #[serde(default)]
    pub inventory: Option<u32>,
    /// Aisle or shelf, for display
    #[serde(default)]
    pub location: Option<String>,
}

impl InventoryItem {
    pub fn ceiling(&self) -> Ceiling {
        match self.inventory {
            Some(units) => Ceiling::Limited(units),
            None => Ceiling::Unbounded,
        }
    }
}

#[async_trait::async_trait]
pub trait InventoryLookup: Send + Sync {
    /// `Ok(None)` when the item is not in the catalogue
    async fn lookup(&self, item_id: &str) -> Result<Option<InventoryItem>>;

    /// Catalogue entries whose name contains `query`, ignoring case, sorted by name.
    /// A blank query lists the whole catalogue.
    async fn search(&self, query: &str) -> Result<Vec<(String, InventoryItem)>>;
}

/// Key/value store of JSON documents
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn put(&self, key: &str, value: Value) -> Result<()>;
    /// Every document directly under `collection`, as (id, document) pairs
    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>>;
}

#[async_trait::async_trait]
pub trait LocationProvider: Send + Sync {
    /// One-shot permission request
    async fn request_permission(&self) -> PermissionState;
    /// Position fixes, already rate-limited by the platform
    fn samples(&self) -> BoxStream<'static, GpsSample>;
}

#[derive(Debug, Deserialize)]
struct ItemDocument {
    name: Option<String>,
    price: Option<f64>,
    inventory: Option<f64>,
    location: Option<String>,
}

/// Whole units in stock. Fractions round down and negative counts mean none left.
fn stock_units(inventory: f64) -> Option<u32> {
    if inventory.is_nan() {
        return None;
    }
    // `as` saturates at the u32 bounds
    Some(inventory.floor().max(0.0) as u32)
}

impl ItemDocument {
    /// The catalogue entry, if the document has the required fields
    fn into_item(self, item_id: &str) -> Option<InventoryItem> {
        match (self.name, self.price) {
            (Some(name), Some(price)) if !name.is_empty() && price > 0.0 => Some(InventoryItem {
                name,
                price,
                inventory: self.inventory.and_then(stock_units),
                location: self.location,
            }),
            _ => {
                warn!("Item {} is missing required fields", item_id);
                None
            }
        }
    }

    fn parse(item_id: &str, value: Value) -> Option<InventoryItem> {
        match serde_json::from_value::<ItemDocument>(value) {
            Ok(document) => document.into_item(item_id),
            Err(e) => {
                warn!("Item {} has a malformed document: {}", item_id, e);
                None
            }
        }
    }
}

/// Catalogue backed by `items/<id>` documents
pub struct StoreInventory<S> {
    store: S,
}

impl<S: DocumentStore> StoreInventory<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Writes a catalogue entry
    pub async fn insert(&self, item_id: &str, item: &InventoryItem) -> Result<()> {
        self.store
            .put(&format!("items/{}", item_id), serde_json::to_value(item)?)
            .await
    }
}

#[async_trait::async_trait]
impl<S: DocumentStore> InventoryLookup for StoreInventory<S> {
    async fn lookup(&self, item_id: &str) -> Result<Option<InventoryItem>> {
        if item_id.is_empty() {
            return Ok(None);
        }
        let Some(value) = self.store.get(&format!("items/{}", item_id)).await? else {
            return Ok(None);
        };
        Ok(ItemDocument::parse(item_id, value))
    }

    async fn search(&self, query: &str) -> Result<Vec<(String, InventoryItem)>> {
        let needle = query.trim().to_lowercase();
        let mut matches: Vec<(String, InventoryItem)> = self
            .store
            .list("items")
            .await?
            .into_iter()
            .filter_map(|(item_id, value)| {
                ItemDocument::parse(&item_id, value).map(|item| (item_id, item))
            })
            .filter(|(_, item)| item.name.to_lowercase().contains(&needle))
            .collect();
        matches.sort_by(|(a_id, a), (b_id, b)| {
            a.name.cmp(&b.name).then_with(|| a_id.cmp(b_id))
        });
        debug!("Search for {:?} matched {} items", query, matches.len());
        Ok(matches)
    }
}

#[async_trait::async_trait]
impl<S: DocumentStore + ?Sized> DocumentStore for std::sync::Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        (**self).put(key, value).await
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        (**self).list(collection).await
    }
}

#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<HashMap<String, Value>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        let prefix = format!("{}/", collection);
        Ok(self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|(key, value)| {
                let id = key.strip_prefix(&prefix)?;
                (!id.contains('/')).then(|| (id.to_string(), value.clone()))
            })
            .collect())
    }
}

/// One pretty-printed JSON file per key below a root directory
pub struct FileDocumentStore {
    root: PathBuf,
}

impl FileDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Only plain relative paths may name documents or collections
    fn is_contained(key: &str) -> bool {
        !key.is_empty()
            && Path::new(key)
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if !Self::is_contained(key) {
            bail!("Invalid document key: {:?}", key);
        }
        Ok(self.root.join(format!("{}.json", key)))
    }
}

#[async_trait::async_trait]
impl DocumentStore for FileDocumentStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        read_json(&self.path_for(key)?).await
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        let path = self.path_for(key)?;
        write_json(&path, &value).await?;
        info!("Document {} saved to {:?}", key, path);
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        if !Self::is_contained(collection) {
            bail!("Invalid collection: {:?}", collection);
        }
        let dir = self.root.join(collection);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut documents = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed to list {:?}", dir))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match read_json(&path).await {
                Ok(Some(value)) => documents.push((id.to_string(), value)),
                Ok(None) => {}
                Err(e) => warn!("Skipping {:?}: {:#}", path, e),
            }
        }
        Ok(documents)
    }
}

/// Reads the store map image URL
pub async fn fetch_map_url(store: &dyn DocumentStore) -> Result<Option<String>> {
    Ok(store
        .get(STORE_MAP_KEY)
        .await?
        .and_then(|doc| doc.get("url").and_then(Value::as_str).map(str::to_string)))
}

/// Location fed by hand, e.g. from the operator console
pub struct ManualLocationProvider {
    permission: PermissionState,
    tx: broadcast::Sender<GpsSample>,
}

impl ManualLocationProvider {
    pub fn new(permission: PermissionState) -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { permission, tx }
    }

    pub fn push(&self, sample: GpsSample) {
        if self.tx.send(sample).is_err() {
            debug!("No telemetry watcher for {:?}", sample);
        }
    }
}

#[async_trait::async_trait]
impl LocationProvider for ManualLocationProvider {
    async fn request_permission(&self) -> PermissionState {
        self.permission
    }

    fn samples(&self) -> BoxStream<'static, GpsSample> {
        futures_util::stream::unfold(self.tx.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(sample) => return Some((sample, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Telemetry watcher skipped {} stale samples", skipped);
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
