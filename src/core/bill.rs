//! Bill computation and checkout persistence

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::config::bill_config::BillConfig;
use crate::core::services::{DocumentStore, InventoryLookup};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillLine {
    pub item_id: String,
    pub name: String,
    pub price: f64,
    pub quantity: u32,
    pub line_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bill {
    pub cart_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub lines: Vec<BillLine>,
    pub subtotal: f64,
    pub tax: f64,
    pub total: f64,
}

impl Bill {
    /// Totals `lines` with `tax_rate` applied on the subtotal
    pub fn from_lines(lines: Vec<BillLine>, tax_rate: f64) -> Self {
        let subtotal: f64 = lines.iter().map(|line| line.line_total).sum();
        let tax = subtotal * tax_rate;
        Self {
            cart_id: Uuid::new_v4(),
            created_at: Utc::now(),
            lines,
            subtotal,
            tax,
            total: subtotal + tax,
        }
    }

    /// Prices a cart snapshot. Items the catalogue no longer knows are left out.
    pub async fn build(
        snapshot: &[(String, u32)],
        inventory: &dyn InventoryLookup,
        config: &BillConfig,
    ) -> Result<Self> {
        let mut lines = Vec::with_capacity(snapshot.len());
        for (item_id, quantity) in snapshot {
            match inventory.lookup(item_id).await? {
                Some(item) => lines.push(BillLine {
                    item_id: item_id.clone(),
                    line_total: item.price * f64::from(*quantity),
                    name: item.name,
                    price: item.price,
                    quantity: *quantity,
                }),
                None => warn!("Leaving unknown item {} off the bill", item_id),
            }
        }
        Ok(Self::from_lines(lines, config.tax_rate))
    }

    /// Stores the cart under `carts/<cart id>`
    pub async fn save(&self, store: &dyn DocumentStore) -> Result<String> {
        let key = format!("carts/{}", self.cart_id);
        let items: Vec<_> = self
            .lines
            .iter()
            .map(|line| {
                json!({
                    "itemId": line.item_id,
                    "name": line.name,
                    "price": line.price,
                    "quantity": line.quantity,
                })
            })
            .collect();
        store
            .put(
                &key,
                json!({
                    "cartId": self.cart_id.to_string(),
                    "status": "active",
                    "createdAt": self.created_at.to_rfc3339(),
                    "items": items,
                }),
            )
            .await?;
        info!("Cart saved with ID: {}", self.cart_id);
        Ok(key)
    }

    /// Plain-text receipt
    pub fn render(&self, currency: &str) -> String {
        let mut out = String::new();
        out.push_str("SMART CART BILL\n");
        out.push_str(&format!("Cart ID: {}\n", self.cart_id));
        out.push_str(&format!(
            "Date: {}\n",
            self.created_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
        ));
        for line in &self.lines {
            out.push_str(&format!(
                "{:<24} x{:<3} {:>10.2} {}\n",
                line.name, line.quantity, line.line_total, currency
            ));
        }
        out.push_str(&format!("Subtotal {:>30.2} {}\n", self.subtotal, currency));
        out.push_str(&format!("Tax      {:>30.2} {}\n", self.tax, currency));
        out.push_str(&format!("Total    {:>30.2} {}\n", self.total, currency));
        out
    }
}
