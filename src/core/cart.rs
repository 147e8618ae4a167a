//! Quantity-bounded cart ledger
//! Maps item identifiers to quantities, never above the inventory ceiling and
//! never at or below zero.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Maximum quantity of one item the ledger will hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Ceiling {
    Limited(u32),
    /// Inventory unknown; never blocks
    Unbounded,
}

impl Ceiling {
    pub fn allows(self, quantity: u32) -> bool {
        match self {
            Self::Limited(max) => quantity <= max,
            Self::Unbounded => true,
        }
    }
}

impl fmt::Display for Ceiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(max) => write!(f, "{}", max),
            Self::Unbounded => write!(f, "unbounded"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CartEntry {
    pub quantity: u32,
    /// Ceiling known when the item was first added
    pub ceiling: Ceiling,
}

/// Result of an add or increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added { quantity: u32 },
    /// The ceiling was reached; nothing changed
    Blocked,
}

#[derive(Debug, Default, Clone)]
pub struct CartLedger {
    entries: HashMap<String, CartEntry>,
}

impl CartLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one unit of `item_id`, inserting it if absent
    pub fn add(&mut self, item_id: &str, ceiling: Ceiling) -> AddOutcome {
        self.increment(item_id, ceiling)
    }

    /// Adds one unit; a missing entry counts as quantity 0
    pub fn increment(&mut self, item_id: &str, ceiling: Ceiling) -> AddOutcome {
        let current = self.quantity(item_id);
        let next = match current.checked_add(1) {
            Some(next) if ceiling.allows(next) => next,
            _ => return AddOutcome::Blocked,
        };

        self.entries
            .entry(item_id.to_string())
            .and_modify(|entry| entry.quantity = next)
            .or_insert(CartEntry {
                quantity: next,
                ceiling,
            });
        AddOutcome::Added { quantity: next }
    }

    /// Adds one unit of an item already in the cart, against its stored ceiling
    pub fn increment_existing(&mut self, item_id: &str) -> Option<AddOutcome> {
        let ceiling = self.entries.get(item_id)?.ceiling;
        Some(self.increment(item_id, ceiling))
    }

    /// Removes one unit; the entry goes away when it would reach zero.
    /// Returns the remaining quantity.
    pub fn decrement(&mut self, item_id: &str) -> u32 {
        match self.entries.get_mut(item_id) {
            Some(entry) if entry.quantity > 1 => {
                entry.quantity -= 1;
                entry.quantity
            }
            Some(_) => {
                self.entries.remove(item_id);
                0
            }
            None => 0,
        }
    }

    pub fn remove(&mut self, item_id: &str) {
        self.entries.remove(item_id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn quantity(&self, item_id: &str) -> u32 {
        self.entries.get(item_id).map(|e| e.quantity).unwrap_or(0)
    }

    pub fn entry(&self, item_id: &str) -> Option<CartEntry> {
        self.entries.get(item_id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(item_id, quantity)` pairs ordered by item identifier
    pub fn snapshot(&self) -> Vec<(String, u32)> {
        let mut lines: Vec<(String, u32)> = self
            .entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.quantity))
            .collect();
        lines.sort();
        lines
    }
}

/// Ledger shared between the event channel (writer) and readers.
///
/// Each call holds the lock for the whole operation, so snapshots are never torn.
#[derive(Debug, Clone, Default)]
pub struct SharedLedger {
    inner: Arc<RwLock<CartLedger>>,
}

impl SharedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn write<R>(&self, f: impl FnOnce(&mut CartLedger) -> R) -> R {
        let mut ledger = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut ledger)
    }

    fn read<R>(&self, f: impl FnOnce(&CartLedger) -> R) -> R {
        let ledger = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&ledger)
    }

    pub fn add(&self, item_id: &str, ceiling: Ceiling) -> AddOutcome {
        self.write(|l| l.add(item_id, ceiling))
    }

    pub fn increment(&self, item_id: &str, ceiling: Ceiling) -> AddOutcome {
        self.write(|l| l.increment(item_id, ceiling))
    }

    pub fn increment_existing(&self, item_id: &str) -> Option<AddOutcome> {
        self.write(|l| l.increment_existing(item_id))
    }

    pub fn decrement(&self, item_id: &str) -> u32 {
        self.write(|l| l.decrement(item_id))
    }

    pub fn remove(&self, item_id: &str) {
        self.write(|l| l.remove(item_id))
    }

    pub fn clear(&self) {
        self.write(|l| l.clear())
    }

    pub fn quantity(&self, item_id: &str) -> u32 {
        self.read(|l| l.quantity(item_id))
    }

    pub fn entry(&self, item_id: &str) -> Option<CartEntry> {
        self.read(|l| l.entry(item_id))
    }

    pub fn is_empty(&self) -> bool {
        self.read(|l| l.is_empty())
    }

    pub fn snapshot(&self) -> Vec<(String, u32)> {
        self.read(|l| l.snapshot())
    }
}
