//! Inventory reservation ledger contract.
//!
//! Stock moves through three phases per order: `reserve` holds units
//! (available -> reserved), then either `confirm` commits them (reserved is
//! cleared, available stays decremented) or `release` returns them
//! (reserved -> available). Each phase is idempotent per order and product.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CheckoutError;
use crate::LineItem;

mod memory;

pub use memory::InMemoryInventoryLedger;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryLevel {
    pub product_id: Uuid,
    pub available: i32,
    pub reserved: i32,
    pub threshold: i32,
    pub updated_at: DateTime<Utc>,
}

impl InventoryLevel {
    pub fn is_low(&self) -> bool {
        self.available <= self.threshold
    }
}

/// Body of `POST /inventory/reserve|confirm|release`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryRequest {
    pub order_id: Uuid,
    pub items: Vec<LineItem>,
}

/// Body returned with 409 when a reservation cannot be satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsufficientStockBody {
    pub error: String,
    pub product_id: Uuid,
    pub requested: i32,
    pub available: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    Reserved,
    Confirmed,
    Released,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Released => "released",
        }
    }
}

#[async_trait]
pub trait InventoryLedger: Send + Sync {
    async fn check(&self, product_id: Uuid, quantity: i32) -> Result<bool, CheckoutError>;

    /// All-or-nothing hold of `items` for `order_id`. Fails with
    /// `InsufficientStock` without holding anything if any item cannot be
    /// covered. Products this order already holds are skipped.
    async fn reserve(&self, order_id: Uuid, items: &[LineItem]) -> Result<(), CheckoutError>;

    async fn confirm(&self, order_id: Uuid, items: &[LineItem]) -> Result<(), CheckoutError>;

    /// Best effort: products without a stock row are logged and skipped.
    async fn release(&self, order_id: Uuid, items: &[LineItem]) -> Result<(), CheckoutError>;

    async fn level(&self, product_id: Uuid) -> Result<Option<InventoryLevel>, CheckoutError>;
}

/// Sums quantities per product, preserving first-seen order. Rejects
/// non-positive quantities.
pub fn merge_items(items: &[LineItem]) -> Result<Vec<LineItem>, CheckoutError> {
    let mut order = Vec::new();
    let mut totals: BTreeMap<Uuid, i32> = BTreeMap::new();
    for item in items {
        if item.quantity <= 0 {
            return Err(CheckoutError::Validation(format!(
                "quantity for product {} must be positive",
                item.product_id
            )));
        }
        let total = totals.entry(item.product_id).or_insert_with(|| {
            order.push(item.product_id);
            0
        });
        *total = total.checked_add(item.quantity).ok_or_else(|| {
            CheckoutError::Validation(format!("quantity overflow for product {}", item.product_id))
        })?;
    }
    Ok(order
        .into_iter()
        .map(|product_id| LineItem {
            product_id,
            quantity: totals[&product_id],
        })
        .collect())
}
