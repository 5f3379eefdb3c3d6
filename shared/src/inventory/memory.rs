use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use super::{merge_items, InventoryLedger, InventoryLevel, ReservationStatus};
use crate::error::CheckoutError;
use crate::LineItem;

#[derive(Debug, Default)]
struct LedgerState {
    stock: HashMap<Uuid, InventoryLevel>,
    holds: HashMap<(Uuid, Uuid), (i32, ReservationStatus)>,
}

/// Ledger kept in process memory. Each operation runs under one lock, so
/// the sufficiency check and the counter updates of a batch are atomic.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl InMemoryInventoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stock(&self, product_id: Uuid, available: i32, threshold: i32) {
        self.lock().stock.insert(
            product_id,
            InventoryLevel {
                product_id,
                available,
                reserved: 0,
                threshold,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn remove_product(&self, product_id: Uuid) {
        self.lock().stock.remove(&product_id);
    }

    pub fn snapshot(&self, product_id: Uuid) -> Option<(i32, i32)> {
        self.lock()
            .stock
            .get(&product_id)
            .map(|l| (l.available, l.reserved))
    }

    pub fn hold(&self, order_id: Uuid, product_id: Uuid) -> Option<(i32, ReservationStatus)> {
        self.lock().holds.get(&(order_id, product_id)).copied()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn settle(
        &self,
        order_id: Uuid,
        items: &[LineItem],
        to: ReservationStatus,
    ) -> Result<(), CheckoutError> {
        let items = merge_items(items)?;
        let mut state = self.lock();
        let now = Utc::now();
        for item in items {
            let key = (order_id, item.product_id);
            let quantity = match state.holds.get(&key) {
                Some((quantity, ReservationStatus::Reserved)) => *quantity,
                _ => continue,
            };
            match state.stock.get_mut(&item.product_id) {
                Some(level) => {
                    level.reserved = (level.reserved - quantity).max(0);
                    if to == ReservationStatus::Released {
                        level.available += quantity;
                    }
                    level.updated_at = now;
                }
                None => warn!(%order_id, product_id = %item.product_id, "Inventory row missing, skipping"),
            }
            state.holds.insert(key, (quantity, to));
        }
        Ok(())
    }
}

#[async_trait]
impl InventoryLedger for InMemoryInventoryLedger {
    async fn check(&self, product_id: Uuid, quantity: i32) -> Result<bool, CheckoutError> {
        Ok(self
            .lock()
            .stock
            .get(&product_id)
            .is_some_and(|l| l.available >= quantity))
    }

    async fn reserve(&self, order_id: Uuid, items: &[LineItem]) -> Result<(), CheckoutError> {
        let items = merge_items(items)?;
        let mut state = self.lock();

        let pending: Vec<LineItem> = items
            .into_iter()
            .filter(|item| !state.holds.contains_key(&(order_id, item.product_id)))
            .collect();

        for item in &pending {
            let available = state.stock.get(&item.product_id).map_or(0, |l| l.available);
            if available < item.quantity {
                return Err(CheckoutError::InsufficientStock {
                    product_id: item.product_id,
                    requested: item.quantity,
                    available,
                });
            }
        }

        let now = Utc::now();
        for item in pending {
            if let Some(level) = state.stock.get_mut(&item.product_id) {
                level.available -= item.quantity;
                level.reserved += item.quantity;
                level.updated_at = now;
            }
            state.holds.insert(
                (order_id, item.product_id),
                (item.quantity, ReservationStatus::Reserved),
            );
        }
        Ok(())
    }

    async fn confirm(&self, order_id: Uuid, items: &[LineItem]) -> Result<(), CheckoutError> {
        self.settle(order_id, items, ReservationStatus::Confirmed)
    }

    async fn release(&self, order_id: Uuid, items: &[LineItem]) -> Result<(), CheckoutError> {
        self.settle(order_id, items, ReservationStatus::Released)
    }

    async fn level(&self, product_id: Uuid) -> Result<Option<InventoryLevel>, CheckoutError> {
        Ok(self.lock().stock.get(&product_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(product_id: Uuid, quantity: i32) -> LineItem {
        LineItem { product_id, quantity }
    }

    #[tokio::test]
    async fn reserve_then_confirm_keeps_available_decremented() {
        let ledger = InMemoryInventoryLedger::new();
        let p1 = Uuid::new_v4();
        let o1 = Uuid::new_v4();
        ledger.set_stock(p1, 5, 1);

        ledger.reserve(o1, &[item(p1, 3)]).await.unwrap();
        assert_eq!(ledger.snapshot(p1), Some((2, 3)));

        ledger.confirm(o1, &[item(p1, 3)]).await.unwrap();
        assert_eq!(ledger.snapshot(p1), Some((2, 0)));

        ledger.confirm(o1, &[item(p1, 3)]).await.unwrap();
        assert_eq!(ledger.snapshot(p1), Some((2, 0)));
        assert_eq!(ledger.hold(o1, p1), Some((3, ReservationStatus::Confirmed)));
    }

    #[tokio::test]
    async fn batch_is_rejected_whole_when_any_item_is_short() {
        let ledger = InMemoryInventoryLedger::new();
        let (p1, p2) = (Uuid::new_v4(), Uuid::new_v4());
        ledger.set_stock(p1, 10, 0);
        ledger.set_stock(p2, 1, 0);

        let err = ledger
            .reserve(Uuid::new_v4(), &[item(p1, 2), item(p2, 5)])
            .await
            .unwrap_err();

        match err {
            CheckoutError::InsufficientStock { product_id, requested, available } => {
                assert_eq!(product_id, p2);
                assert_eq!(requested, 5);
                assert_eq!(available, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(ledger.snapshot(p1), Some((10, 0)));
        assert_eq!(ledger.snapshot(p2), Some((1, 0)));
    }

    #[tokio::test]
    async fn release_after_failure_restores_pre_reservation_stock() {
        let ledger = InMemoryInventoryLedger::new();
        let (p1, p2) = (Uuid::new_v4(), Uuid::new_v4());
        let order = Uuid::new_v4();
        ledger.set_stock(p1, 7, 0);
        ledger.set_stock(p2, 4, 0);
        let items = [item(p1, 2), item(p2, 1)];

        ledger.reserve(order, &items).await.unwrap();
        assert_eq!(ledger.snapshot(p1), Some((5, 2)));
        assert_eq!(ledger.snapshot(p2), Some((3, 1)));

        ledger.release(order, &items).await.unwrap();
        ledger.release(order, &items).await.unwrap();
        assert_eq!(ledger.snapshot(p1), Some((7, 0)));
        assert_eq!(ledger.snapshot(p2), Some((4, 0)));
    }

    #[tokio::test]
    async fn duplicate_reserve_for_same_order_holds_once() {
        let ledger = InMemoryInventoryLedger::new();
        let p1 = Uuid::new_v4();
        let order = Uuid::new_v4();
        ledger.set_stock(p1, 5, 0);

        ledger.reserve(order, &[item(p1, 2)]).await.unwrap();
        ledger.reserve(order, &[item(p1, 2)]).await.unwrap();
        assert_eq!(ledger.snapshot(p1), Some((3, 2)));
    }

    #[tokio::test]
    async fn release_skips_missing_products() {
        let ledger = InMemoryInventoryLedger::new();
        let (p1, p2) = (Uuid::new_v4(), Uuid::new_v4());
        let order = Uuid::new_v4();
        ledger.set_stock(p1, 3, 0);
        ledger.set_stock(p2, 3, 0);
        ledger.reserve(order, &[item(p1, 1), item(p2, 1)]).await.unwrap();

        ledger.remove_product(p2);
        ledger.release(order, &[item(p1, 1), item(p2, 1)]).await.unwrap();
        assert_eq!(ledger.snapshot(p1), Some((3, 0)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_cannot_oversell() {
        let ledger = InMemoryInventoryLedger::new();
        let p1 = Uuid::new_v4();
        ledger.set_stock(p1, 4, 0);

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let ledger = ledger.clone();
            tasks.push(tokio::spawn(async move {
                ledger.reserve(Uuid::new_v4(), &[item(p1, 4)]).await
            }));
        }

        let mut succeeded = 0;
        let mut short = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => succeeded += 1,
                Err(CheckoutError::InsufficientStock { .. }) => short += 1,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!((succeeded, short), (1, 1));
        assert_eq!(ledger.snapshot(p1), Some((0, 4)));
    }
}
