use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use shared::db::DbPool;
use shared::error::is_unique_violation;
use shared::inventory::{merge_items, InventoryLedger, InventoryLevel, ReservationStatus};
use shared::{CheckoutError, LineItem};
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::*;
use crate::schema::*;

/// Postgres ledger. Counter changes are conditional updates
/// (`... WHERE available >= qty`), so two orders racing for the last units
/// cannot both win; each batch runs in one transaction and a lost race rolls
/// back every hold the batch already took.
pub struct PgInventoryLedger {
    pool: DbPool,
}

impl PgInventoryLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn settle(
        &self,
        order_id: Uuid,
        items: &[LineItem],
        to: ReservationStatus,
    ) -> Result<(), CheckoutError> {
        let product_ids: Vec<Uuid> = merge_items(items)?
            .into_iter()
            .map(|item| item.product_id)
            .collect();
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, CheckoutError, _>(|conn| {
            Box::pin(async move {
                let held = reservations::table
                    .filter(reservations::order_id.eq(order_id))
                    .filter(reservations::product_id.eq_any(product_ids))
                    .filter(reservations::status.eq(ReservationStatus::Reserved.as_str()))
                    .for_update()
                    .select(Reservation::as_select())
                    .load::<Reservation>(conn)
                    .await?;

                let now = Utc::now();
                for reservation in held {
                    let target = inventory::table
                        .filter(inventory::product_id.eq(reservation.product_id))
                        .filter(inventory::reserved.ge(reservation.quantity));

                    let updated = match to {
                        ReservationStatus::Released => {
                            diesel::update(target)
                                .set((
                                    inventory::available.eq(inventory::available + reservation.quantity),
                                    inventory::reserved.eq(inventory::reserved - reservation.quantity),
                                    inventory::updated_at.eq(now),
                                ))
                                .execute(conn)
                                .await?
                        }
                        _ => {
                            diesel::update(target)
                                .set((
                                    inventory::reserved.eq(inventory::reserved - reservation.quantity),
                                    inventory::updated_at.eq(now),
                                ))
                                .execute(conn)
                                .await?
                        }
                    };

                    if updated == 0 {
                        warn!(
                            %order_id,
                            product_id = %reservation.product_id,
                            "Inventory row missing or out of sync, skipping counters"
                        );
                    }

                    diesel::update(reservations::table.filter(reservations::id.eq(reservation.id)))
                        .set((
                            reservations::status.eq(to.as_str()),
                            reservations::updated_at.eq(now),
                        ))
                        .execute(conn)
                        .await?;
                }

                Ok(())
            })
        })
        .await
    }
}

#[async_trait]
impl InventoryLedger for PgInventoryLedger {
    async fn check(&self, product_id: Uuid, quantity: i32) -> Result<bool, CheckoutError> {
        let mut conn = self.pool.get().await?;
        let available = inventory::table
            .filter(inventory::product_id.eq(product_id))
            .select(inventory::available)
            .first::<i32>(&mut conn)
            .await
            .optional()?;
        Ok(available.is_some_and(|available| available >= quantity))
    }

    async fn reserve(&self, order_id: Uuid, items: &[LineItem]) -> Result<(), CheckoutError> {
        let items = merge_items(items)?;
        let mut conn = self.pool.get().await?;

        let result = conn
            .transaction::<_, CheckoutError, _>(|conn| {
                Box::pin(async move {
                    let already_held = reservations::table
                        .filter(reservations::order_id.eq(order_id))
                        .select(reservations::product_id)
                        .load::<Uuid>(conn)
                        .await?;

                    let pending: Vec<LineItem> = items
                        .into_iter()
                        .filter(|item| !already_held.contains(&item.product_id))
                        .collect();
                    if pending.is_empty() {
                        return Ok(());
                    }

                    let product_ids: Vec<Uuid> = pending.iter().map(|item| item.product_id).collect();
                    let levels: HashMap<Uuid, i32> = inventory::table
                        .filter(inventory::product_id.eq_any(product_ids))
                        .select((inventory::product_id, inventory::available))
                        .load::<(Uuid, i32)>(conn)
                        .await?
                        .into_iter()
                        .collect();

                    for item in &pending {
                        let available = levels.get(&item.product_id).copied().unwrap_or(0);
                        if available < item.quantity {
                            return Err(CheckoutError::InsufficientStock {
                                product_id: item.product_id,
                                requested: item.quantity,
                                available,
                            });
                        }
                    }

                    let now = Utc::now();
                    for item in &pending {
                        let updated = diesel::update(
                            inventory::table
                                .filter(inventory::product_id.eq(item.product_id))
                                .filter(inventory::available.ge(item.quantity)),
                        )
                        .set((
                            inventory::available.eq(inventory::available - item.quantity),
                            inventory::reserved.eq(inventory::reserved + item.quantity),
                            inventory::updated_at.eq(now),
                        ))
                        .execute(conn)
                        .await?;

                        if updated == 0 {
                            let available = inventory::table
                                .filter(inventory::product_id.eq(item.product_id))
                                .select(inventory::available)
                                .first::<i32>(conn)
                                .await
                                .optional()?
                                .unwrap_or(0);
                            warn!(%order_id, product_id = %item.product_id, "Stock taken by a concurrent reservation, rolling back batch");
                            return Err(CheckoutError::InsufficientStock {
                                product_id: item.product_id,
                                requested: item.quantity,
                                available,
                            });
                        }

                        let new_reservation = NewReservation {
                            id: Uuid::new_v4(),
                            order_id,
                            product_id: item.product_id,
                            quantity: item.quantity,
                            status: ReservationStatus::Reserved.as_str().to_string(),
                        };

                        diesel::insert_into(reservations::table)
                            .values(&new_reservation)
                            .execute(conn)
                            .await
                            .map_err(|e| {
                                if is_unique_violation(&e) {
                                    CheckoutError::Duplicate(format!("reservation for order {}", order_id))
                                } else {
                                    e.into()
                                }
                            })?;
                    }

                    Ok(())
                })
            })
            .await;

        match result {
            Ok(()) => {
                info!(%order_id, "Inventory reserved");
                Ok(())
            }
            Err(CheckoutError::Duplicate(what)) => {
                info!(%order_id, "Concurrent duplicate reservation ignored: {}", what);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn confirm(&self, order_id: Uuid, items: &[LineItem]) -> Result<(), CheckoutError> {
        self.settle(order_id, items, ReservationStatus::Confirmed).await?;
        info!(%order_id, "Inventory reservation confirmed");
        Ok(())
    }

    async fn release(&self, order_id: Uuid, items: &[LineItem]) -> Result<(), CheckoutError> {
        self.settle(order_id, items, ReservationStatus::Released).await?;
        info!(%order_id, "Inventory reservation released");
        Ok(())
    }

    async fn level(&self, product_id: Uuid) -> Result<Option<InventoryLevel>, CheckoutError> {
        let mut conn = self.pool.get().await?;
        let row = inventory::table
            .filter(inventory::product_id.eq(product_id))
            .select(Inventory::as_select())
            .first::<Inventory>(&mut conn)
            .await
            .optional()?;
        Ok(row.map(InventoryLevel::from))
    }
}
