use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use shared::inventory::InventoryLevel;
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = crate::schema::inventory)]
#[diesel(primary_key(product_id))]
pub struct Inventory {
    pub product_id: Uuid,
    pub available: i32,
    pub reserved: i32,
    pub threshold: i32,
    pub updated_at: DateTime<Utc>,
}

impl From<Inventory> for InventoryLevel {
    fn from(row: Inventory) -> Self {
        Self {
            product_id: row.product_id,
            available: row.available,
            reserved: row.reserved,
            threshold: row.threshold,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::reservations)]
pub struct Reservation {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::reservations)]
pub struct NewReservation {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub status: String,
}
