//! The one demo entity: an `Order` row, versioned and soft-deletable,
//! stored as a JSON document per spec §3/§4.2.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use txo_domain::{Entity, VersionedEntity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub customer_id: String,
    pub total_cents: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Entity for Order {
    const TABLE: &'static str = "orders";
    const PRIMARY_KEY_COLUMNS: &'static [&'static str] = &["id"];
    const SOFT_DELETE_COLUMN: Option<&'static str> = Some("deleted_at");

    fn primary_key(&self) -> Vec<String> {
        vec![self.id.clone()]
    }

    fn is_soft_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

impl VersionedEntity for Order {
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub customer_id: String,
    pub total_cents: i64,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub id: String,
    pub customer_id: String,
    pub total_cents: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        Self {
            id: order.id,
            customer_id: order.customer_id,
            total_cents: order.total_cents,
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}
