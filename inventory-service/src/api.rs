use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use shared::inventory::{InsufficientStockBody, InventoryLedger, InventoryLevel, InventoryRequest};
use shared::{CheckoutError, LineItem};
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn InventoryLedger>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LedgerResponse {
    pub order_id: Uuid,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    pub quantity: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckResponse {
    pub product_id: Uuid,
    pub quantity: i32,
    pub sufficient: bool,
}

pub struct ApiError(CheckoutError);

impl From<CheckoutError> for ApiError {
    fn from(err: CheckoutError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = self.0.to_string();
        match self.0 {
            CheckoutError::InsufficientStock {
                product_id,
                requested,
                available,
            } => (
                StatusCode::CONFLICT,
                Json(InsufficientStockBody {
                    error,
                    product_id,
                    requested,
                    available,
                }),
            )
                .into_response(),
            CheckoutError::Validation(_) => {
                (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": error }))).into_response()
            }
            CheckoutError::NotFound(_) => {
                (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": error }))).into_response()
            }
            CheckoutError::Duplicate(_) => {
                (StatusCode::OK, Json(serde_json::json!({ "status": "ignored" }))).into_response()
            }
            CheckoutError::Transient(_) => {
                tracing::error!("Inventory storage failure: {}", error);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(serde_json::json!({ "error": "inventory storage unavailable" })),
                )
                    .into_response()
            }
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/inventory/reserve", post(reserve))
        .route("/inventory/confirm", post(confirm))
        .route("/inventory/release", post(release))
        .route("/inventory/:product_id", get(get_level))
        .route("/inventory/:product_id/check", get(check))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn reserve(
    State(state): State<AppState>,
    Json(request): Json<InventoryRequest>,
) -> Result<Json<LedgerResponse>, ApiError> {
    state.ledger.reserve(request.order_id, &request.items).await?;
    low_stock(&*state.ledger, &request.items).await;
    Ok(Json(LedgerResponse {
        order_id: request.order_id,
        status: "reserved".to_string(),
    }))
}

/// Warns about products at or below their restock threshold. The
/// reservation is already committed, so lookup failures are only logged.
async fn low_stock(ledger: &dyn InventoryLedger, items: &[LineItem]) -> Vec<Uuid> {
    let mut low = Vec::new();
    for item in items {
        if low.contains(&item.product_id) {
            continue;
        }
        match ledger.level(item.product_id).await {
            Ok(Some(level)) if level.is_low() => {
                warn!(
                    product_id = %level.product_id,
                    available = level.available,
                    threshold = level.threshold,
                    "Stock at or below threshold"
                );
                low.push(level.product_id);
            }
            Ok(_) => {}
            Err(e) => warn!(product_id = %item.product_id, "Stock level lookup failed: {}", e),
        }
    }
    low
}

pub async fn confirm(
    State(state): State<AppState>,
    Json(request): Json<InventoryRequest>,
) -> Result<Json<LedgerResponse>, ApiError> {
    state.ledger.confirm(request.order_id, &request.items).await?;
    Ok(Json(LedgerResponse {
        order_id: request.order_id,
        status: "confirmed".to_string(),
    }))
}

pub async fn release(
    State(state): State<AppState>,
    Json(request): Json<InventoryRequest>,
) -> Result<Json<LedgerResponse>, ApiError> {
    state.ledger.release(request.order_id, &request.items).await?;
    Ok(Json(LedgerResponse {
        order_id: request.order_id,
        status: "released".to_string(),
    }))
}

pub async fn get_level(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
) -> Result<Json<InventoryLevel>, ApiError> {
    match state.ledger.level(product_id).await? {
        Some(level) => Ok(Json(level)),
        None => Err(CheckoutError::NotFound(format!("inventory for product {}", product_id)).into()),
    }
}

pub async fn check(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    Query(query): Query<CheckQuery>,
) -> Result<Json<CheckResponse>, ApiError> {
    let sufficient = state.ledger.check(product_id, query.quantity).await?;
    Ok(Json(CheckResponse {
        product_id,
        quantity: query.quantity,
        sufficient,
    }))
}

pub async fn health_check() -> &'static str {
    "OK"
}
