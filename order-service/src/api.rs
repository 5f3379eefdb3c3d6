use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use shared::CheckoutError;
use uuid::Uuid;

use crate::models::{Order, OrderItem};
use crate::store::OrderStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn OrderStore>,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub struct ApiError(CheckoutError);

impl From<CheckoutError> for ApiError {
    fn from(err: CheckoutError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CheckoutError::NotFound(_) => StatusCode::NOT_FOUND,
            CheckoutError::Transient(e) => {
                tracing::error!("Order storage failure: {:#}", e);
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::BAD_REQUEST,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/orders/:order_id", get(get_order))
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

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderResponse>, ApiError> {
    match state.store.find(order_id).await? {
        Some((order, items)) => Ok(Json(OrderResponse { order, items })),
        None => Err(CheckoutError::NotFound(format!("order {}", order_id)).into()),
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}
