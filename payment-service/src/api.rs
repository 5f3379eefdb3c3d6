use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use shared::{CheckoutError, PaymentStatusView};
use uuid::Uuid;

use crate::store::PaymentStore;
use crate::webhook::{WebhookError, WebhookHandler, WebhookOutcome, SIGNATURE_HEADER};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PaymentStore>,
    pub webhooks: Arc<WebhookHandler>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignored: Option<&'static str>,
}

pub enum ApiError {
    Storage(CheckoutError),
    Webhook(WebhookError),
}

impl From<CheckoutError> for ApiError {
    fn from(err: CheckoutError) -> Self {
        ApiError::Storage(err)
    }
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        ApiError::Webhook(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::Webhook(WebhookError::Signature(e)) => (StatusCode::BAD_REQUEST, e.to_string()),
            ApiError::Webhook(WebhookError::Payload(e)) => (StatusCode::BAD_REQUEST, e.to_string()),
            ApiError::Webhook(WebhookError::Storage(e)) | ApiError::Storage(e) => {
                tracing::error!("Payment storage failure: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "payment storage unavailable".to_string())
            }
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/payment/status/by-order/:order_id", get(payment_status))
        .route("/payment/webhook", post(webhook))
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

pub async fn payment_status(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<PaymentStatusView>, ApiError> {
    let view = state
        .store
        .find_by_order(order_id)
        .await?
        .map(|payment| payment.view())
        .unwrap_or_else(|| PaymentStatusView::pending(order_id));
    Ok(Json(view))
}

pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let ignored = match state.webhooks.handle(signature, &body).await? {
        WebhookOutcome::Applied { .. } => None,
        WebhookOutcome::Ignored(reason) => Some(reason),
    };
    Ok(Json(WebhookAck {
        received: true,
        ignored,
    }))
}

pub async fn health_check() -> &'static str {
    "OK"
}
