use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use shared::context::RequestContext;

use crate::orchestrator::{CheckoutOrchestrator, CheckoutOutcome, GatewayError};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<CheckoutOrchestrator>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub struct ApiError(GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::MissingIdempotencyKey | GatewayError::EmptyCart => StatusCode::BAD_REQUEST,
            GatewayError::Upstream(e) => {
                tracing::error!("Checkout collaborator failure: {:#}", e);
                StatusCode::BAD_GATEWAY
            }
            GatewayError::Encoding(e) => {
                tracing::error!("Checkout response encoding failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
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
        .route("/checkout", post(checkout))
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

pub async fn checkout(
    State(state): State<AppState>,
    ctx: RequestContext,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(GatewayError::MissingIdempotencyKey)?;

    let response = match state.orchestrator.checkout(&ctx, key).await? {
        CheckoutOutcome::Cached(body) | CheckoutOutcome::Ready(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        CheckoutOutcome::Pending(pending) => (StatusCode::ACCEPTED, Json(pending)).into_response(),
    };
    Ok(response)
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tests::{orchestrator, FakeCart, ScriptedPayments};
    use axum::body::Body;
    use axum::http::Request;
    use shared::context::USER_ID_HEADER;
    use shared::tasks::BackgroundTasks;
    use std::time::Duration;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn app(items: usize, ready_on: Option<usize>) -> (Router, Uuid) {
        let order_id = Uuid::new_v4();
        let gateway = orchestrator(
            Arc::new(FakeCart {
                items,
                order_id,
                ..FakeCart::default()
            }),
            Arc::new(ScriptedPayments {
                ready_on,
                ..ScriptedPayments::default()
            }),
            BackgroundTasks::new(4, Duration::from_secs(1)),
        );
        (
            create_router(AppState {
                orchestrator: Arc::new(gateway),
            }),
            order_id,
        )
    }

    fn request(key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/checkout")
            .header(USER_ID_HEADER, Uuid::new_v4().to_string());
        if let Some(key) = key {
            builder = builder.header("Idempotency-Key", key);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn ready_checkout_returns_200_with_url() {
        let (app, order_id) = app(1, Some(1));

        let response = app.oneshot(request(Some("K1"))).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["order_id"], order_id.to_string());
        assert_eq!(body["checkout_url"], "https://checkout.example/c/cs_1");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_payment_returns_202_with_poll_url() {
        let (app, order_id) = app(1, None);

        let response = app.oneshot(request(Some("K1"))).await.unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json(response).await;
        assert_eq!(body["status"], "PENDING_PAYMENT");
        assert!(body["checkout_url"].is_null());
        assert_eq!(
            body["poll_url"],
            format!("/payment/status/by-order/{}", order_id)
        );
    }

    #[tokio::test]
    async fn missing_idempotency_key_is_400() {
        let (app, _) = app(1, Some(1));
        let response = app.oneshot(request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_cart_is_400() {
        let (app, _) = app(0, Some(1));
        let response = app.oneshot(request(Some("K1"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_identity_is_401() {
        let (app, _) = app(1, Some(1));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/checkout")
                    .header("Idempotency-Key", "K1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
