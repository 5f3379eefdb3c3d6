mod api;
mod cache;
mod clients;
mod orchestrator;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use shared::bootstrap;
use shared::tasks::BackgroundTasks;
use tracing::info;

use crate::cache::{InMemoryResponseCache, RedisResponseCache, ResponseCache};
use crate::clients::{HttpCartService, HttpPaymentStatus};
use crate::orchestrator::{CheckoutOrchestrator, OrchestratorConfig};

#[derive(Parser)]
#[command(name = "checkout-gateway")]
struct Args {
    #[arg(long, env = "CART_SERVICE_URL", default_value = "http://localhost:3005")]
    cart_url: String,

    #[arg(long, env = "PAYMENT_SERVICE_URL", default_value = "http://localhost:3002")]
    payment_url: String,

    /// Falls back to an in-process cache when unset.
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 700)]
    poll_interval_ms: u64,

    #[arg(long, env = "POLL_DEADLINE_MS", default_value_t = 15000)]
    poll_deadline_ms: u64,

    #[arg(long, env = "CACHE_TTL_SECS", default_value_t = 900)]
    cache_ttl_secs: u64,

    #[arg(long, env = "CACHE_WRITE_TIMEOUT_MS", default_value_t = 2000)]
    cache_write_timeout_ms: u64,

    #[arg(long, env = "BACKGROUND_TASK_CAPACITY", default_value_t = 64)]
    background_capacity: usize,

    #[arg(long, env = "HTTP_TIMEOUT_MS", default_value_t = 5000)]
    http_timeout_ms: u64,

    #[arg(long, env = "PORT", default_value = "3000")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::init_tracing();
    let args = Args::parse();

    let cache: Arc<dyn ResponseCache> = match &args.redis_url {
        Some(url) => {
            info!("Caching checkout responses in Redis");
            Arc::new(RedisResponseCache::connect(url).await?)
        }
        None => {
            info!("Caching checkout responses in memory");
            Arc::new(InMemoryResponseCache::new())
        }
    };

    let http = reqwest::Client::builder()
        .timeout(Duration::from_millis(args.http_timeout_ms))
        .build()?;
    let tasks = BackgroundTasks::new(
        args.background_capacity,
        Duration::from_millis(args.cache_write_timeout_ms),
    );

    let orchestrator = CheckoutOrchestrator::new(
        Arc::new(HttpCartService::new(http.clone(), args.cart_url.clone())),
        Arc::new(HttpPaymentStatus::new(http, args.payment_url.clone())),
        cache,
        tasks.clone(),
        OrchestratorConfig {
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            poll_deadline: Duration::from_millis(args.poll_deadline_ms),
            cache_ttl: Duration::from_secs(args.cache_ttl_secs),
        },
    );

    let shutdown = bootstrap::shutdown_token();
    let app = api::create_router(api::AppState {
        orchestrator: Arc::new(orchestrator),
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;

    info!("Checkout gateway listening on port {}", args.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    tasks.shutdown(Duration::from_secs(5)).await;
    info!("Checkout gateway stopped");
    Ok(())
}
