use anyhow::Result;
use diesel::{Connection, PgConnection};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness};
use tracing::info;

pub type DbPool = bb8::Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;

pub async fn connect(database_url: &str, max_size: u32) -> Result<DbPool> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = bb8::Pool::builder().max_size(max_size).build(config).await?;
    Ok(pool)
}

/// Applies pending embedded migrations on a dedicated blocking connection.
pub async fn run_migrations(database_url: &str, migrations: EmbeddedMigrations) -> Result<()> {
    let url = database_url.to_string();
    tokio::task::spawn_blocking(move || -> Result<()> {
        info!("Running database migrations...");
        let mut conn = PgConnection::establish(&url)?;
        let applied = conn
            .run_pending_migrations(migrations)
            .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
        info!(applied = applied.len(), "Migrations completed successfully");
        Ok(())
    })
    .await?
}
