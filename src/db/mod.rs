use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::{Duration, Instant};

pub mod credential_queries;
pub mod queries;
pub mod rate_limit_queries;

/// Connect to PostgreSQL. The API and the worker each hold one pool.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await
}

/// Apply pending migrations from `./migrations`.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Round-trip a trivial query and report how long it took.
pub async fn ping(pool: &PgPool) -> Result<Duration, sqlx::Error> {
    let start = Instant::now();
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(start.elapsed())
}
