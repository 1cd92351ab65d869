use sqlx::PgPool;
use std::sync::Arc;

use crate::services::{
    auth::Authenticator, orchestrator::Orchestrator, queue::JobQueue,
    rate_limit::RateLimiter, validation::InputValidator,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub authenticator: Authenticator,
    pub rate_limiter: RateLimiter,
    pub validator: Arc<InputValidator>,
    pub orchestrator: Orchestrator,
    /// Present only when jobs are persisted in PostgreSQL.
    pub db: Option<PgPool>,
    /// Present only when generation is dispatched through Redis.
    pub queue: Option<Arc<JobQueue>>,
}

impl AppState {
    pub fn new(
        authenticator: Authenticator,
        rate_limiter: RateLimiter,
        validator: InputValidator,
        orchestrator: Orchestrator,
    ) -> Self {
        Self {
            authenticator,
            rate_limiter,
            validator: Arc::new(validator),
            orchestrator,
            db: None,
            queue: None,
        }
    }

    pub fn with_database(mut self, pool: PgPool) -> Self {
        self.db = Some(pool);
        self
    }

    pub fn with_queue(mut self, queue: Arc<JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }
}
