//! Postgres-backed time-series source.

mod series;
mod util;

pub use util::map_sqlx_error;

use std::sync::Arc;

use sqlx::postgres::{PgPool, PgPoolOptions};

#[derive(Clone)]
pub struct PostgresRepositories {
    pool: Arc<PgPool>,
    released_only: bool,
}

impl PostgresRepositories {
    pub fn new(pool: PgPool, released_only: bool) -> Self {
        Self {
            pool: Arc::new(pool),
            released_only,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn released_only(&self) -> bool {
        self.released_only
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    /// Builds a pool that only connects on first use.
    pub fn connect_lazy(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
    }
}
