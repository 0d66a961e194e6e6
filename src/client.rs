//! The `Client` capability: the SQL driver and connection pool are assumed,
//! not implemented, by the core. This module defines the trait seam
//! and the one concrete implementation this crate ships (`SqlxClient`), which
//! wraps `sqlx::AnyPool` so the same query surface targets Postgres, MySQL, or
//! SQLite depending on the DSN scheme.

use async_trait::async_trait;
use sqlx::any::{install_default_drivers, AnyPoolOptions};
use sqlx::AnyPool;

use crate::error::{Result, SessionError};

/// The SQL engine behind a `Client`, used by the Schema Manager to select
/// DDL dialect and verification queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Postgres,
    MySql,
    Sqlite,
}

impl Engine {
    pub fn from_dsn(dsn: &str) -> Result<Self> {
        if dsn.starts_with("postgres://") || dsn.starts_with("postgresql://") {
            Ok(Engine::Postgres)
        } else if dsn.starts_with("mysql://") {
            Ok(Engine::MySql)
        } else if dsn.starts_with("sqlite:") {
            Ok(Engine::Sqlite)
        } else {
            Err(SessionError::invalid(format!(
                "unrecognized DSN scheme in '{dsn}'"
            )))
        }
    }
}

/// Database driver and connection pool capability. The core depends only on
/// this trait; callers supply a concrete implementation (or the default
/// `SqlxClient`) when constructing the `Service`.
#[async_trait]
pub trait Client: Send + Sync {
    /// The underlying engine, used to select per-engine DDL and verification.
    fn engine(&self) -> Engine;

    /// The pool backing this client, for components that issue `sqlx::query`
    /// calls directly against a portable SQL subset.
    fn pool(&self) -> &AnyPool;

    async fn close(&self);
}

/// Default `Client` implementation backed by `sqlx::AnyPool`.
pub struct SqlxClient {
    engine: Engine,
    pool: AnyPool,
}

impl SqlxClient {
    /// Connects using the given DSN. `max_connections` bounds the pool size.
    pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self> {
        install_default_drivers();
        let engine = Engine::from_dsn(dsn)?;
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(dsn)
            .await
            .map_err(SessionError::from)?;
        Ok(Self { engine, pool })
    }
}

#[async_trait]
impl Client for SqlxClient {
    fn engine(&self) -> Engine {
        self.engine
    }

    fn pool(&self) -> &AnyPool {
        &self.pool
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_from_dsn() {
        assert_eq!(Engine::from_dsn("sqlite::memory:").unwrap(), Engine::Sqlite);
        assert_eq!(
            Engine::from_dsn("postgres://localhost/db").unwrap(),
            Engine::Postgres
        );
        assert_eq!(Engine::from_dsn("mysql://localhost/db").unwrap(), Engine::MySql);
        assert!(Engine::from_dsn("oracle://localhost/db").is_err());
    }

    #[tokio::test]
    async fn connects_to_in_memory_sqlite() {
        let client = SqlxClient::connect("sqlite::memory:", 1).await.unwrap();
        assert_eq!(client.engine(), Engine::Sqlite);
        client.close().await;
    }
}
