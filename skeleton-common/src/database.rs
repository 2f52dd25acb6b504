use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::config::DatabaseConfig;

/// Opens the service pool. Connects eagerly, so an unreachable database
/// fails here rather than on the first request.
pub async fn connect(
    config: &DatabaseConfig,
    application_name: &str,
) -> Result<PgPool, sqlx::Error> {
    let options =
        PgConnectOptions::from_str(&config.database_url)?.application_name(application_name);

    PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .acquire_timeout(config.acquire_timeout.0)
        .test_before_acquire(true)
        .connect_with(options)
        .await
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub firstname: String,
    pub lastname: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub firstname: String,
    pub lastname: String,
}

/// Queries over the `users` table. Soft deleted users (`deleted_at` set)
/// are never returned.
#[derive(Clone)]
pub struct UserStore {
    pool: PgPool,
}

impl UserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list_active(&self) -> Result<Vec<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
SELECT id, email, firstname, lastname, created_at, updated_at, deleted_at
FROM users
WHERE deleted_at IS NULL
ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn get_active(&self, id: Uuid) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
SELECT id, email, firstname, lastname, created_at, updated_at, deleted_at
FROM users
WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub async fn insert(&self, user: NewUser) -> Result<User, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
INSERT INTO users (id, email, firstname, lastname, created_at, updated_at)
VALUES ($1, $2, $3, $4, NOW(), NOW())
RETURNING id, email, firstname, lastname, created_at, updated_at, deleted_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user.email)
        .bind(user.firstname)
        .bind(user.lastname)
        .fetch_one(&self.pool)
        .await
    }

    /// Returns false if there was no active user with that id.
    #[cfg(any(test, feature = "test-utils"))]
    pub async fn soft_delete(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
UPDATE users
SET deleted_at = NOW(), updated_at = NOW()
WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn count_active(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE deleted_at IS NULL")
            .fetch_one(&self.pool)
            .await
    }
}
