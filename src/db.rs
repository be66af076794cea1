use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::error::CacheError;
use crate::models::EntityTable;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Entity cache kept in Postgres, one row per entity name.
#[derive(Clone)]
pub struct PgCacheStore {
    pool: PgPool,
}

impl PgCacheStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheStore for PgCacheStore {
    async fn get(&self, key: &str) -> Result<Option<EntityTable>, CacheError> {
        let row = sqlx::query(
            "SELECT payload FROM attendance_watch.entity_cache WHERE entity_name = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let Json(table): Json<EntityTable> = row.try_get("payload")?;
                Ok(Some(table))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, table: &EntityTable) -> Result<(), CacheError> {
        sqlx::query(
            r#"
            INSERT INTO attendance_watch.entity_cache
            (id, entity_name, payload, row_count, fetched_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (entity_name) DO UPDATE
            SET payload = EXCLUDED.payload,
                row_count = EXCLUDED.row_count,
                fetched_at = EXCLUDED.fetched_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key)
        .bind(Json(table))
        .bind(i32::try_from(table.len()).unwrap_or(i32::MAX))
        .bind(table.fetched_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
