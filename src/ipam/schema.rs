use crate::ipam::error::IpamResult;
use sqlx::SqlitePool;

pub struct PoolSchema {
    pool: SqlitePool,
}

impl PoolSchema {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize(&self) -> IpamResult<()> {
        self.create_ip_pool_table().await?;
        self.create_indexes().await?;

        tracing::debug!("ip pool schema initialized");
        Ok(())
    }

    async fn create_ip_pool_table(&self) -> IpamResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ip_pool (
                ip INTEGER PRIMARY KEY,
                subnet TEXT NOT NULL,
                key TEXT NOT NULL DEFAULT '',
                policy INTEGER NOT NULL DEFAULT 0,
                attr TEXT NOT NULL DEFAULT '',
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_indexes(&self) -> IpamResult<()> {
        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_ip_pool_key ON ip_pool(key)",
            "CREATE INDEX IF NOT EXISTS idx_ip_pool_subnet_updated ON ip_pool(subnet, updated_at)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        Ok(())
    }
}
