use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::ipam::error::{IpamError, IpamResult};

/// One row of the floating ip pool. An address is free iff `key` is the
/// empty string; allocation and release are conditional updates on that
/// sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloatingIp {
    /// IPv4 address in host byte order.
    pub ip: u32,
    /// CIDR of the subnet this address belongs to. Immutable after seeding.
    pub subnet: String,
    /// Owner key, `""` when the address is free.
    pub key: String,
    /// Release policy, opaque to the store.
    pub policy: u16,
    /// Opaque pod metadata payload.
    pub attr: String,
    /// Unix timestamp, rewritten on every mutation.
    pub updated_at: i64,
}

impl FloatingIp {
    pub fn addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }
}

type FipRow = (i64, String, String, i64, String, i64);

fn row_to_fip(row: FipRow) -> FloatingIp {
    FloatingIp {
        ip: row.0 as u32,
        subnet: row.1,
        key: row.2,
        policy: row.3 as u16,
        attr: row.4,
        updated_at: row.5,
    }
}

const FIP_COLUMNS: &str = "ip, subnet, key, policy, attr, updated_at";

pub(crate) fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

pub async fn open_pool(database_path: &str) -> IpamResult<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(database_path)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Typed operations on the `ip_pool` table. Every public method runs in
/// exactly one store transaction; concurrent allocators serialize at the
/// row level through the `key = ''` predicates and the rows-affected
/// checks, never through application locks.
pub struct FipStore {
    pool: SqlitePool,
}

#[allow(dead_code)]
impl FipStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_all(&self) -> IpamResult<Vec<FloatingIp>> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<FipRow> =
            sqlx::query_as(&format!("SELECT {} FROM ip_pool", FIP_COLUMNS))
                .fetch_all(&mut *tx)
                .await?;
        tx.commit().await?;

        Ok(rows.into_iter().map(row_to_fip).collect())
    }

    /// Free rows, lowest address first, up to `limit`. The ordering makes
    /// allocation deterministic across replicas.
    pub async fn find_available(&self, limit: u32) -> IpamResult<Vec<FloatingIp>> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<FipRow> = sqlx::query_as(&format!(
            "SELECT {} FROM ip_pool WHERE key = '' ORDER BY ip ASC LIMIT ?",
            FIP_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(rows.into_iter().map(row_to_fip).collect())
    }

    /// Free rows within one subnet, lowest address first.
    pub async fn find_available_in_subnet(
        &self,
        subnet: &str,
        limit: u32,
    ) -> IpamResult<Vec<FloatingIp>> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<FipRow> = sqlx::query_as(&format!(
            "SELECT {} FROM ip_pool WHERE key = '' AND subnet = ? ORDER BY ip ASC LIMIT ?",
            FIP_COLUMNS
        ))
        .bind(subnet)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(rows.into_iter().map(row_to_fip).collect())
    }

    /// All rows held by `key`, most recently updated first. Not finding
    /// any is not an error.
    pub async fn find_by_key(&self, key: &str) -> IpamResult<Vec<FloatingIp>> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<FipRow> = sqlx::query_as(&format!(
            "SELECT {} FROM ip_pool WHERE key = ? ORDER BY updated_at DESC",
            FIP_COLUMNS
        ))
        .bind(key)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(rows.into_iter().map(row_to_fip).collect())
    }

    /// Rows whose key starts with `prefix`, as a literal prefix comparison.
    pub async fn find_by_prefix(&self, prefix: &str) -> IpamResult<Vec<FloatingIp>> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<FipRow> = sqlx::query_as(&format!(
            "SELECT {} FROM ip_pool WHERE substr(key, 1, ?) = ?",
            FIP_COLUMNS
        ))
        .bind(prefix.len() as i64)
        .bind(prefix)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(rows.into_iter().map(row_to_fip).collect())
    }

    /// Exact lookup; a missing row is an error here, unlike `find_by_key`.
    pub async fn find_by_ip(&self, ip: u32) -> IpamResult<FloatingIp> {
        let mut tx = self.pool.begin().await?;
        let row: Option<FipRow> = sqlx::query_as(&format!(
            "SELECT {} FROM ip_pool WHERE ip = ?",
            FIP_COLUMNS
        ))
        .bind(ip as i64)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;

        row.map(row_to_fip).ok_or(IpamError::NotFound {
            what: Ipv4Addr::from(ip).to_string(),
        })
    }

    /// Seed one row. Fails on duplicate addresses; `(ip)` is the primary
    /// key.
    pub async fn create(&self, fip: &FloatingIp) -> IpamResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO ip_pool (ip, subnet, key, policy, attr, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(fip.ip as i64)
        .bind(&fip.subnet)
        .bind(&fip.key)
        .bind(fip.policy as i64)
        .bind(&fip.attr)
        .bind(now_ts())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(())
    }

    /// Claim a free address for `key`. Exactly one row must transition
    /// `'' -> key`; anything else means the row lost a race and the caller
    /// gets `NotUpdated`.
    pub async fn allocate_op(&self, ip: u32, key: &str) -> IpamResult<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE ip_pool SET key = ?, updated_at = ? WHERE ip = ? AND key = ''",
        )
        .bind(key)
        .bind(now_ts())
        .bind(ip as i64)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Err(IpamError::NotUpdated);
        }
        tx.commit().await?;

        Ok(())
    }

    /// Claim one specific address. `NotUpdated` when the address is
    /// already held.
    pub async fn allocate_specific_ip(
        &self,
        ip: u32,
        key: &str,
        policy: u16,
        attr: &str,
    ) -> IpamResult<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE ip_pool SET key = ?, policy = ?, attr = ?, updated_at = ? WHERE ip = ? AND key = ''",
        )
        .bind(key)
        .bind(policy as i64)
        .bind(attr)
        .bind(now_ts())
        .bind(ip as i64)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Err(IpamError::NotUpdated);
        }
        tx.commit().await?;

        Ok(())
    }

    /// Release `ip` held by `key`, zeroing policy and attr. `NotUpdated`
    /// when the row is not in that state, which makes release idempotence
    /// observable to the caller.
    pub async fn release_ip(&self, key: &str, ip: u32) -> IpamResult<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE ip_pool SET key = '', policy = 0, attr = '', updated_at = ? WHERE ip = ? AND key = ?",
        )
        .bind(now_ts())
        .bind(ip as i64)
        .bind(key)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Err(IpamError::NotUpdated);
        }
        tx.commit().await?;

        Ok(())
    }

    /// Release every row whose key starts with `prefix`. No affected-row
    /// check; releasing nothing is fine.
    pub async fn release_by_prefix(&self, prefix: &str) -> IpamResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE ip_pool SET key = '', policy = 0, attr = '', updated_at = ? WHERE substr(key, 1, ?) = ?",
        )
        .bind(now_ts())
        .bind(prefix.len() as i64)
        .bind(prefix)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(())
    }

    /// Within `subnet`, retag the single most-recently-updated row owned
    /// by `old_key` to `new_key`. The single-row selection runs as a
    /// subquery because stock SQLite has no UPDATE ... ORDER BY ... LIMIT.
    pub async fn update_one_in_subnet(
        &self,
        old_key: &str,
        new_key: &str,
        subnet: &str,
        policy: u16,
        attr: &str,
    ) -> IpamResult<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE ip_pool SET key = ?, policy = ?, attr = ?, updated_at = ?
            WHERE ip = (
                SELECT ip FROM ip_pool WHERE key = ? AND subnet = ?
                ORDER BY updated_at DESC LIMIT 1
            )
        "#,
        )
        .bind(new_key)
        .bind(policy as i64)
        .bind(attr)
        .bind(now_ts())
        .bind(old_key)
        .bind(subnet)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Err(IpamError::NotUpdated);
        }
        tx.commit().await?;

        Ok(())
    }

    pub async fn update_policy(
        &self,
        ip: u32,
        key: &str,
        policy: u16,
        attr: &str,
    ) -> IpamResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE ip_pool SET policy = ?, attr = ?, updated_at = ? WHERE ip = ? AND key = ?",
        )
        .bind(policy as i64)
        .bind(attr)
        .bind(now_ts())
        .bind(ip as i64)
        .bind(key)
        .execute(&mut *tx)
        .await?;
        // no rows-affected check: policy and attr may be rewritten to the
        // values they already hold
        tx.commit().await?;

        Ok(())
    }

    /// Unconditional mass rename of every row held by `old_key`.
    pub async fn update_key(&self, old_key: &str, new_key: &str, attr: &str) -> IpamResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE ip_pool SET key = ?, attr = ?, updated_at = ? WHERE key = ?")
            .bind(new_key)
            .bind(attr)
            .bind(now_ts())
            .bind(old_key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(())
    }

    pub async fn query_by_key_group_by_subnet(&self, key: &str) -> IpamResult<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT subnet FROM ip_pool WHERE key = ? ORDER BY subnet",
        )
        .bind(key)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(rows.into_iter().map(|(subnet,)| subnet).collect())
    }

    /// Substring search over keys. `_` and `%` are SQL LIKE wildcards and
    /// pod keys always contain `_`, so both are escaped to literals.
    pub async fn get_by_keyword(&self, keyword: &str) -> IpamResult<Vec<FloatingIp>> {
        let escaped = keyword
            .replace('\\', "\\\\")
            .replace('_', "\\_")
            .replace('%', "\\%");

        let mut tx = self.pool.begin().await?;
        let rows: Vec<FipRow> = sqlx::query_as(&format!(
            "SELECT {} FROM ip_pool WHERE key LIKE ? ESCAPE '\\'",
            FIP_COLUMNS
        ))
        .bind(format!("%{}%", escaped))
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(rows.into_iter().map(row_to_fip).collect())
    }

    /// Hard delete. The IN list is the one piece of SQL shaped by data;
    /// the addresses themselves are still bound as parameters.
    pub async fn delete_unscoped(&self, ips: &[u32]) -> IpamResult<u64> {
        if ips.is_empty() {
            return Ok(0);
        }
        for ip in ips {
            tracing::debug!("will delete unscoped ip: {}", Ipv4Addr::from(*ip));
        }

        let placeholders = vec!["?"; ips.len()].join(", ");
        let sql = format!("DELETE FROM ip_pool WHERE ip IN ({})", placeholders);

        let mut tx = self.pool.begin().await?;
        let mut query = sqlx::query(&sql);
        for ip in ips {
            query = query.bind(*ip as i64);
        }
        let result = query.execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(result.rows_affected())
    }

    /// Best-effort bulk release of `ip -> key` bindings. Rows whose
    /// release misses its precondition are re-read so the returned
    /// `undeleted` map reflects the key that actually holds each address
    /// now. Only hard store errors abort the walk.
    pub async fn delete_ips(
        &self,
        ip_to_key: &HashMap<String, String>,
    ) -> IpamResult<(HashMap<String, String>, HashMap<String, String>)> {
        let mut deleted = HashMap::new();
        let mut undeleted: HashMap<String, String> = ip_to_key.clone();

        for (ip_str, key) in ip_to_key {
            let ip: Ipv4Addr = ip_str
                .parse()
                .map_err(|_| IpamError::InvalidIp(ip_str.clone()))?;
            match self.release_ip(key, u32::from(ip)).await {
                Ok(()) => {
                    deleted.insert(ip_str.clone(), key.clone());
                    undeleted.remove(ip_str);
                }
                Err(IpamError::NotUpdated) => match self.find_by_ip(u32::from(ip)).await {
                    Ok(fip) => {
                        undeleted.insert(ip_str.clone(), fip.key);
                    }
                    Err(IpamError::NotFound { .. }) => continue,
                    Err(e) => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }

        Ok((deleted, undeleted))
    }
}
