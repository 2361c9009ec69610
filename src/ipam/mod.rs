// Floating-IP allocation: a pool of routable IPv4 addresses persisted in
// SQLite, bound to pod keys. The store's row-level predicates are the only
// concurrency primitive; this layer adds the retry/rebind policy on top.

pub mod error;
pub mod schema;
pub mod store;

use std::collections::HashMap;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use sqlx::SqlitePool;

pub use error::{IpamError, IpamResult};
pub use schema::PoolSchema;
pub use store::{open_pool, FipStore, FloatingIp};

/// Attempts before a lost allocation race is surfaced as a conflict.
const ALLOCATE_RETRIES: usize = 3;

/// Policy layer above the pool store. Guarantees at most one address per
/// `(subnet, key)`: a repeated allocation for a key that already holds an
/// address returns that binding instead of taking a second row.
pub struct FloatingIpAllocator {
    store: FipStore,
}

#[allow(dead_code)]
impl FloatingIpAllocator {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            store: FipStore::new(pool),
        }
    }

    pub fn store(&self) -> &FipStore {
        &self.store
    }

    /// Bind an address to `key`, optionally scoped to one subnet. The
    /// candidate is always the lowest free address; a row that loses its
    /// race yields `NotUpdated` from the store and is retried with a fresh
    /// candidate up to the retry bound.
    pub async fn allocate(
        &self,
        key: &str,
        subnet: Option<&str>,
        policy: u16,
        attr: &str,
    ) -> IpamResult<(Ipv4Addr, String)> {
        if let Some(existing) = self.find_bound(key, subnet).await? {
            tracing::debug!(
                "{} already holds {} in {}",
                key,
                existing.addr(),
                existing.subnet
            );
            return Ok((existing.addr(), existing.subnet));
        }

        for _ in 0..ALLOCATE_RETRIES {
            let candidates = match subnet {
                Some(s) => self.store.find_available_in_subnet(s, 1).await?,
                None => self.store.find_available(1).await?,
            };
            let Some(candidate) = candidates.into_iter().next() else {
                return Err(IpamError::PoolExhausted);
            };

            match self.store.allocate_op(candidate.ip, key).await {
                Ok(()) => {
                    self.store
                        .update_policy(candidate.ip, key, policy, attr)
                        .await?;
                    tracing::info!(
                        "allocated {} in {} for {}",
                        candidate.addr(),
                        candidate.subnet,
                        key
                    );
                    return Ok((candidate.addr(), candidate.subnet));
                }
                Err(IpamError::NotUpdated) => {
                    tracing::debug!("lost allocation race for {}", candidate.addr());
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(IpamError::Conflict {
            key: key.to_string(),
        })
    }

    /// Claim one specific address for `key`.
    pub async fn allocate_specific(
        &self,
        ip: Ipv4Addr,
        key: &str,
        policy: u16,
        attr: &str,
    ) -> IpamResult<()> {
        self.store
            .allocate_specific_ip(u32::from(ip), key, policy, attr)
            .await
    }

    /// The most recent binding for `key`, optionally restricted to one
    /// subnet.
    pub async fn find_bound(
        &self,
        key: &str,
        subnet: Option<&str>,
    ) -> IpamResult<Option<FloatingIp>> {
        let rows = self.store.find_by_key(key).await?;
        Ok(rows
            .into_iter()
            .find(|fip| subnet.map_or(true, |s| fip.subnet == s)))
    }

    pub async fn release(&self, key: &str, ip: Ipv4Addr) -> IpamResult<()> {
        self.store.release_ip(key, u32::from(ip)).await
    }

    /// Release every address held by `key`. A row raced away from under us
    /// is skipped; its new owner is responsible for it.
    pub async fn release_all(&self, key: &str) -> IpamResult<Vec<Ipv4Addr>> {
        let mut released = Vec::new();
        for fip in self.store.find_by_key(key).await? {
            match self.store.release_ip(key, fip.ip).await {
                Ok(()) => released.push(fip.addr()),
                Err(IpamError::NotUpdated) => {
                    tracing::debug!("{} changed hands before release", fip.addr());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(released)
    }

    /// Namespace- or app-wide cleanup; `prefix` is caller-supplied, e.g.
    /// `"<namespace>_"`.
    pub async fn release_by_prefix(&self, prefix: &str) -> IpamResult<()> {
        self.store.release_by_prefix(prefix).await
    }

    /// Used during pod re-creation: the new pod inherits the old pod's
    /// most recently used address within the subnet.
    pub async fn rebind_in_subnet(
        &self,
        old_key: &str,
        new_key: &str,
        subnet: &str,
        policy: u16,
        attr: &str,
    ) -> IpamResult<()> {
        self.store
            .update_one_in_subnet(old_key, new_key, subnet, policy, attr)
            .await
    }

    pub async fn rename_key(&self, old_key: &str, new_key: &str, attr: &str) -> IpamResult<()> {
        self.store.update_key(old_key, new_key, attr).await
    }

    pub async fn subnets_of(&self, key: &str) -> IpamResult<Vec<String>> {
        self.store.query_by_key_group_by_subnet(key).await
    }

    pub async fn search(&self, keyword: &str) -> IpamResult<Vec<FloatingIp>> {
        self.store.get_by_keyword(keyword).await
    }

    /// Best-effort reconciliation with upstream truth: release the given
    /// `ip -> key` bindings and report what actually happened.
    pub async fn reconcile(
        &self,
        ip_to_key: &HashMap<String, String>,
    ) -> IpamResult<(HashMap<String, String>, HashMap<String, String>)> {
        self.store.delete_ips(ip_to_key).await
    }

    /// Seed one free row per host address in `cidr`. Already-seeded
    /// addresses are left untouched, so seeding is safe to repeat on every
    /// startup. Returns the number of rows created.
    pub async fn seed_subnet(&self, cidr: &str) -> IpamResult<usize> {
        let network: Ipv4Network = cidr.parse()?;
        let mut created = 0;

        for addr in network.iter() {
            if network.prefix() < 31
                && (addr == network.network() || addr == network.broadcast())
            {
                continue;
            }
            let row = FloatingIp {
                ip: u32::from(addr),
                subnet: cidr.to_string(),
                key: String::new(),
                policy: 0,
                attr: String::new(),
                updated_at: 0,
            };
            match self.store.create(&row).await {
                Ok(()) => created += 1,
                Err(IpamError::Database(sqlx::Error::Database(db)))
                    if db.is_unique_violation() =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        if created > 0 {
            tracing::info!("seeded {} floating ips from {}", created, cidr);
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn setup_allocator(subnet: &str) -> (NamedTempFile, FloatingIpAllocator) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();

        let pool = open_pool(db_path).await.unwrap();
        PoolSchema::new(pool.clone()).initialize().await.unwrap();

        let allocator = FloatingIpAllocator::new(pool);
        allocator.seed_subnet(subnet).await.unwrap();

        (temp_file, allocator)
    }

    #[tokio::test]
    async fn allocate_then_release() {
        let (_db, allocator) = setup_allocator("10.0.0.0/30").await;

        let (ip, subnet) = allocator.allocate("ns_app", None, 0, "").await.unwrap();
        assert_eq!(ip, "10.0.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(subnet, "10.0.0.0/30");

        let bound = allocator.find_bound("ns_app", None).await.unwrap().unwrap();
        assert_eq!(bound.key, "ns_app");

        allocator.release("ns_app", ip).await.unwrap();
        assert!(allocator.find_bound("ns_app", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn allocate_is_idempotent_per_key() {
        let (_db, allocator) = setup_allocator("10.0.0.0/29").await;

        let first = allocator.allocate("ns_app", None, 0, "").await.unwrap();
        let second = allocator.allocate("ns_app", None, 0, "").await.unwrap();
        assert_eq!(first, second);

        // only one row is held
        let held = allocator.store().find_by_key("ns_app").await.unwrap();
        assert_eq!(held.len(), 1);
    }

    #[tokio::test]
    async fn allocate_exhausts_pool() {
        // /30 has two usable hosts
        let (_db, allocator) = setup_allocator("10.0.0.0/30").await;

        allocator.allocate("pod_a", None, 0, "").await.unwrap();
        allocator.allocate("pod_b", None, 0, "").await.unwrap();
        let third = allocator.allocate("pod_c", None, 0, "").await;
        assert!(matches!(third, Err(IpamError::PoolExhausted)));
    }

    #[tokio::test]
    async fn allocate_scoped_to_subnet() {
        let (_db, allocator) = setup_allocator("10.0.0.0/30").await;
        allocator.seed_subnet("10.0.1.0/30").await.unwrap();

        let (ip, subnet) = allocator
            .allocate("ns_app", Some("10.0.1.0/30"), 0, "")
            .await
            .unwrap();
        assert_eq!(ip, "10.0.1.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(subnet, "10.0.1.0/30");

        // a key may hold one address per subnet
        let (other_ip, _) = allocator
            .allocate("ns_app", Some("10.0.0.0/30"), 0, "")
            .await
            .unwrap();
        assert_ne!(ip, other_ip);
        assert_eq!(allocator.subnets_of("ns_app").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn seeding_twice_creates_nothing_new() {
        let (_db, allocator) = setup_allocator("10.0.0.0/30").await;
        let created = allocator.seed_subnet("10.0.0.0/30").await.unwrap();
        assert_eq!(created, 0);
    }

    #[tokio::test]
    async fn rebind_moves_one_binding() {
        let (_db, allocator) = setup_allocator("10.0.0.0/29").await;
        allocator.allocate("old", None, 0, "").await.unwrap();

        allocator
            .rebind_in_subnet("old", "new", "10.0.0.0/29", 0, "")
            .await
            .unwrap();

        assert!(allocator.find_bound("old", None).await.unwrap().is_none());
        assert!(allocator.find_bound("new", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn release_all_clears_every_subnet() {
        let (_db, allocator) = setup_allocator("10.0.0.0/30").await;
        allocator.seed_subnet("10.0.1.0/30").await.unwrap();

        allocator.allocate("ns_app", Some("10.0.0.0/30"), 0, "").await.unwrap();
        allocator.allocate("ns_app", Some("10.0.1.0/30"), 0, "").await.unwrap();

        let released = allocator.release_all("ns_app").await.unwrap();
        assert_eq!(released.len(), 2);
        assert!(allocator.store().find_by_key("ns_app").await.unwrap().is_empty());
    }
}
