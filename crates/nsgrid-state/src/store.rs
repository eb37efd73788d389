//! The cluster registry: cluster descriptors, API keys and published-route
//! flags in one redb file, each record stored as JSON bytes under a string key.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// `map_err!(Storage)` turns any displayable redb error into that variant.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = redb::TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe registry backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent registry at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "cluster registry opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory registry (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory cluster registry opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        txn.open_table(CLUSTERS).map_err(map_err!(Storage))?;
        txn.open_table(API_KEYS).map_err(map_err!(Storage))?;
        txn.open_table(DNS_ROUTES).map_err(map_err!(Storage))?;
        txn.commit().map_err(map_err!(Storage))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Codec))?;
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Storage))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Storage))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let t = txn.open_table(table).map_err(map_err!(Storage))?;
        match t.get(key).map_err(map_err!(Storage))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Scan a table, keeping the records `keep` accepts.
    fn scan<T: DeserializeOwned>(
        &self,
        table: Table,
        mut keep: impl FnMut(&T) -> bool,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let t = txn.open_table(table).map_err(map_err!(Storage))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Storage))? {
            let (_, value) = entry.map_err(map_err!(Storage))?;
            let record: T = serde_json::from_slice(value.value()).map_err(map_err!(Codec))?;
            if keep(&record) {
                results.push(record);
            }
        }
        Ok(results)
    }

    fn delete(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Storage))?;
            existed = t.remove(key).map_err(map_err!(Storage))?.is_some();
        }
        txn.commit().map_err(map_err!(Storage))?;
        Ok(existed)
    }

    // ── Clusters ───────────────────────────────────────────────────

    /// Insert or replace the descriptor for its namespace.
    pub fn put_cluster(&self, cluster: &ClusterDescriptor) -> StateResult<()> {
        self.put(CLUSTERS, cluster.table_key(), cluster)?;
        debug!(
            namespace = %cluster.namespace,
            cluster_id = %cluster.cluster_id,
            state = cluster.state.as_str(),
            "cluster descriptor stored"
        );
        Ok(())
    }

    /// Get the descriptor for a namespace.
    pub fn get_cluster(&self, namespace: &str) -> StateResult<Option<ClusterDescriptor>> {
        self.get(CLUSTERS, namespace)
    }

    /// Find a descriptor by its cluster id (the poll handle).
    pub fn find_cluster_by_id(&self, cluster_id: &str) -> StateResult<Option<ClusterDescriptor>> {
        Ok(self
            .scan(CLUSTERS, |c: &ClusterDescriptor| c.cluster_id == cluster_id)?
            .into_iter()
            .next())
    }

    /// List every descriptor. Operator listings and startup recovery only.
    pub fn list_clusters(&self) -> StateResult<Vec<ClusterDescriptor>> {
        self.scan(CLUSTERS, |_: &ClusterDescriptor| true)
    }

    /// List descriptors whose namespace equals `namespace`.
    pub fn list_clusters_in(&self, namespace: &str) -> StateResult<Vec<ClusterDescriptor>> {
        self.scan(CLUSTERS, |c: &ClusterDescriptor| c.namespace == namespace)
    }

    /// List descriptors in the given state.
    pub fn list_clusters_in_state(
        &self,
        state: ProvisioningState,
    ) -> StateResult<Vec<ClusterDescriptor>> {
        self.scan(CLUSTERS, |c: &ClusterDescriptor| c.state == state)
    }

    /// Delete a namespace's descriptor. Returns true if it existed.
    pub fn delete_cluster(&self, namespace: &str) -> StateResult<bool> {
        let existed = self.delete(CLUSTERS, namespace)?;
        debug!(%namespace, existed, "cluster descriptor deleted");
        Ok(existed)
    }

    // ── API keys ───────────────────────────────────────────────────

    pub fn put_api_key(&self, record: &ApiKeyRecord) -> StateResult<()> {
        self.put(API_KEYS, record.table_key(), record)?;
        debug!(namespace = %record.namespace, "api key stored");
        Ok(())
    }

    pub fn get_api_key(&self, key: &str) -> StateResult<Option<ApiKeyRecord>> {
        self.get(API_KEYS, key)
    }

    /// Keys bound to `namespace`, compared by equality.
    pub fn list_api_keys_in(&self, namespace: &str) -> StateResult<Vec<ApiKeyRecord>> {
        self.scan(API_KEYS, |k: &ApiKeyRecord| k.namespace == namespace)
    }

    /// Return the key already issued to `wallet` for `namespace`, or store
    /// the one `mint` produces. The lookup and the insert share one write
    /// transaction, so concurrent callers all get the same key. The flag is
    /// true when a new key was stored.
    pub fn issue_api_key(
        &self,
        namespace: &str,
        wallet: &str,
        mint: impl FnOnce() -> ApiKeyRecord,
    ) -> StateResult<(ApiKeyRecord, bool)> {
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        let issued = {
            let mut t = txn.open_table(API_KEYS).map_err(map_err!(Storage))?;
            let mut existing = None;
            for entry in t.iter().map_err(map_err!(Storage))? {
                let (_, value) = entry.map_err(map_err!(Storage))?;
                let record: ApiKeyRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Codec))?;
                if record.namespace == namespace && record.wallet == wallet {
                    existing = Some(record);
                    break;
                }
            }
            match existing {
                Some(record) => (record, false),
                None => {
                    let record = mint();
                    let bytes = serde_json::to_vec(&record).map_err(map_err!(Codec))?;
                    t.insert(record.table_key(), bytes.as_slice())
                        .map_err(map_err!(Storage))?;
                    (record, true)
                }
            }
        };
        txn.commit().map_err(map_err!(Storage))?;
        Ok(issued)
    }

    /// Revoke every key bound to a namespace. Returns number deleted.
    pub fn delete_api_keys_in(&self, namespace: &str) -> StateResult<u32> {
        let keys: Vec<String> = self
            .list_api_keys_in(namespace)?
            .into_iter()
            .map(|k| k.key)
            .collect();
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(API_KEYS).map_err(map_err!(Storage))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Storage))?;
            }
        }
        txn.commit().map_err(map_err!(Storage))?;
        debug!(%namespace, count, "api keys revoked");
        Ok(count)
    }

    // ── DNS routes ─────────────────────────────────────────────────

    pub fn put_dns_route(&self, route: &DnsRoute) -> StateResult<()> {
        self.put(DNS_ROUTES, &route.namespace, route)
    }

    pub fn dns_published(&self, namespace: &str) -> StateResult<bool> {
        Ok(self
            .get::<DnsRoute>(DNS_ROUTES, namespace)?
            .is_some_and(|r| r.published))
    }

    pub fn delete_dns_route(&self, namespace: &str) -> StateResult<bool> {
        self.delete(DNS_ROUTES, namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsgrid_core::PortBlock;

    fn test_cluster(namespace: &str, slot: u32) -> ClusterDescriptor {
        ClusterDescriptor {
            namespace: namespace.to_string(),
            cluster_id: format!("cl-{namespace}"),
            port_block: Some(PortBlock::new(slot, 10000 + slot as u16 * 5)),
            state: ProvisioningState::Provisioning,
            readiness: ComponentReadiness::default(),
            attempt: 1,
            created_at: 1000,
            updated_at: 1000,
            deadline_at_ms: 1_600_000,
            last_error: None,
        }
    }

    fn test_key(namespace: &str, wallet: &str, n: u32) -> ApiKeyRecord {
        ApiKeyRecord {
            key: format!("ak_{namespace}_{n}"),
            namespace: namespace.to_string(),
            wallet: wallet.to_string(),
            created_at: 1000,
        }
    }

    // ── Cluster CRUD ───────────────────────────────────────────────

    #[test]
    fn cluster_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let cluster = test_cluster("shop-42", 0);

        store.put_cluster(&cluster).unwrap();
        let retrieved = store.get_cluster("shop-42").unwrap();

        assert_eq!(retrieved, Some(cluster));
    }

    #[test]
    fn cluster_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_cluster("nothing").unwrap().is_none());
        assert!(store.find_cluster_by_id("cl-nothing").unwrap().is_none());
    }

    #[test]
    fn cluster_one_entry_per_namespace() {
        let store = StateStore::open_in_memory().unwrap();
        let mut cluster = test_cluster("shop-42", 0);
        store.put_cluster(&cluster).unwrap();

        cluster.cluster_id = "cl-retry".to_string();
        cluster.attempt = 2;
        store.put_cluster(&cluster).unwrap();

        let all = store.list_clusters().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].cluster_id, "cl-retry");
        assert!(store.find_cluster_by_id("cl-shop-42").unwrap().is_none());
        assert!(store.find_cluster_by_id("cl-retry").unwrap().is_some());
    }

    #[test]
    fn cluster_listing_is_scoped_by_equality() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_cluster(&test_cluster("shop", 0)).unwrap();
        store.put_cluster(&test_cluster("shop-42", 1)).unwrap();
        store.put_cluster(&test_cluster("blog", 2)).unwrap();

        let scoped = store.list_clusters_in("shop").unwrap();
        assert_eq!(scoped.len(), 1);
        assert!(scoped.iter().all(|c| c.namespace == "shop"));
    }

    #[test]
    fn cluster_list_by_state() {
        let store = StateStore::open_in_memory().unwrap();
        let mut ready = test_cluster("a", 0);
        ready.state = ProvisioningState::Ready;
        store.put_cluster(&ready).unwrap();
        store.put_cluster(&test_cluster("b", 1)).unwrap();

        let provisioning = store
            .list_clusters_in_state(ProvisioningState::Provisioning)
            .unwrap();
        assert_eq!(provisioning.len(), 1);
        assert_eq!(provisioning[0].namespace, "b");
    }

    #[test]
    fn cluster_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_cluster(&test_cluster("a", 0)).unwrap();

        assert!(store.delete_cluster("a").unwrap());
        assert!(!store.delete_cluster("a").unwrap());
        assert!(store.get_cluster("a").unwrap().is_none());
    }

    // ── API keys ───────────────────────────────────────────────────

    #[test]
    fn api_key_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let key = test_key("shop-42", "0xabc", 1);
        store.put_api_key(&key).unwrap();

        assert_eq!(store.get_api_key(&key.key).unwrap(), Some(key));
        assert!(store.get_api_key("ak_missing").unwrap().is_none());
    }

    #[test]
    fn issue_api_key_mints_once_per_wallet_and_namespace() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_api_key(&test_key("other", "0xabc", 9)).unwrap();

        let (first, minted) = store
            .issue_api_key("shop-42", "0xabc", || test_key("shop-42", "0xabc", 1))
            .unwrap();
        assert!(minted);
        assert_eq!(first.key, "ak_shop-42_1");

        let (again, minted) = store
            .issue_api_key("shop-42", "0xabc", || panic!("must reuse the stored key"))
            .unwrap();
        assert!(!minted);
        assert_eq!(again, first);

        let (second_wallet, minted) = store
            .issue_api_key("shop-42", "0xdef", || test_key("shop-42", "0xdef", 2))
            .unwrap();
        assert!(minted);
        assert_ne!(second_wallet.key, first.key);
        assert_eq!(store.list_api_keys_in("shop-42").unwrap().len(), 2);
    }

    #[test]
    fn api_key_listing_never_crosses_namespaces() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_api_key(&test_key("a", "w1", 1)).unwrap();
        store.put_api_key(&test_key("a", "w2", 2)).unwrap();
        store.put_api_key(&test_key("ab", "w1", 3)).unwrap();
        store.put_api_key(&test_key("b", "w1", 4)).unwrap();

        for ns in ["a", "ab", "b", "c"] {
            let keys = store.list_api_keys_in(ns).unwrap();
            assert!(keys.iter().all(|k| k.namespace == ns));
        }
        assert_eq!(store.list_api_keys_in("a").unwrap().len(), 2);
    }

    #[test]
    fn api_key_revoke_namespace() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_api_key(&test_key("a", "w1", 1)).unwrap();
        store.put_api_key(&test_key("a", "w2", 2)).unwrap();
        store.put_api_key(&test_key("b", "w1", 3)).unwrap();

        assert_eq!(store.delete_api_keys_in("a").unwrap(), 2);
        assert!(store.list_api_keys_in("a").unwrap().is_empty());
        // b untouched
        assert_eq!(store.list_api_keys_in("b").unwrap().len(), 1);
    }

    // ── DNS routes ─────────────────────────────────────────────────

    #[test]
    fn dns_route_flag() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(!store.dns_published("a").unwrap());

        store
            .put_dns_route(&DnsRoute {
                namespace: "a".to_string(),
                published: true,
                updated_at: 1000,
            })
            .unwrap();
        assert!(store.dns_published("a").unwrap());
        assert!(!store.dns_published("b").unwrap());

        assert!(store.delete_dns_route("a").unwrap());
        assert!(!store.dns_published("a").unwrap());
    }


    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("registry.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_cluster(&test_cluster("shop-42", 3)).unwrap();
            store.put_api_key(&test_key("shop-42", "w", 1)).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let cluster = store.get_cluster("shop-42").unwrap().unwrap();
        assert_eq!(cluster.port_block.unwrap().slot, 3);
        assert_eq!(store.list_api_keys_in("shop-42").unwrap().len(), 1);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_clusters().unwrap().is_empty());
        assert!(store.list_api_keys_in("any").unwrap().is_empty());
        assert!(!store.delete_cluster("nope").unwrap());
        assert_eq!(store.delete_api_keys_in("nope").unwrap(), 0);
    }
}
