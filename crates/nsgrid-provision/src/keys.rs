//! API key issuance.
//!
//! A key is bound to exactly one namespace when it is minted. Issuance is
//! idempotent per `(wallet, namespace)`.

use nsgrid_state::{ApiKeyRecord, StateStore};
use rand::RngCore;
use tracing::{debug, info};

use crate::error::{ProvisionError, ProvisionResult};
use crate::guard::Credential;

const KEY_PREFIX: &str = "ak_";

/// Mint a new random key: `ak_` followed by 64 hex chars.
pub fn generate_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{KEY_PREFIX}{}", hex::encode(bytes))
}

/// Issues and resolves namespace-bound API keys.
#[derive(Clone)]
pub struct KeyIssuer {
    store: StateStore,
}

impl KeyIssuer {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Return the wallet's key for `namespace`, minting one if none exists.
    ///
    /// Callers must only invoke this once the namespace is servable;
    /// [`Provisioner::issue_key`](crate::Provisioner::issue_key) checks that
    /// under the namespace lock.
    pub fn issue(&self, namespace: &str, wallet: &str) -> ProvisionResult<ApiKeyRecord> {
        let (record, minted) = self.store.issue_api_key(namespace, wallet, || ApiKeyRecord {
            key: generate_key(),
            namespace: namespace.to_string(),
            wallet: wallet.to_string(),
            created_at: epoch_secs(),
        })?;
        if minted {
            info!(%namespace, key = %record.masked(), "api key issued");
        } else {
            debug!(%namespace, key = %record.masked(), "returning existing api key");
        }
        Ok(record)
    }

    /// Resolve a presented key to the namespace it is bound to.
    pub fn authenticate(&self, key: &str) -> ProvisionResult<Credential> {
        if !key.starts_with(KEY_PREFIX) {
            return Err(ProvisionError::Unauthorized);
        }
        let record = self
            .store
            .get_api_key(key)?
            .ok_or(ProvisionError::Unauthorized)?;
        Ok(Credential {
            namespace: record.namespace,
            wallet: record.wallet,
        })
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn issuer() -> KeyIssuer {
        KeyIssuer::new(StateStore::open_in_memory().unwrap())
    }

    #[test]
    fn generated_keys_have_expected_shape() {
        let key = generate_key();
        assert_eq!(key.len(), 3 + 64);
        assert!(key.starts_with("ak_"));
        assert!(key[3..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key, generate_key());
    }

    #[test]
    fn issue_is_idempotent_per_wallet_and_namespace() {
        let issuer = issuer();
        let first = issuer.issue("shop-42", "0xabc").unwrap();
        let again = issuer.issue("shop-42", "0xabc").unwrap();
        assert_eq!(first, again);

        let other_wallet = issuer.issue("shop-42", "0xdef").unwrap();
        let other_ns = issuer.issue("shop-43", "0xabc").unwrap();
        assert_ne!(first.key, other_wallet.key);
        assert_ne!(first.key, other_ns.key);
    }

    #[test]
    fn concurrent_issue_stores_a_single_key() {
        use std::sync::{Arc, Barrier};

        for _ in 0..20 {
            let issuer = issuer();
            let barrier = Arc::new(Barrier::new(8));
            let threads: Vec<_> = (0..8)
                .map(|_| {
                    let issuer = issuer.clone();
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        issuer.issue("shop-42", "0xabc").unwrap().key
                    })
                })
                .collect();

            let keys: HashSet<String> = threads.into_iter().map(|t| t.join().unwrap()).collect();
            assert_eq!(keys.len(), 1);
            assert_eq!(issuer.store.list_api_keys_in("shop-42").unwrap().len(), 1);
        }
    }

    #[test]
    fn authenticate_binds_key_to_its_namespace() {
        let issuer = issuer();
        let record = issuer.issue("shop-42", "0xabc").unwrap();

        let cred = issuer.authenticate(&record.key).unwrap();
        assert_eq!(cred.namespace, "shop-42");
        assert_eq!(cred.wallet, "0xabc");

        assert!(matches!(
            issuer.authenticate("ak_0000"),
            Err(ProvisionError::Unauthorized)
        ));
        assert!(matches!(
            issuer.authenticate("not-a-key"),
            Err(ProvisionError::Unauthorized)
        ));
    }
}
