//! Decrypted Bedrock credential cache (C9, §4.9).
//!
//! Grounded on `providers::aws::AwsCredentialCache`'s thundering-herd-safe
//! refresh: an `AtomicBool` marks one task as the loader, everyone else
//! waits on a `Notify` instead of each independently calling the decryptor.
//! That teacher cache holds exactly one set of credentials process-wide;
//! this one is keyed per access key, so the single `RwLock<Option<_>>` +
//! `AtomicBool` + `Notify` triple becomes a per-key slot in a `DashMap`.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio::sync::{Notify, RwLock};
use uuid::Uuid;

use crate::{
    db::Store,
    errors::KeyMaterialError,
    kms::{BedrockCredentials, KeyDecryptor},
};

struct Slot {
    cached: RwLock<Option<(BedrockCredentials, Instant)>>,
    loading: AtomicBool,
    ready: Notify,
}

impl Slot {
    fn new() -> Self {
        Self {
            cached: RwLock::new(None),
            loading: AtomicBool::new(false),
            ready: Notify::new(),
        }
    }
}

pub struct KeyMaterialCache {
    store: Arc<dyn Store>,
    decryptor: Arc<dyn KeyDecryptor>,
    ttl: Duration,
    slots: DashMap<Uuid, Arc<Slot>>,
}

impl KeyMaterialCache {
    pub fn new(store: Arc<dyn Store>, decryptor: Arc<dyn KeyDecryptor>, ttl_secs: u64) -> Self {
        Self {
            store,
            decryptor,
            ttl: Duration::from_secs(ttl_secs),
            slots: DashMap::new(),
        }
    }

    /// §4.9: return fresh credentials for `access_key_id`, decrypting at
    /// most once per expiry even under concurrent callers.
    pub async fn get(&self, access_key_id: Uuid) -> Result<BedrockCredentials, KeyMaterialError> {
        let slot = self
            .slots
            .entry(access_key_id)
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone();

        loop {
            if let Some((creds, fetched_at)) = slot.cached.read().await.as_ref()
                && fetched_at.elapsed() < self.ttl
            {
                return Ok(creds.clone());
            }

            // Registered before the compare_exchange check (not after), so a
            // `notify_waiters()` that fires in between can't be missed: `Notified`
            // snapshots the notify state at creation and resolves immediately on
            // `.await` if a notification already landed since then.
            let notified = slot.ready.notified();

            if slot
                .loading
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let result = self.load(access_key_id).await;
                match &result {
                    Ok(creds) => {
                        *slot.cached.write().await = Some((creds.clone(), Instant::now()));
                    }
                    Err(_) => {
                        *slot.cached.write().await = None;
                    }
                }
                slot.loading.store(false, Ordering::Release);
                slot.ready.notify_waiters();
                return result;
            }

            notified.await;
        }
    }

    async fn load(&self, access_key_id: Uuid) -> Result<BedrockCredentials, KeyMaterialError> {
        let key = self
            .store
            .get_bedrock_key(access_key_id)
            .await?
            .ok_or(KeyMaterialError::NoKeyConfigured)?;
        self.decryptor.decrypt(&key.ciphertext).await
    }

    /// Explicit invalidation, mirroring the Authenticator's admin-triggered
    /// invalidation path (§8 scenario 6: a tenant rotates their Bedrock key).
    pub fn invalidate(&self, access_key_id: Uuid) {
        self.slots.remove(&access_key_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::DbError,
        models::{AccessKey, BedrockKey, UsageAggregateDelta, UsageRow},
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::AtomicU32;

    struct FakeStore {
        calls: AtomicU32,
        ciphertext: Vec<u8>,
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn find_active_access_key_by_hash(
            &self,
            _key_hash: &str,
        ) -> Result<Option<AccessKey>, DbError> {
            Ok(None)
        }

        async fn has_bedrock_key(&self, _access_key_id: Uuid) -> Result<bool, DbError> {
            Ok(true)
        }

        async fn get_bedrock_key(
            &self,
            access_key_id: Uuid,
        ) -> Result<Option<BedrockKey>, DbError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(BedrockKey {
                access_key_id,
                ciphertext: self.ciphertext.clone(),
                key_hash: "h".to_string(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            }))
        }

        async fn insert_usage_row(&self, _row: &UsageRow) -> Result<(), DbError> {
            Ok(())
        }

        async fn upsert_usage_aggregate(
            &self,
            _delta: &UsageAggregateDelta,
        ) -> Result<(), DbError> {
            Ok(())
        }
    }

    struct FakeDecryptor;

    #[async_trait]
    impl KeyDecryptor for FakeDecryptor {
        async fn decrypt(&self, _ciphertext: &[u8]) -> Result<BedrockCredentials, KeyMaterialError> {
            Ok(BedrockCredentials {
                access_key_id: "AKIA".to_string(),
                secret_access_key: "s".to_string(),
                session_token: None,
            })
        }
    }

    #[tokio::test]
    async fn concurrent_gets_decrypt_at_most_once() {
        let store = Arc::new(FakeStore {
            calls: AtomicU32::new(0),
            ciphertext: vec![1, 2, 3],
        });
        let cache = Arc::new(KeyMaterialCache::new(store.clone(), Arc::new(FakeDecryptor), 60));
        let key = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get(key).await.unwrap() }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_key_errors() {
        struct EmptyStore;
        #[async_trait]
        impl Store for EmptyStore {
            async fn find_active_access_key_by_hash(
                &self,
                _key_hash: &str,
            ) -> Result<Option<AccessKey>, DbError> {
                Ok(None)
            }
            async fn has_bedrock_key(&self, _access_key_id: Uuid) -> Result<bool, DbError> {
                Ok(false)
            }
            async fn get_bedrock_key(
                &self,
                _access_key_id: Uuid,
            ) -> Result<Option<BedrockKey>, DbError> {
                Ok(None)
            }
            async fn insert_usage_row(&self, _row: &UsageRow) -> Result<(), DbError> {
                Ok(())
            }
            async fn upsert_usage_aggregate(
                &self,
                _delta: &UsageAggregateDelta,
            ) -> Result<(), DbError> {
                Ok(())
            }
        }

        let cache = KeyMaterialCache::new(Arc::new(EmptyStore), Arc::new(FakeDecryptor), 60);
        assert!(matches!(
            cache.get(Uuid::new_v4()).await,
            Err(KeyMaterialError::NoKeyConfigured)
        ));
    }
}
