//! Authenticator (C1, §4.1).
//!
//! Resolves an opaque access key embedded in the request path to a
//! `RequestContext`, backed by a TTL cache over the store lookup. Both
//! positive and negative lookups are cached to bound load under
//! credential-stuffing traffic.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::{
    db::Store,
    errors::AuthError,
    models::{AccessKeyStatus, RequestContext},
};

type HmacSha256 = Hmac<Sha256>;

/// Salted, constant-time-comparable fingerprint of a raw access key.
///
/// Grounded on the teacher's `models::api_key_gen::hash_api_key` /
/// `verify_api_key` (SHA-256 + `subtle::ConstantTimeEq`), swapped for an
/// HMAC so the digest cannot be recomputed without the deploy-time secret
/// (§4.1 "fingerprinted with a process-wide secret salt").
pub fn fingerprint(raw_key: &str, secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(raw_key.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison of two fingerprints, for callers that hold a
/// candidate digest and a stored one (mirrors `has_valid_prefix`'s
/// constant-time style).
pub fn fingerprints_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

struct CacheEntry {
    context: Option<CachedContext>,
    expires_at: Instant,
}

/// The parts of `RequestContext` that don't vary per-request (no `request_id`).
#[derive(Clone)]
struct CachedContext {
    user_id: Uuid,
    access_key_id: Uuid,
    access_key_prefix: String,
    bedrock_region: String,
    bedrock_model: String,
    has_bedrock_key: bool,
}

pub struct Authenticator {
    store: Arc<dyn Store>,
    secret: String,
    ttl: Duration,
    cache: DashMap<String, CacheEntry>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn Store>, secret: String, ttl_secs: u64) -> Self {
        Self {
            store,
            secret,
            ttl: Duration::from_secs(ttl_secs),
            cache: DashMap::new(),
        }
    }

    /// §4.1: fingerprint, consult cache, fall through to the store on miss.
    pub async fn authenticate(&self, raw_key: &str) -> Result<RequestContext, AuthError> {
        let key_hash = fingerprint(raw_key, &self.secret);

        if let Some(entry) = self.cache.get(&key_hash)
            && entry.expires_at > Instant::now()
        {
            return match &entry.context {
                Some(ctx) => Ok(ctx.to_request_context()),
                None => Err(AuthError::KeyNotFound),
            };
        }

        let access_key = self.store.find_active_access_key_by_hash(&key_hash).await?;

        let cached = match access_key {
            Some(ak) if ak.status == AccessKeyStatus::Active => {
                let has_bedrock_key = self.store.has_bedrock_key(ak.id).await?;
                Some(CachedContext {
                    user_id: ak.user_id,
                    access_key_id: ak.id,
                    access_key_prefix: ak.key_prefix,
                    bedrock_region: ak.bedrock_region,
                    bedrock_model: ak.bedrock_model,
                    has_bedrock_key,
                })
            }
            _ => None,
        };

        self.cache.insert(
            key_hash,
            CacheEntry {
                context: cached.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );

        cached
            .map(|c| c.to_request_context())
            .ok_or(AuthError::KeyNotFound)
    }

    /// Explicit invalidation entry point for the admin path (§4.1, §8 scenario 6).
    pub fn invalidate(&self, raw_key: &str) {
        let key_hash = fingerprint(raw_key, &self.secret);
        self.cache.remove(&key_hash);
    }

    pub fn invalidate_hash(&self, key_hash: &str) {
        self.cache.remove(key_hash);
    }
}

impl CachedContext {
    fn to_request_context(&self) -> RequestContext {
        RequestContext {
            request_id: Uuid::new_v4().to_string(),
            user_id: self.user_id,
            access_key_id: self.access_key_id,
            access_key_prefix: self.access_key_prefix.clone(),
            bedrock_region: self.bedrock_region.clone(),
            bedrock_model: self.bedrock_model.clone(),
            has_bedrock_key: self.has_bedrock_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic_and_salted() {
        let a = fingerprint("ak-live-abc123", "salt-one");
        let b = fingerprint("ak-live-abc123", "salt-one");
        let c = fingerprint("ak-live-abc123", "salt-two");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn fingerprints_match_is_constant_time_equal() {
        let a = fingerprint("key-1", "s");
        let b = fingerprint("key-1", "s");
        let c = fingerprint("key-2", "s");
        assert!(fingerprints_match(&a, &b));
        assert!(!fingerprints_match(&a, &c));
    }
}
