//! Cache traits
//!
//! `Cache` works on raw payloads and stays object-safe so services can hold
//! an `Arc<dyn Cache>`. `CacheExt` is implemented for every `Cache` and adds
//! the typed operations, encoding and decoding through the codec.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tessera_core::Context;

use crate::codec;
use crate::error::{CacheError, CacheResult};

/// Key/value and hash-field cache with optional expiration
///
/// A zero `ttl` means "no expiration". Positive TTLs are applied in whole
/// seconds, rounding any remainder up.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Payload stored under `key`, `None` if absent or expired
    async fn get_raw(&self, ctx: &Context, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value and expiration
    async fn set_raw(&self, ctx: &Context, key: &str, value: Vec<u8>, ttl: Duration)
        -> CacheResult<()>;

    /// Remove `keys`; missing keys are skipped. Returns how many were removed.
    async fn del(&self, ctx: &Context, keys: &[&str]) -> CacheResult<u64>;

    /// Store `value` in `field` of the hash at `key`
    ///
    /// A positive `ttl` sets the expiration of the whole key; a zero `ttl`
    /// leaves any existing expiration in place.
    ///
    /// With a positive `ttl` the field write and the expiration are two
    /// commands. They are not atomic: if the expiration fails after the field
    /// was written, the call returns `Err` and the field stays without the
    /// new expiration. Callers that need the TTL should retry or delete the
    /// key on error.
    async fn hash_set_raw(
        &self,
        ctx: &Context,
        key: &str,
        field: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> CacheResult<()>;

    /// Payload of one hash field
    async fn hash_get_raw(&self, ctx: &Context, key: &str, field: &str)
        -> CacheResult<Option<Vec<u8>>>;

    /// Remove hash fields. Returns how many were removed.
    async fn hash_del(&self, ctx: &Context, key: &str, fields: &[&str]) -> CacheResult<u64>;

    /// Every field of the hash at `key`; empty if the key is absent
    async fn hash_get_all_raw(
        &self,
        ctx: &Context,
        key: &str,
    ) -> CacheResult<HashMap<String, Vec<u8>>>;

    /// Set or refresh the expiration of `key`
    ///
    /// Returns `false` without effect when the key does not exist. A zero
    /// `ttl` expires the key immediately.
    async fn expire(&self, ctx: &Context, key: &str, ttl: Duration) -> CacheResult<bool>;

    /// Round trip to the backend
    async fn ping(&self, ctx: &Context) -> CacheResult<()>;

    /// Release pooled resources; later operations fail with `PoolClosed`
    async fn close(&self) -> CacheResult<()>;
}

/// Typed operations for every `Cache`
pub trait CacheExt: Cache {
    /// Decode the value stored under `key`
    fn get<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        key: &str,
    ) -> impl Future<Output = CacheResult<Option<T>>> + Send {
        async move {
            match self.get_raw(ctx, key).await? {
                Some(bytes) => codec::decode(key, &bytes).map(Some),
                None => Ok(None),
            }
        }
    }

    /// Encode and store `value` under `key`
    fn set<T: Serialize + ?Sized>(
        &self,
        ctx: &Context,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> impl Future<Output = CacheResult<()>> + Send {
        let encoded = codec::encode(value);
        async move { self.set_raw(ctx, key, encoded?, ttl).await }
    }

    /// Encode and store `value` in a hash field; see `Cache::hash_set_raw` on TTL failures
    fn hash_set<T: Serialize + ?Sized>(
        &self,
        ctx: &Context,
        key: &str,
        field: &str,
        value: &T,
        ttl: Duration,
    ) -> impl Future<Output = CacheResult<()>> + Send {
        let encoded = codec::encode(value);
        async move { self.hash_set_raw(ctx, key, field, encoded?, ttl).await }
    }

    /// Decode one hash field
    fn hash_get<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        key: &str,
        field: &str,
    ) -> impl Future<Output = CacheResult<Option<T>>> + Send {
        async move {
            match self.hash_get_raw(ctx, key, field).await? {
                Some(bytes) => codec::decode(&format!("{key}.{field}"), &bytes).map(Some),
                None => Ok(None),
            }
        }
    }

    /// Decode every field of a hash
    ///
    /// Fails on the first field whose payload does not fit `T`.
    fn hash_get_all<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        key: &str,
    ) -> impl Future<Output = CacheResult<HashMap<String, T>>> + Send {
        async move {
            self.hash_get_all_raw(ctx, key)
                .await?
                .into_iter()
                .map(|(field, bytes)| {
                    let value = codec::decode(&format!("{key}.{field}"), &bytes)?;
                    Ok::<_, CacheError>((field, value))
                })
                .collect()
        }
    }
}

impl<C: Cache + ?Sized> CacheExt for C {}
