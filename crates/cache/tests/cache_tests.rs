//! Cache client integration tests
//!
//! Exercises `CacheClient` over the in-memory backend:
//!
//! 1. **Typed values** - codec round trips and decode failures
//! 2. **Expiration** - TTL behavior driven by `ManualClock`
//! 3. **Hashes** - field set/get/delete and whole-key expiration
//! 4. **Pool** - exhaustion, cancellation, close

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tessera_cache::{Cache, CacheClient, CacheError, CacheExt, MemoryCache, MemoryStore};
use tessera_core::{CacheConfig, Context, ContextError, ManualClock};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    name: String,
}

fn create_cache() -> (Arc<ManualClock>, MemoryCache) {
    let clock = Arc::new(ManualClock::new());
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    (clock, CacheClient::memory(store, &CacheConfig::default()))
}

fn user(name: &str) -> User {
    User {
        name: name.to_string(),
    }
}

// ============================================================================
// SECTION 1: Typed values
// ============================================================================

mod typed_values {
    use super::*;

    #[tokio::test]
    async fn test_set_then_get_round_trip() {
        let (_, cache) = create_cache();
        let ctx = Context::background();

        cache
            .set(&ctx, "user:1", &user("a"), Duration::ZERO)
            .await
            .unwrap();
        let found: Option<User> = cache.get(&ctx, "user:1").await.unwrap();
        assert_eq!(found, Some(user("a")));
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let (_, cache) = create_cache();
        let found: Option<User> = cache.get(&Context::background(), "user:404").await.unwrap();
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn test_shape_mismatch_is_decode_error() {
        let (_, cache) = create_cache();
        let ctx = Context::background();

        cache.set(&ctx, "n", &42u64, Duration::ZERO).await.unwrap();
        let err = cache.get::<User>(&ctx, "n").await.unwrap_err();
        assert!(err.is_codec());
        assert!(matches!(err, CacheError::Decode { ref key, .. } if key == "n"));
    }

    #[tokio::test]
    async fn test_overwrite_replaces_value() {
        let (_, cache) = create_cache();
        let ctx = Context::background();

        cache.set(&ctx, "k", &user("a"), Duration::ZERO).await.unwrap();
        cache.set(&ctx, "k", &user("b"), Duration::ZERO).await.unwrap();
        assert_eq!(cache.get::<User>(&ctx, "k").await.unwrap(), Some(user("b")));
    }

    #[tokio::test]
    async fn test_del_counts_removed_keys() {
        let (_, cache) = create_cache();
        let ctx = Context::background();

        cache.set(&ctx, "a", &1, Duration::ZERO).await.unwrap();
        cache.set(&ctx, "b", &2, Duration::ZERO).await.unwrap();
        assert_eq!(cache.del(&ctx, &["a", "b", "c"]).await.unwrap(), 2);
        assert_eq!(cache.del(&ctx, &["a"]).await.unwrap(), 0);
        assert_eq!(cache.get::<i32>(&ctx, "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_usable_as_trait_object() {
        let (_, cache) = create_cache();
        let cache: Arc<dyn Cache> = Arc::new(cache);
        let ctx = Context::background();

        cache.ping(&ctx).await.unwrap();
        cache.set(&ctx, "k", &[1, 2, 3], Duration::ZERO).await.unwrap();
        let found: Option<Vec<u8>> = cache.get(&ctx, "k").await.unwrap();
        assert_eq!(found, Some(vec![1, 2, 3]));
    }
}

// ============================================================================
// SECTION 2: Expiration
// ============================================================================

mod expiration {
    use super::*;

    #[tokio::test]
    async fn test_value_disappears_after_ttl() {
        let (clock, cache) = create_cache();
        let ctx = Context::background();

        cache
            .set(&ctx, "session", &user("a"), Duration::from_secs(30))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(29));
        assert!(cache.get::<User>(&ctx, "session").await.unwrap().is_some());

        clock.advance(Duration::from_secs(1));
        assert!(cache.get::<User>(&ctx, "session").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_never_expires() {
        let (clock, cache) = create_cache();
        let ctx = Context::background();

        cache.set(&ctx, "k", &1, Duration::ZERO).await.unwrap();
        clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert_eq!(cache.get::<i32>(&ctx, "k").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_expire_refreshes_and_reports_existence() {
        let (clock, cache) = create_cache();
        let ctx = Context::background();

        assert!(!cache.expire(&ctx, "ghost", Duration::from_secs(5)).await.unwrap());
        assert_eq!(cache.get::<i32>(&ctx, "ghost").await.unwrap(), None);

        cache.set(&ctx, "k", &1, Duration::from_secs(5)).await.unwrap();
        clock.advance(Duration::from_secs(4));
        assert!(cache.expire(&ctx, "k", Duration::from_secs(10)).await.unwrap());
        clock.advance(Duration::from_secs(9));
        assert_eq!(cache.get::<i32>(&ctx, "k").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_expire_zero_removes_immediately() {
        let (_, cache) = create_cache();
        let ctx = Context::background();

        cache.set(&ctx, "k", &1, Duration::ZERO).await.unwrap();
        assert!(cache.expire(&ctx, "k", Duration::ZERO).await.unwrap());
        assert_eq!(cache.get::<i32>(&ctx, "k").await.unwrap(), None);
    }
}

// ============================================================================
// SECTION 3: Hashes
// ============================================================================

mod hashes {
    use super::*;

    #[tokio::test]
    async fn test_field_deletion_keeps_siblings() {
        let (_, cache) = create_cache();
        let ctx = Context::background();

        cache.hash_set(&ctx, "h", "f1", &1, Duration::ZERO).await.unwrap();
        cache.hash_set(&ctx, "h", "f2", &2, Duration::ZERO).await.unwrap();

        assert_eq!(cache.hash_del(&ctx, "h", &["f1"]).await.unwrap(), 1);
        assert_eq!(cache.hash_get::<i32>(&ctx, "h", "f1").await.unwrap(), None);
        assert_eq!(cache.hash_get::<i32>(&ctx, "h", "f2").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_get_all_decodes_every_field() {
        let (_, cache) = create_cache();
        let ctx = Context::background();

        cache
            .hash_set(&ctx, "team", "lead", &user("a"), Duration::ZERO)
            .await
            .unwrap();
        cache
            .hash_set(&ctx, "team", "dev", &user("b"), Duration::ZERO)
            .await
            .unwrap();

        let all: HashMap<String, User> = cache.hash_get_all(&ctx, "team").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["lead"], user("a"));
        assert_eq!(all["dev"], user("b"));

        let none: HashMap<String, User> = cache.hash_get_all(&ctx, "nobody").await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_hash_ttl_expires_whole_key() {
        let (clock, cache) = create_cache();
        let ctx = Context::background();

        cache
            .hash_set(&ctx, "h", "f1", &1, Duration::from_secs(10))
            .await
            .unwrap();
        cache.hash_set(&ctx, "h", "f2", &2, Duration::ZERO).await.unwrap();

        clock.advance(Duration::from_secs(10));
        let all: HashMap<String, i32> = cache.hash_get_all(&ctx, "h").await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_mixed_field_types_fail_get_all() {
        let (_, cache) = create_cache();
        let ctx = Context::background();

        cache.hash_set(&ctx, "h", "n", &1, Duration::ZERO).await.unwrap();
        cache.hash_set(&ctx, "h", "s", "text", Duration::ZERO).await.unwrap();

        let err = cache.hash_get_all::<i32>(&ctx, "h").await.unwrap_err();
        assert!(matches!(err, CacheError::Decode { ref key, .. } if key == "h.s"));
    }
}

// ============================================================================
// SECTION 4: Pool
// ============================================================================

mod pool {
    use super::*;

    fn bounded_cache() -> MemoryCache {
        let config = CacheConfig {
            max_active: 1,
            ..CacheConfig::default()
        };
        CacheClient::memory(Arc::new(MemoryStore::new()), &config)
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out_with_deadline() {
        let cache = bounded_cache();
        let _held = cache.pool().get(&Context::background()).await.unwrap();

        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        let started = Instant::now();
        let err = cache.get::<i32>(&ctx, "k").await.unwrap_err();

        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_waiting_checkout() {
        let cache = Arc::new(bounded_cache());
        let held = cache.pool().get(&Context::background()).await.unwrap();

        let (ctx, cancel) = Context::background().with_cancel();
        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.ping(&ctx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, CacheError::Context(ContextError::Cancelled)));

        // Nothing leaked: the held connection is the only one out
        drop(held);
        cache.ping(&Context::background()).await.unwrap();
        assert_eq!(cache.stats().active, 0);
    }

    #[tokio::test]
    async fn test_waiter_proceeds_when_connection_returns() {
        let cache = Arc::new(bounded_cache());
        let held = cache.pool().get(&Context::background()).await.unwrap();

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.ping(&Context::background()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        waiter.await.unwrap().unwrap();
        assert_eq!(cache.pool().connector().dials(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_, cache) = create_cache();
        let ctx = Context::background();

        cache.ping(&ctx).await.unwrap();
        cache.close().await.unwrap();
        cache.close().await.unwrap();

        let err = cache.ping(&ctx).await.unwrap_err();
        assert!(matches!(err, CacheError::PoolClosed));
        assert_eq!(cache.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_connection_error() {
        let (_, cache) = create_cache();
        cache.pool().connector().refuse_connections(true);

        let err = cache.ping(&Context::background()).await.unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_share_pool() {
        let config = CacheConfig {
            max_active: 4,
            max_idle: 4,
            ..CacheConfig::default()
        };
        let cache = Arc::new(CacheClient::memory(Arc::new(MemoryStore::new()), &config));

        let mut handles = Vec::new();
        for i in 0..64u32 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                let ctx = Context::background();
                cache
                    .hash_set(&ctx, "counters", &format!("c{i}"), &i, Duration::ZERO)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let all: HashMap<String, u32> = cache
            .hash_get_all(&Context::background(), "counters")
            .await
            .unwrap();
        assert_eq!(all.len(), 64);
        assert!(cache.pool().connector().dials() <= 4);
        assert_eq!(cache.stats().active, 0);
    }
}
