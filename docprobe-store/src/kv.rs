//! Keyed store
//!
//! A flat key/value store of JSON documents with optional per-key TTLs. The
//! job store, leases and cancellation flags are all expressed on top of this
//! interface, so swapping the backing service only means implementing
//! [`KeyedStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Result, StoreError};

/// Key/value store with TTLs and the few atomic primitives leases need
#[async_trait]
pub trait KeyedStore: Send + Sync {
    /// Returns the value at `key`, or `None` if absent or expired
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Writes `value` at `key`, replacing any previous value and TTL
    ///
    /// # Arguments
    /// * `ttl` - Time to live; `None` keeps the key until it is deleted
    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    /// Deletes `key`
    ///
    /// # Returns
    /// `true` if a live value was removed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Lists every live entry whose key starts with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>>;

    /// Atomically increments the integer counter at `key`, creating it at 1
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Writes `value` only if `key` holds no live value
    ///
    /// # Returns
    /// `true` if the write happened
    async fn set_if_absent(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool>;

    /// Replaces the value at `key` only if it currently equals `expected`
    ///
    /// # Returns
    /// `true` if the write happened
    async fn compare_and_put(
        &self,
        key: &str,
        expected: &Value,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Deletes `key` only if it currently equals `expected`
    ///
    /// # Returns
    /// `true` if the key was deleted
    async fn compare_and_delete(&self, key: &str, expected: &Value) -> Result<bool>;

    /// Removes expired entries
    ///
    /// Reads already ignore expired entries; this only reclaims space.
    ///
    /// # Returns
    /// Number of entries removed
    async fn purge_expired(&self) -> Result<u64>;
}

// =============================================================================
// In-memory implementation
// =============================================================================

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|at| at > Instant::now())
    }
}

/// In-process keyed store
///
/// Used by tests and single-process deployments. Expiry follows tokio's
/// clock, so paused-time tests can age keys out deterministically.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let mut entries = self.lock();
        entries.retain(|_, entry| entry.is_live());
        f(&mut entries)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Entries held, expired ones included
    pub fn stored_len(&self) -> usize {
        self.lock().len()
    }
}

#[async_trait]
impl KeyedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.with_entries(|entries| entries.get(key).map(|e| e.value.clone())))
    }

    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), Entry::new(value, ttl));
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.with_entries(|entries| entries.remove(key).is_some()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        Ok(self.with_entries(|entries| {
            let mut items: Vec<(String, Value)> = entries
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(key, entry)| (key.clone(), entry.value.clone()))
                .collect();
            items.sort_by(|a, b| a.0.cmp(&b.0));
            items
        }))
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        self.with_entries(|entries| {
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| Entry::new(Value::from(0), None));
            let current = entry.value.as_i64().ok_or_else(|| StoreError::NotACounter {
                key: key.to_string(),
            })?;
            entry.value = Value::from(current + 1);
            Ok(current + 1)
        })
    }

    async fn set_if_absent(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        Ok(self.with_entries(|entries| {
            if entries.contains_key(key) {
                false
            } else {
                entries.insert(key.to_string(), Entry::new(value, ttl));
                true
            }
        }))
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected: &Value,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        Ok(self.with_entries(|entries| match entries.get(key) {
            Some(entry) if &entry.value == expected => {
                entries.insert(key.to_string(), Entry::new(value, ttl));
                true
            }
            _ => false,
        }))
    }

    async fn compare_and_delete(&self, key: &str, expected: &Value) -> Result<bool> {
        Ok(self.with_entries(|entries| match entries.get(key) {
            Some(entry) if &entry.value == expected => {
                entries.remove(key);
                true
            }
            _ => false,
        }))
    }

    async fn purge_expired(&self) -> Result<u64> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live());
        Ok((before - entries.len()) as u64)
    }
}

// =============================================================================
// Postgres implementation
// =============================================================================

/// Keyed store backed by the `kv_store` table
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Converts a TTL into an absolute expiry; overflowing TTLs never expire
fn expiry(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok())
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
}

#[async_trait]
impl KeyedStore for PgStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let value = sqlx::query_scalar::<_, Value>(
            r#"
            SELECT value FROM kv_store
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry(ttl))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM kv_store WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())",
        )
        .bind(key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let rows = sqlx::query_as::<_, (String, Value)>(
            r#"
            SELECT key, value FROM kv_store
            WHERE left(key, length($1)) = $1
              AND (expires_at IS NULL OR expires_at > NOW())
            ORDER BY key
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let value = sqlx::query_scalar::<_, Value>(
            r#"
            INSERT INTO kv_store (key, value, expires_at)
            VALUES ($1, '1'::jsonb, NULL)
            ON CONFLICT (key) DO UPDATE
            SET value = to_jsonb((kv_store.value #>> '{}')::bigint + 1)
            RETURNING value
            "#,
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;

        value.as_i64().ok_or_else(|| StoreError::NotACounter {
            key: key.to_string(),
        })
    }

    async fn set_if_absent(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        // An expired row counts as absent and is taken over in place
        let result = sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            WHERE kv_store.expires_at IS NOT NULL AND kv_store.expires_at <= NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry(ttl))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected: &Value,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE kv_store SET value = $3, expires_at = $4
            WHERE key = $1 AND value = $2
              AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .bind(expected)
        .bind(value)
        .bind(expiry(ttl))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &Value) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM kv_store
            WHERE key = $1 AND value = $2
              AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .bind(expected)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM kv_store WHERE expires_at IS NOT NULL AND expires_at <= NOW()",
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
