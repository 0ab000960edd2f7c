//! In-process ledger backend.
//!
//! Keys hold either a string or a small sorted set, each with its own expiry.
//! Expired keys are evicted lazily on access and in bulk by
//! [`LedgerBackend::purge_expired`].

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{LedgerBackend, LedgerError};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    /// Members ordered by ascending score; equal scores keep insertion order.
    ZSet(Vec<(String, i64)>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// Ledger backend backed by a `DashMap`.
#[derive(Debug, Default)]
pub struct InMemoryLedgerBackend {
    entries: DashMap<String, Entry>,
}

impl InMemoryLedgerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_if_expired(&self, key: &str) {
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
    }
}

#[async_trait]
impl LedgerBackend for InMemoryLedgerBackend {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), LedgerError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LedgerError> {
        self.evict_if_expired(key);
        Ok(self.entries.get(key).and_then(|entry| match &entry.value {
            Value::Str(s) => Some(s.clone()),
            Value::ZSet(_) => None,
        }))
    }

    async fn exists(&self, key: &str) -> Result<bool, LedgerError> {
        self.evict_if_expired(key);
        Ok(self.entries.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<bool, LedgerError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn zadd(
        &self,
        key: &str,
        member: &str,
        score: i64,
        ttl: Duration,
    ) -> Result<(), LedgerError> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::ZSet(Vec::new()),
            expires_at: now + ttl,
        });

        if entry.is_expired(now) || !matches!(entry.value, Value::ZSet(_)) {
            entry.value = Value::ZSet(Vec::new());
        }
        if let Value::ZSet(members) = &mut entry.value {
            members.retain(|(m, _)| m != member);
            let pos = members.partition_point(|(_, s)| *s <= score);
            members.insert(pos, (member.to_string(), score));
        }
        entry.expires_at = now + ttl;
        Ok(())
    }

    async fn zrange(&self, key: &str) -> Result<Vec<String>, LedgerError> {
        self.evict_if_expired(key);
        Ok(self
            .entries
            .get(key)
            .map(|entry| match &entry.value {
                Value::ZSet(members) => members.iter().map(|(m, _)| m.clone()).collect(),
                Value::Str(_) => Vec::new(),
            })
            .unwrap_or_default())
    }

    async fn zrem_below(&self, key: &str, min_score: i64) -> Result<usize, LedgerError> {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(0);
        };
        let Value::ZSet(members) = &mut entry.value else {
            return Ok(0);
        };
        let before = members.len();
        members.retain(|(_, s)| *s >= min_score);
        Ok(before - members.len())
    }

    async fn ztrim_newest(&self, key: &str, keep: usize) -> Result<Vec<String>, LedgerError> {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(Vec::new());
        };
        let Value::ZSet(members) = &mut entry.value else {
            return Ok(Vec::new());
        };
        let excess = members.len().saturating_sub(keep);
        Ok(members.drain(..excess).map(|(m, _)| m).collect())
    }

    async fn purge_expired(&self) -> Result<usize, LedgerError> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before.saturating_sub(self.entries.len()))
    }
}
