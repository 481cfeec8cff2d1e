//! Response cache keyed by request content

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use triage_common::{AgentType, ChatMessage};

/// Cache key over `(agent_type, model_preference, messages)`
pub fn cache_key(
    agent_type: AgentType,
    model_preference: Option<&str>,
    messages: &[ChatMessage],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(agent_type.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(model_preference.unwrap_or("").as_bytes());
    hasher.update([0u8]);
    for message in messages {
        hasher.update(message.role.as_bytes());
        hasher.update([0u8]);
        hasher.update(message.content.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: String,
    stored_at: DateTime<Utc>,
}

/// TTL cache of completed responses
///
/// Expired entries are evicted lazily on lookup or by `purge_expired`.
#[derive(Debug)]
pub struct ResponseCache {
    entries: HashMap<String, CacheEntry>,
    ttl: Duration,
    hits: u64,
    misses: u64,
}

impl ResponseCache {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            entries: HashMap::new(),
            ttl: Duration::seconds(ttl_seconds as i64),
            hits: 0,
            misses: 0,
        }
    }

    /// Look up a fresh entry
    pub fn get(&mut self, key: &str, now: DateTime<Utc>) -> Option<String> {
        let fresh = match self.entries.get(key) {
            Some(entry) if now - entry.stored_at < self.ttl => Some(entry.result.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        };

        if fresh.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        fresh
    }

    pub fn insert(&mut self, key: String, result: String, now: DateTime<Utc>) {
        self.entries.insert(
            key,
            CacheEntry {
                result,
                stored_at: now,
            },
        );
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| now - entry.stored_at < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}
