//! Cache-aside response cache with content-dependent TTLs.
//!
//! Keys are derived from the normalized conversation so that trivially
//! different phrasings of the same exchange hit the same entry. Crisis
//! content is never cached; personalized messages get a short TTL; FAQ
//! lookups are kept for a day.
//!
//! Redis is the backing store when configured. Every Redis error
//! degrades to a miss (on read) or a no-op plus the in-memory fallback
//! (on write); the cache never fails a request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use kindred_llm::ChatMessage;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Redis key prefix for cached responses.
const KEY_PREFIX: &str = "kindred:chat:";

/// Upper bound on the in-memory fallback map.
const MAX_LOCAL_ENTRIES: usize = 1024;

/// TTL class of a conversation, decided from its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClass {
    /// Crisis content, never cached
    Crisis,
    /// First-person family context, 5 minutes
    Personalized,
    /// General FAQ lookup, 24 hours
    Faq,
    /// Everything else, 1 hour
    Default,
}

impl CacheClass {
    /// TTL for this class. Zero means do not cache.
    #[must_use]
    pub fn ttl(self) -> Duration {
        match self {
            Self::Crisis => Duration::ZERO,
            Self::Personalized => Duration::from_secs(300),
            Self::Faq => Duration::from_secs(86_400),
            Self::Default => Duration::from_secs(3600),
        }
    }
}

lazy_static! {
    /// First-person references to the user's own family.
    static ref PERSONAL_RE: Regex = Regex::new(
        r"(?i)\b(my|our)\s+(son|daughter|child|kid|kids|husband|wife|partner|family)\b"
    )
    .expect("personalization regex");

    /// General informational questions worth keeping for a day.
    static ref FAQ_RES: Vec<Regex> = vec![
        Regex::new(r"(?i)\bwhat\s+is\s+(autism|adhd|asd|an?\s+iep|a\s+504)\b").expect("faq regex"),
        Regex::new(r"(?i)\bwhat\s+are\s+the\s+(signs|symptoms)\s+of\b").expect("faq regex"),
        Regex::new(r"(?i)\bhow\s+do(es)?\s+(an?\s+)?(iep|504|diagnosis|evaluation)s?\s+work\b")
            .expect("faq regex"),
        Regex::new(r"(?i)\bexplain\s+(autism|adhd|asd|stimming|masking|sensory\s+processing)\b")
            .expect("faq regex"),
    ];
}

/// Classify a conversation for caching purposes.
///
/// Crisis beats personalized beats FAQ; classification looks at user
/// messages only.
#[must_use]
pub fn classify(messages: &[ChatMessage]) -> CacheClass {
    if kindred_llm::messages_contain_crisis(messages) {
        return CacheClass::Crisis;
    }
    let user_text: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == kindred_llm::MessageRole::User)
        .map(|m| m.content.as_str())
        .collect();

    if user_text.iter().any(|t| PERSONAL_RE.is_match(t)) {
        return CacheClass::Personalized;
    }
    if user_text
        .iter()
        .any(|t| FAQ_RES.iter().any(|re| re.is_match(t)))
    {
        return CacheClass::Faq;
    }
    CacheClass::Default
}

/// Derive the cache key for a conversation.
///
/// Content is lowercased and internal whitespace collapsed before
/// hashing, one `role:content` line per message.
#[must_use]
pub fn cache_key(messages: &[ChatMessage]) -> String {
    let mut hasher = Sha256::new();
    for message in messages {
        let normalized: String = message
            .content
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        hasher.update(message.role.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(normalized.as_bytes());
        hasher.update(b"\n");
    }
    format!("{}{:x}", KEY_PREFIX, hasher.finalize())
}

/// A cached assistant response with its provider attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub response: String,
    pub provider: String,
    pub model: String,
    /// Times this entry has been served. Lives inside the entry, so it
    /// expires with it.
    #[serde(default)]
    pub hits: u64,
}

/// Cache counters for health reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub local_entries: usize,
    pub redis_available: bool,
}

struct LocalEntry {
    value: CachedResponse,
    expires_at: Instant,
}

/// Hybrid Redis + in-memory response cache.
pub struct ResponseCache {
    redis: Option<redis::Client>,
    local: Mutex<HashMap<String, LocalEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
}

impl ResponseCache {
    /// Cache backed by Redis, with the in-memory map as fallback.
    pub fn new(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            redis: Some(client),
            local: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
        })
    }

    /// In-memory only cache (no Redis configured).
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            redis: None,
            local: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
        }
    }

    async fn redis_conn(&self) -> Option<redis::aio::MultiplexedConnection> {
        let client = self.redis.as_ref()?;
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!(error = %e, "Redis connection failed, using in-memory cache");
                None
            }
        }
    }

    /// Look up a cached response for this conversation.
    ///
    /// Crisis-class conversations always miss. A hit bumps the entry's
    /// own hit counter; the Redis write-back runs in the background and
    /// keeps the entry's remaining TTL.
    pub async fn check(&self, messages: &[ChatMessage]) -> Option<CachedResponse> {
        if classify(messages) == CacheClass::Crisis {
            return None;
        }
        let key = cache_key(messages);

        if let Some(mut conn) = self.redis_conn().await {
            let data: Option<String> = match redis::cmd("GET")
                .arg(&key)
                .query_async(&mut conn)
                .await
            {
                Ok(data) => data,
                Err(e) => {
                    warn!(error = %e, "Redis GET failed, treating as miss");
                    None
                }
            };
            if let Some(json) = data {
                match serde_json::from_str::<CachedResponse>(&json) {
                    Ok(mut cached) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        cached.hits += 1;
                        debug!(key = %key, entry_hits = cached.hits, "Cache hit");
                        if let Ok(updated) = serde_json::to_string(&cached) {
                            // XX: only if the entry still exists;
                            // KEEPTTL: expiry stays with the entry
                            tokio::spawn(async move {
                                let _: Result<Option<String>, _> = redis::cmd("SET")
                                    .arg(&key)
                                    .arg(updated)
                                    .arg("XX")
                                    .arg("KEEPTTL")
                                    .query_async(&mut conn)
                                    .await;
                            });
                        }
                        return Some(cached);
                    }
                    Err(e) => {
                        warn!(error = %e, "Corrupt cache entry, treating as miss");
                    }
                }
            }
        } else if let Some(cached) = self.check_local(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Cache hit (local)");
            return Some(cached);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a response under this conversation's key, with the TTL of
    /// its content class. A zero TTL (crisis) is a no-op.
    pub async fn store(&self, messages: &[ChatMessage], response: &CachedResponse) {
        let class = classify(messages);
        let ttl = class.ttl();
        if ttl.is_zero() {
            return;
        }
        let key = cache_key(messages);
        let json = match serde_json::to_string(response) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize cache entry");
                return;
            }
        };

        if let Some(mut conn) = self.redis_conn().await {
            let result: Result<(), _> = redis::cmd("SETEX")
                .arg(&key)
                .arg(ttl.as_secs())
                .arg(&json)
                .query_async(&mut conn)
                .await;
            match result {
                Ok(()) => {
                    self.stores.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, ttl_secs = ttl.as_secs(), "Cached response");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Redis SETEX failed, falling back to in-memory");
                }
            }
        }

        self.store_local(key, response.clone(), ttl);
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    fn check_local(&self, key: &str) -> Option<CachedResponse> {
        let mut local = self.local.lock().unwrap_or_else(|e| e.into_inner());
        match local.get_mut(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.value.hits += 1;
                Some(entry.value.clone())
            }
            Some(_) => {
                local.remove(key);
                None
            }
            None => None,
        }
    }

    fn store_local(&self, key: String, value: CachedResponse, ttl: Duration) {
        let mut local = self.local.lock().unwrap_or_else(|e| e.into_inner());
        if local.len() >= MAX_LOCAL_ENTRIES && !local.contains_key(&key) {
            // Evict the entry closest to expiry
            if let Some(victim) = local
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(k, _)| k.clone())
            {
                local.remove(&victim);
            }
        }
        local.insert(
            key,
            LocalEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let local = self.local.lock().unwrap_or_else(|e| e.into_inner());
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            local_entries: local.len(),
            redis_available: self.redis.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convo(text: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::user(text)]
    }

    fn cached(text: &str) -> CachedResponse {
        CachedResponse {
            response: text.to_string(),
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            hits: 0,
        }
    }

    #[test]
    fn test_key_is_normalization_invariant() {
        let a = cache_key(&convo("What is   Autism?"));
        let b = cache_key(&convo("what is autism?"));
        let c = cache_key(&convo("what is adhd?"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with(KEY_PREFIX));
    }

    #[test]
    fn test_key_depends_on_role() {
        let user = cache_key(&[ChatMessage::user("hello")]);
        let assistant = cache_key(&[ChatMessage::assistant("hello")]);
        assert_ne!(user, assistant);
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify(&convo("what is autism?")), CacheClass::Faq);
        assert_eq!(
            classify(&convo("my son has trouble sleeping")),
            CacheClass::Personalized
        );
        assert_eq!(
            classify(&convo("I want to kill myself")),
            CacheClass::Crisis
        );
        assert_eq!(
            classify(&convo("recommend a weighted blanket")),
            CacheClass::Default
        );
    }

    #[test]
    fn test_crisis_beats_personalized() {
        let messages = convo("my son keeps talking about suicide");
        assert_eq!(classify(&messages), CacheClass::Crisis);
        assert!(classify(&messages).ttl().is_zero());
    }

    #[test]
    fn test_ttl_classes() {
        assert_eq!(CacheClass::Crisis.ttl(), Duration::ZERO);
        assert_eq!(CacheClass::Personalized.ttl(), Duration::from_secs(300));
        assert_eq!(CacheClass::Faq.ttl(), Duration::from_secs(86_400));
        assert_eq!(CacheClass::Default.ttl(), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_in_memory_store_and_check() {
        let cache = ResponseCache::in_memory();
        let messages = convo("what is autism?");

        assert!(cache.check(&messages).await.is_none());
        cache.store(&messages, &cached("Autism is...")).await;

        let hit = cache.check(&messages).await.expect("cached entry");
        assert_eq!(hit.response, "Autism is...");
        assert_eq!(hit.provider, "openai");
        assert_eq!(hit.hits, 1);

        // Different phrasing, same normalization
        let rephrased = convo("What  is  AUTISM?");
        let again = cache.check(&rephrased).await.expect("cached entry");
        assert_eq!(again.hits, 2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.stores, 1);
    }

    #[tokio::test]
    async fn test_hit_counter_expires_with_entry() {
        let cache = ResponseCache::in_memory();
        let messages = convo("recommend a weighted blanket");
        cache.store(&messages, &cached("Try...")).await;
        cache.check(&messages).await.expect("cached entry");

        // Force the entry past its expiry; the counter goes with it
        {
            let mut local = cache.local.lock().unwrap();
            for entry in local.values_mut() {
                entry.expires_at = Instant::now();
            }
        }
        assert!(cache.check(&messages).await.is_none());
        assert_eq!(cache.stats().local_entries, 0);
    }

    #[tokio::test]
    async fn test_crisis_never_cached() {
        let cache = ResponseCache::in_memory();
        let messages = convo("thinking about suicide");

        cache.store(&messages, &cached("should never land")).await;
        assert!(cache.check(&messages).await.is_none());
        assert_eq!(cache.stats().stores, 0);
        assert_eq!(cache.stats().local_entries, 0);
    }

    #[tokio::test]
    async fn test_local_eviction_bounded() {
        let cache = ResponseCache::in_memory();
        for i in 0..(MAX_LOCAL_ENTRIES + 10) {
            let messages = convo(&format!("question number {i}"));
            cache.store(&messages, &cached("answer")).await;
        }
        assert!(cache.stats().local_entries <= MAX_LOCAL_ENTRIES);
    }
}
