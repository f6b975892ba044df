//! Context-string provider with a time-boxed cache.
//!
//! The engine seeds each transcript with a system-message string describing
//! the target datasource. Building that string is expensive (it reads
//! datasource metadata), so lookups are cached per datasource id with a
//! TTL.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::ToolError;

/// Supplies the system-message string for a transcript.
#[async_trait::async_trait]
pub trait ContextProvider: Send + Sync {
    async fn system_context(&self, datasource_id: Option<&str>) -> Result<String, ToolError>;
}

/// Fixed-string provider for callers that precompute their prompt.
pub struct StaticContext {
    context: String,
}

impl StaticContext {
    #[must_use]
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
        }
    }
}

#[async_trait::async_trait]
impl ContextProvider for StaticContext {
    async fn system_context(&self, _datasource_id: Option<&str>) -> Result<String, ToolError> {
        Ok(self.context.clone())
    }
}

/// TTL cache wrapping an inner provider, keyed by datasource id.
pub struct CachedContext<P> {
    inner: P,
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, String)>>,
}

impl<P: ContextProvider> CachedContext<P> {
    #[must_use]
    pub fn new(inner: P, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait::async_trait]
impl<P: ContextProvider> ContextProvider for CachedContext<P> {
    async fn system_context(&self, datasource_id: Option<&str>) -> Result<String, ToolError> {
        let key = datasource_id.unwrap_or("").to_string();

        {
            let entries = self.entries.lock().await;
            if let Some((stored_at, context)) = entries.get(&key)
                && stored_at.elapsed() < self.ttl
            {
                return Ok(context.clone());
            }
        }

        let context = self.inner.system_context(datasource_id).await?;
        let mut entries = self.entries.lock().await;
        entries.insert(key, (Instant::now(), context.clone()));
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ContextProvider for Counting {
        async fn system_context(&self, datasource_id: Option<&str>) -> Result<String, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("context for {}", datasource_id.unwrap_or("none")))
        }
    }

    #[tokio::test]
    async fn cache_hits_within_ttl() {
        let cached = CachedContext::new(
            Counting {
                calls: AtomicUsize::new(0),
            },
            Duration::from_secs(60),
        );

        let first = cached.system_context(Some("ds-1")).await.unwrap();
        let second = cached.system_context(Some("ds-1")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_datasources_miss_separately() {
        let cached = CachedContext::new(
            Counting {
                calls: AtomicUsize::new(0),
            },
            Duration::from_secs(60),
        );

        cached.system_context(Some("ds-1")).await.unwrap();
        cached.system_context(Some("ds-2")).await.unwrap();
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_ttl_always_misses() {
        let cached = CachedContext::new(
            Counting {
                calls: AtomicUsize::new(0),
            },
            Duration::from_secs(0),
        );
        cached.system_context(Some("ds-1")).await.unwrap();
        cached.system_context(Some("ds-1")).await.unwrap();
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
    }
}
