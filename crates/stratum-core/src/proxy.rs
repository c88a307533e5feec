use std::collections::{HashMap, HashSet};

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::layer::BoxFuture;

/// What a before-hook decided for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Interception {
    /// Run the target as usual.
    Proceed,
    /// Skip the target and return this result.
    Cached(Value),
}

/// Before/after hooks around the target call of a layer handle.
pub trait LayerProxy: Send + Sync {
    fn before_invoke<'a>(
        &'a self,
        operation: &'a str,
        args: &'a [Value],
    ) -> BoxFuture<'a, Interception>;

    fn after_invoke<'a>(
        &'a self,
        operation: &'a str,
        result: &'a Value,
        args: &'a [Value],
    ) -> BoxFuture<'a, ()>;
}

/// Result cache keyed by operation and arguments.
///
/// Only operations listed at construction are cached; a later call with the
/// same arguments is answered without reaching the target.
pub struct CachingProxy {
    operations: HashSet<String>,
    entries: RwLock<HashMap<String, Value>>,
}

impl CachingProxy {
    pub fn new<I, S>(operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            operations: operations.into_iter().map(Into::into).collect(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Stable SHA-256 key for an operation call.
    pub fn key(operation: &str, args: &[Value]) -> String {
        let canonical = serde_json::to_string(args).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(operation.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub async fn invalidate(&self, operation: &str, args: &[Value]) {
        let mut entries = self.entries.write().await;
        entries.remove(&Self::key(operation, args));
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl LayerProxy for CachingProxy {
    fn before_invoke<'a>(
        &'a self,
        operation: &'a str,
        args: &'a [Value],
    ) -> BoxFuture<'a, Interception> {
        Box::pin(async move {
            if !self.operations.contains(operation) {
                return Interception::Proceed;
            }

            let key = Self::key(operation, args);
            let entries = self.entries.read().await;
            match entries.get(&key) {
                Some(cached) => {
                    tracing::debug!(operation, key = %key, "Cache hit");
                    Interception::Cached(cached.clone())
                }
                None => Interception::Proceed,
            }
        })
    }

    fn after_invoke<'a>(
        &'a self,
        operation: &'a str,
        result: &'a Value,
        args: &'a [Value],
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.operations.contains(operation) {
                let mut entries = self.entries.write().await;
                entries.insert(Self::key(operation, args), result.clone());
            }
        })
    }
}
