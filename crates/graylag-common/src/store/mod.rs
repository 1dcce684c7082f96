//! The key-value capability shared by the greylist and the auto-whitelist.
//!
//! Backends are discriminated by URL scheme: `sled:///PATH` (or the
//! compatibility alias `gdbm:///PATH`) for the embedded on-disk map,
//! `redis-tcp://HOST:PORT[/?db=N]` / `redis-unix://[user:pw@]/PATH[?db=N]`
//! for the networked store. `file:///PATH` is only valid as a whitelist
//! source and is refused here.
//!
//! The redis-unix form carries user-info against an empty host, which is
//! not a parseable WHATWG URL, so schemes are split by hand rather than
//! through a URL library.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

mod redis_store;
mod sled_store;

pub use redis_store::RedisStore;
pub use sled_store::SledStore;

/// Predicate applied to `(key, value)` pairs during a [`Store::scan`].
pub type ScanPredicate<'a> = &'a (dyn Fn(&str, &str) -> bool + Send + Sync);

/// Errors raised by store backends and the URL dispatcher.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The URL did not split into scheme and remainder.
    #[error("invalid store url {0}")]
    InvalidUrl(String),
    /// The URL scheme maps to no backend.
    #[error("unsupported store scheme {0:?}")]
    UnsupportedScheme(String),
    /// The scheme is only valid as a whitelist source.
    #[error("scheme {0:?} is read-only and not usable as a store")]
    ReadOnly(String),
    /// A TCP URL without a host.
    #[error("store url {0} has no host")]
    MissingHost(String),
    /// Embedded backend failure.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    /// Networked backend failure.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// The narrow capability the policy engine and the sweeper depend on.
///
/// Implementations must be safe for concurrent use by the connection
/// workers and the maintenance sweeper.
#[async_trait]
pub trait Store: Send + Sync {
    /// Looks up a value, `None` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Creates or overwrites a key. No expiry is attached.
    async fn update(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Removes a key. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Durability barrier; a no-op for backends that persist on each write.
    async fn save(&self) -> Result<(), StoreError>;

    /// Visits every `(key, value)` pair and collects the keys for which the
    /// predicate returns true. Enumeration order is unspecified.
    async fn scan(&self, predicate: ScanPredicate<'_>) -> Result<Vec<String>, StoreError>;
}

/// Opens the backend named by `url`. Failure here is fatal at startup.
pub async fn open(url: &str) -> Result<Arc<dyn Store>, StoreError> {
    let (scheme, rest) = split_scheme(url)?;
    let store: Arc<dyn Store> = match scheme {
        "sled" | "gdbm" => Arc::new(SledStore::open(Path::new(rest))?),
        "redis-tcp" | "redis-unix" => Arc::new(RedisStore::connect(url).await?),
        "file" => return Err(StoreError::ReadOnly("file".to_owned())),
        other => return Err(StoreError::UnsupportedScheme(other.to_owned())),
    };
    tracing::info!(url = %sanitize_url(url), "opened store");
    Ok(store)
}

/// Splits `scheme://rest`, leaving any leading `/` of an absolute path on
/// the `rest` side.
pub(crate) fn split_scheme(url: &str) -> Result<(&str, &str), StoreError> {
    url.split_once("://")
        .filter(|(scheme, _)| !scheme.is_empty())
        .ok_or_else(|| StoreError::InvalidUrl(sanitize_url(url)))
}

static URL_PASSWORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(//[^/@:]*:)[^@]*@").expect("password pattern"));

/// Replaces the password segment of a URL with the literal `password`.
/// Every log line that mentions a store URL goes through this.
#[must_use]
pub fn sanitize_url(url: &str) -> String {
    URL_PASSWORD_RE.replace(url, "${1}password@").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_scheme_is_refused() {
        assert!(matches!(
            open("file:///etc/whitelist").await,
            Err(StoreError::ReadOnly(_))
        ));
    }

    #[tokio::test]
    async fn unknown_scheme_is_refused() {
        assert!(matches!(
            open("mysql://db/grey").await,
            Err(StoreError::UnsupportedScheme(_))
        ));
    }

    #[tokio::test]
    async fn garbage_url_is_refused() {
        assert!(matches!(
            open("not a url").await,
            Err(StoreError::InvalidUrl(_))
        ));
    }

    #[test]
    fn scheme_split_keeps_absolute_paths() {
        assert_eq!(
            split_scheme("sled:///var/db/grey").unwrap(),
            ("sled", "/var/db/grey")
        );
        assert_eq!(
            split_scheme("redis-tcp://host:6379/?db=1").unwrap(),
            ("redis-tcp", "host:6379/?db=1")
        );
    }

    #[test]
    fn password_is_elided() {
        assert_eq!(
            sanitize_url("redis-unix://user:hunter2@/run/redis.sock?db=3"),
            "redis-unix://user:password@/run/redis.sock?db=3"
        );
        assert_eq!(
            sanitize_url("redis-unix://:hunter2@/run/redis.sock"),
            "redis-unix://:password@/run/redis.sock"
        );
    }

    #[test]
    fn urls_without_secrets_are_untouched() {
        assert_eq!(
            sanitize_url("redis-tcp://cache.test:6379/?db=2"),
            "redis-tcp://cache.test:6379/?db=2"
        );
        assert_eq!(sanitize_url("sled:///var/db/grey"), "sled:///var/db/grey");
    }
}
