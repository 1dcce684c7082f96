//! Networked backend over a redis server.
//!
//! `save` is a no-op: the server persists per its own policy. `scan` drives
//! the SCAN cursor and applies the predicate after a GET of each key, so a
//! key deleted mid-scan is simply skipped.

use super::{ScanPredicate, Store, StoreError};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use std::collections::HashMap;
use std::path::PathBuf;

/// A store fronting a single redis instance, over TCP or a unix socket.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Connects to the instance named by a `redis-tcp://` or
    /// `redis-unix://` store URL.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(connection_info(url)?)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    /// All members of the list at `key`, oldest first.
    ///
    /// Used by whitelist sources, which the importer stores as redis lists.
    pub async fn lrange(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    /// The full hash at `key`, as a field → value map.
    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(fields)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn update(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn save(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn scan(&self, predicate: ScanPredicate<'_>) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        let mut matched = Vec::new();
        for key in keys {
            if let Some(value) = self.get(&key).await? {
                if predicate(&key, &value) {
                    matched.push(key);
                }
            }
        }
        Ok(matched)
    }
}

/// Parsed form of `redis-tcp://[user:pw@]HOST[:PORT][/][?db=N]` and
/// `redis-unix://[user:pw@]/PATH[?db=N]`.
fn connection_info(url: &str) -> Result<ConnectionInfo, StoreError> {
    let (scheme, rest) = super::split_scheme(url)?;
    let (main, query) = match rest.split_once('?') {
        Some((main, query)) => (main, Some(query)),
        None => (rest, None),
    };
    let db = query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .find_map(|pair| pair.strip_prefix("db="))
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);

    // Credentials come before the authority; only an '@' ahead of the first
    // '/' is user-info.
    let (credentials, target) = match main.split_once('@') {
        Some((creds, target)) if !creds.contains('/') => (Some(creds), target),
        _ => (None, main),
    };
    let (username, password) = match credentials {
        Some(creds) => {
            let (user, pass) = creds.split_once(':').unwrap_or((creds, ""));
            (
                (!user.is_empty()).then(|| user.to_owned()),
                (!pass.is_empty()).then(|| pass.to_owned()),
            )
        }
        None => (None, None),
    };

    let addr = match scheme {
        "redis-unix" => ConnectionAddr::Unix(PathBuf::from(target)),
        _ => {
            let host_port = target.split_once('/').map_or(target, |(hp, _)| hp);
            let (host, port) = match host_port.rsplit_once(':') {
                Some((host, port)) => (
                    host,
                    port.parse()
                        .map_err(|_| StoreError::InvalidUrl(super::sanitize_url(url)))?,
                ),
                None => (host_port, 6379),
            };
            let host = host.trim_start_matches('[').trim_end_matches(']');
            if host.is_empty() {
                return Err(StoreError::MissingHost(super::sanitize_url(url)));
            }
            ConnectionAddr::Tcp(host.to_owned(), port)
        }
    };

    Ok(ConnectionInfo {
        addr,
        redis: RedisConnectionInfo {
            db,
            username,
            password,
            ..Default::default()
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_url_maps_to_tcp_addr() {
        let info = connection_info("redis-tcp://cache.test:6380/?db=2").unwrap();
        match info.addr {
            ConnectionAddr::Tcp(host, port) => {
                assert_eq!(host, "cache.test");
                assert_eq!(port, 6380);
            }
            other => panic!("expected tcp addr, got {other:?}"),
        }
        assert_eq!(info.redis.db, 2);
        assert_eq!(info.redis.username, None);
        assert_eq!(info.redis.password, None);
    }

    #[test]
    fn tcp_port_defaults() {
        let info = connection_info("redis-tcp://cache.test").unwrap();
        match info.addr {
            ConnectionAddr::Tcp(host, port) => {
                assert_eq!(host, "cache.test");
                assert_eq!(port, 6379);
            }
            other => panic!("expected tcp addr, got {other:?}"),
        }
        assert_eq!(info.redis.db, 0);
    }

    #[test]
    fn unix_url_maps_to_socket_path() {
        let info = connection_info("redis-unix://user:pw@/run/redis.sock?db=3").unwrap();
        match info.addr {
            ConnectionAddr::Unix(path) => {
                assert_eq!(path, PathBuf::from("/run/redis.sock"));
            }
            other => panic!("expected unix addr, got {other:?}"),
        }
        assert_eq!(info.redis.db, 3);
        assert_eq!(info.redis.username.as_deref(), Some("user"));
        assert_eq!(info.redis.password.as_deref(), Some("pw"));
    }

    #[test]
    fn unix_url_without_credentials() {
        let info = connection_info("redis-unix:///run/redis.sock").unwrap();
        match info.addr {
            ConnectionAddr::Unix(path) => {
                assert_eq!(path, PathBuf::from("/run/redis.sock"));
            }
            other => panic!("expected unix addr, got {other:?}"),
        }
        assert_eq!(info.redis.username, None);
        assert_eq!(info.redis.password, None);
    }

    #[test]
    fn tcp_url_without_host_is_refused() {
        assert!(matches!(
            connection_info("redis-tcp://:6379"),
            Err(StoreError::MissingHost(_))
        ));
    }

    #[test]
    fn bracketed_v6_host_is_unwrapped() {
        let info = connection_info("redis-tcp://[::1]:6390").unwrap();
        match info.addr {
            ConnectionAddr::Tcp(host, port) => {
                assert_eq!(host, "::1");
                assert_eq!(port, 6390);
            }
            other => panic!("expected tcp addr, got {other:?}"),
        }
    }
}
