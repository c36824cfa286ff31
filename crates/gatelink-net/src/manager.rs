//! Keyed collection of live connections.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::connection::Connection;

/// Composite key identifying a remote endpoint.
///
/// IPv4 addresses (and IPv4-mapped IPv6 addresses) map one-to-one:
/// `address << 16 | port`. Other IPv6 addresses fold both 64-bit halves
/// together first, so distinct endpoints may share a key.
pub fn key_for(ip: IpAddr, port: u16) -> u64 {
    let ip = match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    };
    match ip {
        IpAddr::V4(v4) => (u64::from(u32::from(v4)) << 16) | u64::from(port),
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let folded = (bits >> 64) as u64 ^ bits as u64;
            (folded << 16) | u64::from(port)
        }
    }
}

/// Thread-safe map of active connections keyed by [`key_for`].
///
/// Prevents two physical connections to the same endpoint and starts every
/// connection it accepts.
#[derive(Default)]
pub struct ConnectionManager {
    inner: RwLock<HashMap<u64, Arc<Connection>>>,
}

impl ConnectionManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `connection` under `key` and start it.
    ///
    /// Returns `false`, leaving `connection` unstarted, if the key is taken.
    /// The caller decides whether to reuse the existing connection or drop
    /// the new one.
    pub async fn try_insert(&self, key: u64, connection: Arc<Connection>) -> bool {
        let mut map = self.inner.write().await;
        if map.contains_key(&key) {
            tracing::debug!(
                "Connection to {} already registered",
                connection.remote_addr()
            );
            return false;
        }
        if !connection.start() {
            tracing::warn!(
                "Connection to {} was already started or stopped",
                connection.remote_addr()
            );
        }
        map.insert(key, connection);
        true
    }

    /// Look up a connection.
    pub async fn get(&self, key: u64) -> Option<Arc<Connection>> {
        self.inner.read().await.get(&key).cloned()
    }

    /// Whether `key` is registered.
    pub async fn contains(&self, key: u64) -> bool {
        self.inner.read().await.contains_key(&key)
    }

    /// Remove a connection without stopping it.
    pub async fn remove(&self, key: u64) -> Option<Arc<Connection>> {
        self.inner.write().await.remove(&key)
    }

    /// Remove `key` only if it still maps to `connection`.
    pub async fn remove_if_same(&self, key: u64, connection: &Arc<Connection>) -> bool {
        let mut map = self.inner.write().await;
        match map.get(&key) {
            Some(current) if Arc::ptr_eq(current, connection) => {
                map.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Return the current number of connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Return `true` if there are no connections.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Remove and stop every connection.
    pub async fn stop_all(&self) {
        let drained: Vec<_> = self.inner.write().await.drain().map(|(_, c)| c).collect();
        for connection in drained {
            connection.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, ConnectionState};
    use crate::dispatch::DispatchRegistry;
    use crate::service::ServiceCategory;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
    use tokio::net::TcpListener;

    async fn connection_to(listener: &TcpListener) -> Arc<Connection> {
        let conn = Connection::connect(
            listener.local_addr().unwrap(),
            ServiceCategory::COMMON,
            Arc::new(DispatchRegistry::new()),
            ConnectionConfig::default(),
        )
        .await
        .unwrap();
        Arc::new(conn)
    }

    #[test]
    fn test_key_is_deterministic_and_distinct() {
        let a = key_for(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 7777);
        assert_eq!(a, key_for(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 7777));
        assert_ne!(a, key_for(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 7778));
        assert_ne!(a, key_for(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 7777));
        assert_eq!(a, (0x0A00_0001u64 << 16) | 7777);
    }

    #[test]
    fn test_mapped_ipv6_matches_ipv4() {
        let v4 = Ipv4Addr::new(192, 168, 1, 20);
        assert_eq!(
            key_for(IpAddr::V4(v4), 80),
            key_for(IpAddr::V6(v4.to_ipv6_mapped()), 80)
        );
    }

    #[test]
    fn test_ipv6_key_includes_port() {
        let ip = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert_ne!(key_for(ip, 1), key_for(ip, 2));
    }

    #[tokio::test]
    async fn test_insert_starts_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let manager = ConnectionManager::new();
        let conn = connection_to(&listener).await;
        let SocketAddr::V4(addr) = conn.remote_addr() else {
            panic!("expected ipv4");
        };
        let key = key_for(IpAddr::V4(*addr.ip()), addr.port());

        assert!(manager.try_insert(key, Arc::clone(&conn)).await);
        assert_eq!(conn.state().current(), ConnectionState::Started);
        assert_eq!(manager.len().await, 1);
        assert!(manager.contains(key).await);

        manager.stop_all().await;
        assert!(manager.is_empty().await);
        assert_eq!(conn.state().current(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected_without_start() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let manager = ConnectionManager::new();
        let first = connection_to(&listener).await;
        let second = connection_to(&listener).await;

        assert!(manager.try_insert(42, Arc::clone(&first)).await);
        assert!(!manager.try_insert(42, Arc::clone(&second)).await);
        assert_eq!(second.state().current(), ConnectionState::Connected);

        let current = manager.get(42).await.unwrap();
        assert!(Arc::ptr_eq(&current, &first));

        assert!(!manager.remove_if_same(42, &second).await);
        assert!(manager.remove_if_same(42, &first).await);
        assert!(manager.remove(42).await.is_none());

        first.stop().await;
        second.stop().await;
    }
}
