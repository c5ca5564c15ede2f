use std::sync::atomic::{
    AtomicU32,
    Ordering,
};
use std::sync::{
    Arc,
    Mutex as StdMutex,
};
use std::time::Duration;

use tracing::{
    debug,
    warn,
};

use crate::client::{
    ClientConnection,
    ClientHandler,
};
use crate::tls::TlsClientConfig;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_conns: usize,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_conns: 4096,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::ZERO,
        }
    }
}

/// Bounded pool of reusable outgoing connections keyed by `(ip, port)`.
/// Callers return a connection by flipping `available` back to true.
pub struct ConnectionPool {
    conns: StdMutex<Vec<Arc<ClientConnection>>>,
    next_id: AtomicU32,
    tls: Option<TlsClientConfig>,
    cfg: PoolConfig,
}

impl ConnectionPool {
    pub fn new(cfg: PoolConfig, tls: Option<TlsClientConfig>) -> Self {
        Self {
            conns: StdMutex::new(Vec::new()),
            next_id: AtomicU32::new(0),
            tls,
            cfg,
        }
    }

    /// Hands out the first idle connection to the target after rebinding the
    /// handler, or dials a new one. Returns `None` on dial failure or when
    /// the pool is full. `timeout_secs` overrides the connect timeout when
    /// non-zero.
    pub async fn apply_conn(
        &self, ip: &str, port: &str, handler: ClientHandler, timeout_secs: u64,
    ) -> Option<Arc<ClientConnection>> {
        {
            let mut conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
            conns.retain(|conn| !conn.is_closed());
            for conn in conns.iter() {
                if conn.ip() == ip
                    && conn.port() == port
                    && conn.is_available()
                    && !conn.is_closed()
                {
                    conn.set_available(false);
                    conn.set_handler(handler);
                    debug!(id = conn.connection_id(), addr = %conn.address(), "reusing pooled connection");
                    return Some(conn.clone());
                }
            }
            if conns.len() >= self.cfg.max_conns {
                warn!(limit = self.cfg.max_conns, "connection pool full");
                return None;
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connect_timeout = if timeout_secs > 0 {
            Duration::from_secs(timeout_secs)
        } else {
            self.cfg.connect_timeout
        };
        match ClientConnection::connect(
            id,
            ip,
            port,
            handler,
            self.tls.clone(),
            connect_timeout,
            self.cfg.idle_timeout,
        )
        .await
        {
            Ok(conn) => {
                conn.set_available(false);
                self.conns
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(conn.clone());
                Some(conn)
            }
            Err(e) => {
                warn!(%ip, %port, error = %e, "new pooled connection failed");
                None
            }
        }
    }

    /// Any live connection to the target, regardless of availability.
    pub fn find_conn(&self, ip: &str, port: &str) -> Option<Arc<ClientConnection>> {
        let conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
        conns
            .iter()
            .find(|conn| conn.ip() == ip && conn.port() == port && !conn.is_closed())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.conns.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;

    async fn silent_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_apply_conn_reuses_returned_connection() {
        let port = silent_server().await.to_string();
        let pool = ConnectionPool::new(PoolConfig::default(), None);

        let first = pool
            .apply_conn("127.0.0.1", &port, ClientHandler::new(), 0)
            .await
            .unwrap();
        assert!(!first.is_available());
        assert_eq!(pool.len(), 1);

        // Busy connection forces a second dial.
        let second = pool
            .apply_conn("127.0.0.1", &port, ClientHandler::new(), 0)
            .await
            .unwrap();
        assert_ne!(first.connection_id(), second.connection_id());
        assert_eq!(pool.len(), 2);

        // Returning the first makes it eligible again.
        first.set_available(true);
        let third = pool
            .apply_conn("127.0.0.1", &port, ClientHandler::new(), 0)
            .await
            .unwrap();
        assert_eq!(third.connection_id(), first.connection_id());
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_apply_conn_respects_limit() {
        let port = silent_server().await.to_string();
        let pool = ConnectionPool::new(
            PoolConfig {
                max_conns: 1,
                ..PoolConfig::default()
            },
            None,
        );

        let first = pool
            .apply_conn("127.0.0.1", &port, ClientHandler::new(), 0)
            .await
            .unwrap();
        assert!(pool
            .apply_conn("127.0.0.1", &port, ClientHandler::new(), 0)
            .await
            .is_none());
        drop(first);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dial_failure_returns_none() {
        let pool = ConnectionPool::new(
            PoolConfig {
                connect_timeout: Duration::from_millis(300),
                ..PoolConfig::default()
            },
            None,
        );
        assert!(pool
            .apply_conn("127.0.0.1", "1", ClientHandler::new(), 0)
            .await
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_find_conn_sees_busy_connections() {
        let port = silent_server().await.to_string();
        let pool = ConnectionPool::new(PoolConfig::default(), None);
        assert!(pool.find_conn("127.0.0.1", &port).is_none());
        let conn = pool
            .apply_conn("127.0.0.1", &port, ClientHandler::new(), 0)
            .await
            .unwrap();
        assert!(pool.find_conn("127.0.0.1", &port).is_some());
        drop(conn);
    }
}
