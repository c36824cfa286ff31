//! Per-connection socket options.
//!
//! Applied once, right after the TCP handshake and before the loops start.

use std::io;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

/// Socket options for an outbound connection.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm. Default: true.
    pub tcp_nodelay: bool,
    /// Send keepalive probes on an idle connection. Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first probe. Default: 60 s.
    pub keepalive_idle: Duration,
    /// Time between probes. Default: 10 s.
    pub keepalive_interval: Duration,
    /// Unanswered probes before the kernel drops the connection. Ignored on
    /// platforms without `TCP_KEEPCNT`. Default: 3.
    pub keepalive_retries: u32,
    /// `SO_RCVBUF` override; `None` keeps the OS default.
    pub os_recv_buffer: Option<usize>,
    /// `SO_SNDBUF` override; `None` keeps the OS default.
    pub os_send_buffer: Option<usize>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            keepalive_retries: 3,
            os_recv_buffer: None,
            os_send_buffer: None,
        }
    }
}

impl SocketConfig {
    fn keepalive(&self) -> TcpKeepalive {
        let keepalive = TcpKeepalive::new()
            .with_time(self.keepalive_idle)
            .with_interval(self.keepalive_interval);

        #[cfg(any(target_os = "linux", target_os = "windows"))]
        let keepalive = keepalive.with_retries(self.keepalive_retries);

        keepalive
    }

    /// Apply these options to a connected stream.
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.tcp_nodelay)?;

        let socket = SockRef::from(stream);
        if self.keepalive_enabled {
            socket.set_tcp_keepalive(&self.keepalive())?;
        } else {
            socket.set_keepalive(false)?;
        }
        if let Some(size) = self.os_recv_buffer {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.os_send_buffer {
            socket.set_send_buffer_size(size)?;
        }

        tracing::trace!(
            nodelay = self.tcp_nodelay,
            keepalive = self.keepalive_enabled,
            "Socket options applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_defaults_enable_nodelay_and_keepalive() {
        let (client, _server) = loopback_pair().await;
        SocketConfig::default().apply(&client).unwrap();

        assert!(client.nodelay().unwrap());
        assert!(SockRef::from(&client).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_options_can_be_turned_off() {
        let config = SocketConfig {
            tcp_nodelay: false,
            keepalive_enabled: false,
            ..Default::default()
        };
        let (client, _server) = loopback_pair().await;
        config.apply(&client).unwrap();

        assert!(!client.nodelay().unwrap());
        assert!(!SockRef::from(&client).keepalive().unwrap());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_keepalive_idle_time_applied() {
        let config = SocketConfig {
            keepalive_idle: Duration::from_secs(30),
            ..Default::default()
        };
        let (client, _server) = loopback_pair().await;
        config.apply(&client).unwrap();

        let socket = SockRef::from(&client);
        assert_eq!(socket.keepalive_time().unwrap(), Duration::from_secs(30));
        assert_eq!(socket.keepalive_retries().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_kernel_buffer_sizes_applied() {
        let config = SocketConfig {
            os_recv_buffer: Some(128 * 1024),
            os_send_buffer: Some(128 * 1024),
            ..Default::default()
        };
        let (client, _server) = loopback_pair().await;
        config.apply(&client).unwrap();

        // Kernels may round the requested size up (Linux doubles it).
        let socket = SockRef::from(&client);
        assert!(socket.recv_buffer_size().unwrap() >= 64 * 1024);
        assert!(socket.send_buffer_size().unwrap() >= 64 * 1024);
    }
}
