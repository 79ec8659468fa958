//! Local port helpers: ephemeral allocation and the liveness probe.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

/// Loopback address the remote tunnels forward to.
pub const TUNNEL_HOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Ask the OS for a free loopback port.
///
/// The listener is released immediately, so another process can in principle
/// grab the port before the remote tunnel binds it.
pub async fn allocate_port() -> io::Result<u16> {
    let listener = TcpListener::bind(SocketAddr::from((TUNNEL_HOST, 0))).await?;
    Ok(listener.local_addr()?.port())
}

/// Whether something accepts TCP connections on `port`.
///
/// A plain connect cannot tell the remote tunnel apart from an unrelated
/// process listening on the same port.
pub async fn probe(port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(
            timeout,
            TcpStream::connect(SocketAddr::from((TUNNEL_HOST, port)))
        )
        .await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocated_port_is_free() {
        let port = allocate_port().await.unwrap();
        assert_ne!(port, 0);
        // Nothing listens there any more.
        assert!(!probe(port, Duration::from_millis(500)).await);
        TcpListener::bind(SocketAddr::from((TUNNEL_HOST, port)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_probe_sees_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe(port, Duration::from_secs(1)).await);
        drop(listener);
        assert!(!probe(port, Duration::from_millis(500)).await);
    }
}
