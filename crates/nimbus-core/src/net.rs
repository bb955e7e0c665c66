//! Socket helpers: listeners, dialing by name or packed IPv4, and the
//! local-interface probe behind the local-router shortcut.

use std::net::Ipv4Addr;
use tokio::net::{TcpListener, TcpStream};

/// Bind a listener on all interfaces. Port 0 lets the OS choose; the
/// actual port is returned alongside the listener.
pub async fn listen(port: u16) -> std::io::Result<(TcpListener, u16)> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

/// Dial a server by hostname.
pub async fn connect(host: &str, port: u16) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Dial a server by the packed IPv4 address carried in router-map words.
pub async fn connect_ip(ip: u32, port: u16) -> std::io::Result<TcpStream> {
    let addr = Ipv4Addr::from(ip);
    let stream = TcpStream::connect((addr, port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// True when `ip` is an address of a local interface. A UDP socket
/// connected toward a local address always sources from that same
/// address, which makes this answerable without enumerating interfaces.
pub fn is_local_ipv4(ip: u32) -> bool {
    let addr = Ipv4Addr::from(ip);
    if addr.is_loopback() || addr.is_unspecified() {
        return true;
    }
    let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") else {
        return false;
    };
    if socket.connect((addr, 9)).is_err() {
        return false;
    }
    match socket.local_addr() {
        Ok(local) => local.ip() == std::net::IpAddr::V4(addr),
        Err(_) => false,
    }
}

/// Packed form of a peer's IPv4 address, 0 for non-IPv4 peers.
pub fn peer_ipv4(stream: &TcpStream) -> u32 {
    match stream.peer_addr() {
        Ok(std::net::SocketAddr::V4(v4)) => u32::from(*v4.ip()),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_is_local() {
        assert!(is_local_ipv4(u32::from(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn documentation_range_is_not_local() {
        // 192.0.2.0/24 is reserved for documentation and never assigned.
        assert!(!is_local_ipv4(u32::from(Ipv4Addr::new(192, 0, 2, 17))));
    }

    #[tokio::test]
    async fn listen_assigns_port() {
        let (listener, port) = listen(0).await.unwrap();
        assert_ne!(port, 0);
        drop(listener);
    }
}
