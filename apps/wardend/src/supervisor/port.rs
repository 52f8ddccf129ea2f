use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Duration, timeout};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// True when something accepts connections on the local port.
pub async fn port_open(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    matches!(timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

/// True when another process already holds the port.
pub async fn port_in_use(port: u16) -> bool {
    if port_open(port).await {
        return true;
    }
    match TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await {
        Ok(listener) => {
            drop(listener);
            false
        }
        Err(err) => err.kind() == std::io::ErrorKind::AddrInUse,
    }
}
