use std::io;
use std::path::Path;
use tokio::net::{UnixListener, UnixStream};

pub async fn connect(path: &Path) -> io::Result<UnixStream> {
    UnixStream::connect(path).await
}

/// Bind the daemon socket. A leftover socket file from a dead daemon is removed first;
/// a socket that still accepts connections yields `AddrInUse`.
pub async fn listen(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("another daemon is listening on {}", path.display()),
            ));
        }
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path)
}
