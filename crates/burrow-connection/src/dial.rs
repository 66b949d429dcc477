//! Bounded TCP dial

use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpStream, ToSocketAddrs};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connecting to {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },
}

/// Dial `addr`, giving up after `timeout`. Nagle is disabled on the result.
pub async fn connect_with_timeout<A>(
    addr: A,
    timeout: Duration,
) -> Result<TcpStream, ConnectionError>
where
    A: ToSocketAddrs + std::fmt::Display,
{
    let address = addr.to_string();
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ConnectionError::Timeout { address, timeout })??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = connect_with_timeout(addr, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_refused_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = connect_with_timeout(addr, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::IoError(_)));
    }
}
