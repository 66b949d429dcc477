//! Bidirectional byte relay
//!
//! Both directions run concurrently. The first direction to hit EOF or an error
//! (or cancellation) ends the relay: the other direction is dropped mid-read,
//! both write halves are shut down and both streams are closed. An idle
//! direction never ends the relay on its own.

use std::io;

use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Copy buffer per direction
pub const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// Why a relay stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Reading from the left stream returned EOF.
    LeftClosed,
    /// Reading from the right stream returned EOF.
    RightClosed,
    /// The left-to-right direction failed (read from left or write to right).
    LeftToRightError,
    /// The right-to-left direction failed.
    RightToLeftError,
    Cancelled,
}

/// Result of a finished relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub left_to_right: u64,
    pub right_to_left: u64,
    pub end: RelayEnd,
}

impl RelayOutcome {
    pub fn total_bytes(&self) -> u64 {
        self.left_to_right + self.right_to_left
    }
}

/// Relay `left` and `right` with the default buffer size.
pub async fn relay<L, R>(left: L, right: R, cancel: &CancellationToken) -> RelayOutcome
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    relay_with_buffer(left, right, cancel, RELAY_BUFFER_SIZE).await
}

pub async fn relay_with_buffer<L, R>(
    left: L,
    right: R,
    cancel: &CancellationToken,
    buffer_size: usize,
) -> RelayOutcome
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let buffer_size = buffer_size.max(1);
    let (mut left_rd, mut left_wr) = split(left);
    let (mut right_rd, mut right_wr) = split(right);

    let mut left_to_right = 0u64;
    let mut right_to_left = 0u64;

    let end = tokio::select! {
        res = pump(&mut left_rd, &mut right_wr, buffer_size, &mut left_to_right) => match res {
            Ok(()) => RelayEnd::LeftClosed,
            Err(e) => {
                debug!("Relay left->right failed: {}", e);
                RelayEnd::LeftToRightError
            }
        },
        res = pump(&mut right_rd, &mut left_wr, buffer_size, &mut right_to_left) => match res {
            Ok(()) => RelayEnd::RightClosed,
            Err(e) => {
                debug!("Relay right->left failed: {}", e);
                RelayEnd::RightToLeftError
            }
        },
        _ = cancel.cancelled() => RelayEnd::Cancelled,
    };

    // Propagate the close to both peers. Errors here only mean the peer is already gone.
    let _ = left_wr.shutdown().await;
    let _ = right_wr.shutdown().await;
    drop((left_rd, left_wr, right_rd, right_wr));

    trace!(
        left_to_right,
        right_to_left,
        end = ?end,
        "Relay finished"
    );

    RelayOutcome {
        left_to_right,
        right_to_left,
        end,
    }
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    counter: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *counter += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::timeout;

    /// Returns (consumer, target, relay handle); the relay sits between them.
    fn relayed_pair(
        cancel: CancellationToken,
    ) -> (
        tokio::io::DuplexStream,
        tokio::io::DuplexStream,
        tokio::task::JoinHandle<RelayOutcome>,
    ) {
        let (consumer, consumer_side) = duplex(RELAY_BUFFER_SIZE * 2);
        let (target_side, target) = duplex(RELAY_BUFFER_SIZE * 2);
        let handle = tokio::spawn(async move { relay(consumer_side, target_side, &cancel).await });
        (consumer, target, handle)
    }

    #[tokio::test]
    async fn test_round_trip_both_directions() {
        let (mut consumer, mut target, handle) = relayed_pair(CancellationToken::new());

        consumer.write_all(b"hello target").await.unwrap();
        let mut buf = [0u8; 12];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello target");

        target.write_all(b"hi consumer").await.unwrap();
        let mut buf = [0u8; 11];
        consumer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi consumer");

        drop(consumer);
        let outcome = timeout(Duration::from_secs(2), handle)
            .await
            .expect("relay should end")
            .unwrap();
        assert_eq!(outcome.end, RelayEnd::LeftClosed);
        assert_eq!(outcome.left_to_right, 12);
        assert_eq!(outcome.right_to_left, 11);
    }

    #[tokio::test]
    async fn test_payload_one_byte_over_buffer() {
        let (mut consumer, mut target, handle) = relayed_pair(CancellationToken::new());

        let payload: Vec<u8> = (0..RELAY_BUFFER_SIZE + 1).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            consumer.write_all(&payload).await.unwrap();
            consumer
        });

        let mut received = vec![0u8; expected.len()];
        target.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        let consumer = writer.await.unwrap();
        drop(consumer);
        let outcome = timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.left_to_right, (RELAY_BUFFER_SIZE + 1) as u64);
    }

    #[tokio::test]
    async fn test_empty_session_closes_other_leg() {
        let (consumer, mut target, handle) = relayed_pair(CancellationToken::new());

        // Consumer connects and leaves without sending anything
        drop(consumer);

        let mut buf = Vec::new();
        let n = timeout(Duration::from_secs(2), target.read_to_end(&mut buf))
            .await
            .expect("target leg should be closed")
            .unwrap();
        assert_eq!(n, 0);

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.total_bytes(), 0);
    }

    #[tokio::test]
    async fn test_target_close_closes_consumer() {
        let (mut consumer, target, handle) = relayed_pair(CancellationToken::new());

        drop(target);

        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(2), consumer.read(&mut buf))
            .await
            .expect("consumer leg should be closed")
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(handle.await.unwrap().end, RelayEnd::RightClosed);
    }

    #[tokio::test]
    async fn test_idle_direction_does_not_end_relay() {
        let (mut consumer, mut target, handle) = relayed_pair(CancellationToken::new());

        // Only consumer->target traffic; the reverse stays idle
        for chunk in [b"one".as_ref(), b"two".as_ref(), b"three".as_ref()] {
            consumer.write_all(chunk).await.unwrap();
            let mut buf = vec![0u8; chunk.len()];
            target.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, chunk);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        drop(consumer);
        timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_closes_both_legs() {
        let cancel = CancellationToken::new();
        let (mut consumer, mut target, handle) = relayed_pair(cancel.clone());

        cancel.cancel();
        let outcome = timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.end, RelayEnd::Cancelled);

        let mut buf = [0u8; 1];
        assert_eq!(consumer.read(&mut buf).await.unwrap(), 0);
        assert_eq!(target.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_only_affects_own_tunnel() {
        let first = CancellationToken::new();
        let second = CancellationToken::new();
        let (_c1, _t1, h1) = relayed_pair(first.clone());
        let (mut c2, mut t2, h2) = relayed_pair(second);

        first.cancel();
        timeout(Duration::from_secs(2), h1).await.unwrap().unwrap();

        c2.write_all(b"still alive").await.unwrap();
        let mut buf = [0u8; 11];
        t2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still alive");
        assert!(!h2.is_finished());
    }
}
