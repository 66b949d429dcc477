//! Public consumer ports
//!
//! A consumer connection waits (without timeout) for an idle reverse connection
//! of its app, sends it `TunnelOpen`, then relays. If the open signal cannot be
//! written the reverse connection is discarded and the next one is taken. A
//! consumer that hangs up while waiting gives up its place in the queue.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use burrow_connection::{relay, RelayOutcome};
use burrow_control::{AppListener, AppPool, ConsumerSpawner};
use burrow_proto::{write_tunnel_signal, TunnelSignal};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

use crate::error::TcpProxyError;

/// Spawner wiring public listeners created by the control handler to
/// [`run_consumer_listener`].
pub fn consumer_spawner() -> ConsumerSpawner {
    Arc::new(
        |app: AppListener| -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(run_consumer_listener(app).in_current_span())
        },
    )
}

/// Accept consumers on one app's public port until the owning session ends.
pub async fn run_consumer_listener(app: AppListener) {
    let AppListener {
        key,
        listener,
        pool,
        cancel,
    } = app;
    let local = listener.local_addr().ok();

    info!(
        client_id = key.client_id,
        app_id = key.app_id,
        addr = ?local,
        "Public port listening"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, client_id = key.client_id, app_id = key.app_id, "New consumer connection");
                    let pool = pool.clone();
                    let tunnel_cancel = cancel.child_token();
                    tokio::spawn(
                        async move {
                            match handle_consumer(stream, peer, pool, tunnel_cancel).await {
                                Ok(outcome) => debug!(
                                    %peer,
                                    bytes_in = outcome.left_to_right,
                                    bytes_out = outcome.right_to_left,
                                    end = ?outcome.end,
                                    "Tunnel closed"
                                ),
                                Err(e) => debug!(%peer, "Consumer connection ended: {}", e),
                            }
                        }
                        .in_current_span(),
                    );
                }
                Err(e) => {
                    error!("Failed to accept consumer connection: {}", e);
                }
            }
        }
    }

    info!(
        client_id = key.client_id,
        app_id = key.app_id,
        "Public port closed"
    );
}

/// Pair one consumer with a pooled reverse connection and relay until either side ends.
pub async fn handle_consumer(
    consumer: TcpStream,
    peer: SocketAddr,
    pool: Arc<AppPool>,
    cancel: CancellationToken,
) -> Result<RelayOutcome, TcpProxyError> {
    let _ = consumer.set_nodelay(true);

    let provider = loop {
        let mut reserved = tokio::select! {
            acquired = pool.acquire() => acquired?,
            _ = cancel.cancelled() => return Err(TcpProxyError::Cancelled),
            _ = hung_up(&consumer) => return Err(TcpProxyError::ConsumerGone),
        };
        match write_tunnel_signal(reserved.stream_mut(), TunnelSignal::Open).await {
            Ok(()) => break reserved,
            Err(e) => {
                debug!(
                    provider = %reserved.peer(),
                    "Discarding reverse connection, open signal failed: {}", e
                );
            }
        }
    };

    let label = provider.key().label();
    debug!(%peer, provider = %provider.peer(), clientapp = %label, "Tunnel established");

    Ok(relay(consumer, provider.into_stream(), &cancel).await)
}

/// Resolves once the consumer has closed its side. A consumer that talks
/// first keeps its bytes queued for the relay and is never reported gone.
async fn hung_up(consumer: &TcpStream) {
    let mut first = [0u8; 1];
    match consumer.peek(&mut first).await {
        Ok(0) | Err(_) => {}
        Ok(_) => std::future::pending::<()>().await,
    }
}
