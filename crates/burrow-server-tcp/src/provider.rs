//! Reverse-connection intake

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use burrow_control::SessionRegistry;
use burrow_proto::read_provider_hello;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, Instrument};

use crate::error::TcpProxyError;

/// How long a fresh reverse connection may take to send its hello
pub const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ProviderServer {
    registry: Arc<SessionRegistry>,
    hello_timeout: Duration,
}

impl ProviderServer {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            hello_timeout: DEFAULT_HELLO_TIMEOUT,
        }
    }

    pub fn with_hello_timeout(mut self, timeout: Duration) -> Self {
        self.hello_timeout = timeout;
        self
    }

    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!("Provider server listening on {}", addr);
        }
        let this = Arc::new(self);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let this = this.clone();
                        tokio::spawn(
                            async move {
                                if let Err(e) = this.handle_provider(stream, peer).await {
                                    debug!(%peer, "Rejected reverse connection: {}", e);
                                }
                            }
                            .in_current_span(),
                        );
                    }
                    Err(e) => {
                        error!("Failed to accept reverse connection: {}", e);
                    }
                }
            }
        }

        info!("Provider server stopped");
    }

    /// Read the hello and file the connection into its app pool.
    pub async fn handle_provider(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), TcpProxyError> {
        let hello = tokio::time::timeout(self.hello_timeout, read_provider_hello(&mut stream))
            .await
            .map_err(|_| TcpProxyError::HelloTimeout)??;

        let session = self
            .registry
            .get(hello.client_id)
            .ok_or(TcpProxyError::UnknownClient(hello.client_id))?;
        let key = session
            .app_key(hello.app_id)
            .ok_or(TcpProxyError::UnknownApp {
                client_id: hello.client_id,
                app_id: hello.app_id,
            })?;

        let _ = stream.set_nodelay(true);
        self.registry.pool().push(key, stream, peer)?;
        trace!(%peer, client_id = key.client_id, app_id = key.app_id, "Reverse connection pooled");
        Ok(())
    }
}
