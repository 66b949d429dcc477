//! Control-port accept loop

use std::sync::Arc;

use burrow_control::ControlHandler;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

pub struct ControlServer {
    handler: Arc<ControlHandler>,
}

impl ControlServer {
    pub fn new(handler: Arc<ControlHandler>) -> Self {
        Self { handler }
    }

    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!("Control server listening on {}", addr);
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = self.handler.clone();
                        tokio::spawn(
                            async move {
                                if let Err(e) = handler.handle_connection(stream, peer).await {
                                    debug!(%peer, "Control connection failed: {}", e);
                                }
                            }
                            .in_current_span(),
                        );
                    }
                    Err(e) => {
                        error!("Failed to accept control connection: {}", e);
                    }
                }
            }
        }

        info!("Control server stopped");
    }
}
