//! Short-lived control exchanges and reverse-connection dials

use std::time::Duration;

use burrow_connection::connect_with_timeout;
use burrow_proto::{
    read_heartbeat_ack, read_new_app_response, write_control_request, write_provider_hello,
    ControlRequest, NewAppRequest, NewAppResponse, ProviderHello,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::ClientError;

#[derive(Debug, Clone)]
pub struct ServerConnector {
    control_addr: String,
    provider_addr: String,
    connect_timeout: Duration,
    ack_timeout: Duration,
}

impl ServerConnector {
    pub fn new(control_addr: impl Into<String>, provider_addr: impl Into<String>) -> Self {
        Self {
            control_addr: control_addr.into(),
            provider_addr: provider_addr.into(),
            connect_timeout: Duration::from_secs(burrow_proto::DEFAULT_CONNECT_TIMEOUT_SECS),
            ack_timeout: Duration::from_secs(burrow_proto::DEFAULT_ACK_TIMEOUT_SECS),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.control_addr(), config.provider_addr())
            .with_timeouts(config.connect_timeout, config.ack_timeout)
    }

    pub fn with_timeouts(mut self, connect: Duration, ack: Duration) -> Self {
        self.connect_timeout = connect;
        self.ack_timeout = ack;
        self
    }

    pub fn provider_addr(&self) -> &str {
        &self.provider_addr
    }

    async fn control(&self) -> Result<TcpStream, ClientError> {
        Ok(connect_with_timeout(self.control_addr.as_str(), self.connect_timeout).await?)
    }

    /// Register the app set. `reconnect` only picks the opcode; the server
    /// treats both as a full re-registration.
    pub async fn request_apps(
        &self,
        token: &str,
        port_hints: Vec<u16>,
        reconnect: bool,
    ) -> Result<NewAppResponse, ClientError> {
        let count = port_hints.len();
        let mut stream = self.control().await?;
        let request = ControlRequest::NewApp {
            reconnect,
            request: NewAppRequest::new(token, port_hints),
        };
        write_control_request(&mut stream, &request).await?;

        // The server closes without replying when it rejects the token
        let response = tokio::time::timeout(self.ack_timeout, read_new_app_response(&mut stream, count))
            .await
            .map_err(|_| ClientError::Timeout("app registration reply"))?
            .map_err(|e| {
                if e.is_closed() {
                    ClientError::Registration("server refused the registration".to_string())
                } else {
                    e.into()
                }
            })?;

        if response.client_id == 0 {
            return Err(ClientError::Registration("server returned client id 0".to_string()));
        }
        if response.assignments.len() != count {
            return Err(ClientError::Registration(format!(
                "asked for {} apps, got {}",
                count,
                response.assignments.len()
            )));
        }
        Ok(response)
    }

    /// Dial a reverse connection and introduce it.
    pub async fn open_provider(&self, client_id: u16, app_id: u8) -> Result<TcpStream, ClientError> {
        let mut stream =
            connect_with_timeout(self.provider_addr.as_str(), self.connect_timeout).await?;
        write_provider_hello(&mut stream, ProviderHello::new(client_id, app_id)).await?;
        Ok(stream)
    }

    pub async fn heartbeat(&self, client_id: u16) -> Result<(), ClientError> {
        let mut stream = self.control().await?;
        write_control_request(&mut stream, &ControlRequest::Heartbeat { client_id }).await?;
        tokio::time::timeout(self.ack_timeout, read_heartbeat_ack(&mut stream))
            .await
            .map_err(|_| ClientError::Timeout("heartbeat ack"))??;
        Ok(())
    }

    pub async fn close_client(&self, client_id: u16) -> Result<(), ClientError> {
        let mut stream = self.control().await?;
        write_control_request(&mut stream, &ControlRequest::CloseClient { client_id }).await?;
        let _ = stream.shutdown().await;
        debug!(client_id, "Sent close request");
        Ok(())
    }
}
