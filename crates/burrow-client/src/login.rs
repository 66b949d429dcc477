//! Client side of the server's HTTP login endpoint

use std::time::Duration;

use async_trait::async_trait;
use burrow_auth::{AuthError, Authenticator, LoginResponse};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Serialize)]
struct LoginBody<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginData {
    token: String,
    user_id: u16,
}

#[derive(Deserialize)]
struct LoginReply {
    state: u8,
    #[serde(default)]
    msg: String,
    data: Option<LoginData>,
}

/// Posts credentials to `POST /api/v1/login`
pub struct HttpAuthenticator {
    url: String,
    client: reqwest::Client,
}

impl HttpAuthenticator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, AuthError> {
        debug!(url = %self.url, anonymous = username.is_empty(), "Logging in");
        let reply: LoginReply = self
            .client
            .post(&self.url)
            .json(&LoginBody { username, password })
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        match (reply.state, reply.data) {
            (1, Some(data)) => Ok(LoginResponse {
                token: data.token,
                user_id: data.user_id,
            }),
            (1, None) => Err(AuthError::Transport(
                "login succeeded without a token".to_string(),
            )),
            _ => Err(AuthError::Rejected(reply.msg)),
        }
    }
}
