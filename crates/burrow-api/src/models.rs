use serde::{Deserialize, Serialize};

/// Body of `POST /api/v1/login`. Both fields empty requests anonymous registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginData {
    pub token: String,
    pub user_id: u16,
    pub version: String,
}

/// Envelope of every API reply: `state` is 1 on success, 0 on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub state: u8,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            state: 1,
            msg: "success".to_string(),
            data: Some(data),
        }
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        Self {
            state: 0,
            msg: msg.into(),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub sessions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reply_without_data_parses() {
        let reply: ApiResponse<LoginData> =
            serde_json::from_str(r#"{"state":0,"msg":"anonymous login disabled"}"#).unwrap();
        assert!(!reply.is_success());
        assert_eq!(reply.data, None);
    }

    #[test]
    fn test_success_reply_carries_login_data() {
        let body = serde_json::to_string(&ApiResponse::success(LoginData {
            token: "t".to_string(),
            user_id: 3,
            version: "0.1.0".to_string(),
        }))
        .unwrap();
        let reply: ApiResponse<LoginData> = serde_json::from_str(&body).unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.data.map(|d| d.user_id), Some(3));
    }
}
