use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use burrow_auth::AuthError;
use tracing::{debug, info};

use crate::models::*;
use crate::AppState;

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> (StatusCode, Json<ApiResponse<LoginData>>) {
    let anonymous = req.username.is_empty() && req.password.is_empty();
    debug!(user = %req.username, anonymous, "Login request");

    match state.authenticator.login(&req.username, &req.password).await {
        Ok(resp) => {
            info!(client_id = resp.user_id, anonymous, "Issued client token");
            (
                StatusCode::OK,
                Json(ApiResponse::success(LoginData {
                    token: resp.token,
                    user_id: resp.user_id,
                    version: env!("CARGO_PKG_VERSION").to_string(),
                })),
            )
        }
        Err(e) => {
            let status = match e {
                AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
                AuthError::AnonymousDisabled | AuthError::UserBanned(_) => StatusCode::FORBIDDEN,
                AuthError::UserExists(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            debug!(user = %req.username, "Login failed: {}", e);
            (status, Json(ApiResponse::failure(e.to_string())))
        }
    }
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions: state.registry.as_ref().map(|r| r.len()).unwrap_or(0),
    })
}
