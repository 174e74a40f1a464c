use axum::{extract::State, http::StatusCode, Json};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ClientInfo;
use crate::{
    auth::Principal,
    error::{AppError, AppResult, ServiceError},
    session::TokensPair,
    state::AppState,
    store::Database,
};

#[derive(Deserialize)]
pub struct LoginRequest {
    pub login: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Serialize)]
pub struct TokensResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

impl From<TokensPair> for TokensResponse {
    fn from(pair: TokensPair) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: pair.expires_in,
        }
    }
}

#[derive(Serialize)]
pub struct MeResponse {
    pub user_id: Option<Uuid>,
    pub login: Option<String>,
    pub is_admin: bool,
}

pub async fn login<D: Database>(
    State(state): State<AppState<D>>,
    client: ClientInfo,
    Json(payload): Json<LoginRequest>,
) -> AppResult<Json<TokensResponse>> {
    let pair = state
        .sessions
        .login(
            &payload.login,
            &payload.password,
            &client.user_agent,
            &client.ip_address,
        )
        .await
        .map_err(AppError::from_login)?;

    Ok(Json(pair.into()))
}

pub async fn refresh<D: Database>(
    State(state): State<AppState<D>>,
    client: ClientInfo,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    Json(payload): Json<RefreshRequest>,
) -> AppResult<Json<TokensResponse>> {
    let TypedHeader(Authorization(bearer)) = bearer.ok_or_else(AppError::unauthorized)?;

    let pair = state
        .sessions
        .refresh(
            &client.user_agent,
            &client.ip_address,
            bearer.token(),
            &payload.refresh_token,
        )
        .await
        .map_err(AppError::from_refresh)?;

    Ok(Json(pair.into()))
}

pub async fn logout<D: Database>(
    State(state): State<AppState<D>>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> AppResult<StatusCode> {
    let TypedHeader(Authorization(bearer)) = bearer.ok_or_else(AppError::unauthorized)?;

    state
        .sessions
        .logout_with_access_token(bearer.token())
        .await
        .map_err(|err| match err {
            ServiceError::RefreshTokenNotFound => AppError::unauthorized(),
            other => other.into(),
        })?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn me<D: Database>(
    State(state): State<AppState<D>>,
    principal: Principal,
) -> AppResult<Json<MeResponse>> {
    let login = match principal.user_id() {
        Some(user_id) => Some(state.users.get_user(&principal, user_id).await?.login),
        None => None,
    };

    Ok(Json(MeResponse {
        user_id: principal.user_id(),
        login,
        is_admin: principal.is_admin(),
    }))
}
