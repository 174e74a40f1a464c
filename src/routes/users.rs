use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::Principal,
    error::AppResult,
    models::User,
    state::AppState,
    store::Database,
    users::DeletedUser,
};

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub login: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct UpdateUserRequest {
    pub login: String,
}

#[derive(Deserialize)]
pub struct UpdatePasswordRequest {
    pub password: String,
}

#[derive(Deserialize)]
pub struct PageQuery {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub login: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            login: user.login,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

#[derive(Serialize)]
pub struct UserListResponse {
    pub items: Vec<UserResponse>,
    pub next_cursor: Option<String>,
}

#[derive(Serialize)]
pub struct DeletedUserResponse {
    pub documents_removed: usize,
    pub orphaned_objects: usize,
}

impl From<DeletedUser> for DeletedUserResponse {
    fn from(value: DeletedUser) -> Self {
        Self {
            documents_removed: value.documents_removed,
            orphaned_objects: value.orphaned_objects,
        }
    }
}

pub async fn register<D: Database>(
    State(state): State<AppState<D>>,
    principal: Principal,
    Json(payload): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<UserResponse>)> {
    let user = state
        .users
        .register(&principal, &payload.login, &payload.password)
        .await?;
    Ok((StatusCode::CREATED, Json(user.into())))
}

pub async fn list_users<D: Database>(
    State(state): State<AppState<D>>,
    principal: Principal,
    Query(query): Query<PageQuery>,
) -> AppResult<Json<UserListResponse>> {
    let page = state
        .users
        .list_users(&principal, query.cursor.as_deref(), query.limit)
        .await?;
    Ok(Json(UserListResponse {
        items: page.items.into_iter().map(UserResponse::from).collect(),
        next_cursor: page.next_cursor,
    }))
}

pub async fn get_user<D: Database>(
    State(state): State<AppState<D>>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> AppResult<Json<UserResponse>> {
    let user = state.users.get_user(&principal, id).await?;
    Ok(Json(user.into()))
}

pub async fn update_user<D: Database>(
    State(state): State<AppState<D>>,
    principal: Principal,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateUserRequest>,
) -> AppResult<Json<UserResponse>> {
    let user = state
        .users
        .update_login(&principal, id, payload.login.trim())
        .await?;
    Ok(Json(user.into()))
}

pub async fn update_password<D: Database>(
    State(state): State<AppState<D>>,
    principal: Principal,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdatePasswordRequest>,
) -> AppResult<StatusCode> {
    state
        .users
        .update_password(&principal, id, &payload.password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_user<D: Database>(
    State(state): State<AppState<D>>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> AppResult<Json<DeletedUserResponse>> {
    let deleted = state.users.delete_user(&principal, id).await?;
    Ok(Json(deleted.into()))
}
