use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    access::{DeleteOutcome, UploadRequest},
    auth::Principal,
    cache::ResolvedDocument,
    error::{AppError, AppResult},
    models::Document,
    state::AppState,
    storage::ObjectStorage,
    store::Database,
};

#[derive(Deserialize)]
pub struct DocumentListQuery {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct GrantRequest {
    pub user_id: Uuid,
}

#[derive(Serialize)]
pub struct DocumentResponse {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub original_name: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub content_hash: String,
    pub is_public: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    pub version: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub grants: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl DocumentResponse {
    /// The access token is only shown to the owner and admins.
    fn new(resolved: ResolvedDocument, principal: &Principal) -> Self {
        let grants = resolved.grant_logins();
        let document = resolved.document;
        let reveal_token = principal.acts_for(document.owner_id);
        Self {
            id: document.id,
            owner_id: document.owner_id,
            original_name: document.original_name,
            size_bytes: document.size_bytes,
            mime_type: document.mime_type,
            content_hash: document.content_hash,
            is_public: document.is_public,
            access_token: reveal_token.then_some(document.access_token),
            version: document.version,
            created_at: document.created_at,
            updated_at: document.updated_at,
            grants,
            download_url: None,
        }
    }

    fn with_download_url(mut self, url: String) -> Self {
        self.download_url = Some(url);
        self
    }
}

#[derive(Serialize)]
pub struct DocumentListResponse {
    pub items: Vec<DocumentResponse>,
    pub next_cursor: Option<String>,
}

#[derive(Serialize)]
pub struct UploadResponse {
    pub document: DocumentResponse,
    pub upload_url: String,
}

#[derive(Serialize)]
pub struct PublicDocumentResponse {
    pub id: Uuid,
    pub original_name: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub created_at: NaiveDateTime,
    pub download_url: String,
}

impl PublicDocumentResponse {
    fn new(document: Document, download_url: String) -> Self {
        Self {
            id: document.id,
            original_name: document.original_name,
            size_bytes: document.size_bytes,
            mime_type: document.mime_type,
            created_at: document.created_at,
            download_url,
        }
    }
}

#[derive(Serialize)]
pub struct DeleteResponse {
    pub document_id: Uuid,
    pub object_deleted: bool,
}

impl From<DeleteOutcome> for DeleteResponse {
    fn from(outcome: DeleteOutcome) -> Self {
        Self {
            document_id: outcome.document_id,
            object_deleted: outcome.object_deleted,
        }
    }
}

pub async fn list_documents<D: Database>(
    State(state): State<AppState<D>>,
    principal: Principal,
    Query(query): Query<DocumentListQuery>,
) -> AppResult<Json<DocumentListResponse>> {
    let page = state
        .documents
        .list_documents(&principal, query.cursor.as_deref(), query.limit)
        .await?;

    Ok(Json(DocumentListResponse {
        items: page
            .items
            .into_iter()
            .map(|resolved| DocumentResponse::new(resolved, &principal))
            .collect(),
        next_cursor: page.next_cursor,
    }))
}

pub async fn upload_document<D: Database>(
    State(state): State<AppState<D>>,
    principal: Principal,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<UploadResponse>)> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut original_name: Option<String> = None;
    let mut content_type: Option<String> = None;
    let mut is_public = false;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        match field.name() {
            Some("file") => {
                original_name = field.file_name().map(|name| name.to_string());
                content_type = field.content_type().map(|mime| mime.to_string());
                let data = field.bytes().await.map_err(|err| {
                    error!(error = %err, "failed to read file bytes");
                    AppError::bad_request(format!("failed to read file bytes: {err}"))
                })?;
                file_bytes = Some(data.to_vec());
            }
            Some("public") => {
                let value = field.text().await.map_err(|err| {
                    AppError::bad_request(format!("invalid public flag: {err}"))
                })?;
                is_public = value
                    .trim()
                    .parse()
                    .map_err(|_| AppError::bad_request("public must be true or false"))?;
            }
            _ => {}
        }
    }

    let file_bytes = file_bytes.ok_or_else(|| AppError::bad_request("file field is required"))?;
    if file_bytes.is_empty() {
        return Err(AppError::bad_request("file field must not be empty"));
    }
    let original_name =
        original_name.ok_or_else(|| AppError::bad_request("filename is required"))?;
    let mime_type = content_type
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| {
            mime_guess::from_path(&original_name)
                .first_or_octet_stream()
                .to_string()
        });

    let created = state
        .documents
        .create_document(
            &principal,
            UploadRequest {
                original_name,
                size_bytes: file_bytes.len() as i64,
                mime_type: mime_type.clone(),
                content_hash: hex::encode(Sha256::digest(&file_bytes)),
                is_public,
            },
        )
        .await?;

    spawn_upload(
        state.storage.clone(),
        created.document.id,
        created.document.storage_key.clone(),
        file_bytes,
        mime_type,
        state.config.upload_timeout(),
    );

    let document = DocumentResponse::new(
        ResolvedDocument {
            document: created.document,
            grantees: Vec::new(),
        },
        &principal,
    );
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            document,
            upload_url: created.upload_url,
        }),
    ))
}

/// Pushes the bytes in the background. The document row already exists; the
/// outcome is only logged.
fn spawn_upload(
    storage: Arc<dyn ObjectStorage>,
    document_id: Uuid,
    storage_key: String,
    bytes: Vec<u8>,
    content_type: String,
    timeout: Duration,
) {
    tokio::spawn(async move {
        let upload = storage.put_object(&storage_key, bytes, &content_type);
        match tokio::time::timeout(timeout, upload).await {
            Ok(Ok(())) => info!(%document_id, "upload stored"),
            Ok(Err(err)) => warn!(%document_id, error = %err, "upload failed"),
            Err(_) => warn!(
                %document_id,
                timeout_secs = timeout.as_secs(),
                "upload timed out"
            ),
        }
    });
}

pub async fn get_document<D: Database>(
    State(state): State<AppState<D>>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> AppResult<Json<DocumentResponse>> {
    let resolved = state.documents.resolve_readable(&principal, id).await?;
    let download_url = state.documents.download_url(&resolved.document).await?;
    Ok(Json(
        DocumentResponse::new(resolved, &principal).with_download_url(download_url),
    ))
}

pub async fn delete_document<D: Database>(
    State(state): State<AppState<D>>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> AppResult<Json<DeleteResponse>> {
    let outcome = state.documents.delete(&principal, id).await?;
    Ok(Json(outcome.into()))
}

pub async fn share_document<D: Database>(
    State(state): State<AppState<D>>,
    principal: Principal,
    Path(id): Path<Uuid>,
    Json(payload): Json<GrantRequest>,
) -> AppResult<StatusCode> {
    state
        .documents
        .share(&principal, id, payload.user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unshare_document<D: Database>(
    State(state): State<AppState<D>>,
    principal: Principal,
    Path(id): Path<Uuid>,
    Json(payload): Json<GrantRequest>,
) -> AppResult<StatusCode> {
    state
        .documents
        .unshare(&principal, id, payload.user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_document_by_token<D: Database>(
    State(state): State<AppState<D>>,
    Path(token): Path<String>,
) -> AppResult<Json<PublicDocumentResponse>> {
    let document = state.documents.resolve_by_token(&token).await?;
    public_response(&state, document).await
}

pub async fn get_public_document<D: Database>(
    State(state): State<AppState<D>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<PublicDocumentResponse>> {
    let document = state.documents.resolve_public(id).await?;
    public_response(&state, document).await
}

pub async fn get_public_document_by_token<D: Database>(
    State(state): State<AppState<D>>,
    Path(token): Path<String>,
) -> AppResult<Json<PublicDocumentResponse>> {
    let document = state.documents.resolve_public_by_token(&token).await?;
    public_response(&state, document).await
}

async fn public_response<D: Database>(
    state: &AppState<D>,
    document: Document,
) -> AppResult<Json<PublicDocumentResponse>> {
    let download_url = state.documents.download_url(&document).await?;
    Ok(Json(PublicDocumentResponse::new(document, download_url)))
}
