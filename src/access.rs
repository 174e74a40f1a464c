//! Document read resolution, sharing, deletion and upload acceptance.
//!
//! Reads go through the metadata cache; every committed change to a
//! document's grants, ownership or existence invalidates its entry before the
//! call returns.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::{rngs::OsRng, RngCore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Principal;
use crate::cache::{FillTicket, MetadataCache, ResolvedDocument};
use crate::error::{ServiceError, ServiceResult};
use crate::models::{Document, NewDocument};
use crate::storage::ObjectStorage;
use crate::store::{Database, Transaction};
use crate::utils::cursor::{paginate, Cursor};
use crate::utils::now_utc;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

const MAX_NAME_LEN: usize = 255;
const MAX_STEM_CHARS: usize = 120;
const MAX_EXTENSION_CHARS: usize = 16;
const ACCESS_TOKEN_BYTES: usize = 16;

const STEM_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// Metadata of an upload the caller has accepted.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub original_name: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub content_hash: String,
    pub is_public: bool,
}

#[derive(Debug, Clone)]
pub struct CreatedDocument {
    pub document: Document,
    pub upload_url: String,
}

#[derive(Debug, Clone)]
pub struct DocumentPage {
    pub items: Vec<ResolvedDocument>,
    pub next_cursor: Option<String>,
}

/// Result of a delete. The catalog entry is gone either way; `object_deleted`
/// reports whether the stored bytes were removed too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub document_id: Uuid,
    pub object_deleted: bool,
}

pub struct AccessResolver<D> {
    db: D,
    cache: Arc<dyn MetadataCache>,
    storage: Arc<dyn ObjectStorage>,
    deadline: Duration,
    url_ttl: Duration,
}

impl<D: Database> AccessResolver<D> {
    pub fn new(
        db: D,
        cache: Arc<dyn MetadataCache>,
        storage: Arc<dyn ObjectStorage>,
        deadline: Duration,
        url_ttl: Duration,
    ) -> Self {
        Self {
            db,
            cache,
            storage,
            deadline,
            url_ttl,
        }
    }

    /// Document plus grantees, if `principal` may read it.
    ///
    /// Anonymous callers only see public documents. Admins see everything.
    pub async fn resolve_readable(
        &self,
        principal: &Principal,
        id: Uuid,
    ) -> ServiceResult<ResolvedDocument> {
        let reader = match principal {
            Principal::Anonymous => {
                let document = self.resolve_public(id).await?;
                return Ok(ResolvedDocument {
                    document,
                    grantees: Vec::new(),
                });
            }
            Principal::Admin => None,
            Principal::User { user_id, .. } => Some(*user_id),
        };

        if let Some(hit) = self.cached(id).await {
            return match reader {
                Some(user_id) if !hit.readable_by(user_id) => Err(ServiceError::AccessDenied),
                _ => Ok(hit),
            };
        }

        let ticket = self.ticket().await;
        let resolved = self
            .db
            .transaction(self.deadline, move |tx| {
                let document = match reader {
                    Some(user_id) => match tx.find_readable_document(id, user_id)? {
                        Some(document) => document,
                        None => {
                            let exists = tx.find_document(id)?.is_some();
                            return Err(if exists {
                                ServiceError::AccessDenied
                            } else {
                                ServiceError::NotFound
                            });
                        }
                    },
                    None => tx.find_document(id)?.ok_or(ServiceError::NotFound)?,
                };
                let grantees = tx.list_grantees(id)?;
                Ok(ResolvedDocument { document, grantees })
            })
            .await?;

        self.fill(ticket, resolved.clone()).await;
        Ok(resolved)
    }

    /// A public document by id, for callers without a session.
    pub async fn resolve_public(&self, id: Uuid) -> ServiceResult<Document> {
        if let Some(hit) = self.cached(id).await {
            return if hit.document.is_public {
                Ok(hit.document)
            } else {
                Err(ServiceError::NotFound)
            };
        }

        let ticket = self.ticket().await;
        let resolved = self
            .db
            .transaction(self.deadline, move |tx| {
                let document = tx.find_public_document(id)?.ok_or(ServiceError::NotFound)?;
                let grantees = tx.list_grantees(id)?;
                Ok::<_, ServiceError>(ResolvedDocument { document, grantees })
            })
            .await?;

        self.fill(ticket, resolved.clone()).await;
        Ok(resolved.document)
    }

    /// Any live document whose access token matches. Holding the token is the
    /// capability, so `is_public` is not consulted.
    pub async fn resolve_by_token(&self, token: &str) -> ServiceResult<Document> {
        let token = token.to_string();
        self.db
            .transaction(self.deadline, move |tx| {
                tx.find_document_by_token(&token)?
                    .ok_or(ServiceError::NotFound)
            })
            .await
    }

    pub async fn resolve_public_by_token(&self, token: &str) -> ServiceResult<Document> {
        let token = token.to_string();
        self.db
            .transaction(self.deadline, move |tx| {
                tx.find_public_document_by_token(&token)?
                    .ok_or(ServiceError::NotFound)
            })
            .await
    }

    pub async fn share(
        &self,
        principal: &Principal,
        document_id: Uuid,
        target_user_id: Uuid,
    ) -> ServiceResult<()> {
        let actor = owner_actor(principal)?;
        let added = self
            .db
            .transaction(self.deadline, move |tx| {
                ensure_owner(tx, document_id, actor)?;
                if !tx.user_exists(target_user_id)? {
                    return Err(ServiceError::UserNotFound);
                }
                Ok(tx.add_grant(document_id, target_user_id, now_utc())?)
            })
            .await?;

        self.invalidate(document_id).await;
        info!(%document_id, %target_user_id, added, "document shared");
        Ok(())
    }

    pub async fn unshare(
        &self,
        principal: &Principal,
        document_id: Uuid,
        target_user_id: Uuid,
    ) -> ServiceResult<()> {
        let actor = owner_actor(principal)?;
        let removed = self
            .db
            .transaction(self.deadline, move |tx| {
                ensure_owner(tx, document_id, actor)?;
                Ok::<_, ServiceError>(tx.remove_grant(document_id, target_user_id)?)
            })
            .await?;

        self.invalidate(document_id).await;
        info!(%document_id, %target_user_id, removed, "document unshared");
        Ok(())
    }

    /// Soft-deletes the document and drops its grants, then removes the
    /// stored object. An object-store failure does not undo the delete.
    pub async fn delete(
        &self,
        principal: &Principal,
        document_id: Uuid,
    ) -> ServiceResult<DeleteOutcome> {
        let actor = owner_actor(principal)?;
        let storage_key = self
            .db
            .transaction(self.deadline, move |tx| {
                ensure_owner(tx, document_id, actor)?;
                tx.soft_delete_document(document_id, now_utc())?
                    .ok_or(ServiceError::NotFound)
            })
            .await?;

        self.invalidate(document_id).await;

        let object_deleted = match self.storage.delete_object(&storage_key).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    %document_id,
                    storage_key = %storage_key,
                    error = %err,
                    "document deleted but object removal failed"
                );
                false
            }
        };

        info!(%document_id, object_deleted, "document deleted");
        Ok(DeleteOutcome {
            document_id,
            object_deleted,
        })
    }

    /// Registers an upload for the calling user and returns a presigned PUT
    /// URL for its bytes. The row exists before the bytes land in storage.
    pub async fn create_document(
        &self,
        principal: &Principal,
        upload: UploadRequest,
    ) -> ServiceResult<CreatedDocument> {
        let owner_id = principal.user_id().ok_or(ServiceError::AccessDenied)?;
        let original_name = upload.original_name.trim().to_string();
        if original_name.is_empty() || original_name.len() > MAX_NAME_LEN {
            return Err(ServiceError::Validation(format!(
                "file name must be between 1 and {MAX_NAME_LEN} bytes"
            )));
        }
        if upload.size_bytes < 0 {
            return Err(ServiceError::Validation("size must not be negative".into()));
        }

        let storage_key = storage_key(owner_id, &original_name);
        let upload_url = self
            .storage
            .presign_put_object(&storage_key, &upload.mime_type, self.url_ttl)
            .await
            .map_err(|err| ServiceError::StorageUnavailable(err.to_string()))?;

        let document = self
            .db
            .transaction(self.deadline, move |tx| {
                let mut access_token = generate_access_token();
                while tx.access_token_exists(&access_token)? {
                    access_token = generate_access_token();
                }
                let now = now_utc();
                Ok::<_, ServiceError>(tx.insert_document(&NewDocument {
                    id: Uuid::new_v4(),
                    owner_id,
                    original_name,
                    size_bytes: upload.size_bytes,
                    mime_type: upload.mime_type,
                    content_hash: upload.content_hash,
                    storage_key,
                    is_public: upload.is_public,
                    access_token,
                    created_at: now,
                    updated_at: now,
                })?)
            })
            .await?;

        info!(document_id = %document.id, %owner_id, "document created");
        Ok(CreatedDocument {
            document,
            upload_url,
        })
    }

    /// The caller's own documents, newest first, with their grantees.
    pub async fn list_documents(
        &self,
        principal: &Principal,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> ServiceResult<DocumentPage> {
        let owner_id = principal.user_id().ok_or(ServiceError::AccessDenied)?;
        let cursor = Cursor::parse_optional(cursor)?;
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

        let rows = self
            .db
            .transaction(self.deadline, move |tx| {
                let documents = tx.list_documents_by_owner(owner_id, cursor, limit + 1)?;
                let mut rows = Vec::with_capacity(documents.len());
                for document in documents {
                    let grantees = tx.list_grantees(document.id)?;
                    rows.push(ResolvedDocument { document, grantees });
                }
                Ok::<_, ServiceError>(rows)
            })
            .await?;

        let (items, next_cursor) = paginate(rows, limit, |row| {
            Cursor::new(row.document.created_at, row.document.id)
        });
        Ok(DocumentPage { items, next_cursor })
    }

    pub async fn download_url(&self, document: &Document) -> ServiceResult<String> {
        self.storage
            .presign_get_object(&document.storage_key, self.url_ttl)
            .await
            .map_err(|err| ServiceError::StorageUnavailable(err.to_string()))
    }

    /// Drops a cache entry. Failures are logged; the cache is never a source
    /// of truth.
    pub async fn invalidate(&self, document_id: Uuid) {
        if let Err(err) = self.cache.invalidate(document_id).await {
            warn!(%document_id, error = %err, "cache invalidation failed");
        }
    }

    async fn cached(&self, id: Uuid) -> Option<ResolvedDocument> {
        match self.cache.get(id).await {
            Ok(Some(hit)) => {
                debug!(document_id = %id, "metadata cache hit");
                Some(hit)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(document_id = %id, error = %err, "cache read failed; treating as miss");
                None
            }
        }
    }

    async fn ticket(&self) -> Option<FillTicket> {
        match self.cache.ticket().await {
            Ok(ticket) => Some(ticket),
            Err(err) => {
                warn!(error = %err, "cache unavailable; skipping fill");
                None
            }
        }
    }

    async fn fill(&self, ticket: Option<FillTicket>, entry: ResolvedDocument) {
        let Some(ticket) = ticket else {
            return;
        };
        let document_id = entry.document.id;
        match self.cache.set_if_unchanged(ticket, entry).await {
            Ok(true) => {}
            Ok(false) => debug!(%document_id, "cache fill skipped after concurrent invalidation"),
            Err(err) => warn!(%document_id, error = %err, "cache write failed"),
        }
    }
}

/// `None` for admins, who pass every ownership gate.
fn owner_actor(principal: &Principal) -> ServiceResult<Option<Uuid>> {
    match principal {
        Principal::Anonymous => Err(ServiceError::AccessDenied),
        Principal::Admin => Ok(None),
        Principal::User { user_id, .. } => Ok(Some(*user_id)),
    }
}

fn ensure_owner(
    tx: &mut dyn Transaction,
    document_id: Uuid,
    actor: Option<Uuid>,
) -> ServiceResult<()> {
    let allowed = match actor {
        Some(user_id) => tx.check_owner(document_id, user_id)?,
        None => tx.find_document(document_id)?.is_some(),
    };
    match (allowed, actor) {
        (true, _) => Ok(()),
        (false, Some(_)) => Err(ServiceError::NotOwner),
        (false, None) => Err(ServiceError::NotFound),
    }
}

fn generate_access_token() -> String {
    let mut bytes = [0u8; ACCESS_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// `users/{owner}/documents/{escaped stem}-{8 hex}{ext}`
pub fn storage_key(owner_id: Uuid, original_name: &str) -> String {
    let path = Path::new(original_name);
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_CHARS
                && ext.chars().all(|ch| ch.is_ascii_alphanumeric())
        })
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default();
    let stem = if extension.is_empty() {
        original_name
    } else {
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(original_name)
    };
    let stem: String = stem
        .chars()
        .filter(|ch| *ch != '/' && *ch != '\\')
        .take(MAX_STEM_CHARS)
        .collect();
    let stem = if stem.is_empty() {
        "file".to_string()
    } else {
        utf8_percent_encode(&stem, STEM_ESCAPE).to_string()
    };
    let suffix = &Uuid::new_v4().simple().to_string()[..8];

    format!("users/{owner_id}/documents/{stem}-{suffix}{extension}")
}
