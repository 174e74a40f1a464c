use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::access::{AccessResolver, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::auth::password::SecretHasher;
use crate::auth::Principal;
use crate::error::{ServiceError, ServiceResult};
use crate::models::{NewUser, User};
use crate::storage::ObjectStorage;
use crate::store::Database;
use crate::utils::cursor::{paginate, Cursor};
use crate::utils::now_utc;

const LOGIN_MIN: usize = 3;
const LOGIN_MAX: usize = 100;
const PASSWORD_MAX: usize = 1024;

#[derive(Debug, Clone)]
pub struct UserPage {
    pub items: Vec<User>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletedUser {
    pub documents_removed: usize,
    pub orphaned_objects: usize,
}

pub struct UserService<D> {
    db: D,
    hasher: SecretHasher,
    documents: Arc<AccessResolver<D>>,
    storage: Arc<dyn ObjectStorage>,
    deadline: Duration,
}

impl<D: Database> UserService<D> {
    pub fn new(
        db: D,
        hasher: SecretHasher,
        documents: Arc<AccessResolver<D>>,
        storage: Arc<dyn ObjectStorage>,
        deadline: Duration,
    ) -> Self {
        Self {
            db,
            hasher,
            documents,
            storage,
            deadline,
        }
    }

    pub async fn register(
        &self,
        principal: &Principal,
        login: &str,
        password: &str,
    ) -> ServiceResult<User> {
        if !principal.is_admin() {
            return Err(ServiceError::AccessDenied);
        }
        validate_login(login)?;
        validate_password(password)?;

        let password_hash = self.hasher.hash(password).map_err(ServiceError::internal)?;
        let now = now_utc();
        let new_user = NewUser {
            id: Uuid::new_v4(),
            login: login.to_string(),
            password_hash,
            created_at: now,
            updated_at: now,
        };

        let user = self
            .db
            .transaction(self.deadline, move |tx| {
                if tx.find_user_by_login(&new_user.login)?.is_some() {
                    return Err(ServiceError::Conflict("login already taken".into()));
                }
                Ok(tx.insert_user(&new_user)?)
            })
            .await?;

        info!(user_id = %user.id, login = %user.login, "user registered");
        Ok(user)
    }

    pub async fn get_user(&self, principal: &Principal, id: Uuid) -> ServiceResult<User> {
        if !principal.acts_for(id) {
            return Err(ServiceError::AccessDenied);
        }
        self.db
            .transaction(self.deadline, move |tx| {
                tx.find_user(id)?.ok_or(ServiceError::UserNotFound)
            })
            .await
    }

    pub async fn list_users(
        &self,
        principal: &Principal,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> ServiceResult<UserPage> {
        if matches!(principal, Principal::Anonymous) {
            return Err(ServiceError::AccessDenied);
        }
        let cursor = Cursor::parse_optional(cursor)?;
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

        let rows = self
            .db
            .transaction(self.deadline, move |tx| {
                Ok::<_, ServiceError>(tx.list_users(cursor, limit + 1)?)
            })
            .await?;

        let (items, next_cursor) =
            paginate(rows, limit, |user| Cursor::new(user.created_at, user.id));
        Ok(UserPage { items, next_cursor })
    }

    /// Renames the user. Cached documents listing them as a grantee are dropped.
    pub async fn update_login(
        &self,
        principal: &Principal,
        id: Uuid,
        login: &str,
    ) -> ServiceResult<User> {
        if !principal.acts_for(id) {
            return Err(ServiceError::AccessDenied);
        }
        validate_login(login)?;

        let login = login.to_string();
        let (user, shared_with) = self
            .db
            .transaction(self.deadline, move |tx| {
                if !tx.update_login(id, &login, now_utc())? {
                    return Err(ServiceError::UserNotFound);
                }
                let user = tx.find_user(id)?.ok_or(ServiceError::UserNotFound)?;
                Ok((user, tx.list_granted_documents(id)?))
            })
            .await?;

        for document_id in shared_with {
            self.documents.invalidate(document_id).await;
        }
        info!(user_id = %id, login = %user.login, "login updated");
        Ok(user)
    }

    /// Changes the password and revokes every live session of the user.
    pub async fn update_password(
        &self,
        principal: &Principal,
        id: Uuid,
        password: &str,
    ) -> ServiceResult<()> {
        if !principal.acts_for(id) {
            return Err(ServiceError::AccessDenied);
        }
        validate_password(password)?;

        let password_hash = self.hasher.hash(password).map_err(ServiceError::internal)?;
        let revoked = self
            .db
            .transaction(self.deadline, move |tx| {
                let now = now_utc();
                if !tx.update_password(id, &password_hash, now)? {
                    return Err(ServiceError::UserNotFound);
                }
                Ok(tx.revoke_user_refresh_tokens(id, now)?)
            })
            .await?;

        info!(user_id = %id, revoked_sessions = revoked, "password updated");
        Ok(())
    }

    /// Removes the user with their tokens, grants and documents, then deletes
    /// the stored objects. Object failures are counted, not raised.
    pub async fn delete_user(&self, principal: &Principal, id: Uuid) -> ServiceResult<DeletedUser> {
        if !principal.acts_for(id) {
            return Err(ServiceError::AccessDenied);
        }

        let (owned, shared_with) = self
            .db
            .transaction(self.deadline, move |tx| {
                let owned = tx.list_owned_documents(id)?;
                let shared_with = tx.list_granted_documents(id)?;
                if !tx.delete_user(id)? {
                    return Err(ServiceError::UserNotFound);
                }
                Ok((owned, shared_with))
            })
            .await?;

        for document_id in owned.iter().map(|(doc, _)| *doc).chain(shared_with) {
            self.documents.invalidate(document_id).await;
        }

        let mut orphaned_objects = 0;
        for (document_id, storage_key) in &owned {
            if let Err(err) = self.storage.delete_object(storage_key).await {
                orphaned_objects += 1;
                warn!(
                    user_id = %id,
                    %document_id,
                    storage_key = %storage_key,
                    error = %err,
                    "object removal failed during user deletion"
                );
            }
        }

        info!(user_id = %id, documents = owned.len(), orphaned_objects, "user deleted");
        Ok(DeletedUser {
            documents_removed: owned.len(),
            orphaned_objects,
        })
    }
}

fn validate_login(login: &str) -> ServiceResult<()> {
    let len = login.chars().count();
    if !(LOGIN_MIN..=LOGIN_MAX).contains(&len) {
        return Err(ServiceError::Validation(format!(
            "login must be between {LOGIN_MIN} and {LOGIN_MAX} characters"
        )));
    }
    if !login.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return Err(ServiceError::Validation(
            "login may only contain latin letters and digits".into(),
        ));
    }
    Ok(())
}

fn validate_password(password: &str) -> ServiceResult<()> {
    if password.is_empty() || password.len() > PASSWORD_MAX {
        return Err(ServiceError::Validation(format!(
            "password must be between 1 and {PASSWORD_MAX} bytes"
        )));
    }
    Ok(())
}
