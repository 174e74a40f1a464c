//! Persistence capabilities used by the session and access layers.
//!
//! Every store operation runs against an explicit [`Transaction`] handle handed
//! out by [`Database::transaction`]. The closure commits when it returns `Ok`
//! and rolls back on `Err` or when the caller-supplied deadline passes, so a
//! multi-statement invariant (conditional token consumption, owner-checked
//! grant insertion) is never left half applied.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Document, Grantee, NewDocument, NewRefreshToken, NewUser, RefreshToken, TokenRetirement, User,
};
use crate::utils::cursor::Cursor;

pub mod memory;
pub mod postgres;

pub use memory::MemoryDatabase;
pub use postgres::PgDatabase;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("transaction deadline exceeded")]
    Timeout,
    #[error("database error: {0}")]
    Database(diesel::result::Error),
    #[error("{0}")]
    Internal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Database: Send + Sync + 'static {
    /// Runs `f` inside one transaction bounded by `deadline`.
    async fn transaction<T, E, F>(&self, deadline: Duration, f: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
        F: FnOnce(&mut dyn Transaction) -> Result<T, E> + Send + 'static;
}

pub trait Transaction: UserStore + CredentialStore + DocumentStore + GrantStore {}

impl<T> Transaction for T where T: UserStore + CredentialStore + DocumentStore + GrantStore {}

pub trait UserStore {
    fn find_user(&mut self, id: Uuid) -> StoreResult<Option<User>>;

    fn find_user_by_login(&mut self, login: &str) -> StoreResult<Option<User>>;

    fn user_exists(&mut self, id: Uuid) -> StoreResult<bool>;

    /// Fails with [`StoreError::Conflict`] when the login is taken.
    fn insert_user(&mut self, user: &NewUser) -> StoreResult<User>;

    fn update_login(&mut self, id: Uuid, login: &str, now: NaiveDateTime) -> StoreResult<bool>;

    fn update_password(
        &mut self,
        id: Uuid,
        password_hash: &str,
        now: NaiveDateTime,
    ) -> StoreResult<bool>;

    /// Removes the user together with their documents, grants and refresh tokens.
    fn delete_user(&mut self, id: Uuid) -> StoreResult<bool>;

    /// Users ordered by `(created_at, id)` ascending, strictly after `cursor`.
    fn list_users(&mut self, cursor: Option<Cursor>, limit: usize) -> StoreResult<Vec<User>>;
}

pub trait CredentialStore {
    fn insert_refresh_token(&mut self, token: &NewRefreshToken) -> StoreResult<()>;

    fn find_refresh_token(&mut self, id: Uuid) -> StoreResult<Option<RefreshToken>>;

    /// Flags the record used only if it is still unused; returns the affected row count.
    fn mark_refresh_token_used(
        &mut self,
        id: Uuid,
        now: NaiveDateTime,
        retirement: TokenRetirement,
    ) -> StoreResult<usize>;

    /// Revokes every live refresh token of the user.
    fn revoke_user_refresh_tokens(&mut self, user_id: Uuid, now: NaiveDateTime)
        -> StoreResult<usize>;
}

pub trait DocumentStore {
    fn insert_document(&mut self, document: &NewDocument) -> StoreResult<Document>;

    /// Any non-deleted document.
    fn find_document(&mut self, id: Uuid) -> StoreResult<Option<Document>>;

    /// A non-deleted document the user owns, holds a grant on, or that is public.
    fn find_readable_document(&mut self, id: Uuid, user_id: Uuid)
        -> StoreResult<Option<Document>>;

    /// A non-deleted document by its access token, public or not.
    fn find_document_by_token(&mut self, token: &str) -> StoreResult<Option<Document>>;

    fn find_public_document(&mut self, id: Uuid) -> StoreResult<Option<Document>>;

    fn find_public_document_by_token(&mut self, token: &str) -> StoreResult<Option<Document>>;

    /// Owner's non-deleted documents ordered by `(created_at, id)` descending,
    /// strictly before `cursor`.
    fn list_documents_by_owner(
        &mut self,
        owner_id: Uuid,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> StoreResult<Vec<Document>>;

    fn access_token_exists(&mut self, token: &str) -> StoreResult<bool>;

    /// Soft-deletes the document and drops its grants; returns the storage key.
    fn soft_delete_document(&mut self, id: Uuid, now: NaiveDateTime)
        -> StoreResult<Option<String>>;

    /// `(id, storage_key)` of every document the user owns, deleted or not.
    fn list_owned_documents(&mut self, owner_id: Uuid) -> StoreResult<Vec<(Uuid, String)>>;
}

pub trait GrantStore {
    /// Inserts the grant unless it already exists; returns whether a row was added.
    fn add_grant(
        &mut self,
        document_id: Uuid,
        target_user_id: Uuid,
        now: NaiveDateTime,
    ) -> StoreResult<bool>;

    fn remove_grant(&mut self, document_id: Uuid, target_user_id: Uuid) -> StoreResult<bool>;

    /// Logins of every grantee, sorted.
    fn list_grants(&mut self, document_id: Uuid) -> StoreResult<Vec<String>> {
        Ok(self
            .list_grantees(document_id)?
            .into_iter()
            .map(|grantee| grantee.login)
            .collect())
    }

    fn list_grantees(&mut self, document_id: Uuid) -> StoreResult<Vec<Grantee>>;

    /// True when `user_id` owns the non-deleted document.
    fn check_owner(&mut self, document_id: Uuid, user_id: Uuid) -> StoreResult<bool>;

    /// True when `user_id` owns the non-deleted document or holds a grant on it.
    fn has_access(&mut self, document_id: Uuid, user_id: Uuid) -> StoreResult<bool>;

    /// Documents shared with the user.
    fn list_granted_documents(&mut self, user_id: Uuid) -> StoreResult<Vec<Uuid>>;
}
