use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use uuid::Uuid;

use super::{
    CredentialStore, Database, DocumentStore, GrantStore, StoreError, StoreResult, Transaction,
    UserStore,
};
use crate::models::{
    Document, Grantee, NewDocument, NewRefreshToken, NewUser, RefreshToken, TokenRetirement, User,
};
use crate::utils::cursor::Cursor;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    refresh_tokens: HashMap<Uuid, RefreshToken>,
    documents: HashMap<Uuid, Document>,
    grants: BTreeMap<(Uuid, Uuid), NaiveDateTime>,
}

/// In-process store with the same transactional contract as [`super::PgDatabase`].
///
/// Transactions are serialized: each one works on a copy of the state that
/// replaces the committed state only when the closure succeeds within its
/// deadline.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
    transactions: AtomicUsize,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent transaction fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Adds a fixed delay to every transaction body.
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of transactions started so far.
    pub fn transaction_count(&self) -> usize {
        self.inner.transactions.load(Ordering::SeqCst)
    }

    pub fn refresh_tokens_for_user(&self, user_id: Uuid) -> Vec<RefreshToken> {
        let state = self.lock();
        let mut tokens: Vec<RefreshToken> = state
            .refresh_tokens
            .values()
            .filter(|token| token.user_id == user_id)
            .cloned()
            .collect();
        tokens.sort_by_key(|token| token.created_at);
        tokens
    }

    pub fn refresh_token(&self, id: Uuid) -> Option<RefreshToken> {
        self.lock().refresh_tokens.get(&id).cloned()
    }

    /// Raw document row, soft-deleted or not.
    pub fn document(&self, id: Uuid) -> Option<Document> {
        self.lock().documents.get(&id).cloned()
    }

    pub fn grant_count(&self, document_id: Uuid) -> usize {
        self.lock()
            .grants
            .keys()
            .filter(|(doc, _)| *doc == document_id)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn transaction<T, E, F>(&self, deadline: Duration, f: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
        F: FnOnce(&mut dyn Transaction) -> Result<T, E> + Send + 'static,
    {
        self.inner.transactions.fetch_add(1, Ordering::SeqCst);
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(E::from(StoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            )));
        }

        let db = self.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let mut committed = db.lock();
            let mut working = committed.clone();

            let latency = db.inner.latency_ms.load(Ordering::SeqCst);
            if latency > 0 {
                std::thread::sleep(Duration::from_millis(latency));
            }

            let result = f(&mut MemoryTransaction { state: &mut working })?;
            if started.elapsed() > deadline {
                return Err(E::from(StoreError::Timeout));
            }
            *committed = working;
            Ok(result)
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(err) => Err(E::from(StoreError::Internal(format!(
                "transaction task failed: {err}"
            )))),
        }
    }
}

struct MemoryTransaction<'a> {
    state: &'a mut MemoryState,
}

impl MemoryTransaction<'_> {
    fn live_document(&self, id: Uuid) -> Option<&Document> {
        self.state
            .documents
            .get(&id)
            .filter(|doc| doc.deleted_at.is_none())
    }

    fn granted(&self, document_id: Uuid, user_id: Uuid) -> bool {
        self.state.grants.contains_key(&(document_id, user_id))
    }
}

impl UserStore for MemoryTransaction<'_> {
    fn find_user(&mut self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.state.users.get(&id).cloned())
    }

    fn find_user_by_login(&mut self, login: &str) -> StoreResult<Option<User>> {
        Ok(self
            .state
            .users
            .values()
            .find(|user| user.login == login)
            .cloned())
    }

    fn user_exists(&mut self, id: Uuid) -> StoreResult<bool> {
        Ok(self.state.users.contains_key(&id))
    }

    fn insert_user(&mut self, user: &NewUser) -> StoreResult<User> {
        if self.state.users.values().any(|u| u.login == user.login) {
            return Err(StoreError::Conflict(format!(
                "login {} already exists",
                user.login
            )));
        }
        let row = User {
            id: user.id,
            login: user.login.clone(),
            password_hash: user.password_hash.clone(),
            created_at: user.created_at,
            updated_at: user.updated_at,
        };
        self.state.users.insert(row.id, row.clone());
        Ok(row)
    }

    fn update_login(&mut self, id: Uuid, login: &str, now: NaiveDateTime) -> StoreResult<bool> {
        if self
            .state
            .users
            .values()
            .any(|u| u.login == login && u.id != id)
        {
            return Err(StoreError::Conflict(format!("login {login} already exists")));
        }
        Ok(match self.state.users.get_mut(&id) {
            Some(user) => {
                user.login = login.to_string();
                user.updated_at = now;
                true
            }
            None => false,
        })
    }

    fn update_password(
        &mut self,
        id: Uuid,
        password_hash: &str,
        now: NaiveDateTime,
    ) -> StoreResult<bool> {
        Ok(match self.state.users.get_mut(&id) {
            Some(user) => {
                user.password_hash = password_hash.to_string();
                user.updated_at = now;
                true
            }
            None => false,
        })
    }

    fn delete_user(&mut self, id: Uuid) -> StoreResult<bool> {
        if self.state.users.remove(&id).is_none() {
            return Ok(false);
        }
        self.state.refresh_tokens.retain(|_, token| token.user_id != id);
        let owned: Vec<Uuid> = self
            .state
            .documents
            .values()
            .filter(|doc| doc.owner_id == id)
            .map(|doc| doc.id)
            .collect();
        for doc_id in &owned {
            self.state.documents.remove(doc_id);
        }
        self.state
            .grants
            .retain(|(doc, target), _| *target != id && !owned.contains(doc));
        Ok(true)
    }

    fn list_users(&mut self, cursor: Option<Cursor>, limit: usize) -> StoreResult<Vec<User>> {
        let mut rows: Vec<User> = self
            .state
            .users
            .values()
            .filter(|user| match cursor {
                Some(c) => (user.created_at, user.id) > (c.created_at, c.id),
                None => true,
            })
            .cloned()
            .collect();
        rows.sort_by_key(|user| (user.created_at, user.id));
        rows.truncate(limit);
        Ok(rows)
    }
}

impl CredentialStore for MemoryTransaction<'_> {
    fn insert_refresh_token(&mut self, token: &NewRefreshToken) -> StoreResult<()> {
        if self.state.refresh_tokens.contains_key(&token.id) {
            return Err(StoreError::Conflict(format!(
                "refresh token {} already exists",
                token.id
            )));
        }
        self.state.refresh_tokens.insert(
            token.id,
            RefreshToken {
                id: token.id,
                user_id: token.user_id,
                token_hash: token.token_hash.clone(),
                expires_at: token.expires_at,
                used: token.used,
                user_agent: token.user_agent.clone(),
                ip_address: token.ip_address.clone(),
                created_at: token.created_at,
                revoked_at: None,
            },
        );
        Ok(())
    }

    fn find_refresh_token(&mut self, id: Uuid) -> StoreResult<Option<RefreshToken>> {
        Ok(self.state.refresh_tokens.get(&id).cloned())
    }

    fn mark_refresh_token_used(
        &mut self,
        id: Uuid,
        now: NaiveDateTime,
        retirement: TokenRetirement,
    ) -> StoreResult<usize> {
        match self.state.refresh_tokens.get_mut(&id) {
            Some(token) if !token.used => {
                token.used = true;
                if retirement == TokenRetirement::Revoked {
                    token.revoked_at = Some(now);
                }
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    fn revoke_user_refresh_tokens(
        &mut self,
        user_id: Uuid,
        now: NaiveDateTime,
    ) -> StoreResult<usize> {
        let mut revoked = 0;
        for token in self.state.refresh_tokens.values_mut() {
            if token.user_id == user_id && !token.used {
                token.used = true;
                token.revoked_at = Some(now);
                revoked += 1;
            }
        }
        Ok(revoked)
    }
}

impl DocumentStore for MemoryTransaction<'_> {
    fn insert_document(&mut self, document: &NewDocument) -> StoreResult<Document> {
        if self
            .state
            .documents
            .values()
            .any(|doc| doc.access_token == document.access_token)
        {
            return Err(StoreError::Conflict("access token already exists".into()));
        }
        if !self.state.users.contains_key(&document.owner_id) {
            return Err(StoreError::Internal(format!(
                "owner {} does not exist",
                document.owner_id
            )));
        }
        let row = Document {
            id: document.id,
            owner_id: document.owner_id,
            original_name: document.original_name.clone(),
            size_bytes: document.size_bytes,
            mime_type: document.mime_type.clone(),
            content_hash: document.content_hash.clone(),
            storage_key: document.storage_key.clone(),
            is_public: document.is_public,
            access_token: document.access_token.clone(),
            version: 1,
            created_at: document.created_at,
            updated_at: document.updated_at,
            deleted_at: None,
        };
        self.state.documents.insert(row.id, row.clone());
        Ok(row)
    }

    fn find_document(&mut self, id: Uuid) -> StoreResult<Option<Document>> {
        Ok(self.live_document(id).cloned())
    }

    fn find_readable_document(
        &mut self,
        id: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Option<Document>> {
        let granted = self.granted(id, user_id);
        Ok(self
            .live_document(id)
            .filter(|doc| doc.owner_id == user_id || doc.is_public || granted)
            .cloned())
    }

    fn find_document_by_token(&mut self, token: &str) -> StoreResult<Option<Document>> {
        Ok(self
            .state
            .documents
            .values()
            .find(|doc| doc.deleted_at.is_none() && doc.access_token == token)
            .cloned())
    }

    fn find_public_document(&mut self, id: Uuid) -> StoreResult<Option<Document>> {
        Ok(self.live_document(id).filter(|doc| doc.is_public).cloned())
    }

    fn find_public_document_by_token(&mut self, token: &str) -> StoreResult<Option<Document>> {
        Ok(self
            .find_document_by_token(token)?
            .filter(|doc| doc.is_public))
    }

    fn list_documents_by_owner(
        &mut self,
        owner_id: Uuid,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> StoreResult<Vec<Document>> {
        let mut rows: Vec<Document> = self
            .state
            .documents
            .values()
            .filter(|doc| doc.owner_id == owner_id && doc.deleted_at.is_none())
            .filter(|doc| match cursor {
                Some(c) => (doc.created_at, doc.id) < (c.created_at, c.id),
                None => true,
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    fn access_token_exists(&mut self, token: &str) -> StoreResult<bool> {
        Ok(self
            .state
            .documents
            .values()
            .any(|doc| doc.access_token == token))
    }

    fn soft_delete_document(
        &mut self,
        id: Uuid,
        now: NaiveDateTime,
    ) -> StoreResult<Option<String>> {
        let storage_key = match self.state.documents.get_mut(&id) {
            Some(doc) if doc.deleted_at.is_none() => {
                doc.deleted_at = Some(now);
                doc.updated_at = now;
                doc.version += 1;
                doc.storage_key.clone()
            }
            _ => return Ok(None),
        };
        self.state.grants.retain(|(doc, _), _| *doc != id);
        Ok(Some(storage_key))
    }

    fn list_owned_documents(&mut self, owner_id: Uuid) -> StoreResult<Vec<(Uuid, String)>> {
        Ok(self
            .state
            .documents
            .values()
            .filter(|doc| doc.owner_id == owner_id)
            .map(|doc| (doc.id, doc.storage_key.clone()))
            .collect())
    }
}

impl GrantStore for MemoryTransaction<'_> {
    fn add_grant(
        &mut self,
        document_id: Uuid,
        target_user_id: Uuid,
        now: NaiveDateTime,
    ) -> StoreResult<bool> {
        let key = (document_id, target_user_id);
        if self.state.grants.contains_key(&key) {
            return Ok(false);
        }
        self.state.grants.insert(key, now);
        Ok(true)
    }

    fn remove_grant(&mut self, document_id: Uuid, target_user_id: Uuid) -> StoreResult<bool> {
        Ok(self
            .state
            .grants
            .remove(&(document_id, target_user_id))
            .is_some())
    }

    fn list_grantees(&mut self, document_id: Uuid) -> StoreResult<Vec<Grantee>> {
        let mut grantees: Vec<Grantee> = self
            .state
            .grants
            .keys()
            .filter(|(doc, _)| *doc == document_id)
            .filter_map(|(_, target)| self.state.users.get(target))
            .map(|user| Grantee {
                user_id: user.id,
                login: user.login.clone(),
            })
            .collect();
        grantees.sort_by(|a, b| a.login.cmp(&b.login));
        Ok(grantees)
    }

    fn check_owner(&mut self, document_id: Uuid, user_id: Uuid) -> StoreResult<bool> {
        Ok(self
            .live_document(document_id)
            .is_some_and(|doc| doc.owner_id == user_id))
    }

    fn has_access(&mut self, document_id: Uuid, user_id: Uuid) -> StoreResult<bool> {
        let granted = self.granted(document_id, user_id);
        Ok(self
            .live_document(document_id)
            .is_some_and(|doc| doc.owner_id == user_id || granted))
    }

    fn list_granted_documents(&mut self, user_id: Uuid) -> StoreResult<Vec<Uuid>> {
        Ok(self
            .state
            .grants
            .keys()
            .filter(|(_, target)| *target == user_id)
            .map(|(doc, _)| *doc)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::utils::now_utc;

    fn new_user(login: &str) -> NewUser {
        let now = now_utc();
        NewUser {
            id: Uuid::new_v4(),
            login: login.to_string(),
            password_hash: "hash".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn failed_closure_rolls_back() {
        let db = MemoryDatabase::new();
        let user = new_user("alice");
        let id = user.id;

        let result: Result<(), ServiceError> = db
            .transaction(Duration::from_secs(1), move |tx| {
                tx.insert_user(&user)?;
                Err(ServiceError::Validation("abort".into()))
            })
            .await;
        assert!(result.is_err());

        let exists: Result<bool, ServiceError> = db
            .transaction(Duration::from_secs(1), move |tx| Ok(tx.user_exists(id)?))
            .await;
        assert!(!exists.unwrap());
    }

    #[tokio::test]
    async fn deadline_overrun_rolls_back_with_timeout() {
        let db = MemoryDatabase::new();
        db.set_latency(Duration::from_millis(50));
        let user = new_user("bob");
        let id = user.id;

        let result: Result<User, ServiceError> = db
            .transaction(Duration::from_millis(10), move |tx| Ok(tx.insert_user(&user)?))
            .await;
        assert!(matches!(result, Err(ServiceError::StorageUnavailable(_))));

        db.set_latency(Duration::ZERO);
        let exists: Result<bool, ServiceError> = db
            .transaction(Duration::from_secs(1), move |tx| Ok(tx.user_exists(id)?))
            .await;
        assert!(!exists.unwrap());
    }

    #[tokio::test]
    async fn duplicate_login_conflicts() {
        let db = MemoryDatabase::new();
        let first = new_user("carol");
        let second = new_user("carol");

        let result: Result<User, ServiceError> = db
            .transaction(Duration::from_secs(1), move |tx| {
                tx.insert_user(&first)?;
                Ok(tx.insert_user(&second)?)
            })
            .await;
        assert!(matches!(result, Err(ServiceError::Conflict(_))));
    }

    #[tokio::test]
    async fn conditional_mark_used_only_succeeds_once() {
        let db = MemoryDatabase::new();
        let user = new_user("dave");
        let user_id = user.id;
        let token_id = Uuid::new_v4();

        let counts: Result<(usize, usize), ServiceError> = db
            .transaction(Duration::from_secs(1), move |tx| {
                let now = now_utc();
                tx.insert_user(&user)?;
                tx.insert_refresh_token(&NewRefreshToken {
                    id: token_id,
                    user_id,
                    token_hash: "h".into(),
                    expires_at: now + chrono::Duration::hours(1),
                    used: false,
                    user_agent: "ua".into(),
                    ip_address: "127.0.0.1".into(),
                    created_at: now,
                })?;
                let first = tx.mark_refresh_token_used(token_id, now, TokenRetirement::Rotated)?;
                let second = tx.mark_refresh_token_used(token_id, now, TokenRetirement::Revoked)?;
                Ok((first, second))
            })
            .await;
        assert_eq!(counts.unwrap(), (1, 0));
        assert!(db.refresh_token(token_id).unwrap().revoked_at.is_none());
    }
    #[tokio::test]
    async fn grants_follow_document_lifecycle() {
        let db = MemoryDatabase::new();
        let owner = new_user("erin");
        let reader = new_user("frank");
        let (owner_id, reader_id) = (owner.id, reader.id);
        let doc_id = Uuid::new_v4();

        let checks: Result<_, ServiceError> = db
            .transaction(Duration::from_secs(1), move |tx| {
                let now = now_utc();
                tx.insert_user(&owner)?;
                tx.insert_user(&reader)?;
                tx.insert_document(&NewDocument {
                    id: doc_id,
                    owner_id,
                    original_name: "a.txt".into(),
                    size_bytes: 1,
                    mime_type: "text/plain".into(),
                    content_hash: "00".into(),
                    storage_key: "users/a.txt".into(),
                    is_public: false,
                    access_token: "token".into(),
                    created_at: now,
                    updated_at: now,
                })?;
                let before = tx.has_access(doc_id, reader_id)?;
                let added = tx.add_grant(doc_id, reader_id, now)?;
                let again = tx.add_grant(doc_id, reader_id, now)?;
                let after = tx.has_access(doc_id, reader_id)?;
                let logins = tx.list_grants(doc_id)?;
                tx.soft_delete_document(doc_id, now)?;
                let deleted = tx.has_access(doc_id, owner_id)?;
                Ok((before, added, again, after, logins, deleted))
            })
            .await;

        let (before, added, again, after, logins, deleted) = checks.unwrap();
        assert!(!before);
        assert!(added);
        assert!(!again);
        assert!(after);
        assert_eq!(logins, vec!["frank".to_string()]);
        assert!(!deleted);
        assert_eq!(db.grant_count(doc_id), 0);
    }
}
