use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use diesel::dsl::exists;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::{select, sql_query, PgConnection};
use uuid::Uuid;

use super::{
    CredentialStore, Database, DocumentStore, GrantStore, StoreError, StoreResult, Transaction,
    UserStore,
};
use crate::db::PgPool;
use crate::models::{
    Document, Grantee, NewDocument, NewDocumentGrant, NewRefreshToken, NewUser, RefreshToken,
    TokenRetirement, User,
};
use crate::schema::{document_grants, documents, refresh_tokens, users};
use crate::utils::cursor::Cursor;

impl From<DieselError> for StoreError {
    fn from(value: DieselError) -> Self {
        match value {
            DieselError::NotFound => StoreError::NotFound,
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                StoreError::Conflict(info.message().to_string())
            }
            DieselError::DatabaseError(_, ref info)
                if info.message().contains("statement timeout") =>
            {
                StoreError::Timeout
            }
            other => StoreError::Database(other),
        }
    }
}

/// Postgres-backed store. Transactions run on the blocking pool with
/// `statement_timeout` set from the caller's deadline.
#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Deletes refresh records that can never be presented successfully again.
    pub fn purge_refresh_tokens(&self, now: NaiveDateTime) -> StoreResult<usize> {
        let mut conn = self.connection()?;
        let removed = diesel::delete(
            refresh_tokens::table.filter(
                refresh_tokens::used
                    .eq(true)
                    .or(refresh_tokens::expires_at.lt(now)),
            ),
        )
        .execute(&mut conn)?;
        Ok(removed)
    }

    /// `(id, storage_key)` of documents soft-deleted before `cutoff`.
    pub fn deleted_documents_before(
        &self,
        cutoff: NaiveDateTime,
    ) -> StoreResult<Vec<(Uuid, String)>> {
        let mut conn = self.connection()?;
        let rows = documents::table
            .filter(documents::deleted_at.lt(cutoff))
            .select((documents::id, documents::storage_key))
            .load::<(Uuid, String)>(&mut conn)?;
        Ok(rows)
    }

    pub fn hard_delete_documents(&self, ids: &[Uuid]) -> StoreResult<usize> {
        let mut conn = self.connection()?;
        let removed = diesel::delete(documents::table.filter(documents::id.eq_any(ids)))
            .execute(&mut conn)?;
        Ok(removed)
    }

    fn connection(
        &self,
    ) -> StoreResult<diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<PgConnection>>>
    {
        self.pool
            .get()
            .map_err(|err| StoreError::Unavailable(format!("database pool error: {err}")))
    }
}

enum TxError<E> {
    Store(DieselError),
    DeadlineExceeded,
    Caller(E),
}

impl<E> From<DieselError> for TxError<E> {
    fn from(value: DieselError) -> Self {
        TxError::Store(value)
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn transaction<T, E, F>(&self, deadline: Duration, f: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
        F: FnOnce(&mut dyn Transaction) -> Result<T, E> + Send + 'static,
    {
        let pool = self.pool.clone();
        match tokio::task::spawn_blocking(move || run_transaction(&pool, deadline, f)).await {
            Ok(result) => result,
            Err(err) => Err(E::from(StoreError::Internal(format!(
                "transaction task failed: {err}"
            )))),
        }
    }
}

/// Runs `f` inside one database transaction. The deadline covers the wait for
/// a pooled connection, every statement and the closure itself; a body that
/// finishes late is rolled back.
fn run_transaction<T, E, F>(pool: &PgPool, deadline: Duration, f: F) -> Result<T, E>
where
    E: From<StoreError>,
    F: FnOnce(&mut dyn Transaction) -> Result<T, E>,
{
    let started = Instant::now();
    let mut pooled = pool
        .get_timeout(deadline)
        .map_err(|err| E::from(StoreError::Unavailable(format!("database pool error: {err}"))))?;
    let conn: &mut PgConnection = &mut pooled;

    conn.transaction::<T, TxError<E>, _>(|conn| {
        let remaining = deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(TxError::DeadlineExceeded);
        }
        let timeout_ms = remaining.as_millis().max(1);
        sql_query(format!("SET LOCAL statement_timeout = {timeout_ms}")).execute(conn)?;

        let mut tx = PgTransaction { conn };
        let value = f(&mut tx).map_err(TxError::Caller)?;
        if started.elapsed() > deadline {
            return Err(TxError::DeadlineExceeded);
        }
        Ok(value)
    })
    .map_err(|err| match err {
        TxError::Store(err) => E::from(StoreError::from(err)),
        TxError::DeadlineExceeded => E::from(StoreError::Timeout),
        TxError::Caller(err) => err,
    })
}

struct PgTransaction<'a> {
    conn: &'a mut PgConnection,
}

impl UserStore for PgTransaction<'_> {
    fn find_user(&mut self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(users::table.find(id).first::<User>(self.conn).optional()?)
    }

    fn find_user_by_login(&mut self, login: &str) -> StoreResult<Option<User>> {
        Ok(users::table
            .filter(users::login.eq(login))
            .first::<User>(self.conn)
            .optional()?)
    }

    fn user_exists(&mut self, id: Uuid) -> StoreResult<bool> {
        Ok(select(exists(users::table.find(id))).get_result(self.conn)?)
    }

    fn insert_user(&mut self, user: &NewUser) -> StoreResult<User> {
        Ok(diesel::insert_into(users::table)
            .values(user)
            .get_result(self.conn)?)
    }

    fn update_login(&mut self, id: Uuid, login: &str, now: NaiveDateTime) -> StoreResult<bool> {
        let updated = diesel::update(users::table.find(id))
            .set((users::login.eq(login), users::updated_at.eq(now)))
            .execute(self.conn)?;
        Ok(updated > 0)
    }

    fn update_password(
        &mut self,
        id: Uuid,
        password_hash: &str,
        now: NaiveDateTime,
    ) -> StoreResult<bool> {
        let updated = diesel::update(users::table.find(id))
            .set((
                users::password_hash.eq(password_hash),
                users::updated_at.eq(now),
            ))
            .execute(self.conn)?;
        Ok(updated > 0)
    }

    fn delete_user(&mut self, id: Uuid) -> StoreResult<bool> {
        let removed = diesel::delete(users::table.find(id)).execute(self.conn)?;
        Ok(removed > 0)
    }

    fn list_users(&mut self, cursor: Option<Cursor>, limit: usize) -> StoreResult<Vec<User>> {
        let mut query = users::table.into_boxed();
        if let Some(cursor) = cursor {
            query = query.filter(
                users::created_at.gt(cursor.created_at).or(users::created_at
                    .eq(cursor.created_at)
                    .and(users::id.gt(cursor.id))),
            );
        }
        Ok(query
            .order_by(users::created_at.asc())
            .then_order_by(users::id.asc())
            .limit(limit as i64)
            .load::<User>(self.conn)?)
    }
}

impl CredentialStore for PgTransaction<'_> {
    fn insert_refresh_token(&mut self, token: &NewRefreshToken) -> StoreResult<()> {
        diesel::insert_into(refresh_tokens::table)
            .values(token)
            .execute(self.conn)?;
        Ok(())
    }

    fn find_refresh_token(&mut self, id: Uuid) -> StoreResult<Option<RefreshToken>> {
        Ok(refresh_tokens::table
            .find(id)
            .first::<RefreshToken>(self.conn)
            .optional()?)
    }

    fn mark_refresh_token_used(
        &mut self,
        id: Uuid,
        now: NaiveDateTime,
        retirement: TokenRetirement,
    ) -> StoreResult<usize> {
        let live = refresh_tokens::table
            .filter(refresh_tokens::id.eq(id))
            .filter(refresh_tokens::used.eq(false));

        let affected = match retirement {
            TokenRetirement::Rotated => diesel::update(live)
                .set(refresh_tokens::used.eq(true))
                .execute(self.conn)?,
            TokenRetirement::Revoked => diesel::update(live)
                .set((
                    refresh_tokens::used.eq(true),
                    refresh_tokens::revoked_at.eq(Some(now)),
                ))
                .execute(self.conn)?,
        };
        Ok(affected)
    }

    fn revoke_user_refresh_tokens(
        &mut self,
        user_id: Uuid,
        now: NaiveDateTime,
    ) -> StoreResult<usize> {
        Ok(diesel::update(
            refresh_tokens::table
                .filter(refresh_tokens::user_id.eq(user_id))
                .filter(refresh_tokens::used.eq(false)),
        )
        .set((
            refresh_tokens::used.eq(true),
            refresh_tokens::revoked_at.eq(Some(now)),
        ))
        .execute(self.conn)?)
    }
}

impl DocumentStore for PgTransaction<'_> {
    fn insert_document(&mut self, document: &NewDocument) -> StoreResult<Document> {
        Ok(diesel::insert_into(documents::table)
            .values(document)
            .get_result(self.conn)?)
    }

    fn find_document(&mut self, id: Uuid) -> StoreResult<Option<Document>> {
        Ok(documents::table
            .find(id)
            .filter(documents::deleted_at.is_null())
            .first::<Document>(self.conn)
            .optional()?)
    }

    fn find_readable_document(
        &mut self,
        id: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Option<Document>> {
        let granted = exists(
            document_grants::table
                .filter(document_grants::document_id.eq(id))
                .filter(document_grants::target_user_id.eq(user_id)),
        );

        Ok(documents::table
            .find(id)
            .filter(documents::deleted_at.is_null())
            .filter(
                documents::owner_id
                    .eq(user_id)
                    .or(documents::is_public.eq(true))
                    .or(granted),
            )
            .first::<Document>(self.conn)
            .optional()?)
    }

    fn find_document_by_token(&mut self, token: &str) -> StoreResult<Option<Document>> {
        Ok(documents::table
            .filter(documents::access_token.eq(token))
            .filter(documents::deleted_at.is_null())
            .first::<Document>(self.conn)
            .optional()?)
    }

    fn find_public_document(&mut self, id: Uuid) -> StoreResult<Option<Document>> {
        Ok(documents::table
            .find(id)
            .filter(documents::is_public.eq(true))
            .filter(documents::deleted_at.is_null())
            .first::<Document>(self.conn)
            .optional()?)
    }

    fn find_public_document_by_token(&mut self, token: &str) -> StoreResult<Option<Document>> {
        Ok(documents::table
            .filter(documents::access_token.eq(token))
            .filter(documents::is_public.eq(true))
            .filter(documents::deleted_at.is_null())
            .first::<Document>(self.conn)
            .optional()?)
    }

    fn list_documents_by_owner(
        &mut self,
        owner_id: Uuid,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> StoreResult<Vec<Document>> {
        let mut query = documents::table
            .filter(documents::owner_id.eq(owner_id))
            .filter(documents::deleted_at.is_null())
            .into_boxed();
        if let Some(cursor) = cursor {
            query = query.filter(
                documents::created_at
                    .lt(cursor.created_at)
                    .or(documents::created_at
                        .eq(cursor.created_at)
                        .and(documents::id.lt(cursor.id))),
            );
        }
        Ok(query
            .order_by(documents::created_at.desc())
            .then_order_by(documents::id.desc())
            .limit(limit as i64)
            .load::<Document>(self.conn)?)
    }

    fn access_token_exists(&mut self, token: &str) -> StoreResult<bool> {
        Ok(
            select(exists(
                documents::table.filter(documents::access_token.eq(token)),
            ))
            .get_result(self.conn)?,
        )
    }

    fn soft_delete_document(
        &mut self,
        id: Uuid,
        now: NaiveDateTime,
    ) -> StoreResult<Option<String>> {
        let storage_key: Option<String> = diesel::update(
            documents::table
                .find(id)
                .filter(documents::deleted_at.is_null()),
        )
        .set((
            documents::deleted_at.eq(Some(now)),
            documents::updated_at.eq(now),
            documents::version.eq(documents::version + 1),
        ))
        .returning(documents::storage_key)
        .get_result(self.conn)
        .optional()?;

        if storage_key.is_some() {
            diesel::delete(document_grants::table.filter(document_grants::document_id.eq(id)))
                .execute(self.conn)?;
        }
        Ok(storage_key)
    }

    fn list_owned_documents(&mut self, owner_id: Uuid) -> StoreResult<Vec<(Uuid, String)>> {
        Ok(documents::table
            .filter(documents::owner_id.eq(owner_id))
            .select((documents::id, documents::storage_key))
            .load::<(Uuid, String)>(self.conn)?)
    }
}

impl GrantStore for PgTransaction<'_> {
    fn add_grant(
        &mut self,
        document_id: Uuid,
        target_user_id: Uuid,
        now: NaiveDateTime,
    ) -> StoreResult<bool> {
        let inserted = diesel::insert_into(document_grants::table)
            .values(&NewDocumentGrant {
                document_id,
                target_user_id,
                created_at: now,
            })
            .on_conflict((document_grants::document_id, document_grants::target_user_id))
            .do_nothing()
            .execute(self.conn)?;
        Ok(inserted > 0)
    }

    fn remove_grant(&mut self, document_id: Uuid, target_user_id: Uuid) -> StoreResult<bool> {
        let removed = diesel::delete(
            document_grants::table
                .filter(document_grants::document_id.eq(document_id))
                .filter(document_grants::target_user_id.eq(target_user_id)),
        )
        .execute(self.conn)?;
        Ok(removed > 0)
    }

    fn list_grantees(&mut self, document_id: Uuid) -> StoreResult<Vec<Grantee>> {
        let rows = document_grants::table
            .inner_join(users::table)
            .filter(document_grants::document_id.eq(document_id))
            .order(users::login.asc())
            .select((users::id, users::login))
            .load::<(Uuid, String)>(self.conn)?;
        Ok(rows
            .into_iter()
            .map(|(user_id, login)| Grantee { user_id, login })
            .collect())
    }

    fn check_owner(&mut self, document_id: Uuid, user_id: Uuid) -> StoreResult<bool> {
        Ok(select(exists(
            documents::table
                .filter(documents::id.eq(document_id))
                .filter(documents::owner_id.eq(user_id))
                .filter(documents::deleted_at.is_null()),
        ))
        .get_result(self.conn)?)
    }

    fn has_access(&mut self, document_id: Uuid, user_id: Uuid) -> StoreResult<bool> {
        if self.check_owner(document_id, user_id)? {
            return Ok(true);
        }
        let live: bool = select(exists(
            documents::table
                .filter(documents::id.eq(document_id))
                .filter(documents::deleted_at.is_null()),
        ))
        .get_result(self.conn)?;
        if !live {
            return Ok(false);
        }
        Ok(select(exists(
            document_grants::table
                .filter(document_grants::document_id.eq(document_id))
                .filter(document_grants::target_user_id.eq(user_id)),
        ))
        .get_result(self.conn)?)
    }

    fn list_granted_documents(&mut self, user_id: Uuid) -> StoreResult<Vec<Uuid>> {
        Ok(document_grants::table
            .filter(document_grants::target_user_id.eq(user_id))
            .select(document_grants::document_id)
            .load::<Uuid>(self.conn)?)
    }
}
