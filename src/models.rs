use chrono::NaiveDateTime;
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub login: String,
    pub password_hash: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub login: String,
    pub password_hash: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Associations)]
#[diesel(table_name = documents)]
#[diesel(belongs_to(User, foreign_key = owner_id))]
pub struct Document {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub original_name: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub content_hash: String,
    pub storage_key: String,
    pub is_public: bool,
    pub access_token: String,
    pub version: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = documents)]
pub struct NewDocument {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub original_name: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub content_hash: String,
    pub storage_key: String,
    pub is_public: bool,
    pub access_token: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[allow(dead_code)]
#[derive(Debug, Clone, Queryable, Associations)]
#[diesel(table_name = document_grants)]
#[diesel(belongs_to(Document))]
#[diesel(belongs_to(User, foreign_key = target_user_id))]
#[diesel(primary_key(document_id, target_user_id))]
pub struct DocumentGrant {
    pub document_id: Uuid,
    pub target_user_id: Uuid,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_grants)]
pub struct NewDocumentGrant {
    pub document_id: Uuid,
    pub target_user_id: Uuid,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = refresh_tokens)]
#[diesel(belongs_to(User))]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub expires_at: NaiveDateTime,
    pub used: bool,
    pub user_agent: String,
    pub ip_address: String,
    pub created_at: NaiveDateTime,
    pub revoked_at: Option<NaiveDateTime>,
}

impl RefreshToken {
    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = refresh_tokens)]
pub struct NewRefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub expires_at: NaiveDateTime,
    pub used: bool,
    pub user_agent: String,
    pub ip_address: String,
    pub created_at: NaiveDateTime,
}

/// Why a refresh record stops being live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRetirement {
    /// Consumed by a successful refresh; a successor record exists.
    Rotated,
    /// Burned by logout, a user-agent mismatch or a password change.
    Revoked,
}

/// A user holding a read grant on a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grantee {
    pub user_id: Uuid,
    pub login: String,
}
