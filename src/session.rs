//! Login, refresh-token rotation with theft detection, logout, and request
//! authentication.

use std::sync::Arc;
use std::time::Duration;

use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::jwt::{IssuedPair, TokenIssuer};
use crate::auth::password::SecretHasher;
use crate::auth::Principal;
use crate::error::{ServiceError, ServiceResult};
use crate::models::TokenRetirement;
use crate::notifier::{self, IpChangeEvent, IpChangeNotifier};
use crate::store::Database;
use crate::utils::now_utc;

/// What the client receives after login or refresh.
#[derive(Debug, Clone)]
pub struct TokensPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

pub struct SessionService<D> {
    db: D,
    issuer: TokenIssuer,
    hasher: SecretHasher,
    notifier: Arc<dyn IpChangeNotifier>,
    admin_token: Option<String>,
    /// Verified against on unknown logins so both failures cost one argon2 run.
    dummy_hash: Option<String>,
    deadline: Duration,
}

impl<D: Database> SessionService<D> {
    pub fn new(
        db: D,
        issuer: TokenIssuer,
        hasher: SecretHasher,
        notifier: Arc<dyn IpChangeNotifier>,
        deadline: Duration,
    ) -> Self {
        let dummy_hash = dummy_hash(&hasher);
        Self {
            db,
            issuer,
            hasher,
            notifier,
            admin_token: None,
            dummy_hash,
            deadline,
        }
    }

    pub fn with_admin_token(mut self, admin_token: Option<String>) -> Self {
        self.admin_token = admin_token.filter(|token| !token.is_empty());
        self
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    pub async fn login(
        &self,
        login: &str,
        password: &str,
        user_agent: &str,
        ip_address: &str,
    ) -> ServiceResult<TokensPair> {
        let lookup = login.to_string();
        let user = self
            .db
            .transaction(self.deadline, move |tx| {
                Ok::<_, ServiceError>(tx.find_user_by_login(&lookup)?)
            })
            .await?;
        let Some(user) = user else {
            if let Some(dummy) = &self.dummy_hash {
                let _ = self.hasher.verify(password, dummy);
            }
            debug!("login for unknown user");
            return Err(ServiceError::UserNotFound);
        };

        let valid = self
            .hasher
            .verify(password, &user.password_hash)
            .map_err(ServiceError::internal)?;
        if !valid {
            debug!(user_id = %user.id, "password mismatch");
            return Err(ServiceError::InvalidCredentials);
        }

        let pair = self.issuer.issue_pair(user.id, user_agent, ip_address)?;
        let record = pair.record.clone();
        self.db
            .transaction(self.deadline, move |tx| {
                tx.insert_refresh_token(&record)?;
                Ok::<_, ServiceError>(())
            })
            .await?;

        info!(user_id = %user.id, refresh_token_id = %pair.record.id, "login succeeded");
        Ok(self.tokens(pair))
    }

    /// Rotates the refresh token bound to `access_token`.
    ///
    /// Classification runs cheapest first: record state, expiry, user-agent
    /// pin, then the secret. Only then is the record consumed, with a
    /// conditional update that lets exactly one concurrent caller win.
    pub async fn refresh(
        &self,
        user_agent: &str,
        ip_address: &str,
        access_token: &str,
        refresh_secret: &str,
    ) -> ServiceResult<TokensPair> {
        let claims = self.issuer.verify(access_token).map_err(|err| {
            debug!(error = %err, "access token rejected on refresh");
            ServiceError::InvalidAccessToken
        })?;
        let token_id = claims.refresh_token_id;

        let record = self
            .db
            .transaction(self.deadline, move |tx| {
                Ok::<_, ServiceError>(tx.find_refresh_token(token_id)?)
            })
            .await?
            .filter(|record| record.user_id == claims.sub)
            .ok_or(ServiceError::RefreshTokenNotFound)?;

        if record.used {
            warn!(
                user_id = %record.user_id,
                refresh_token_id = %token_id,
                "refresh token reuse detected"
            );
            return Err(ServiceError::ReusedToken);
        }

        let now = now_utc();
        if record.is_expired(now) {
            return Err(ServiceError::ExpiredToken);
        }

        if record.user_agent != user_agent {
            let burned = self
                .db
                .transaction(self.deadline, move |tx| {
                    Ok::<_, ServiceError>(tx.mark_refresh_token_used(
                        token_id,
                        now,
                        TokenRetirement::Revoked,
                    )?)
                })
                .await?;
            warn!(
                user_id = %record.user_id,
                refresh_token_id = %token_id,
                burned = burned > 0,
                "user agent changed on refresh; session revoked"
            );
            return Err(ServiceError::SessionHijackSuspected);
        }

        if record.ip_address != ip_address {
            info!(
                user_id = %record.user_id,
                new_ip = %ip_address,
                old_ip = %record.ip_address,
                "refresh from a new address"
            );
            notifier::dispatch(
                self.notifier.clone(),
                IpChangeEvent {
                    user_id: record.user_id,
                    new_ip: ip_address.to_string(),
                    old_ip: record.ip_address.clone(),
                },
            );
        }

        if !self
            .issuer
            .verify_refresh_secret(refresh_secret, &record.token_hash)?
        {
            warn!(
                user_id = %record.user_id,
                refresh_token_id = %token_id,
                "refresh secret mismatch"
            );
            return Err(ServiceError::InvalidRefreshSecret);
        }

        let pair = self
            .issuer
            .issue_pair(record.user_id, user_agent, ip_address)?;
        let next = pair.record.clone();
        let rotated = self
            .db
            .transaction(self.deadline, move |tx| {
                let consumed =
                    tx.mark_refresh_token_used(token_id, now_utc(), TokenRetirement::Rotated)?;
                if consumed == 0 {
                    return Err(ServiceError::ReusedToken);
                }
                tx.insert_refresh_token(&next)?;
                Ok(())
            })
            .await;

        if let Err(ServiceError::ReusedToken) = &rotated {
            warn!(
                user_id = %record.user_id,
                refresh_token_id = %token_id,
                "refresh token consumed by a concurrent request"
            );
        }
        rotated?;

        debug!(
            user_id = %record.user_id,
            previous = %token_id,
            next = %pair.record.id,
            "refresh token rotated"
        );
        Ok(self.tokens(pair))
    }

    /// Revokes the record. Revoking an already used record succeeds.
    pub async fn logout(&self, refresh_token_id: Uuid) -> ServiceResult<()> {
        let revoked = self
            .db
            .transaction(self.deadline, move |tx| {
                if tx.find_refresh_token(refresh_token_id)?.is_none() {
                    return Err(ServiceError::RefreshTokenNotFound);
                }
                Ok(tx.mark_refresh_token_used(
                    refresh_token_id,
                    now_utc(),
                    TokenRetirement::Revoked,
                )?)
            })
            .await?;

        debug!(%refresh_token_id, already_used = revoked == 0, "logout");
        Ok(())
    }

    /// Logs out the session an access token belongs to, even if the access
    /// token itself has expired.
    pub async fn logout_with_access_token(&self, access_token: &str) -> ServiceResult<()> {
        let claims = self.issuer.verify_ignoring_expiry(access_token)?;
        self.logout(claims.refresh_token_id).await
    }

    /// Resolves a bearer token to a principal. The token must verify and its
    /// refresh record must still be live.
    pub async fn authenticate(&self, bearer: &str) -> ServiceResult<Principal> {
        if let Some(admin_token) = &self.admin_token {
            if is_admin_token(bearer, admin_token) {
                return Ok(Principal::Admin);
            }
        }

        let claims = self.issuer.verify(bearer)?;
        let token_id = claims.refresh_token_id;
        let record = self
            .db
            .transaction(self.deadline, move |tx| {
                Ok::<_, ServiceError>(tx.find_refresh_token(token_id)?)
            })
            .await?
            .ok_or(ServiceError::InvalidAccessToken)?;

        if record.user_id != claims.sub || record.used || record.is_expired(now_utc()) {
            return Err(ServiceError::InvalidAccessToken);
        }

        Ok(Principal::User {
            user_id: claims.sub,
            refresh_token_id: token_id,
        })
    }

    fn tokens(&self, pair: IssuedPair) -> TokensPair {
        TokensPair {
            access_token: pair.access_token,
            refresh_token: pair.refresh_secret,
            expires_in: self.issuer.access_ttl().num_seconds(),
        }
    }
}

fn dummy_hash(hasher: &SecretHasher) -> Option<String> {
    match hasher.hash("docvault-unknown-login") {
        Ok(hash) => Some(hash),
        Err(err) => {
            warn!(error = %err, "failed to prepare dummy password hash");
            None
        }
    }
}

fn is_admin_token(bearer: &str, admin_token: &str) -> bool {
    bearer.as_bytes().ct_eq(admin_token.as_bytes()).into()
}
