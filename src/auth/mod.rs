pub mod jwt;
pub mod password;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use uuid::Uuid;

use crate::{
    error::{AppError, ServiceError},
    state::AppState,
    store::Database,
};

/// Who is making a request. Resolved once at the boundary and passed
/// explicitly into every service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    Anonymous,
    User {
        user_id: Uuid,
        refresh_token_id: Uuid,
    },
    Admin,
}

impl Principal {
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Principal::User { user_id, .. } => Some(*user_id),
            _ => None,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Principal::Admin)
    }

    /// True for the user themselves or an admin.
    pub fn acts_for(&self, user_id: Uuid) -> bool {
        self.is_admin() || self.user_id() == Some(user_id)
    }
}

#[async_trait]
impl<D: Database> FromRequestParts<AppState<D>> for Principal {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState<D>,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::unauthorized())?;

        state
            .sessions
            .authenticate(bearer.token())
            .await
            .map_err(|err| match err {
                ServiceError::StorageUnavailable(_) | ServiceError::Internal(_) => err.into(),
                _ => AppError::unauthorized(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acts_for_self_or_admin_only() {
        let me = Uuid::new_v4();
        let user = Principal::User {
            user_id: me,
            refresh_token_id: Uuid::new_v4(),
        };
        assert!(user.acts_for(me));
        assert!(!user.acts_for(Uuid::new_v4()));
        assert!(Principal::Admin.acts_for(me));
        assert!(!Principal::Anonymous.acts_for(me));
    }
}
