use std::sync::Arc;

use crate::{
    access::AccessResolver,
    auth::{jwt::TokenIssuer, password::SecretHasher},
    cache::MetadataCache,
    config::AppConfig,
    notifier::IpChangeNotifier,
    session::SessionService,
    storage::ObjectStorage,
    store::Database,
    users::UserService,
};

pub struct AppState<D> {
    pub config: Arc<AppConfig>,
    pub sessions: Arc<SessionService<D>>,
    pub documents: Arc<AccessResolver<D>>,
    pub users: Arc<UserService<D>>,
    pub storage: Arc<dyn ObjectStorage>,
}

impl<D> Clone for AppState<D> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            sessions: self.sessions.clone(),
            documents: self.documents.clone(),
            users: self.users.clone(),
            storage: self.storage.clone(),
        }
    }
}

impl<D: Database + Clone> AppState<D> {
    pub fn new(
        config: AppConfig,
        db: D,
        storage: Arc<dyn ObjectStorage>,
        cache: Arc<dyn MetadataCache>,
        notifier: Arc<dyn IpChangeNotifier>,
        hasher: SecretHasher,
    ) -> Self {
        let deadline = config.transaction_timeout();
        let issuer = TokenIssuer::from_config(&config, hasher.clone());

        let sessions = SessionService::new(db.clone(), issuer, hasher.clone(), notifier, deadline)
            .with_admin_token(config.admin_token.clone());
        let documents = Arc::new(AccessResolver::new(
            db.clone(),
            cache,
            storage.clone(),
            deadline,
            config.presigned_url_ttl(),
        ));
        let users = UserService::new(db, hasher, documents.clone(), storage.clone(), deadline);

        Self {
            config: Arc::new(config),
            sessions: Arc::new(sessions),
            documents,
            users: Arc::new(users),
            storage,
        }
    }
}
