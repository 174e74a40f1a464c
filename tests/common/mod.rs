#![allow(dead_code)]

use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, ensure, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use docvault::access::UploadRequest;
use docvault::auth::password::SecretHasher;
use docvault::auth::Principal;
use docvault::cache::{CacheError, FillTicket, LruMetadataCache, MetadataCache, ResolvedDocument};
use docvault::config::AppConfig;
use docvault::db;
use docvault::error::ServiceError;
use docvault::models::{Document, NewUser};
use docvault::notifier::{IpChangeEvent, IpChangeNotifier};
use docvault::routes;
use docvault::session::TokensPair;
use docvault::state::AppState;
use docvault::storage::ObjectStorage;
use docvault::store::{Database, MemoryDatabase, PgDatabase, StoreError};
use docvault::utils::now_utc;
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde::Serialize;
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

pub const ADMIN_TOKEN: &str = "test-admin-token";
pub const USER_AGENT: &str = "docvault-tests/1.0";
pub const CLIENT_IP: &str = "198.51.100.10";

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "postgres://unused@localhost/docvault".to_string(),
        database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
        database_transaction_timeout_ms: 2_000,
        server_host: "127.0.0.1".to_string(),
        server_port: 0,
        jwt_secret: "test-secret".to_string(),
        jwt_issuer: "test-issuer".to_string(),
        access_token_ttl_minutes: 15,
        refresh_token_ttl_hours: 24,
        secret_hash_memory_kib: 8,
        secret_hash_iterations: 1,
        admin_token: Some(ADMIN_TOKEN.to_string()),
        webhook_url: None,
        webhook_timeout_secs: 1,
        cache_ttl_secs: 300,
        cache_capacity: 128,
        presigned_url_ttl_secs: 60,
        upload_timeout_secs: 5,
        cors_allowed_origin: None,
        aws_endpoint_url: None,
        aws_access_key_id: None,
        aws_secret_access_key: None,
        aws_region: "us-east-1".to_string(),
        s3_bucket: "test-bucket".to_string(),
    }
}

pub fn test_hasher() -> SecretHasher {
    SecretHasher::new(8, 1).expect("test hasher parameters are valid")
}

#[derive(Clone)]
pub struct StoredObject {
    pub key: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<HashMap<String, StoredObject>>,
    deleted: Mutex<Vec<String>>,
    fail_deletes: AtomicBool,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn presign_put_object(
        &self,
        key: &str,
        content_type: &str,
        expires_in: Duration,
    ) -> Result<String> {
        Ok(format!(
            "https://fake-storage/{key}?method=PUT&content_type={content_type}&expires_in={}",
            expires_in.as_secs()
        ))
    }

    async fn presign_get_object(&self, key: &str, expires_in: Duration) -> Result<String> {
        Ok(format!(
            "https://fake-storage/{key}?expires_in={}",
            expires_in.as_secs()
        ))
    }

    async fn put_object(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let stored = StoredObject {
            key: key.to_string(),
            bytes,
            content_type: content_type.to_string(),
        };
        let mut guard = self.objects.lock().await;
        guard.insert(stored.key.clone(), stored);
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            bail!("object storage offline");
        }
        self.objects.lock().await.remove(key);
        self.deleted.lock().await.push(key.to_string());
        Ok(())
    }
}

impl FakeStorage {
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub async fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().await.get(key).cloned()
    }

    pub async fn deleted_keys(&self) -> Vec<String> {
        self.deleted.lock().await.clone()
    }

    /// Polls until the background upload for `key` lands.
    pub async fn wait_for(&self, key: &str) -> Result<StoredObject> {
        for _ in 0..100 {
            if let Some(object) = self.get(key).await {
                return Ok(object);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(anyhow!("object {key} never arrived"))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<IpChangeEvent>>,
}

#[async_trait]
impl IpChangeNotifier for RecordingNotifier {
    async fn notify(&self, event: &IpChangeEvent) -> Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

impl RecordingNotifier {
    pub async fn events(&self) -> Vec<IpChangeEvent> {
        self.events.lock().await.clone()
    }

    pub async fn wait_for_events(&self, count: usize) -> Result<Vec<IpChangeEvent>> {
        for _ in 0..100 {
            let events = self.events().await;
            if events.len() >= count {
                return Ok(events);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(anyhow!("expected {count} ip change events"))
    }
}

pub struct FailingNotifier;

#[async_trait]
impl IpChangeNotifier for FailingNotifier {
    async fn notify(&self, _event: &IpChangeEvent) -> Result<()> {
        bail!("webhook endpoint unreachable")
    }
}

/// Never completes, like a webhook endpoint that accepts the connection and stalls.
pub struct HangingNotifier;

#[async_trait]
impl IpChangeNotifier for HangingNotifier {
    async fn notify(&self, _event: &IpChangeEvent) -> Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Cache whose every operation fails.
pub struct BrokenCache;

#[async_trait]
impl MetadataCache for BrokenCache {
    async fn get(&self, _id: Uuid) -> Result<Option<ResolvedDocument>, CacheError> {
        Err(CacheError::Unavailable("cache down".into()))
    }

    async fn set(&self, _entry: ResolvedDocument) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("cache down".into()))
    }

    async fn ticket(&self) -> Result<FillTicket, CacheError> {
        Err(CacheError::Unavailable("cache down".into()))
    }

    async fn set_if_unchanged(
        &self,
        _ticket: FillTicket,
        _entry: ResolvedDocument,
    ) -> Result<bool, CacheError> {
        Err(CacheError::Unavailable("cache down".into()))
    }

    async fn invalidate(&self, _id: Uuid) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("cache down".into()))
    }
}

pub struct TestOptions {
    pub cache_ttl: Duration,
    pub transaction_timeout: Duration,
    pub cache: Option<Arc<dyn MetadataCache>>,
    pub notifier: Option<Arc<dyn IpChangeNotifier>>,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            transaction_timeout: Duration::from_secs(2),
            cache: None,
            notifier: None,
        }
    }
}

pub struct TestApp {
    pub state: AppState<MemoryDatabase>,
    pub db: MemoryDatabase,
    pub storage: Arc<FakeStorage>,
    pub notifier: Arc<RecordingNotifier>,
    pub cache: Arc<dyn MetadataCache>,
    hasher: SecretHasher,
    router: Router,
}

impl TestApp {
    pub fn new() -> Result<Self> {
        Self::with_options(TestOptions::default())
    }

    /// Same app with caching turned off.
    pub fn uncached() -> Result<Self> {
        Self::with_options(TestOptions {
            cache_ttl: Duration::ZERO,
            ..TestOptions::default()
        })
    }

    pub fn with_options(options: TestOptions) -> Result<Self> {
        let mut config = test_config();
        config.cache_ttl_secs = options.cache_ttl.as_secs();
        config.database_transaction_timeout_ms = options.transaction_timeout.as_millis() as u64;

        let db = MemoryDatabase::new();
        let storage = Arc::new(FakeStorage::default());
        let recording = Arc::new(RecordingNotifier::default());
        let notifier: Arc<dyn IpChangeNotifier> = match options.notifier {
            Some(notifier) => notifier,
            None => recording.clone(),
        };
        let cache: Arc<dyn MetadataCache> = match options.cache {
            Some(cache) => cache,
            None => Arc::new(LruMetadataCache::new(
                config.cache_capacity,
                options.cache_ttl,
            )),
        };
        let hasher = test_hasher();
        let storage_for_state: Arc<dyn ObjectStorage> = storage.clone();

        let state = AppState::new(
            config,
            db.clone(),
            storage_for_state,
            cache.clone(),
            notifier,
            hasher.clone(),
        );
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            db,
            storage,
            notifier: recording,
            cache,
            hasher,
            router,
        })
    }

    pub async fn insert_user(&self, login: &str, password: &str) -> Result<Uuid> {
        insert_user(&self.db, &self.hasher, login, password).await
    }

    pub async fn login(&self, login: &str, password: &str) -> Result<TokensPair, ServiceError> {
        self.state
            .sessions
            .login(login, password, USER_AGENT, CLIENT_IP)
            .await
    }

    pub async fn refresh(&self, pair: &TokensPair) -> Result<TokensPair, ServiceError> {
        self.state
            .sessions
            .refresh(
                USER_AGENT,
                CLIENT_IP,
                &pair.access_token,
                &pair.refresh_token,
            )
            .await
    }

    pub async fn principal(&self, access_token: &str) -> Result<Principal> {
        self.state
            .sessions
            .authenticate(access_token)
            .await
            .context("access token did not authenticate")
    }

    /// Registers a user, logs them in and returns their principal.
    pub async fn user_session(&self, login: &str) -> Result<(Uuid, Principal, TokensPair)> {
        let user_id = self.insert_user(login, "password").await?;
        let pair = self.login(login, "password").await?;
        let principal = self.principal(&pair.access_token).await?;
        Ok((user_id, principal, pair))
    }

    pub async fn create_document(
        &self,
        owner: &Principal,
        name: &str,
        is_public: bool,
    ) -> Result<Document> {
        let created = self
            .state
            .documents
            .create_document(
                owner,
                UploadRequest {
                    original_name: name.to_string(),
                    size_bytes: 11,
                    mime_type: "text/plain".to_string(),
                    content_hash: "00".repeat(32),
                    is_public,
                },
            )
            .await?;
        Ok(created.document)
    }

    pub async fn send(&self, request: Request<Body>) -> Result<hyper::Response<Body>> {
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.json_request(Method::POST, path, payload, token).await
    }

    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.json_request(Method::PUT, path, payload, token).await
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let request = base_request(Method::GET, path, token).body(Body::empty())?;
        self.send(request).await
    }

    pub async fn delete(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let request = base_request(Method::DELETE, path, token).body(Body::empty())?;
        self.send(request).await
    }

    pub async fn upload_document(
        &self,
        filename: &str,
        content_type: &str,
        data: &[u8],
        public: Option<bool>,
        token: &str,
    ) -> Result<hyper::Response<Body>> {
        let boundary = format!("boundary-{}", Uuid::new_v4());
        let mut body = Vec::new();
        body.extend(format!("--{boundary}\r\n").as_bytes());
        body.extend(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
                filename
            )
            .as_bytes(),
        );
        body.extend(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
        body.extend(data);
        body.extend(b"\r\n");

        if let Some(public) = public {
            body.extend(format!("--{boundary}\r\n").as_bytes());
            body.extend(b"Content-Disposition: form-data; name=\"public\"\r\n\r\n");
            body.extend(public.to_string().as_bytes());
            body.extend(b"\r\n");
        }

        body.extend(format!("--{boundary}--\r\n").as_bytes());

        let request = base_request(Method::POST, "/api/docs", Some(token))
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))?;
        self.send(request).await
    }

    async fn json_request<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let request = base_request(method, path, token)
            .header("content-type", "application/json")
            .body(Body::from(body))?;
        self.send(request).await
    }
}

/// Request builder carrying the default client headers.
pub fn base_request(method: Method, path: &str, token: Option<&str>) -> axum::http::request::Builder {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("user-agent", USER_AGENT)
        .header("x-forwarded-for", CLIENT_IP);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder
}

pub async fn insert_user<D: Database>(
    db: &D,
    hasher: &SecretHasher,
    login: &str,
    password: &str,
) -> Result<Uuid> {
    let now = now_utc();
    let user = NewUser {
        id: Uuid::new_v4(),
        login: login.to_string(),
        password_hash: hasher.hash(password)?,
        created_at: now,
        updated_at: now,
    };
    let id = user.id;
    db.transaction(Duration::from_secs(5), move |tx| {
        tx.insert_user(&user)?;
        Ok::<_, StoreError>(())
    })
    .await
    .context("failed to insert user")?;
    Ok(id)
}

pub async fn expect_status(response: hyper::Response<Body>, status: StatusCode) -> Result<Vec<u8>> {
    let actual = response.status();
    let body = body_to_vec(response.into_body()).await?;
    ensure!(
        actual == status,
        "expected {status}, got {actual}: {}",
        String::from_utf8_lossy(&body)
    );
    Ok(body)
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

/// Postgres store for the database-backed suite, or `None` when
/// `TEST_DATABASE_URL` is not set.
pub async fn postgres_database() -> Result<Option<PgDatabase>> {
    let Ok(database_url) = env::var("TEST_DATABASE_URL") else {
        return Ok(None);
    };

    let pool = db::init_pool_with_size(&database_url, 4)?;
    let prepared = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        use diesel::connection::SimpleConnection;

        db::run_migrations(&prepared)?;
        let mut conn = prepared
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.batch_execute(
            "TRUNCATE TABLE document_grants, refresh_tokens, documents, users RESTART IDENTITY CASCADE;",
        )
        .context("failed to truncate tables")?;
        Ok(())
    })
    .await
    .context("migration task panicked")??;

    Ok(Some(PgDatabase::new(pool)))
}
