use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use url::Url;

use crate::db::DEFAULT_MAX_POOL_SIZE;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_pool_size: u32,
    pub database_transaction_timeout_ms: u64,
    pub server_host: String,
    pub server_port: u16,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub access_token_ttl_minutes: i64,
    pub refresh_token_ttl_hours: i64,
    pub secret_hash_memory_kib: u32,
    pub secret_hash_iterations: u32,
    pub admin_token: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    pub presigned_url_ttl_secs: u64,
    pub upload_timeout_secs: u64,
    pub cors_allowed_origin: Option<String>,
    pub aws_endpoint_url: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_region: String,
    pub s3_bucket: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_pool_size = env::var("DATABASE_MAX_POOL_SIZE")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let jwt_secret = env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        let jwt_issuer = env::var("JWT_ISSUER").unwrap_or_else(|_| "docvault".to_string());

        Ok(Self {
            database_url,
            database_max_pool_size,
            database_transaction_timeout_ms: parsed("DATABASE_TRANSACTION_TIMEOUT_MS", 5000)?,
            server_host,
            server_port: parsed("SERVER_PORT", 3000)?,
            jwt_secret,
            jwt_issuer,
            access_token_ttl_minutes: parsed("ACCESS_TOKEN_TTL_MINUTES", 15)?,
            refresh_token_ttl_hours: parsed("REFRESH_TOKEN_TTL_HOURS", 720)?,
            secret_hash_memory_kib: parsed("SECRET_HASH_MEMORY_KIB", 19_456)?,
            secret_hash_iterations: parsed("SECRET_HASH_ITERATIONS", 2)?,
            admin_token: optional("ADMIN_TOKEN"),
            webhook_url: optional("WEBHOOK_URL"),
            webhook_timeout_secs: parsed("WEBHOOK_TIMEOUT_SECS", 5)?,
            cache_ttl_secs: parsed("CACHE_TTL_SECS", 300)?,
            cache_capacity: parsed("CACHE_CAPACITY", 10_000)?,
            presigned_url_ttl_secs: parsed("PRESIGNED_URL_TTL_SECS", 900)?,
            upload_timeout_secs: parsed("UPLOAD_TIMEOUT_SECS", 1800)?,
            cors_allowed_origin: optional("CORS_ALLOWED_ORIGIN"),
            aws_endpoint_url: optional("AWS_ENDPOINT_URL"),
            aws_access_key_id: optional("AWS_ACCESS_KEY_ID"),
            aws_secret_access_key: optional("AWS_SECRET_ACCESS_KEY"),
            aws_region: env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            s3_bucket: env::var("S3_BUCKET").context("S3_BUCKET must be set")?,
        })
    }

    pub fn redacted_database_url(&self) -> String {
        redact_database_url(&self.database_url)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.database_transaction_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn presigned_url_ttl(&self) -> Duration {
        Duration::from_secs(self.presigned_url_ttl_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parsed<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} must be a valid {}", std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}

fn redact_database_url(raw: &str) -> String {
    let Ok(mut parsed) = Url::parse(raw) else {
        return "***".to_string();
    };
    if parsed.password().is_some() && parsed.set_password(Some("*****")).is_err() {
        return "***".to_string();
    }
    parsed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_password_is_masked() {
        assert_eq!(
            redact_database_url("postgres://docvault:hunter2@db:5432/docvault"),
            "postgres://docvault:*****@db:5432/docvault"
        );
    }

    #[test]
    fn database_url_without_password_is_left_alone() {
        assert_eq!(
            redact_database_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
        assert_eq!(
            redact_database_url("postgres://docvault@localhost/db"),
            "postgres://docvault@localhost/db"
        );
    }

    #[test]
    fn falls_back_when_parse_fails() {
        assert_eq!(redact_database_url("not a url"), "***");
    }

    #[test]
    fn parsed_uses_default_when_unset() {
        let value: u64 = parsed("DOCVAULT_TEST_SURELY_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
