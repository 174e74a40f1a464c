use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::AppConfig;

/// Payload posted when a refresh arrives from a different address than the
/// one the token was issued to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpChangeEvent {
    pub user_id: Uuid,
    pub new_ip: String,
    pub old_ip: String,
}

#[async_trait]
pub trait IpChangeNotifier: Send + Sync + 'static {
    async fn notify(&self, event: &IpChangeEvent) -> Result<()>;
}

/// Posts IP-change events as JSON. Without a URL every call is a no-op.
pub struct WebhookNotifier {
    client: Client,
    url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build webhook client")?;
        Ok(Self { client, url })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::new(config.webhook_url.clone(), config.webhook_timeout())
    }
}

#[async_trait]
impl IpChangeNotifier for WebhookNotifier {
    async fn notify(&self, event: &IpChangeEvent) -> Result<()> {
        let Some(url) = &self.url else {
            debug!(user_id = %event.user_id, "webhook url not configured; skipping ip change notice");
            return Ok(());
        };

        let response = self
            .client
            .post(url)
            .json(event)
            .send()
            .await
            .context("webhook request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("webhook responded with {status}: {body}"));
        }
        Ok(())
    }
}

pub struct NoopNotifier;

#[async_trait]
impl IpChangeNotifier for NoopNotifier {
    async fn notify(&self, _event: &IpChangeEvent) -> Result<()> {
        Ok(())
    }
}

/// Sends the event on a detached task. The caller never waits on delivery.
pub fn dispatch(notifier: Arc<dyn IpChangeNotifier>, event: IpChangeEvent) {
    tokio::spawn(async move {
        if let Err(err) = notifier.notify(&event).await {
            warn!(
                user_id = %event.user_id,
                new_ip = %event.new_ip,
                old_ip = %event.old_ip,
                error = %err,
                "ip change notification failed"
            );
        }
    });
}
