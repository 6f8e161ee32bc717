//! REST client for the hosted database.
//!
//! Speaks the PostgREST dialect: filters go in the query string
//! (`id=eq.<value>`), stored procedures live under `/rpc`, and every request
//! carries the service key as both `apikey` and bearer token.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::Method;
use serde_json::json;
use std::time::Duration;

use crate::audit::{AuditEvent, AuditLog};
use crate::catalog::{Catalog, Product};
use crate::config::DatastoreConfig;
use crate::entitlement::{EntitlementOracle, EntitlementRecord};

#[derive(Clone)]
pub struct RestDatastore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RestDatastore {
    pub fn new(config: &DatastoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}/rest/v1/{}", self.base_url, path))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }
}

#[async_trait]
impl EntitlementOracle for RestDatastore {
    #[tracing::instrument(skip(self))]
    async fn has_active_entitlement(&self, subject_id: &str) -> anyhow::Result<bool> {
        let active = self
            .request(Method::POST, "rpc/has_active_subscription")
            .json(&json!({ "user_uuid": subject_id }))
            .send()
            .await?
            .error_for_status()?
            .json::<bool>()
            .await?;
        Ok(active)
    }

    #[tracing::instrument(skip(self))]
    async fn active_entitlement(
        &self,
        subject_id: &str,
    ) -> anyhow::Result<Option<EntitlementRecord>> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let rows: Vec<EntitlementRecord> = self
            .request(Method::GET, "subscriptions")
            .query(&[
                ("select", "id,user_id,plan,expires_at".to_string()),
                ("user_id", format!("eq.{subject_id}")),
                ("status", "eq.active".to_string()),
                ("or", format!("(expires_at.is.null,expires_at.gt.{now})")),
                ("order", "created_at.desc".to_string()),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl Catalog for RestDatastore {
    #[tracing::instrument(skip(self))]
    async fn find_product(&self, resource_id: &str) -> anyhow::Result<Option<Product>> {
        let rows: Vec<Product> = self
            .request(Method::GET, "products")
            .query(&[
                ("select", "id,title,author,is_active,file_url".to_string()),
                ("id", format!("eq.{resource_id}")),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl AuditLog for RestDatastore {
    #[tracing::instrument(skip(self, event), fields(action = ?event.action))]
    async fn append(&self, event: AuditEvent) -> anyhow::Result<()> {
        self.request(Method::POST, "download_audit")
            .header("Prefer", "return=minimal")
            .json(&event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
