//! In-memory collaborators and fixtures shared by unit tests.

use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::AppState;
use crate::audit::{AuditEvent, AuditLog};
use crate::catalog::{Catalog, Product};
use crate::claims::unix_now;
use crate::codec::TokenCodec;
use crate::config::{DatastoreConfig, IdentityConfig, Settings, TelemetryConfig};
use crate::delivery::FileDelivery;
use crate::entitlement::{EntitlementOracle, EntitlementRecord};
use crate::issuance::IssuanceService;
use crate::middleware::with_request_info;
use crate::redemption::RedemptionService;
use crate::session::SessionVerifier;

pub const TEST_SECRET: &str = "test-signing-secret";

pub fn settings() -> Settings {
    Settings {
        port: 8080,
        signing_secret: TEST_SECRET.to_string(),
        token_ttl_minutes: 15,
        single_use_tokens: false,
        identity: IdentityConfig {
            jwks_url: "http://identity.invalid/jwks.json".to_string(),
            validate_token: false,
            audience: None,
        },
        datastore: DatastoreConfig {
            url: "http://datastore.invalid".to_string(),
            api_key: "service-key".to_string(),
            timeout_secs: 5,
        },
        telemetry: TelemetryConfig::default(),
    }
}

/// An unsigned-looking session token; only accepted with validation off.
pub fn session_token(sub: &str) -> String {
    encode(
        &Header::default(),
        &json!({ "sub": sub, "email": format!("{sub}@example.com"), "exp": unix_now() + 600 }),
        &EncodingKey::from_secret(b"identity-provider-test-key"),
    )
    .unwrap()
}

pub fn bearer_headers(sub: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        format!("Bearer {}", session_token(sub)).parse().unwrap(),
    );
    headers
}

#[derive(Default)]
pub struct InMemoryCatalog {
    products: Mutex<HashMap<String, Product>>,
}

impl InMemoryCatalog {
    pub fn insert(&self, product: Product) {
        self.products
            .lock()
            .unwrap()
            .insert(product.id.clone(), product);
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn find_product(&self, resource_id: &str) -> anyhow::Result<Option<Product>> {
        Ok(self.products.lock().unwrap().get(resource_id).cloned())
    }
}

#[derive(Default)]
pub struct FakeEntitlements {
    active: Mutex<HashSet<String>>,
    records: Mutex<HashMap<String, EntitlementRecord>>,
    failing: AtomicBool,
}

impl FakeEntitlements {
    pub fn grant(&self, subject_id: &str) {
        self.active.lock().unwrap().insert(subject_id.to_string());
        self.records.lock().unwrap().insert(
            subject_id.to_string(),
            EntitlementRecord {
                id: format!("sub-{subject_id}"),
                subject_id: subject_id.to_string(),
                plan: Some("monthly".to_string()),
                expires_at: None,
            },
        );
    }

    pub fn revoke(&self, subject_id: &str) {
        self.active.lock().unwrap().remove(subject_id);
        self.records.lock().unwrap().remove(subject_id);
    }

    /// Leaves the boolean check passing while the record disappears.
    pub fn drop_record(&self, subject_id: &str) {
        self.records.lock().unwrap().remove(subject_id);
    }

    pub fn fail_checks(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl EntitlementOracle for FakeEntitlements {
    async fn has_active_entitlement(&self, subject_id: &str) -> anyhow::Result<bool> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("entitlement store unreachable");
        }
        Ok(self.active.lock().unwrap().contains(subject_id))
    }

    async fn active_entitlement(
        &self,
        subject_id: &str,
    ) -> anyhow::Result<Option<EntitlementRecord>> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("entitlement store unreachable");
        }
        Ok(self.records.lock().unwrap().get(subject_id).cloned())
    }
}

#[derive(Default)]
pub struct RecordingAudit {
    events: Mutex<Vec<AuditEvent>>,
    request_ids: Mutex<Vec<String>>,
    failing: bool,
    delay: Option<Duration>,
}

impl RecordingAudit {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Takes `delay` to acknowledge every write.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Request ids in scope when each write reached the log.
    pub fn request_ids(&self) -> Vec<String> {
        self.request_ids.lock().unwrap().clone()
    }

    /// Writes happen on background tasks; waits until `count` have landed.
    pub async fn wait_for_events(&self, count: usize) -> Vec<AuditEvent> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let events = self.events();
                if events.len() >= count {
                    return events;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("audit events were not written in time")
    }
}

#[async_trait]
impl AuditLog for RecordingAudit {
    async fn append(&self, event: AuditEvent) -> anyhow::Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing {
            anyhow::bail!("audit table unavailable");
        }
        let request_id = with_request_info(|ctx| ctx.request_id.clone());
        self.request_ids.lock().unwrap().push(request_id);
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// A small storefront: `P1` and `P2` downloadable, `retired` withdrawn,
/// `nofile` without an uploaded file. `U1` and `U3` subscribe, `U2` does not.
pub struct Fixture {
    pub catalog: Arc<InMemoryCatalog>,
    pub entitlements: Arc<FakeEntitlements>,
    pub audit: Arc<RecordingAudit>,
    codec: TokenCodec,
}

impl Fixture {
    pub fn new() -> Self {
        Self::build("https://storage.example", RecordingAudit::default())
    }

    pub fn with_failing_audit() -> Self {
        Self::build("https://storage.example", RecordingAudit::failing())
    }

    pub fn with_audit(audit: RecordingAudit) -> Self {
        Self::build("https://storage.example", audit)
    }

    /// Files are served from `storage_url` (usually a mock server).
    pub fn with_storage(storage_url: &str) -> Self {
        Self::build(storage_url, RecordingAudit::default())
    }

    fn build(storage_url: &str, audit: RecordingAudit) -> Self {
        let catalog = InMemoryCatalog::default();
        let product = |id: &str, title: &str, author: &str, active: bool, file: Option<&str>| {
            Product {
                id: id.to_string(),
                title: title.to_string(),
                author: author.to_string(),
                is_active: active,
                file_url: file.map(|f| format!("{storage_url}/ebooks/{f}")),
            }
        };
        catalog.insert(product("P1", "Dune", "Frank Herbert", true, Some("dune.pdf")));
        catalog.insert(product(
            "P2",
            "Foundation",
            "Isaac Asimov",
            true,
            Some("foundation.epub"),
        ));
        catalog.insert(product("retired", "Old", "Nobody", false, Some("old.pdf")));
        catalog.insert(product("nofile", "Draft", "Somebody", true, None));

        let entitlements = FakeEntitlements::default();
        entitlements.grant("U1");
        entitlements.grant("U3");

        Self {
            catalog: Arc::new(catalog),
            entitlements: Arc::new(entitlements),
            audit: Arc::new(audit),
            codec: TokenCodec::from_settings(&settings()),
        }
    }

    pub fn codec(&self) -> TokenCodec {
        self.codec.clone()
    }

    pub fn issuance(&self) -> IssuanceService {
        IssuanceService::new(
            self.codec(),
            self.catalog.clone(),
            self.entitlements.clone(),
            self.audit.clone(),
        )
    }

    pub fn redemption(&self) -> RedemptionService {
        RedemptionService::new(
            self.codec(),
            self.catalog.clone(),
            self.entitlements.clone(),
            self.audit.clone(),
        )
    }

    /// Application state wired to this fixture, with session tokens decoded
    /// without signature validation.
    pub fn app_state(&self) -> Arc<AppState> {
        let settings = settings();
        Arc::new(AppState {
            sessions: SessionVerifier::new(settings.identity, reqwest::Client::new()),
            issuance: self.issuance(),
            redemption: self.redemption(),
            delivery: FileDelivery::new(reqwest::Client::new()),
        })
    }
}
