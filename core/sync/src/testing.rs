//! Shared fixtures for refresher and scheduler tests.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tempfile::TempDir;

use crate::context::SyncContext;
use crate::state::{SyncStateStore, STATE_FILE_NAME};
use calvault_common::{CredentialPayload, Event, ProviderKind};
use calvault_crypto::MasterKey;
use calvault_providers::{AdapterRegistry, MemoryAdapter};
use calvault_vault::{CredentialStore, KeyContext};

pub(crate) struct Fixture {
    pub dir: TempDir,
    pub ctx: Arc<SyncContext>,
    pub icloud: Arc<MemoryAdapter>,
    pub google: Arc<MemoryAdapter>,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_adapters(
            MemoryAdapter::new(ProviderKind::ICloud),
            MemoryAdapter::new(ProviderKind::Google),
        )
        .await
    }

    pub async fn with_adapters(icloud: MemoryAdapter, google: MemoryAdapter) -> Self {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::open(dir.path().join("credentials"))
            .await
            .unwrap();
        let states = SyncStateStore::open(dir.path().join(STATE_FILE_NAME))
            .await
            .unwrap();

        let icloud = Arc::new(icloud);
        let google = Arc::new(google);
        let mut registry = AdapterRegistry::new();
        registry.register(icloud.clone()).unwrap();
        registry.register(google.clone()).unwrap();

        let ctx = SyncContext::new(
            Arc::new(KeyContext::new(MasterKey::generate(1))),
            Arc::new(store),
            registry,
            states,
        );

        Self {
            dir,
            ctx: Arc::new(ctx),
            icloud,
            google,
        }
    }

    pub async fn add_password(&self, label: &str) {
        let payload = CredentialPayload::Password {
            apple_id: format!("{}@icloud.com", label.to_lowercase()),
            password: "abcd-efgh-ijkl-mnop".to_string(),
        };
        self.ctx
            .keys
            .save(&self.ctx.store, label, ProviderKind::ICloud, &payload)
            .await
            .unwrap();
    }

    pub async fn add_oauth(&self, label: &str, expires_at: DateTime<Utc>) {
        let payload = CredentialPayload::OAuth {
            access_token: "ya29.initial".to_string(),
            refresh_token: "1//initial".to_string(),
            expires_at,
        };
        self.ctx
            .keys
            .save(&self.ctx.store, label, ProviderKind::Google, &payload)
            .await
            .unwrap();
    }

    pub async fn payload(&self, label: &str) -> CredentialPayload {
        self.ctx.keys.load(&self.ctx.store, label).await.unwrap().1
    }
}

/// Midnight UTC of the current day.
pub(crate) fn today() -> DateTime<Utc> {
    Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
}

/// One-hour event starting `hours` after today's midnight.
pub(crate) fn event(id: &str, hours: i64) -> Event {
    let start = today() + Duration::hours(hours);
    Event {
        id: id.to_string(),
        start,
        end: start + Duration::hours(1),
        all_day: false,
        title: format!("Event {}", id),
        location: None,
        recurrence_rule: None,
        timezone: None,
        exdates: Vec::new(),
        calendar: Some("Home".to_string()),
        source_account: String::new(),
    }
}
