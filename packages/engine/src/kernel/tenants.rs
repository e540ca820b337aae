//! Read-only tenant directory: store endpoint, access token, billing plan.
//!
//! Plan mapping itself is owned elsewhere; the engine only needs to know
//! where a tenant's store lives and whether the free-tier cap applies.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "tenant_plan", rename_all = "snake_case")]
pub enum Plan {
    #[default]
    Free,
    Pro,
}

#[derive(FromRow, Debug, Clone)]
pub struct TenantRecord {
    pub tenant: String,
    pub api_endpoint: String,
    pub api_token: String,
    pub plan: Plan,
}

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn get(&self, tenant: &str) -> Result<Option<TenantRecord>>;
}

pub struct PgTenantDirectory {
    pool: PgPool,
}

impl PgTenantDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantDirectory for PgTenantDirectory {
    async fn get(&self, tenant: &str) -> Result<Option<TenantRecord>> {
        let record = sqlx::query_as::<_, TenantRecord>(
            "SELECT tenant, api_endpoint, api_token, plan FROM tenants WHERE tenant = $1",
        )
        .bind(tenant)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }
}

/// In-memory directory for tests.
#[derive(Default)]
pub struct MemoryTenantDirectory {
    records: Mutex<HashMap<String, TenantRecord>>,
}

impl MemoryTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: TenantRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.tenant.clone(), record);
    }

    /// Convenience: register a tenant with a given plan.
    pub fn with_tenant(self, tenant: &str, plan: Plan) -> Self {
        self.insert(TenantRecord {
            tenant: tenant.to_string(),
            api_endpoint: format!("https://{tenant}.example.com/admin/api/graphql"),
            api_token: "test-token".into(),
            plan,
        });
        self
    }
}

#[async_trait]
impl TenantDirectory for MemoryTenantDirectory {
    async fn get(&self, tenant: &str) -> Result<Option<TenantRecord>> {
        Ok(self.records.lock().unwrap().get(tenant).cloned())
    }
}
