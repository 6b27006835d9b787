// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Short-lived tenant credentials and the per-tenant cache in front of them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::cloud::{CloudClients, CloudConnector, CloudError};

/// Temporary access credentials obtained by assuming a tenant's role.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token bound to the assumed role.
    pub session_token: String,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
}

impl Credentials {
    /// Whether the credentials are no longer valid at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the credentials expire within `margin` of `now`.
    pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin >= self.expires_at
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Exchanges a delegated role for short-lived credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Assume `role_id` on behalf of `tenant_id`.
    async fn assume_role(&self, tenant_id: &str, role_id: &str) -> Result<Credentials, CloudError>;
}

/// Issues random credentials with a fixed lifetime. Used for local runs.
pub struct StaticCredentialProvider {
    lifetime: Duration,
    issued: AtomicU32,
}

impl Default for StaticCredentialProvider {
    fn default() -> Self {
        Self::with_lifetime(Duration::hours(23))
    }
}

impl StaticCredentialProvider {
    /// Issue credentials valid for `lifetime`.
    pub fn with_lifetime(lifetime: Duration) -> Self {
        Self {
            lifetime,
            issued: AtomicU32::new(0),
        }
    }

    /// Number of credentials issued so far.
    pub fn issued(&self) -> u32 {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn assume_role(&self, tenant_id: &str, role_id: &str) -> Result<Credentials, CloudError> {
        if role_id.is_empty() {
            return Err(CloudError::Rejected(format!(
                "tenant '{tenant_id}' has no delegated role"
            )));
        }
        self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(Credentials {
            access_key_id: format!("AK{}", Uuid::new_v4().simple()),
            secret_access_key: Uuid::new_v4().simple().to_string(),
            session_token: Uuid::new_v4().to_string(),
            expires_at: Utc::now() + self.lifetime,
        })
    }
}

struct CachedCredentials {
    role_id: String,
    credentials: Credentials,
}

/// Per-tenant credential cache.
///
/// Entries are reused until they come within the refresh margin of their
/// expiry, then replaced by a fresh exchange.
pub struct CredentialCache {
    provider: Arc<dyn CredentialProvider>,
    refresh_margin: Duration,
    entries: Mutex<HashMap<String, CachedCredentials>>,
}

impl CredentialCache {
    /// Default margin before expiry at which credentials are refreshed.
    pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::minutes(5);

    /// Create a cache with the default refresh margin.
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self::with_refresh_margin(provider, Self::DEFAULT_REFRESH_MARGIN)
    }

    /// Create a cache with a custom refresh margin.
    pub fn with_refresh_margin(provider: Arc<dyn CredentialProvider>, margin: Duration) -> Self {
        Self {
            provider,
            refresh_margin: margin,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Credentials for a tenant, exchanging the role if the cached entry is
    /// missing, for another role, or close to expiry.
    pub async fn get(&self, tenant_id: &str, role_id: &str) -> Result<Credentials, CloudError> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();

        if let Some(cached) = entries.get(tenant_id)
            && cached.role_id == role_id
            && !cached.credentials.expires_within(now, self.refresh_margin)
        {
            return Ok(cached.credentials.clone());
        }

        let credentials = self.provider.assume_role(tenant_id, role_id).await?;
        debug!(
            tenant_id,
            expires_at = %credentials.expires_at,
            "Refreshed tenant credentials"
        );
        entries.insert(
            tenant_id.to_string(),
            CachedCredentials {
                role_id: role_id.to_string(),
                credentials: credentials.clone(),
            },
        );
        Ok(credentials)
    }

    /// Drop a tenant's cached credentials.
    pub async fn invalidate(&self, tenant_id: &str) {
        self.entries.lock().await.remove(tenant_id);
    }
}

/// Credential cache plus connector: the one way to get cloud clients for a tenant.
pub struct CloudAccess {
    cache: CredentialCache,
    connector: Arc<dyn CloudConnector>,
}

impl CloudAccess {
    /// Combine a credential cache with a connector.
    pub fn new(cache: CredentialCache, connector: Arc<dyn CloudConnector>) -> Self {
        Self { cache, connector }
    }

    /// Clients for `tenant_id` in `region`, authenticated as `role_id`.
    pub async fn clients(
        &self,
        tenant_id: &str,
        role_id: &str,
        region: &str,
    ) -> Result<CloudClients, CloudError> {
        let credentials = self.cache.get(tenant_id, role_id).await?;
        self.connector.connect(region, &credentials).await
    }

    /// The underlying cache.
    pub fn cache(&self) -> &CredentialCache {
        &self.cache
    }
}
