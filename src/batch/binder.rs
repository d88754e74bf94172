//! Connection binder.
//!
//! Produces the connection context each target executes against. Pooled
//! contexts are cached by instance key and shared with later targets; owned
//! contexts belong to the caller for one target and must be released.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{DatabaseHandle, ExecutionTarget};
use crate::db::{ConnectOptions, Connector, ServerClient};
use crate::error::Result;
use crate::instance::{CredentialClassifier, InstanceSpec};

/// Who is responsible for closing a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Shared; left open for reuse.
    Pooled,
    /// Exclusively owned by the current target; closed on release.
    Owned,
}

/// A connection context bound to one target.
pub struct BoundContext {
    client: Arc<dyn ServerClient>,
    label: String,
    ownership: Ownership,
}

impl BoundContext {
    pub fn client(&self) -> &dyn ServerClient {
        self.client.as_ref()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Releases the context. Owned contexts are closed, pooled ones are not.
    pub async fn release(self) -> Result<()> {
        match self.ownership {
            Ownership::Pooled => Ok(()),
            Ownership::Owned => {
                debug!(target_name = %self.label, "Closing non-pooled connection");
                self.client.close().await
            }
        }
    }
}

impl fmt::Debug for BoundContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundContext")
            .field("label", &self.label)
            .field("ownership", &self.ownership)
            .finish_non_exhaustive()
    }
}

/// Binds execution targets to connection contexts.
pub struct ConnectionBinder {
    connector: Arc<dyn Connector>,
    options: ConnectOptions,
    classifier: Arc<dyn CredentialClassifier>,
    pool: Mutex<HashMap<String, Arc<dyn ServerClient>>>,
}

impl ConnectionBinder {
    pub fn new(
        connector: Arc<dyn Connector>,
        options: ConnectOptions,
        classifier: Arc<dyn CredentialClassifier>,
    ) -> Self {
        Self {
            connector,
            options,
            classifier,
            pool: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if connections for `spec` must not be pooled.
    pub fn requires_unpooled(&self, spec: &InstanceSpec) -> bool {
        !self.options.pooled
            || spec
                .user()
                .map(|user| self.classifier.is_domain_identity(user))
                .unwrap_or(false)
    }

    /// Binds a target.
    ///
    /// Returns `Ok(None)` when a database handle points at a database the
    /// login cannot access; the caller skips that target.
    pub async fn bind(&self, target: &ExecutionTarget) -> Result<Option<BoundContext>> {
        match target {
            ExecutionTarget::Database(handle) => self.bind_database(handle).await,
            ExecutionTarget::Instance(spec) => self.bind_instance(spec).await.map(Some),
        }
    }

    async fn bind_database(&self, handle: &DatabaseHandle) -> Result<Option<BoundContext>> {
        let label = handle.label();
        if !handle.server.is_database_accessible(&handle.name).await? {
            warn!(target_name = %label, "Database is not accessible, skipping");
            return Ok(None);
        }

        let current = handle.server.current_database();
        if current
            .as_deref()
            .map(|db| db.eq_ignore_ascii_case(&handle.name))
            .unwrap_or(false)
        {
            return Ok(Some(BoundContext {
                client: Arc::clone(&handle.server),
                label,
                ownership: Ownership::Pooled,
            }));
        }

        debug!(
            target_name = %label,
            current = current.as_deref().unwrap_or(""),
            "Opening context scoped to requested database"
        );
        let client = handle.server.with_database(&handle.name).await?;
        Ok(Some(BoundContext {
            client,
            label,
            ownership: Ownership::Owned,
        }))
    }

    async fn bind_instance(&self, spec: &InstanceSpec) -> Result<BoundContext> {
        let label = spec.display_name();

        if self.requires_unpooled(spec) {
            debug!(target_name = %label, "Opening non-pooled connection");
            let options = self.options.clone().with_pooling(false);
            let client = self.connector.connect(spec, &options).await?;
            return Ok(BoundContext {
                client,
                label,
                ownership: Ownership::Owned,
            });
        }

        let client = self.connect_shared(spec).await?;
        Ok(BoundContext {
            client,
            label,
            ownership: Ownership::Pooled,
        })
    }

    /// Returns the pooled context for `spec`, connecting on first use.
    pub async fn connect_shared(&self, spec: &InstanceSpec) -> Result<Arc<dyn ServerClient>> {
        let key = spec.pool_key();
        let mut pool = self.pool.lock().await;
        if let Some(client) = pool.get(&key) {
            debug!(instance = %spec, "Reusing pooled connection");
            return Ok(Arc::clone(client));
        }

        let options = self.options.clone().with_pooling(true);
        let client = self.connector.connect(spec, &options).await?;
        pool.insert(key, Arc::clone(&client));
        Ok(client)
    }

    /// Number of cached pooled contexts.
    pub async fn pooled_count(&self) -> usize {
        self.pool.lock().await.len()
    }

    /// Closes every pooled context. Close failures are logged at debug level.
    pub async fn shutdown(&self) {
        let clients: Vec<Arc<dyn ServerClient>> =
            self.pool.lock().await.drain().map(|(_, c)| c).collect();
        for client in clients {
            if let Err(e) = client.close().await {
                debug!(instance = %client.instance(), error = %e, "Failed to close pooled connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MockConnector, MockServer};
    use crate::error::FleetError;
    use crate::instance::{Credential, SeparatorClassifier};

    fn binder(connector: MockConnector) -> ConnectionBinder {
        ConnectionBinder::new(
            Arc::new(connector),
            ConnectOptions::default(),
            SeparatorClassifier::default().shared(),
        )
    }

    #[tokio::test]
    async fn test_pooled_context_is_reused() {
        let server = MockServer::new();
        let binder = binder(MockConnector::new().with_server("sql01", server.clone()));
        let target = ExecutionTarget::Instance(InstanceSpec::new("sql01"));

        let first = binder.bind(&target).await.unwrap().unwrap();
        assert_eq!(first.ownership(), Ownership::Pooled);
        first.release().await.unwrap();
        let second = binder.bind(&target).await.unwrap().unwrap();
        second.release().await.unwrap();

        assert_eq!(server.connects(), 1);
        assert_eq!(server.closes(), 0);

        binder.shutdown().await;
        assert_eq!(server.closes(), 1);
        assert_eq!(binder.pooled_count().await, 0);
    }

    #[tokio::test]
    async fn test_domain_credential_is_not_pooled() {
        let server = MockServer::new();
        let binder = binder(MockConnector::new().with_server("sql01", server.clone()));
        let spec = InstanceSpec::new("sql01").with_credential(Credential::new(r"CORP\alice", None));

        let context = binder
            .bind(&ExecutionTarget::Instance(spec))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(context.ownership(), Ownership::Owned);
        assert_eq!(server.pooled_connects(), 0);

        context.release().await.unwrap();
        assert_eq!(server.closes(), 1);
    }

    #[tokio::test]
    async fn test_legacy_mode_never_pools() {
        let server = MockServer::new();
        let binder = ConnectionBinder::new(
            Arc::new(MockConnector::new().with_server("sql01", server.clone())),
            ConnectOptions::default().with_pooling(false),
            SeparatorClassifier::default().shared(),
        );
        assert!(binder.requires_unpooled(&InstanceSpec::new("sql01")));
    }

    #[tokio::test]
    async fn test_unreachable_instance_is_connection_error() {
        let binder = binder(MockConnector::new().with_server("down", MockServer::unreachable()));
        let err = binder
            .bind(&ExecutionTarget::Instance(InstanceSpec::new("down")))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Connection(_)));
    }

    #[tokio::test]
    async fn test_database_handle_switches_without_mutating_shared() {
        let server = MockServer::new();
        let binder = binder(MockConnector::new().with_server("sql01", server.clone()));
        let shared = binder.connect_shared(&InstanceSpec::new("sql01")).await.unwrap();

        let handle = DatabaseHandle::new(Arc::clone(&shared), "sales");
        let context = binder
            .bind(&ExecutionTarget::Database(handle))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(context.ownership(), Ownership::Owned);
        assert_eq!(context.client().current_database().as_deref(), Some("sales"));
        assert_eq!(shared.current_database().as_deref(), Some("master"));
        context.release().await.unwrap();

        let same = DatabaseHandle::new(Arc::clone(&shared), "master");
        let context = binder
            .bind(&ExecutionTarget::Database(same))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(context.ownership(), Ownership::Pooled);
    }

    #[tokio::test]
    async fn test_inaccessible_database_is_skipped() {
        let server = MockServer::new().with_inaccessible_database("archive");
        let binder = binder(MockConnector::new().with_server("sql01", server));
        let shared = binder.connect_shared(&InstanceSpec::new("sql01")).await.unwrap();

        let bound = binder
            .bind(&ExecutionTarget::Database(DatabaseHandle::new(shared, "archive")))
            .await
            .unwrap();
        assert!(bound.is_none());
    }
}
