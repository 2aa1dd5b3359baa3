//! Connection registry and the per-connection access discipline.
//!
//! Statement executors hold shared access to a [`ConnectionHandle`] for as
//! long as they talk to the database. Tearing a connection down (explicit
//! close, reconfiguration, or invalidation after a fatal driver error) takes
//! exclusive access, so it waits for every in-flight executor to finish.
//!
//! Opening, closing and reconfiguring a database are serialized per name.
//! Work on one database never waits for a slow connect to another.

use crate::{
    database::{
        ConnectionConfig, Connector, Database, DatabaseError, ErrorClassifier, StatementParams,
    },
    role::Statements,
    storage::{self, Storage},
    time::Timestamp,
    Error, Result,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

const CONFIG_PREFIX: &str = "config/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// Exclusive access held, driver session being closed.
    Invalidating,
    Closed,
}

#[derive(Debug)]
pub struct ConnectionHandle {
    id: Uuid,
    name: String,
    db: Arc<dyn Database>,
    gate: Arc<RwLock<()>>,
    state: Mutex<ConnectionState>,
}

impl ConnectionHandle {
    pub fn new(name: impl Into<String>, db: Arc<dyn Database>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            db,
            gate: Arc::new(RwLock::new(())),
            state: Mutex::new(ConnectionState::Open),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Wait for shared access. Fails if the connection was torn down while
    /// waiting.
    pub async fn acquire_shared(self: &Arc<Self>) -> Result<SharedAccess> {
        let guard = self.gate.clone().read_owned().await;
        match self.state() {
            ConnectionState::Open => Ok(SharedAccess {
                handle: self.clone(),
                _guard: guard,
            }),
            state => Err(Error::Resolution(format!(
                "connection to {:?} is {state:?}",
                self.name
            ))),
        }
    }

    /// Escalate to exclusive access and close the driver session.
    ///
    /// Returns `Ok(false)` when someone else already tore this handle down.
    async fn shutdown(&self) -> std::result::Result<bool, DatabaseError> {
        let _exclusive = self.gate.write().await;
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Open {
                return Ok(false);
            }
            *state = ConnectionState::Invalidating;
        }

        let closed = self.db.close().await;
        *self.state.lock() = ConnectionState::Closed;
        closed.map(|()| true)
    }
}

/// Shared access to a connection. Dropping it releases the access.
#[derive(Debug)]
pub struct SharedAccess {
    handle: Arc<ConnectionHandle>,
    _guard: OwnedRwLockReadGuard<()>,
}

impl SharedAccess {
    /// The connection this access was taken on, for invalidating it once the
    /// access has been dropped.
    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    pub async fn renew_user(
        &self,
        statements: &Statements,
        username: &str,
        expiration: &Timestamp,
    ) -> std::result::Result<(), DatabaseError> {
        let params = StatementParams::for_user(username).with_expiration(expiration);
        for stmt in statements.renewal_or_default() {
            self.handle.db.execute(stmt, &params).await?;
        }
        Ok(())
    }

    pub async fn revoke_user(
        &self,
        statements: &Statements,
        username: &str,
    ) -> std::result::Result<(), DatabaseError> {
        let params = StatementParams::for_user(username);
        for stmt in statements.revocation_or_default() {
            self.handle.db.execute(stmt, &params).await?;
        }
        Ok(())
    }
}

/// Maps logical database names to live connection handles.
#[derive(Debug)]
pub struct ConnectionRegistry {
    storage: Arc<dyn Storage>,
    connector: Arc<dyn Connector>,
    classifier: Arc<dyn ErrorClassifier>,
    connections: DashMap<String, Arc<ConnectionHandle>>,
    /// One lock per database name, held while a connection for that name is
    /// opened, closed or reconfigured.
    creating: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl ConnectionRegistry {
    pub fn new(
        storage: Arc<dyn Storage>,
        connector: Arc<dyn Connector>,
        classifier: Arc<dyn ErrorClassifier>,
    ) -> Self {
        Self {
            storage,
            connector,
            classifier,
            connections: DashMap::new(),
            creating: DashMap::new(),
        }
    }

    /// Return the live handle for `name`, opening one if there is none.
    pub async fn resolve(&self, name: &str) -> Result<Arc<ConnectionHandle>> {
        if let Some(handle) = self.lookup_open(name) {
            return Ok(handle);
        }

        let lock = self.creation_lock(name);
        let _creating = lock.lock().await;
        if let Some(handle) = self.lookup_open(name) {
            return Ok(handle);
        }

        let config = self.load_config(name).await?;
        let db = self.connector.connect(name, &config).await.map_err(|e| {
            Error::Resolution(format!("failed to open connection to {name:?}: {e}"))
        })?;

        let handle = Arc::new(ConnectionHandle::new(name, db));
        info!(
            db = name,
            id = %handle.id,
            plugin = %config.plugin_name,
            "opened database connection"
        );
        self.connections.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Resolve `name` and take shared access to it.
    ///
    /// A handle torn down between lookup and acquisition is looked up once
    /// more, so a caller racing an invalidation lands on the replacement.
    pub async fn acquire_shared(&self, name: &str) -> Result<SharedAccess> {
        let handle = self.resolve(name).await?;
        self.acquire_from(handle, name).await
    }

    async fn acquire_from(
        &self,
        handle: Arc<ConnectionHandle>,
        name: &str,
    ) -> Result<SharedAccess> {
        match handle.acquire_shared().await {
            Ok(access) => Ok(access),
            Err(e) => {
                debug!(
                    db = name,
                    id = %handle.id,
                    error = %e,
                    "stale connection handle, resolving again"
                );
                self.resolve(name).await?.acquire_shared().await
            }
        }
    }

    /// Tear `handle` down if `err` says its session is unusable. After this
    /// returns `true` the next [`resolve`](Self::resolve) opens a fresh
    /// connection.
    ///
    /// The caller must not hold shared access to `handle` itself.
    pub async fn invalidate_if_unusable(
        &self,
        handle: &Arc<ConnectionHandle>,
        err: &DatabaseError,
    ) -> bool {
        if !self.classifier.is_connection_fatal(err) {
            debug!(db = %handle.name, error = %err, "statement error does not affect connection");
            return false;
        }

        warn!(db = %handle.name, id = %handle.id, error = %err, "invalidating database connection");
        self.connections
            .remove_if(&handle.name, |_, registered| registered.id == handle.id);

        if let Err(e) = handle.shutdown().await {
            warn!(
                db = %handle.name,
                id = %handle.id,
                error = %e,
                "error closing invalidated connection"
            );
        }
        true
    }

    /// Store new settings for `name` and drop the current connection so the
    /// next resolution picks them up. A connection being opened with the old
    /// settings finishes first and is closed here.
    pub async fn configure(&self, name: &str, config: &ConnectionConfig) -> Result<()> {
        let lock = self.creation_lock(name);
        let _creating = lock.lock().await;
        storage::put_json(self.storage.as_ref(), &config_key(name), config).await?;
        self.close_locked(name).await
    }

    pub async fn close(&self, name: &str) -> Result<()> {
        let lock = self.creation_lock(name);
        let _creating = lock.lock().await;
        self.close_locked(name).await
    }

    pub async fn close_all(&self) -> Result<()> {
        let names: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        let mut first_err = None;
        for name in names {
            if let Err(e) = self.close(&name).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    async fn close_locked(&self, name: &str) -> Result<()> {
        let Some((_, handle)) = self.connections.remove(name) else {
            return Ok(());
        };
        match handle.shutdown().await {
            Ok(true) => {
                info!(db = name, id = %handle.id, "closed database connection");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => Err(Error::Resolution(format!(
                "failed to close connection to {name:?}: {e}"
            ))),
        }
    }

    fn creation_lock(&self, name: &str) -> Arc<AsyncMutex<()>> {
        self.creating.entry(name.to_string()).or_default().clone()
    }

    fn lookup_open(&self, name: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections
            .get(name)
            .filter(|handle| handle.state() == ConnectionState::Open)
            .map(|handle| handle.value().clone())
    }

    async fn load_config(&self, name: &str) -> Result<ConnectionConfig> {
        storage::get_json(self.storage.as_ref(), &config_key(name))
            .await
            .map_err(|e| {
                Error::Resolution(format!("failed to load connection config {name:?}: {e}"))
            })?
            .ok_or_else(|| {
                Error::Resolution(format!("no connection configuration found for {name:?}"))
            })
    }
}

fn config_key(name: &str) -> String {
    format!("{CONFIG_PREFIX}{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DatabaseErrorKind, DefaultClassifier};
    use crate::storage::InMemoryStorage;
    use crate::test_utils::InMemoryConnector;
    use async_trait::async_trait;
    use std::time::Duration;

    async fn storage_with(names: &[(&str, &str)]) -> Arc<InMemoryStorage> {
        let storage = Arc::new(InMemoryStorage::new());
        for (name, url) in names {
            let config = ConnectionConfig::new("in-memory", *url);
            storage::put_json(storage.as_ref(), &config_key(name), &config)
                .await
                .unwrap();
        }
        storage
    }

    async fn registry() -> (ConnectionRegistry, Arc<InMemoryConnector>) {
        let storage = storage_with(&[("pg", "mem://pg")]).await;
        let connector = Arc::new(InMemoryConnector::new());
        let registry =
            ConnectionRegistry::new(storage, connector.clone(), Arc::new(DefaultClassifier));
        (registry, connector)
    }

    /// Never finishes connecting to `stalled`.
    #[derive(Debug, Default)]
    struct StallingConnector {
        inner: InMemoryConnector,
    }

    #[async_trait]
    impl Connector for StallingConnector {
        async fn connect(
            &self,
            name: &str,
            config: &ConnectionConfig,
        ) -> std::result::Result<Arc<dyn Database>, DatabaseError> {
            if name == "stalled" {
                std::future::pending::<()>().await;
            }
            self.inner.connect(name, config).await
        }
    }

    #[tokio::test]
    async fn test_resolve_reuses_open_handle() {
        let (registry, connector) = registry().await;
        let a = registry.resolve("pg").await.unwrap();
        let b = registry.resolve("pg").await.unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(connector.opens(), 1);
    }

    #[tokio::test]
    async fn test_resolve_without_config() {
        let (registry, _) = registry().await;
        let err = registry.resolve("mysql").await.unwrap_err();
        assert!(matches!(err, Error::Resolution(_)));
    }

    #[tokio::test]
    async fn test_stalled_connect_does_not_block_other_databases() {
        let storage = storage_with(&[("stalled", "mem://stalled"), ("pg", "mem://pg")]).await;
        let registry = Arc::new(ConnectionRegistry::new(
            storage,
            Arc::new(StallingConnector::default()),
            Arc::new(DefaultClassifier),
        ));

        let stalled = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.resolve("stalled").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let handle = tokio::time::timeout(Duration::from_secs(2), registry.resolve("pg"))
            .await
            .expect("resolve waited on another database")
            .unwrap();
        assert_eq!(handle.name(), "pg");
        assert!(!stalled.is_finished());
        stalled.abort();
    }

    #[tokio::test]
    async fn test_configure_closes_connection_opened_with_old_settings() {
        let storage = storage_with(&[("pg", "mem://old")]).await;
        let connector =
            Arc::new(InMemoryConnector::new().with_connect_delay(Duration::from_millis(100)));
        let registry = Arc::new(ConnectionRegistry::new(
            storage,
            connector.clone(),
            Arc::new(DefaultClassifier),
        ));

        let opening = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.resolve("pg").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry
            .configure("pg", &ConnectionConfig::new("in-memory", "mem://new"))
            .await
            .unwrap();

        let old = opening.await.unwrap().unwrap();
        assert_eq!(old.state(), ConnectionState::Closed);
        assert_eq!(connector.connection(0).unwrap().url(), "mem://old");

        let current = registry.resolve("pg").await.unwrap();
        assert_ne!(current.id(), old.id());
        assert_eq!(connector.opens(), 2);
        assert_eq!(connector.connection(1).unwrap().url(), "mem://new");
    }

    #[tokio::test]
    async fn test_acquire_from_closed_handle_lands_on_replacement() {
        let (registry, connector) = registry().await;
        let stale = registry.resolve("pg").await.unwrap();
        registry.close("pg").await.unwrap();

        let access = registry.acquire_from(stale.clone(), "pg").await.unwrap();
        assert_ne!(access.handle().id(), stale.id());
        assert_eq!(access.handle().state(), ConnectionState::Open);
        assert_eq!(connector.opens(), 2);
    }

    #[tokio::test]
    async fn test_non_fatal_error_keeps_connection() {
        let (registry, _) = registry().await;
        let handle = registry.resolve("pg").await.unwrap();
        let err = DatabaseError::new(DatabaseErrorKind::Rejected, "permission denied");

        assert!(!registry.invalidate_if_unusable(&handle, &err).await);
        assert_eq!(handle.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_invalidation_waits_for_shared_holders() {
        let (registry, _) = registry().await;
        let registry = Arc::new(registry);
        let access = registry.acquire_shared("pg").await.unwrap();
        let handle = access.handle().clone();

        let invalidating = {
            let registry = registry.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                let err = DatabaseError::new(DatabaseErrorKind::ConnectionClosed, "eof");
                registry.invalidate_if_unusable(&handle, &err).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.state(), ConnectionState::Open);
        assert!(registry.is_empty());

        drop(access);
        assert!(invalidating.await.unwrap());
        assert_eq!(handle.state(), ConnectionState::Closed);
        assert!(handle.acquire_shared().await.is_err());
    }

    #[tokio::test]
    async fn test_close_all() {
        let (registry, _) = registry().await;
        let handle = registry.resolve("pg").await.unwrap();
        registry.close_all().await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Closed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_configure_reopens_with_new_settings() {
        let (registry, connector) = registry().await;
        let old = registry.resolve("pg").await.unwrap();

        registry
            .configure("pg", &ConnectionConfig::new("in-memory", "mem://pg-replica"))
            .await
            .unwrap();
        assert_eq!(old.state(), ConnectionState::Closed);

        let new = registry.resolve("pg").await.unwrap();
        assert_ne!(old.id(), new.id());
        assert_eq!(connector.opens(), 2);
        assert_eq!(connector.connection(1).unwrap().url(), "mem://pg-replica");
    }
}
