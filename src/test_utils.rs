//! In-memory database driver and a wired-up backend for tests and demos.

use crate::{
    backend::DatabaseBackend,
    config::BackendConfig,
    connection::ConnectionRegistry,
    database::{
        ConnectionConfig, Connector, Database, DatabaseError, DatabaseErrorKind, DefaultClassifier,
        StatementParams,
    },
    lease::LeaseRequest,
    role::Role,
    storage::InMemoryStorage,
    time::ManualClock,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TEST_DB: &str = "pg";
pub const TEST_ROLE: &str = "app-role";

/// Accounts as the fake database sees them: username to `VALID UNTIL`.
#[derive(Debug, Default)]
pub struct AccountTable {
    accounts: DashMap<String, Option<String>>,
}

impl AccountTable {
    pub fn create(&self, username: &str) {
        self.accounts.insert(username.to_string(), None);
    }

    pub fn exists(&self, username: &str) -> bool {
        self.accounts.contains_key(username)
    }

    pub fn valid_until(&self, username: &str) -> Option<String> {
        self.accounts.get(username).and_then(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedStatement {
    pub connection: usize,
    pub statement: String,
    pub params: StatementParams,
}

/// State shared by every connection a connector opens, so accounts and
/// injected failures survive a reconnect.
#[derive(Debug, Default)]
struct Shared {
    accounts: AccountTable,
    journal: Mutex<Vec<ExecutedStatement>>,
    failures: Mutex<VecDeque<DatabaseError>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

#[derive(Debug)]
pub struct InMemoryDatabase {
    id: usize,
    url: String,
    shared: Arc<Shared>,
    latency: Duration,
    closed: AtomicBool,
}

impl InMemoryDatabase {
    pub fn id(&self) -> usize {
        self.id
    }

    /// The connection URL this session was opened with.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn apply(&self, statement: &str, params: &StatementParams) -> Result<(), DatabaseError> {
        let upper = statement.to_uppercase();
        let accounts = &self.shared.accounts.accounts;

        if upper.contains("VALID UNTIL") {
            match accounts.get_mut(&params.name) {
                Some(mut valid_until) => {
                    *valid_until = params.expiration.clone();
                    Ok(())
                }
                None => Err(DatabaseError::new(
                    DatabaseErrorKind::UserNotFound,
                    format!("role \"{}\" does not exist", params.name),
                )),
            }
        } else if upper.starts_with("DROP ROLE IF EXISTS") {
            accounts.remove(&params.name);
            Ok(())
        } else if upper.starts_with("DROP ROLE") {
            accounts.remove(&params.name).map(|_| ()).ok_or_else(|| {
                DatabaseError::new(
                    DatabaseErrorKind::UserNotFound,
                    format!("role \"{}\" does not exist", params.name),
                )
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn execute(
        &self,
        statement: &str,
        params: &StatementParams,
    ) -> Result<(), DatabaseError> {
        if self.is_closed() {
            return Err(DatabaseError::new(
                DatabaseErrorKind::ConnectionClosed,
                "connection is closed",
            ));
        }

        let now = self.shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let injected = self.shared.failures.lock().pop_front();
        let result = match injected {
            Some(err) => Err(err),
            None => self.apply(statement, params),
        };
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.shared.journal.lock().push(ExecutedStatement {
            connection: self.id,
            statement: statement.to_string(),
            params: params.clone(),
        });
        result
    }

    async fn close(&self) -> Result<(), DatabaseError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryConnector {
    shared: Arc<Shared>,
    latency: Duration,
    connect_delay: Duration,
    refuse: AtomicBool,
    opened: Mutex<Vec<Arc<InMemoryDatabase>>>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every statement takes at least `latency` to run.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Opening a session takes `delay`.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn accounts(&self) -> &AccountTable {
        &self.shared.accounts
    }

    /// The next statement executed on any connection fails with `err`.
    pub fn fail_next(&self, err: DatabaseError) {
        self.shared.failures.lock().push_back(err);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opened.lock().len()
    }

    pub fn connection(&self, index: usize) -> Option<Arc<InMemoryDatabase>> {
        self.opened.lock().get(index).cloned()
    }

    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.shared.journal.lock().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.shared.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(
        &self,
        _name: &str,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn Database>, DatabaseError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(DatabaseError::new(DatabaseErrorKind::NetworkReset, "connection refused"));
        }
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        let mut opened = self.opened.lock();
        let db = Arc::new(InMemoryDatabase {
            id: opened.len(),
            url: config.connection_url.clone(),
            shared: self.shared.clone(),
            latency: self.latency,
            closed: AtomicBool::new(false),
        });
        opened.push(db.clone());
        Ok(db)
    }
}

/// A backend wired to in-memory storage and the in-memory driver, with role
/// `app-role` (1h default, 24h max) on database `pg`.
#[derive(Debug)]
pub struct TestBackend {
    pub storage: Arc<InMemoryStorage>,
    pub connector: Arc<InMemoryConnector>,
    pub clock: Arc<ManualClock>,
    pub backend: DatabaseBackend,
}

impl TestBackend {
    pub async fn new() -> crate::Result<Self> {
        Self::with_connector(InMemoryConnector::new()).await
    }

    pub async fn with_connector(connector: InMemoryConnector) -> crate::Result<Self> {
        let storage = Arc::new(InMemoryStorage::new());
        let connector = Arc::new(connector);
        let clock = Arc::new(ManualClock::default());

        let registry = Arc::new(ConnectionRegistry::new(
            storage.clone(),
            connector.clone(),
            Arc::new(DefaultClassifier),
        ));
        let backend = DatabaseBackend::new(BackendConfig::default(), storage.clone(), registry)
            .with_clock(clock.clone());

        backend
            .connections()
            .configure(TEST_DB, &ConnectionConfig::new("in-memory", "mem://pg"))
            .await?;
        backend
            .roles()
            .put(
                TEST_ROLE,
                &Role::new(TEST_DB, Duration::from_secs(3600), Duration::from_secs(86400)),
            )
            .await?;

        Ok(Self {
            storage,
            connector,
            clock,
            backend,
        })
    }

    /// Create the account in the fake database and return the lease the
    /// scheduler would hold for it.
    pub fn issue(&self, username: &str, role: &str) -> LeaseRequest {
        self.connector.accounts().create(username);
        LeaseRequest::new(
            format!("database/creds/{role}/{username}"),
            LeaseRequest::creds_data(username, role),
        )
    }
}
