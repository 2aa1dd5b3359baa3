use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use dbcreds::{
    database::{DatabaseError, DatabaseErrorKind},
    lease::{LeaseRequest, ROLE_KEY, USERNAME_KEY},
    storage::Storage,
    test_utils::{TestBackend, TEST_DB, TEST_ROLE},
    time::{format_expiration, Clock},
    BackendConfig, ConnectionRegistry, DatabaseBackend, Error, ErrorKind, RequestContext, Role,
    RoleResolver, SecretLifecycle,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

const HOUR: Duration = Duration::from_secs(3600);

#[tokio::test]
async fn test_renew_uses_role_default_ttl() {
    let t = TestBackend::new().await.unwrap();
    let lease = t.issue("v-app-role-abcd", TEST_ROLE);
    let ctx = RequestContext::background();

    let resp = t.backend.renew(&ctx, &lease).await.unwrap();

    let expected = t.clock.now() + ChronoDuration::hours(1);
    assert_eq!(resp.ttl, HOUR);
    assert_eq!(resp.expiration, Some(expected));
    assert_eq!(
        t.connector.accounts().valid_until("v-app-role-abcd"),
        Some(format_expiration(&expected))
    );
}

#[tokio::test]
async fn test_renew_caps_requested_increment_at_max_ttl() {
    let t = TestBackend::new().await.unwrap();
    let ctx = RequestContext::background();

    let lease = t.issue("v-app-role-long", TEST_ROLE).with_increment(48 * HOUR);
    let resp = t.backend.renew(&ctx, &lease).await.unwrap();
    assert_eq!(resp.ttl, 24 * HOUR);
    assert_eq!(resp.expiration, Some(t.clock.now() + ChronoDuration::hours(24)));

    let lease = t.issue("v-app-role-short", TEST_ROLE).with_increment(Duration::from_secs(1800));
    let resp = t.backend.renew(&ctx, &lease).await.unwrap();
    assert_eq!(resp.ttl, Duration::from_secs(1800));
}

#[tokio::test]
async fn test_renew_picks_up_role_changes() {
    let t = TestBackend::new().await.unwrap();
    let ctx = RequestContext::background();
    let lease = t.issue("v-app-role-edit", TEST_ROLE);

    assert_eq!(t.backend.renew(&ctx, &lease).await.unwrap().ttl, HOUR);

    t.backend
        .roles()
        .put(TEST_ROLE, &Role::new(TEST_DB, Duration::from_secs(600), HOUR))
        .await
        .unwrap();
    t.clock.advance(ChronoDuration::minutes(5));

    let resp = t.backend.renew(&ctx, &lease).await.unwrap();
    assert_eq!(resp.ttl, Duration::from_secs(600));
    assert_eq!(resp.expiration, Some(t.clock.now() + ChronoDuration::minutes(10)));
}

#[tokio::test]
async fn test_renew_missing_attributes_touch_nothing() {
    let t = TestBackend::new().await.unwrap();
    let ctx = RequestContext::background();

    for missing in [USERNAME_KEY, ROLE_KEY] {
        let mut lease = t.issue("v-app-role-abcd", TEST_ROLE);
        lease.internal_data.remove(missing);

        let err = t.backend.renew(&ctx, &lease).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingAttribute);
        assert!(matches!(err, Error::MissingAttribute { key } if key == missing));
    }

    assert_eq!(t.connector.opens(), 0);
    assert!(t.connector.executed().is_empty());
}

#[tokio::test]
async fn test_renew_deleted_role() {
    let t = TestBackend::new().await.unwrap();
    let lease = t.issue("v-app-role-abcd", TEST_ROLE);
    t.backend.roles().delete(TEST_ROLE).await.unwrap();

    let err = t.backend.renew(&RequestContext::background(), &lease).await.unwrap_err();
    assert!(matches!(err, Error::RoleNotFound { ref role } if role == TEST_ROLE));
    assert!(!err.is_retryable());
    assert!(t.connector.executed().is_empty());
}

#[tokio::test]
async fn test_non_expiring_lease_is_not_pushed() {
    let t = TestBackend::new().await.unwrap();
    let unbounded = BackendConfig {
        system_default_ttl: Duration::ZERO,
        system_max_ttl: Duration::ZERO,
    };
    let backend =
        DatabaseBackend::new(unbounded, t.storage.clone(), t.backend.connections().clone())
            .with_clock(t.clock.clone());
    backend
        .roles()
        .put("forever", &Role::new(TEST_DB, Duration::ZERO, Duration::ZERO))
        .await
        .unwrap();

    let lease = t.issue("v-forever", "forever");
    let resp = backend.renew(&RequestContext::background(), &lease).await.unwrap();

    assert_eq!(resp.expiration, None);
    assert!(t.connector.executed().is_empty());
    assert_eq!(t.connector.accounts().valid_until("v-forever"), None);
}

#[tokio::test]
async fn test_renew_of_vanished_account_keeps_connection() {
    let t = TestBackend::new().await.unwrap();
    let lease = LeaseRequest::new(
        "database/creds/app-role/ghost",
        LeaseRequest::creds_data("ghost", TEST_ROLE),
    );

    let err = t.backend.renew(&RequestContext::background(), &lease).await.unwrap_err();
    match err {
        Error::StatementExecution { db_name, source } => {
            assert_eq!(db_name, TEST_DB);
            assert_eq!(source.kind, DatabaseErrorKind::UserNotFound);
        }
        other => panic!("unexpected error: {other}"),
    }

    // Not a connection problem, so the same session is reused.
    let again = t.issue("v-app-role-abcd", TEST_ROLE);
    assert_ok!(t.backend.renew(&RequestContext::background(), &again).await);
    assert_eq!(t.connector.opens(), 1);
}

#[tokio::test]
async fn test_rejected_renewal_statement_surfaces() {
    let t = TestBackend::new().await.unwrap();
    let lease = t.issue("v-app-role-abcd", TEST_ROLE);
    t.connector
        .fail_next(DatabaseError::new(DatabaseErrorKind::Rejected, "permission denied"));

    let err = t.backend.renew(&RequestContext::background(), &lease).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StatementExecution);
    assert!(err.is_retryable());
    assert_eq!(t.connector.accounts().valid_until("v-app-role-abcd"), None);
}

#[derive(Debug)]
struct OfflineStorage;

#[async_trait]
impl Storage for OfflineStorage {
    async fn get(&self, _key: &str) -> dbcreds::Result<Option<Vec<u8>>> {
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "storage offline").into())
    }

    async fn put(&self, _key: &str, _value: Vec<u8>) -> dbcreds::Result<()> {
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "storage offline").into())
    }

    async fn delete(&self, _key: &str) -> dbcreds::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_storage_failure_is_resolution_error() {
    let t = TestBackend::new().await.unwrap();
    let storage: Arc<dyn Storage> = Arc::new(OfflineStorage);
    let registry = Arc::new(ConnectionRegistry::new(
        storage.clone(),
        t.connector.clone(),
        Arc::new(dbcreds::database::DefaultClassifier),
    ));
    let backend = DatabaseBackend::new(BackendConfig::default(), storage.clone(), registry);

    let lease = t.issue("v-app-role-abcd", TEST_ROLE);
    let err = backend.renew(&RequestContext::background(), &lease).await.unwrap_err();
    assert!(matches!(err, Error::Resolution(_)));
    assert!(err.is_retryable());

    let err = RoleResolver::new(storage).resolve(TEST_ROLE).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resolution);
}
