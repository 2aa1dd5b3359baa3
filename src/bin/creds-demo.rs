use anyhow::Context;
use dbcreds::{
    test_utils::{InMemoryConnector, TestBackend, TEST_ROLE},
    BackendConfig, DatabaseBackend, RequestContext, SecretLifecycle,
};
use std::env;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match env::var("DBCREDS_CONFIG") {
        Ok(path) => BackendConfig::from_file(&path).with_context(|| format!("loading {path}"))?,
        Err(_) => BackendConfig::from_env()?,
    };
    info!(
        default_ttl = %humantime::format_duration(config.system_default_ttl),
        max_ttl = %humantime::format_duration(config.system_max_ttl),
        "backend configuration loaded"
    );

    let connector = InMemoryConnector::with_latency(Duration::from_millis(5));
    let harness = TestBackend::with_connector(connector).await?;
    let backend = DatabaseBackend::new(
        config,
        harness.storage.clone(),
        harness.backend.connections().clone(),
    )
    .with_clock(harness.clock.clone());

    let lease = harness.issue("v-app-role-demo", TEST_ROLE);
    let ctx = RequestContext::background().with_timeout(Duration::from_secs(5));

    let renewed = backend.renew(&ctx, &lease).await?;
    info!(
        lease_id = %renewed.lease_id,
        expiration = ?renewed.expiration,
        valid_until = ?harness.connector.accounts().valid_until("v-app-role-demo"),
        "renewed"
    );

    let extended = lease.clone().with_increment(Duration::from_secs(48 * 3600));
    let capped = backend.renew(&ctx, &extended).await?;
    info!(ttl = %humantime::format_duration(capped.ttl), "renewal request capped by role max TTL");

    backend.revoke(&ctx, &lease).await?;
    backend.revoke(&ctx, &lease).await?;
    info!(
        exists = harness.connector.accounts().exists("v-app-role-demo"),
        "revoked twice"
    );

    backend.connections().close_all().await?;
    Ok(())
}
