use crate::{
    config::BackendConfig,
    connection::{ConnectionHandle, ConnectionRegistry},
    context::RequestContext,
    database::{DatabaseError, DatabaseErrorKind},
    lease::{extend, CredsLease, LeaseRequest, LeaseResponse},
    role::{Role, RoleResolver},
    storage::Storage,
    time::{Clock, SystemClock},
    Error, Result,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Callbacks the lease scheduler drives for one secret type.
#[async_trait]
pub trait SecretLifecycle: Send + Sync {
    async fn renew(&self, ctx: &RequestContext, req: &LeaseRequest) -> Result<LeaseResponse>;

    async fn revoke(&self, ctx: &RequestContext, req: &LeaseRequest) -> Result<()>;
}

#[derive(Debug)]
pub struct DatabaseBackend {
    config: BackendConfig,
    roles: RoleResolver,
    connections: Arc<ConnectionRegistry>,
    clock: Arc<dyn Clock>,
}

impl DatabaseBackend {
    pub fn new(
        config: BackendConfig,
        storage: Arc<dyn Storage>,
        connections: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            config,
            roles: RoleResolver::new(storage),
            connections,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn roles(&self) -> &RoleResolver {
        &self.roles
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Extend the lease within the role's TTL bounds and push the new
    /// expiration into the database account.
    pub async fn secret_creds_renew(
        &self,
        ctx: &RequestContext,
        req: &LeaseRequest,
    ) -> Result<LeaseResponse> {
        let (creds, role) = self.load(ctx, req).await?;

        let (default_ttl, max_ttl) = self.config.effective_ttls(&role);
        let extension = extend(self.clock.now(), req.increment, default_ttl, max_ttl)?;

        let access = ctx.run(self.connections.acquire_shared(&role.db_name)).await??;
        // Nothing to push for a lease that never expires.
        let executed = match extension.expiration {
            Some(expiration) => {
                ctx.run(access.renew_user(&role.statements, &creds.username, &expiration))
                    .await?
            }
            None => Ok(()),
        };
        let handle = access.handle().clone();
        drop(access);

        if let Err(source) = executed {
            return Err(self.statement_failed(&handle, &role, source).await);
        }

        info!(
            lease_id = %req.lease_id,
            username = %creds.username,
            role = %creds.role,
            ttl = %humantime::format_duration(extension.ttl),
            "renewed database credential"
        );
        Ok(LeaseResponse {
            lease_id: req.lease_id.clone(),
            ttl: extension.ttl,
            expiration: extension.expiration,
        })
    }

    /// Drop the database account behind the lease. An account that is
    /// already gone counts as revoked.
    pub async fn secret_creds_revoke(
        &self,
        ctx: &RequestContext,
        req: &LeaseRequest,
    ) -> Result<()> {
        let (creds, role) = self.load(ctx, req).await?;

        let access = ctx.run(self.connections.acquire_shared(&role.db_name)).await??;
        let executed = ctx
            .run(access.revoke_user(&role.statements, &creds.username))
            .await?;
        let handle = access.handle().clone();
        drop(access);

        match executed {
            Ok(()) => {}
            Err(e) if e.kind == DatabaseErrorKind::UserNotFound => {
                debug!(
                    lease_id = %req.lease_id,
                    username = %creds.username,
                    "account already revoked"
                );
            }
            Err(source) => return Err(self.statement_failed(&handle, &role, source).await),
        }

        info!(
            lease_id = %req.lease_id,
            username = %creds.username,
            role = %creds.role,
            "revoked database credential"
        );
        Ok(())
    }

    async fn load(&self, ctx: &RequestContext, req: &LeaseRequest) -> Result<(CredsLease, Role)> {
        let creds = CredsLease::decode(&req.internal_data)?;
        let role = ctx.run(self.roles.resolve(&creds.role)).await??;
        Ok((creds, role))
    }

    /// Invalidate the connection if `source` says it is unusable. The caller
    /// must have released its shared access first.
    async fn statement_failed(
        &self,
        handle: &Arc<ConnectionHandle>,
        role: &Role,
        source: DatabaseError,
    ) -> Error {
        self.connections.invalidate_if_unusable(handle, &source).await;
        Error::StatementExecution {
            db_name: role.db_name.clone(),
            source,
        }
    }
}

#[async_trait]
impl SecretLifecycle for DatabaseBackend {
    async fn renew(&self, ctx: &RequestContext, req: &LeaseRequest) -> Result<LeaseResponse> {
        self.secret_creds_renew(ctx, req).await
    }

    async fn revoke(&self, ctx: &RequestContext, req: &LeaseRequest) -> Result<()> {
        self.secret_creds_revoke(ctx, req).await
    }
}
