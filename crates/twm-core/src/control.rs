//! Controller-facing operations and the process-wide runtime that owns every
//! component.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use tokio::task::JoinSet;

use crate::{
    config::Config,
    connection::port::WaConnector,
    domain::{SessionId, UserId},
    errors::ControlError,
    media::ImageHost,
    notifier::PairingNotifier,
    replies::StoredReplyHandler,
    status::StatusTracker,
    store::SessionStore,
    supervisor::{policy, Supervisor},
    tenant::{Quota, Role, Tenant, TenantRegistry},
    Result,
};

pub type ControlResult<T> = std::result::Result<T, ControlError>;

/// One row of `/list`. `owner` is only filled in for developers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub status: &'static str,
    pub owner: Option<UserId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MenuInfo {
    pub role: Role,
    pub owned: usize,
    pub quota: Quota,
}

pub struct ControlService {
    registry: Arc<TenantRegistry>,
    store: Arc<SessionStore>,
    status: Arc<StatusTracker>,
    supervisor: Arc<Supervisor>,
    /// Ids with a create or restart in progress.
    pending: Mutex<HashSet<SessionId>>,
}

/// Marks an id as being set up until dropped.
struct PendingGuard<'a> {
    set: &'a Mutex<HashSet<SessionId>>,
    id: SessionId,
}

impl<'a> PendingGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<SessionId>>, id: &SessionId) -> ControlResult<Self> {
        let mut ids = set.lock().unwrap_or_else(|p| p.into_inner());
        if !ids.insert(id.clone()) {
            return Err(ControlError::CreationFailed(format!(
                "{id} is already being set up"
            )));
        }
        Ok(Self {
            set,
            id: id.clone(),
        })
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.id);
    }
}

impl ControlService {
    pub fn new(
        registry: Arc<TenantRegistry>,
        store: Arc<SessionStore>,
        status: Arc<StatusTracker>,
        supervisor: Arc<Supervisor>,
    ) -> Self {
        Self {
            registry,
            store,
            status,
            supervisor,
            pending: Mutex::new(HashSet::new()),
        }
    }

    pub async fn tenant(&self, controller: UserId) -> Tenant {
        self.registry.get_or_create(controller).await
    }

    pub async fn menu(&self, controller: UserId) -> MenuInfo {
        let tenant = self.registry.get_or_create(controller).await;
        MenuInfo {
            role: tenant.role,
            owned: tenant.owned_sessions.len(),
            quota: self.registry.quota_of(tenant.role).await,
        }
    }

    /// Checks `/add` can go ahead without claiming anything: the id is well
    /// formed, nobody else owns it and the controller has room for it.
    pub async fn check_create(&self, controller: UserId, phone: &str) -> ControlResult<SessionId> {
        let id = SessionId::parse(phone).ok_or(ControlError::InvalidPhoneFormat)?;
        let tenant = self.registry.get_or_create(controller).await;
        match self.registry.owner_of(&id).await {
            Some(owner) if owner != controller => return Err(ControlError::Unauthorized),
            Some(_) => return Ok(id),
            None => {}
        }
        if !self.registry.can_add_session(controller).await {
            let quota = self.registry.quota_of(tenant.role).await;
            return Err(ControlError::QuotaExceeded {
                limit: quota.to_string(),
            });
        }
        Ok(id)
    }

    /// Claim the id for the controller, then start the connection. A claim made
    /// here is released again if the session does not come up.
    pub async fn create_session(&self, controller: UserId, phone: &str) -> ControlResult<SessionId> {
        let id = SessionId::parse(phone).ok_or(ControlError::InvalidPhoneFormat)?;
        let _pending = PendingGuard::acquire(&self.pending, &id)?;

        let already_owned = self.registry.get_or_create(controller).await.owns(&id);
        self.registry.add_owned_session(controller, &id).await?;

        let failure = match self.supervisor.start(&id).await {
            Ok(Some(_)) => None,
            Ok(None) => Some(ControlError::CreationFailed(
                "could not connect or obtain a pairing code".to_string(),
            )),
            Err(e) => Some(ControlError::CreationFailed(e.to_string())),
        };
        if let Some(err) = failure {
            if !already_owned {
                self.registry.remove_owned_session(controller, &id).await;
            }
            tracing::warn!(tenant = %controller, session = %id, "session creation failed: {err}");
            return Err(err);
        }

        tracing::info!(tenant = %controller, session = %id, "session created");
        Ok(id)
    }

    pub async fn list_sessions(&self, controller: UserId) -> Vec<SessionSummary> {
        let tenant = self.registry.get_or_create(controller).await;
        if tenant.role != Role::Developer {
            return tenant
                .owned_sessions
                .iter()
                .map(|id| self.summary(id, None))
                .collect();
        }

        let mut out = Vec::new();
        for t in self.registry.tenants().await {
            for id in &t.owned_sessions {
                out.push(self.summary(id, t.id));
            }
        }
        // Sessions restored from disk that nobody owns.
        for id in self.supervisor.live_ids() {
            if !out.iter().any(|s| s.session_id == id) {
                out.push(self.summary(&id, None));
            }
        }
        out
    }

    pub async fn restart_session(&self, controller: UserId, phone: &str) -> ControlResult<()> {
        let id = self.authorize(controller, phone).await?;
        let _pending = PendingGuard::acquire(&self.pending, &id)?;
        match self.supervisor.restart(&id).await {
            Ok(Some(_)) => {
                tracing::info!(tenant = %controller, session = %id, "session restarted");
                Ok(())
            }
            Ok(None) => Err(ControlError::CreationFailed(
                "could not connect or obtain a pairing code".to_string(),
            )),
            Err(e) => Err(ControlError::CreationFailed(e.to_string())),
        }
    }

    /// Log out, delete all session data and release ownership.
    pub async fn delete_session(&self, controller: UserId, phone: &str) -> ControlResult<()> {
        let id = self.authorize(controller, phone).await?;
        self.supervisor.stop(&id, true).await;
        self.store
            .destroy(&id)
            .await
            .map_err(|e| ControlError::Internal(e.to_string()))?;
        if let Some(owner) = self.registry.owner_of(&id).await {
            self.registry.remove_owned_session(owner, &id).await;
        }
        self.status.remove(&id);
        tracing::info!(tenant = %controller, session = %id, "session deleted");
        Ok(())
    }

    pub async fn set_role(&self, actor: UserId, target: UserId, role: &str) -> ControlResult<Tenant> {
        self.registry.set_role(actor, target, role).await
    }

    pub async fn set_role_limit(&self, actor: UserId, role: &str, limit: usize) -> ControlResult<Quota> {
        self.registry.set_role_limit(actor, role, limit).await
    }

    /// Every known tenant, for a developer's broadcast.
    pub async fn broadcast_targets(&self, actor: UserId) -> ControlResult<Vec<UserId>> {
        if self.registry.get_or_create(actor).await.role != Role::Developer {
            return Err(ControlError::Unauthorized);
        }
        Ok(self
            .registry
            .tenants()
            .await
            .into_iter()
            .filter_map(|t| t.id)
            .collect())
    }

    /// The session must exist (owned, live or with auth on disk) and the
    /// controller must own it or be a developer.
    pub async fn authorize(&self, controller: UserId, phone: &str) -> ControlResult<SessionId> {
        let id = SessionId::parse(phone).ok_or(ControlError::InvalidPhoneFormat)?;
        let tenant = self.registry.get_or_create(controller).await;
        let owner = self.registry.owner_of(&id).await;
        let exists = owner.is_some() || self.supervisor.is_live(&id) || self.store.has_auth(&id);
        if !exists {
            return Err(ControlError::NotFound(id.to_string()));
        }
        if owner != Some(controller) && tenant.role != Role::Developer {
            return Err(ControlError::Unauthorized);
        }
        Ok(id)
    }

    fn summary(&self, id: &SessionId, owner: Option<UserId>) -> SessionSummary {
        SessionSummary {
            session_id: id.clone(),
            status: self.supervisor.observed_status(id),
            owner,
        }
    }
}

/// Everything the process keeps alive between `init` and `teardown`.
pub struct Runtime {
    pub registry: Arc<TenantRegistry>,
    pub store: Arc<SessionStore>,
    pub status: Arc<StatusTracker>,
    pub supervisor: Arc<Supervisor>,
    pub control: Arc<ControlService>,
}

impl Runtime {
    pub fn init(
        cfg: &Config,
        connector: Arc<dyn WaConnector>,
        notifier: Arc<dyn PairingNotifier>,
        image_host: Arc<dyn ImageHost>,
    ) -> Result<Self> {
        let registry = Arc::new(TenantRegistry::load(cfg.registry_file(), cfg.owner_id)?);
        let store = Arc::new(SessionStore::new(&cfg.data_dir, &cfg.sessions_dir));
        let status = Arc::new(StatusTracker::new());
        let handler = Arc::new(StoredReplyHandler::new(
            store.clone(),
            image_host,
            cfg.bot_name.clone(),
            cfg.bot_author.clone(),
            cfg.timezone_offset_hours,
        ));
        let supervisor = Arc::new(
            Supervisor::new(
                connector,
                store.clone(),
                status.clone(),
                notifier,
                policy::from_config(cfg),
                cfg.pairing_timeout,
            )
            .with_message_handler(handler),
        );
        let control = Arc::new(ControlService::new(
            registry.clone(),
            store.clone(),
            status.clone(),
            supervisor.clone(),
        ));
        Ok(Self {
            registry,
            store,
            status,
            supervisor,
            control,
        })
    }

    /// Start every session that has auth material on disk, all at once. Returns
    /// how many came up.
    pub async fn restore_sessions(&self) -> Result<usize> {
        let ids = self.store.stored_session_ids()?;
        let mut tasks = JoinSet::new();
        for id in ids {
            let supervisor = self.supervisor.clone();
            tasks.spawn(async move {
                let res = supervisor.start(&id).await;
                (id, res)
            });
        }

        let mut started = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Some(_)))) => started += 1,
                Ok((id, Ok(None))) => tracing::warn!(session = %id, "stored session did not start"),
                Ok((id, Err(e))) => tracing::error!(session = %id, "failed to restore session: {e}"),
                Err(e) => tracing::error!("restore task panicked: {e}"),
            }
        }
        tracing::info!(started, "stored sessions restored");
        Ok(started)
    }

    /// Drop all live connections (devices stay linked) and flush every document.
    pub async fn teardown(&self) -> Result<()> {
        self.supervisor.shutdown().await;
        let sessions = self.store.flush_all().await;
        let registry = self.registry.flush().await;
        tracing::info!("runtime torn down");
        sessions.and(registry)
    }
}
