//! Tenant registry: controller identity → role, quota and owned sessions.
//!
//! Persisted as one JSON document `{users:{}, settings:{roles:{...}}}`. Tenants are
//! created lazily on first interaction.

use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    domain::{SessionId, UserId},
    errors::ControlError,
    persist::{read_json, write_json_atomic},
    utils::iso_timestamp_utc,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Free,
    Premium,
    Vip,
    Vvip,
    Developer,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Free,
        Role::Premium,
        Role::Vip,
        Role::Vvip,
        Role::Developer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Free => "free",
            Role::Premium => "premium",
            Role::Vip => "vip",
            Role::Vvip => "vvip",
            Role::Developer => "developer",
        }
    }

    fn default_quota(self) -> Quota {
        match self {
            Role::Free => Quota::Limited(1),
            Role::Premium => Quota::Limited(2),
            Role::Vip => Quota::Limited(3),
            Role::Vvip => Quota::Limited(5),
            Role::Developer => Quota::Unlimited,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ControlError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == lower)
            .ok_or_else(|| ControlError::InvalidRole(s.trim().to_string()))
    }
}

/// How many sessions a role may own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quota {
    Limited(usize),
    Unlimited,
}

impl Quota {
    pub fn allows(self, owned: usize) -> bool {
        match self {
            Quota::Limited(n) => owned < n,
            Quota::Unlimited => true,
        }
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quota::Limited(n) => write!(f, "{n}"),
            Quota::Unlimited => f.write_str("∞"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    #[serde(skip)]
    pub id: Option<UserId>,
    pub role: Role,
    #[serde(rename = "bots", default)]
    pub owned_sessions: Vec<SessionId>,
    #[serde(rename = "joinDate")]
    pub joined_at: String,
}

impl Tenant {
    pub fn owns(&self, session_id: &SessionId) -> bool {
        self.owned_sessions.contains(session_id)
    }
}

/// `limit: null` encodes an unlimited quota.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RoleLimit {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Settings {
    #[serde(default)]
    roles: BTreeMap<Role, RoleLimit>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RegistryDoc {
    #[serde(default)]
    users: BTreeMap<i64, Tenant>,
    #[serde(default)]
    settings: Settings,
}

impl RegistryDoc {
    /// Fill in missing role limits; the developer role is always unlimited.
    fn normalize(&mut self) -> bool {
        let mut changed = false;
        for role in Role::ALL {
            if !self.settings.roles.contains_key(&role) {
                let limit = match role.default_quota() {
                    Quota::Limited(n) => Some(n),
                    Quota::Unlimited => None,
                };
                self.settings.roles.insert(role, RoleLimit { limit });
                changed = true;
            }
        }
        if let Some(dev) = self.settings.roles.get_mut(&Role::Developer) {
            if dev.limit.is_some() {
                dev.limit = None;
                changed = true;
            }
        }
        for (id, tenant) in self.users.iter_mut() {
            tenant.id = Some(UserId(*id));
        }
        changed
    }

    fn quota_of(&self, role: Role) -> Quota {
        if role == Role::Developer {
            return Quota::Unlimited;
        }
        match self.settings.roles.get(&role) {
            Some(RoleLimit { limit: Some(n) }) => Quota::Limited(*n),
            Some(RoleLimit { limit: None }) => Quota::Unlimited,
            None => Quota::Limited(0),
        }
    }
}

pub struct TenantRegistry {
    path: PathBuf,
    owner: UserId,
    doc: Mutex<RegistryDoc>,
}

impl TenantRegistry {
    /// Load the registry document (or start empty) and make sure every role has a quota.
    pub fn load(path: impl Into<PathBuf>, owner: UserId) -> Result<Self> {
        let path = path.into();
        let mut doc = match read_json::<RegistryDoc>(&path) {
            Ok(Some(doc)) => doc,
            Ok(None) => RegistryDoc::default(),
            Err(e) => {
                tracing::error!(path = %path.display(), "failed to load tenant registry, starting empty: {e}");
                RegistryDoc::default()
            }
        };
        let changed = doc.normalize();
        if changed || !path.exists() {
            write_json_atomic(&path, &doc)?;
        }
        Ok(Self {
            path,
            owner,
            doc: Mutex::new(doc),
        })
    }

    pub fn owner(&self) -> UserId {
        self.owner
    }

    pub async fn get_or_create(&self, id: UserId) -> Tenant {
        let mut doc = self.doc.lock().await;
        self.ensure(&mut doc, id)
    }

    /// Change `target`'s role. Checks, in order: role name, owner immutability,
    /// actor is developer, only the owner may grant developer.
    pub async fn set_role(
        &self,
        actor: UserId,
        target: UserId,
        new_role: &str,
    ) -> std::result::Result<Tenant, ControlError> {
        let role: Role = new_role.parse()?;
        if target == self.owner && role != Role::Developer {
            return Err(ControlError::ImmutableRole);
        }

        let mut doc = self.doc.lock().await;
        let actor_tenant = self.ensure(&mut doc, actor);
        if actor_tenant.role != Role::Developer {
            return Err(ControlError::Unauthorized);
        }
        if role == Role::Developer && actor != self.owner {
            return Err(ControlError::ImmutableRole);
        }

        self.ensure(&mut doc, target);
        let Some(entry) = doc.users.get_mut(&target.0) else {
            return Err(ControlError::NotFound(target.to_string()));
        };
        entry.role = role;
        let out = entry.clone();
        self.persist(&doc);
        tracing::info!(actor = %actor, target = %target, role = %role, "role changed");
        Ok(out)
    }

    /// Change the quota of a non-developer role (developer-only).
    pub async fn set_role_limit(
        &self,
        actor: UserId,
        role: &str,
        limit: usize,
    ) -> std::result::Result<Quota, ControlError> {
        let role: Role = role.parse()?;
        let mut doc = self.doc.lock().await;
        if self.ensure(&mut doc, actor).role != Role::Developer {
            return Err(ControlError::Unauthorized);
        }
        if role == Role::Developer {
            return Err(ControlError::ImmutableRole);
        }
        doc.settings
            .roles
            .insert(role, RoleLimit { limit: Some(limit) });
        self.persist(&doc);
        tracing::info!(actor = %actor, role = %role, limit, "role limit changed");
        Ok(Quota::Limited(limit))
    }

    pub async fn can_add_session(&self, id: UserId) -> bool {
        let mut doc = self.doc.lock().await;
        let tenant = self.ensure(&mut doc, id);
        tenant.role == Role::Developer || doc.quota_of(tenant.role).allows(tenant.owned_sessions.len())
    }

    /// Append `session_id` to the tenant's owned list. Idempotent; refuses to go
    /// over quota or to take a session another tenant owns.
    pub async fn add_owned_session(
        &self,
        id: UserId,
        session_id: &SessionId,
    ) -> std::result::Result<Tenant, ControlError> {
        let mut doc = self.doc.lock().await;
        let tenant = self.ensure(&mut doc, id);
        if tenant.owns(session_id) {
            return Ok(tenant);
        }
        if doc
            .users
            .iter()
            .any(|(other, t)| *other != id.0 && t.owns(session_id))
        {
            return Err(ControlError::Unauthorized);
        }
        let quota = doc.quota_of(tenant.role);
        if tenant.role != Role::Developer && !quota.allows(tenant.owned_sessions.len()) {
            return Err(ControlError::QuotaExceeded {
                limit: quota.to_string(),
            });
        }
        let Some(entry) = doc.users.get_mut(&id.0) else {
            return Err(ControlError::NotFound(id.to_string()));
        };
        entry.owned_sessions.push(session_id.clone());
        let out = entry.clone();
        self.persist(&doc);
        Ok(out)
    }

    pub async fn remove_owned_session(&self, id: UserId, session_id: &SessionId) -> Tenant {
        let mut doc = self.doc.lock().await;
        let tenant = self.ensure(&mut doc, id);
        if !tenant.owns(session_id) {
            return tenant;
        }
        let Some(entry) = doc.users.get_mut(&id.0) else {
            return tenant;
        };
        entry.owned_sessions.retain(|s| s != session_id);
        let out = entry.clone();
        self.persist(&doc);
        out
    }

    pub async fn quota_of(&self, role: Role) -> Quota {
        self.doc.lock().await.quota_of(role)
    }

    /// Who owns `session_id`, if anyone.
    pub async fn owner_of(&self, session_id: &SessionId) -> Option<UserId> {
        let doc = self.doc.lock().await;
        doc.users
            .iter()
            .find(|(_, t)| t.owns(session_id))
            .map(|(id, _)| UserId(*id))
    }

    /// Snapshot of all tenants (ordered by id).
    pub async fn tenants(&self) -> Vec<Tenant> {
        self.doc.lock().await.users.values().cloned().collect()
    }

    /// Write the current document; used at teardown.
    pub async fn flush(&self) -> Result<()> {
        let doc = self.doc.lock().await;
        write_json_atomic(&self.path, &*doc)
    }

    fn ensure(&self, doc: &mut RegistryDoc, id: UserId) -> Tenant {
        if let Some(t) = doc.users.get(&id.0) {
            return t.clone();
        }
        let role = if id == self.owner {
            Role::Developer
        } else {
            Role::Free
        };
        let tenant = Tenant {
            id: Some(id),
            role,
            owned_sessions: Vec::new(),
            joined_at: iso_timestamp_utc(),
        };
        doc.users.insert(id.0, tenant.clone());
        self.persist(doc);
        tracing::info!(tenant = %id, role = %role, "tenant created");
        tenant
    }

    /// Persistence failures are logged; the in-memory state is kept as-is.
    fn persist(&self, doc: &RegistryDoc) {
        if let Err(e) = write_json_atomic(&self.path, doc) {
            tracing::error!(path = %self.path.display(), "failed to save tenant registry: {e}");
        }
    }
}
