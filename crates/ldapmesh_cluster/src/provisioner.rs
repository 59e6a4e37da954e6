//! Node provisioning.
//!
//! Brings a node to the state where it can serve as a replication provider:
//! server ID set, protocol modules loaded, a change-log database with its own
//! sync provider, the sync provider and change-log overlay on the primary
//! database, the indexes replication relies on, and unlimited resource limits
//! for the replication identity. Every step reads before it writes, so a
//! provisioned node receives no writes at all.

use crate::settings::ReplicationSettings;
use ldapmesh_core::{NodeId, ServerId};
use ldapmesh_directory::{ConfigSession, DirectoryError, Modification, Scope, strip_ordering_prefix};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

const CONFIG_ROOT: &str = "cn=config";
const OVERLAY_FILTER_BASE: &str = "(&(objectClass=olcOverlayConfig)(olcOverlay=";
const REQUIRED_INDEXES: &[(&str, &str)] = &[("entryCSN", "eq"), ("entryUUID", "eq")];

/// Provisioning step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// `olcServerID` on the global entry
    ServerId,
    /// Sync-provider and change-log modules
    Modules,
    /// Change-log database
    AccessLogDatabase,
    /// Sync provider on the change-log database
    AccessLogSyncProv,
    /// Sync provider on the primary database
    PrimarySyncProv,
    /// Replication indexes on the primary database
    PrimaryIndexes,
    /// Change-log overlay on the primary database
    AccessLogOverlay,
    /// Resource limits for the replication identity
    ReplicatorLimits,
}

impl StepKind {
    /// Steps in execution order
    pub const ALL: [StepKind; 8] = [
        Self::ServerId,
        Self::Modules,
        Self::AccessLogDatabase,
        Self::AccessLogSyncProv,
        Self::PrimarySyncProv,
        Self::PrimaryIndexes,
        Self::AccessLogOverlay,
        Self::ReplicatorLimits,
    ];

    /// Stable name used in logs
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ServerId => "server_id",
            Self::Modules => "modules",
            Self::AccessLogDatabase => "accesslog_database",
            Self::AccessLogSyncProv => "accesslog_syncprov",
            Self::PrimarySyncProv => "primary_syncprov",
            Self::PrimaryIndexes => "primary_indexes",
            Self::AccessLogOverlay => "accesslog_overlay",
            Self::ReplicatorLimits => "replicator_limits",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a step did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// A new entry was added
    Created,
    /// An existing entry was modified
    Updated,
    /// Already in the desired state; nothing written
    Unchanged,
}

impl StepOutcome {
    /// Whether the step wrote anything
    #[must_use]
    pub const fn wrote(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Provisioning errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionError {
    /// A directory call failed during a step
    #[error("Provisioning step {step} failed: {source}")]
    Directory {
        /// Step that failed
        step: StepKind,
        /// Underlying failure
        #[source]
        source: DirectoryError,
    },
}

impl ProvisionError {
    /// Step that failed
    #[must_use]
    pub const fn step(&self) -> StepKind {
        match self {
            Self::Directory { step, .. } => *step,
        }
    }

    /// Whether the node could not be talked to at all
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        match self {
            Self::Directory { source, .. } => source.is_connectivity(),
        }
    }
}

/// Outcome of provisioning one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionReport {
    /// Node provisioned
    pub node: NodeId,
    /// DN of the change-log database as found or created
    pub accesslog_db: String,
    /// Outcome of every step, in order
    pub steps: Vec<(StepKind, StepOutcome)>,
}

impl ProvisionReport {
    /// Number of writes performed (each changing step writes once)
    #[must_use]
    pub fn writes(&self) -> usize {
        self.steps.iter().filter(|(_, o)| o.wrote()).count()
    }

    /// Outcome of one step
    #[must_use]
    pub fn outcome(&self, step: StepKind) -> Option<StepOutcome> {
        self.steps.iter().find(|(s, _)| *s == step).map(|(_, o)| *o)
    }
}

/// Read-only view of a node's provisioning state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionStatus {
    /// Configured server ID
    pub server_id: Option<ServerId>,
    /// Required modules that are not loaded
    pub missing_modules: Vec<String>,
    /// DN of the change-log database, if any
    pub accesslog_db: Option<String>,
    /// Sync provider present on the change-log database
    pub accesslog_syncprov: bool,
    /// Sync provider present on the primary database
    pub primary_syncprov: bool,
    /// Replication indexes present
    pub primary_indexes: bool,
    /// Change-log overlay present on the primary database
    pub accesslog_overlay: bool,
    /// Change-log purge policy matches the settings
    pub purge_matches: bool,
    /// Replication identity has unlimited resource limits
    pub replicator_limits: bool,
}

impl ProvisionStatus {
    /// Whether the node may serve as a provider
    #[must_use]
    pub fn is_provisioned(&self) -> bool {
        self.server_id.is_some()
            && self.missing_modules.is_empty()
            && self.accesslog_db.is_some()
            && self.accesslog_syncprov
            && self.primary_syncprov
            && self.primary_indexes
            && self.accesslog_overlay
            && self.purge_matches
            && self.replicator_limits
    }
}

/// Prepares nodes to take part in replication
#[derive(Debug, Clone)]
pub struct Provisioner {
    settings: ReplicationSettings,
}

impl Provisioner {
    /// Create a provisioner
    #[must_use]
    pub fn new(settings: ReplicationSettings) -> Self {
        Self { settings }
    }

    /// Settings in use
    #[must_use]
    pub fn settings(&self) -> &ReplicationSettings {
        &self.settings
    }

    /// Run every step against one node
    ///
    /// Stops at the first step the node rejects.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] naming the step that failed
    pub async fn provision(
        &self,
        session: &mut dyn ConfigSession,
        server_id: ServerId,
    ) -> Result<ProvisionReport, ProvisionError> {
        let node = session.node().clone();
        let mut accesslog_db = self.settings.accesslog_db_dn.clone();
        let mut steps = Vec::with_capacity(StepKind::ALL.len());

        for step in StepKind::ALL {
            let result = match step {
                StepKind::ServerId => self.ensure_server_id(session, server_id).await,
                StepKind::Modules => self.ensure_modules(session).await,
                StepKind::AccessLogDatabase => match self.ensure_accesslog_db(session).await {
                    Ok((outcome, dn)) => {
                        accesslog_db = dn;
                        Ok(outcome)
                    }
                    Err(e) => Err(e),
                },
                StepKind::AccessLogSyncProv => {
                    let attrs = vec![
                        ("olcSpReloadHint", "TRUE".to_string()),
                        ("olcSpCheckpoint", self.settings.checkpoint.clone()),
                    ];
                    ensure_overlay(session, &accesslog_db, "syncprov", "olcSyncProvConfig", attrs).await
                }
                StepKind::PrimarySyncProv => {
                    let attrs = vec![
                        ("olcSpNoPresent", "TRUE".to_string()),
                        ("olcSpReloadHint", "TRUE".to_string()),
                    ];
                    ensure_overlay(
                        session,
                        &self.settings.primary_db_dn,
                        "syncprov",
                        "olcSyncProvConfig",
                        attrs,
                    )
                    .await
                }
                StepKind::PrimaryIndexes => self.ensure_indexes(session).await,
                StepKind::AccessLogOverlay => {
                    let attrs = vec![
                        ("olcAccessLogDB", self.settings.log_base.clone()),
                        ("olcAccessLogOps", "writes".to_string()),
                        ("olcAccessLogSuccess", "TRUE".to_string()),
                        ("olcAccessLogPurge", self.settings.purge.render()),
                    ];
                    ensure_overlay(
                        session,
                        &self.settings.primary_db_dn,
                        "accesslog",
                        "olcAccessLogConfig",
                        attrs,
                    )
                    .await
                }
                StepKind::ReplicatorLimits => self.ensure_limits(session).await,
            };

            match result {
                Ok(outcome) => {
                    if outcome.wrote() {
                        info!(node = %node, step = %step, outcome = ?outcome, "provisioning step applied");
                    } else {
                        debug!(node = %node, step = %step, "provisioning step already satisfied");
                    }
                    steps.push((step, outcome));
                }
                Err(source) => {
                    warn!(node = %node, step = %step, error = %source, "provisioning step rejected");
                    return Err(ProvisionError::Directory { step, source });
                }
            }
        }

        Ok(ProvisionReport {
            node,
            accesslog_db,
            steps,
        })
    }

    /// Inspect a node without changing it
    ///
    /// # Errors
    ///
    /// Returns error if the node cannot be read
    pub async fn status(&self, session: &mut dyn ConfigSession) -> Result<ProvisionStatus, DirectoryError> {
        let server_id = session
            .read_values(CONFIG_ROOT, "olcServerID")
            .await?
            .first()
            .and_then(|v| parse_server_id(v));

        let loaded = loaded_modules(session).await?.map(|(_, names)| names).unwrap_or_default();
        let missing_modules = self
            .settings
            .modules
            .iter()
            .filter(|m| !loaded.contains(&module_name(m)))
            .cloned()
            .collect();

        let accesslog_db = find_accesslog_db(session, &self.settings.log_base).await?;
        let accesslog_syncprov = match &accesslog_db {
            Some(dn) => find_overlay(session, dn, "syncprov").await?.is_some(),
            None => false,
        };
        let primary = &self.settings.primary_db_dn;
        let primary_syncprov = find_overlay(session, primary, "syncprov").await?.is_some();
        let indexes = session.read_values(primary, "olcDbIndex").await?;
        let primary_indexes = REQUIRED_INDEXES
            .iter()
            .all(|(attr, kind)| index_present(&indexes, attr, kind));
        let overlay = find_overlay(session, primary, "accesslog").await?;
        let purge = self.settings.purge.render();
        let purge_matches = overlay
            .as_ref()
            .and_then(|e| e.first("olcAccessLogPurge"))
            .is_some_and(|v| v == purge);
        let limits = self.settings.replicator_limits();
        let replicator_limits = session
            .read_values(primary, "olcLimits")
            .await?
            .iter()
            .any(|v| strip_ordering_prefix(v) == limits);

        Ok(ProvisionStatus {
            server_id,
            missing_modules,
            accesslog_db,
            accesslog_syncprov,
            primary_syncprov,
            primary_indexes,
            accesslog_overlay: overlay.is_some(),
            purge_matches,
            replicator_limits,
        })
    }

    async fn ensure_server_id(
        &self,
        session: &mut dyn ConfigSession,
        server_id: ServerId,
    ) -> Result<StepOutcome, DirectoryError> {
        let current = session.read_values(CONFIG_ROOT, "olcServerID").await?;
        let desired = server_id.get().to_string();
        match current.first() {
            Some(v) if parse_server_id(v) == Some(server_id) && current.len() == 1 => Ok(StepOutcome::Unchanged),
            Some(_) => {
                warn!(node = %session.node(), current = ?current, desired = %desired, "server ID drift, replacing");
                session
                    .modify(CONFIG_ROOT, vec![Modification::replace("olcServerID", vec![desired])])
                    .await?;
                Ok(StepOutcome::Updated)
            }
            None => {
                session
                    .modify(CONFIG_ROOT, vec![Modification::add("olcServerID", vec![desired])])
                    .await?;
                Ok(StepOutcome::Updated)
            }
        }
    }

    async fn ensure_modules(&self, session: &mut dyn ConfigSession) -> Result<StepOutcome, DirectoryError> {
        match loaded_modules(session).await? {
            Some((dn, loaded)) => {
                let missing: Vec<String> = self
                    .settings
                    .modules
                    .iter()
                    .filter(|m| !loaded.contains(&module_name(m)))
                    .cloned()
                    .collect();
                if missing.is_empty() {
                    return Ok(StepOutcome::Unchanged);
                }
                debug!(node = %session.node(), missing = ?missing, "loading modules");
                session
                    .modify(&dn, vec![Modification::add("olcModuleLoad", missing)])
                    .await?;
                Ok(StepOutcome::Updated)
            }
            None => {
                session
                    .add(
                        "cn=module{0},cn=config",
                        vec![
                            ("objectClass".to_string(), vec!["olcModuleList".to_string()]),
                            ("cn".to_string(), vec!["module{0}".to_string()]),
                            ("olcModuleLoad".to_string(), self.settings.modules.clone()),
                        ],
                    )
                    .await?;
                Ok(StepOutcome::Created)
            }
        }
    }

    async fn ensure_accesslog_db(
        &self,
        session: &mut dyn ConfigSession,
    ) -> Result<(StepOutcome, String), DirectoryError> {
        let s = &self.settings;
        if let Some(dn) = find_accesslog_db(session, &s.log_base).await? {
            return Ok((StepOutcome::Unchanged, dn));
        }
        let dn = s.accesslog_db_dn.clone();
        let database = dn
            .split(',')
            .next()
            .and_then(|rdn| rdn.split_once('='))
            .map(|(_, v)| v.to_string())
            .unwrap_or_else(|| "mdb".to_string());
        let mut attrs = vec![
            (
                "objectClass".to_string(),
                vec!["olcDatabaseConfig".to_string(), "olcMdbConfig".to_string()],
            ),
            ("olcDatabase".to_string(), vec![database]),
            ("olcDbDirectory".to_string(), vec![s.accesslog_dir.clone()]),
            ("olcSuffix".to_string(), vec![s.log_base.clone()]),
            ("olcRootDN".to_string(), vec![s.accesslog_root_dn()]),
            (
                "olcDbIndex".to_string(),
                vec![
                    "default eq".to_string(),
                    "entryCSN,objectClass,reqEnd,reqResult,reqStart".to_string(),
                ],
            ),
            ("olcDbMaxSize".to_string(), vec![s.accesslog_max_size.to_string()]),
            ("olcLimits".to_string(), vec![s.replicator_limits()]),
        ];
        if let Some(password) = &s.accesslog_root_password {
            attrs.push(("olcRootPW".to_string(), vec![password.clone()]));
        }
        session.add(&dn, attrs).await?;
        Ok((StepOutcome::Created, dn))
    }

    async fn ensure_indexes(&self, session: &mut dyn ConfigSession) -> Result<StepOutcome, DirectoryError> {
        let primary = &self.settings.primary_db_dn;
        let current = session.read_values(primary, "olcDbIndex").await?;
        let missing: Vec<String> = REQUIRED_INDEXES
            .iter()
            .filter(|(attr, kind)| !index_present(&current, attr, kind))
            .map(|(attr, kind)| format!("{} {}", attr, kind))
            .collect();
        if missing.is_empty() {
            return Ok(StepOutcome::Unchanged);
        }
        session
            .modify(primary, vec![Modification::add("olcDbIndex", missing)])
            .await?;
        Ok(StepOutcome::Updated)
    }

    async fn ensure_limits(&self, session: &mut dyn ConfigSession) -> Result<StepOutcome, DirectoryError> {
        let primary = &self.settings.primary_db_dn;
        let limits = self.settings.replicator_limits();
        let current = session.read_values(primary, "olcLimits").await?;
        if current.iter().any(|v| strip_ordering_prefix(v) == limits) {
            return Ok(StepOutcome::Unchanged);
        }
        session
            .modify(primary, vec![Modification::add("olcLimits", vec![limits])])
            .await?;
        Ok(StepOutcome::Updated)
    }
}

/// Locate or create an overlay below `database`, then reconcile its attributes
async fn ensure_overlay(
    session: &mut dyn ConfigSession,
    database: &str,
    overlay: &str,
    class: &str,
    attrs: Vec<(&str, String)>,
) -> Result<StepOutcome, DirectoryError> {
    let Some(existing) = find_overlay(session, database, overlay).await? else {
        let mut entry = vec![
            (
                "objectClass".to_string(),
                vec!["olcOverlayConfig".to_string(), class.to_string()],
            ),
            ("olcOverlay".to_string(), vec![overlay.to_string()]),
        ];
        entry.extend(attrs.into_iter().map(|(k, v)| (k.to_string(), vec![v])));
        session.add(&format!("olcOverlay={},{}", overlay, database), entry).await?;
        return Ok(StepOutcome::Created);
    };

    let changes: Vec<Modification> = attrs
        .into_iter()
        .filter(|(k, v)| existing.get(k) != std::slice::from_ref(v))
        .map(|(k, v)| Modification::replace(k, vec![v]))
        .collect();
    if changes.is_empty() {
        return Ok(StepOutcome::Unchanged);
    }
    let drifted: Vec<&str> = changes.iter().map(|c| c.attr.as_str()).collect();
    warn!(node = %session.node(), overlay, dn = %existing.dn, drifted = ?drifted, "overlay drift, replacing");
    session.modify(&existing.dn, changes).await?;
    Ok(StepOutcome::Updated)
}

async fn find_overlay(
    session: &mut dyn ConfigSession,
    database: &str,
    overlay: &str,
) -> Result<Option<ldapmesh_directory::Entry>, DirectoryError> {
    let filter = format!("{}{}))", OVERLAY_FILTER_BASE, overlay);
    let mut found = session.search(database, Scope::OneLevel, &filter, &["*"]).await?;
    Ok(if found.is_empty() {
        None
    } else {
        Some(found.swap_remove(0))
    })
}

async fn find_accesslog_db(
    session: &mut dyn ConfigSession,
    log_base: &str,
) -> Result<Option<String>, DirectoryError> {
    let filter = format!("(olcSuffix={})", log_base);
    let found = session
        .search(CONFIG_ROOT, Scope::Subtree, &filter, &["olcSuffix"])
        .await?;
    Ok(found.into_iter().next().map(|e| e.dn))
}

/// Module list entry and the normalized names it loads
async fn loaded_modules(
    session: &mut dyn ConfigSession,
) -> Result<Option<(String, Vec<String>)>, DirectoryError> {
    let lists = session
        .search(CONFIG_ROOT, Scope::OneLevel, "(objectClass=olcModuleList)", &["olcModuleLoad"])
        .await?;
    let Some(first) = lists.first() else {
        return Ok(None);
    };
    let names = lists
        .iter()
        .flat_map(|e| e.get("olcModuleLoad").iter().map(|v| module_name(v)))
        .collect();
    Ok(Some((first.dn.clone(), names)))
}

/// `{1}/usr/lib/ldap/syncprov.la` -> `syncprov`
fn module_name(value: &str) -> String {
    let bare = strip_ordering_prefix(value).trim();
    let file = bare.rsplit('/').next().unwrap_or(bare);
    file.strip_suffix(".la")
        .or_else(|| file.strip_suffix(".so"))
        .unwrap_or(file)
        .to_ascii_lowercase()
}

/// Whether an `olcDbIndex` value covers `attr` with index type `kind`
fn index_present(values: &[String], attr: &str, kind: &str) -> bool {
    values.iter().any(|value| {
        let mut parts = strip_ordering_prefix(value).split_whitespace();
        let attrs = parts.next().unwrap_or_default();
        let kinds: Vec<&str> = parts.flat_map(|p| p.split(',')).collect();
        attrs.split(',').any(|a| a.eq_ignore_ascii_case(attr))
            && kinds.iter().any(|k| k.eq_ignore_ascii_case(kind))
    })
}

fn parse_server_id(value: &str) -> Option<ServerId> {
    value
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<u16>().ok())
        .and_then(|v| ServerId::new(v).ok())
}
