//! Replication and orchestration settings.

use ldapmesh_core::Credentials;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A required value is empty
    #[error("{field} cannot be empty")]
    Empty {
        /// Offending field
        field: &'static str,
    },

    /// A value is out of range or malformed
    #[error("Invalid {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Change-log purge thresholds, in the engine's `dd+hh:mm` notation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgePolicy {
    /// Age after which fully-processed changes are purged
    pub processed_age: String,
    /// Age after which unprocessed changes are purged
    pub unprocessed_age: String,
}

impl PurgePolicy {
    /// Value of `olcAccessLogPurge`
    #[must_use]
    pub fn render(&self) -> String {
        format!("{} {}", self.processed_age, self.unprocessed_age)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("purge.processed_age", &self.processed_age),
            ("purge.unprocessed_age", &self.unprocessed_age),
        ] {
            if !is_purge_age(value) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("'{}' is not in dd+hh:mm form", value),
                });
            }
        }
        Ok(())
    }
}

impl Default for PurgePolicy {
    fn default() -> Self {
        Self {
            processed_age: "07+00:00".to_string(),
            unprocessed_age: "01+00:00".to_string(),
        }
    }
}

fn is_purge_age(value: &str) -> bool {
    let Some((days, time)) = value.split_once('+') else {
        return false;
    };
    let Some((hours, minutes)) = time.split_once(':') else {
        return false;
    };
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    numeric(days) && numeric(hours) && numeric(minutes)
}

/// Everything needed to provision nodes and render replication directives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSettings {
    /// Identity consumers bind as when pulling from a provider
    pub replicator: Credentials,
    /// Replicated suffix
    pub search_base: String,
    /// Change-log suffix
    pub log_base: String,
    /// Change-log filter: successful write operations only
    pub log_filter: String,
    /// Consumer retry schedule
    pub retry: String,
    /// Verify provider certificates (`tls_reqcert=demand`)
    pub verify_provider_cert: bool,
    /// Trust anchor passed through to directives for TLS providers
    pub tls_cacert: Option<PathBuf>,
    /// DN of the replicated database
    pub primary_db_dn: String,
    /// DN the change-log database is created at
    pub accesslog_db_dn: String,
    /// On-disk directory of the change-log database
    pub accesslog_dir: String,
    /// Maximum size of the change-log database in bytes
    pub accesslog_max_size: u64,
    /// Password of the change-log root (`cn=admin,<log_base>`); no root bind when absent
    pub accesslog_root_password: Option<String>,
    /// Change-log purge thresholds
    pub purge: PurgePolicy,
    /// Sync-provider checkpoint (`ops minutes`)
    pub checkpoint: String,
    /// Protocol modules that must be loaded
    pub modules: Vec<String>,
}

impl ReplicationSettings {
    /// Create settings for a replication identity with the default layout
    #[must_use]
    pub fn new(replicator: Credentials) -> Self {
        Self {
            replicator,
            search_base: "o=gluu".to_string(),
            log_base: "cn=accesslog".to_string(),
            log_filter: "(&(objectClass=auditWriteObject)(reqResult=0))".to_string(),
            retry: "60 +".to_string(),
            verify_provider_cert: false,
            tls_cacert: None,
            primary_db_dn: "olcDatabase={1}mdb,cn=config".to_string(),
            accesslog_db_dn: "olcDatabase={2}mdb,cn=config".to_string(),
            accesslog_dir: "/opt/gluu/data/accesslog".to_string(),
            accesslog_max_size: 1_073_741_824,
            accesslog_root_password: None,
            purge: PurgePolicy::default(),
            checkpoint: "100 10".to_string(),
            modules: vec!["syncprov".to_string(), "accesslog".to_string()],
        }
    }

    /// Set the replicated suffix
    #[must_use]
    pub fn with_search_base(mut self, base: impl Into<String>) -> Self {
        self.search_base = base.into();
        self
    }

    /// Set the trust anchor for TLS providers
    #[must_use]
    pub fn with_tls_cacert(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls_cacert = Some(path.into());
        self
    }

    /// Set the purge policy
    #[must_use]
    pub fn with_purge(mut self, purge: PurgePolicy) -> Self {
        self.purge = purge;
        self
    }

    /// Allow binding as the change-log root
    #[must_use]
    pub fn with_accesslog_root_password(mut self, password: impl Into<String>) -> Self {
        self.accesslog_root_password = Some(password.into());
        self
    }

    /// Root DN of the change-log database
    #[must_use]
    pub fn accesslog_root_dn(&self) -> String {
        format!("cn=admin,{}", self.log_base)
    }

    /// Unlimited resource grant for the replication identity
    #[must_use]
    pub fn replicator_limits(&self) -> String {
        format!(
            "dn.exact=\"{}\" time.soft=unlimited time.hard=unlimited size.soft=unlimited size.hard=unlimited",
            self.replicator.bind_dn
        )
    }

    /// Validate the settings
    ///
    /// # Errors
    ///
    /// Returns error if a required value is empty or malformed
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("replication.bind_dn", self.replicator.bind_dn.as_str()),
            ("replication.password", self.replicator.password()),
            ("replication.search_base", self.search_base.as_str()),
            ("replication.log_base", self.log_base.as_str()),
            ("replication.primary_db_dn", self.primary_db_dn.as_str()),
            ("replication.accesslog_db_dn", self.accesslog_db_dn.as_str()),
            ("replication.accesslog_dir", self.accesslog_dir.as_str()),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty { field });
            }
        }
        if self.modules.is_empty() {
            return Err(ConfigError::Empty {
                field: "replication.modules",
            });
        }
        // The directive value is space separated; an unquoted token cannot carry one.
        if self.replicator.password().chars().any(char::is_whitespace) {
            return Err(ConfigError::Invalid {
                field: "replication.password",
                reason: "must not contain whitespace".to_string(),
            });
        }
        if self
            .accesslog_root_password
            .as_deref()
            .is_some_and(|pw| pw.trim().is_empty())
        {
            return Err(ConfigError::Empty {
                field: "replication.accesslog_root_password",
            });
        }
        self.purge.validate()
    }
}

/// File form of [`ReplicationSettings`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RawReplicationSettings {
    /// Replication identity DN
    pub bind_dn: String,
    /// Replication identity password
    pub password: String,
    /// Replicated suffix
    pub search_base: String,
    /// Verify provider certificates
    pub verify_provider_cert: bool,
    /// Trust anchor for TLS providers
    pub tls_cacert: Option<PathBuf>,
    /// Retry schedule
    pub retry: String,
    /// Change-log directory
    pub accesslog_dir: String,
    /// Change-log maximum size
    pub accesslog_max_size: u64,
    /// Change-log root password
    pub accesslog_root_password: Option<String>,
    /// Purge policy
    pub purge: PurgePolicy,
}

impl Default for RawReplicationSettings {
    fn default() -> Self {
        let defaults = ReplicationSettings::new(Credentials::new("cn=replicator,o=gluu", ""));
        Self {
            bind_dn: defaults.replicator.bind_dn.clone(),
            password: String::new(),
            search_base: defaults.search_base,
            verify_provider_cert: defaults.verify_provider_cert,
            tls_cacert: None,
            retry: defaults.retry,
            accesslog_dir: defaults.accesslog_dir,
            accesslog_max_size: defaults.accesslog_max_size,
            accesslog_root_password: None,
            purge: defaults.purge,
        }
    }
}

impl From<RawReplicationSettings> for ReplicationSettings {
    fn from(raw: RawReplicationSettings) -> Self {
        let mut settings = ReplicationSettings::new(Credentials::new(raw.bind_dn, raw.password))
            .with_search_base(raw.search_base)
            .with_purge(raw.purge);
        settings.verify_provider_cert = raw.verify_provider_cert;
        settings.tls_cacert = raw.tls_cacert;
        settings.retry = raw.retry;
        settings.accesslog_dir = raw.accesslog_dir;
        settings.accesslog_max_size = raw.accesslog_max_size;
        settings.accesslog_root_password = raw.accesslog_root_password;
        settings
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum nodes worked on concurrently
    pub max_concurrent: usize,
    /// Bound on one node's provisioning or linking, in milliseconds
    pub operation_timeout_ms: u64,
}

impl OrchestratorConfig {
    /// Create the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_concurrent: 8,
            operation_timeout_ms: 30_000,
        }
    }

    /// Set max concurrency
    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Set the per-node operation timeout
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout_ms: u64) -> Self {
        self.operation_timeout_ms = timeout_ms;
        self
    }

    /// Per-node operation timeout
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if concurrency or timeout is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                field: "orchestrator.max_concurrent",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "orchestrator.operation_timeout_ms",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ReplicationSettings {
        ReplicationSettings::new(Credentials::new("cn=replicator,o=gluu", "secret"))
    }

    #[test]
    fn test_defaults_validate() {
        assert!(settings().validate().is_ok());
        assert_eq!(settings().purge.render(), "07+00:00 01+00:00");
    }

    #[test]
    fn test_replicator_limits() {
        assert_eq!(
            settings().replicator_limits(),
            "dn.exact=\"cn=replicator,o=gluu\" time.soft=unlimited time.hard=unlimited size.soft=unlimited size.hard=unlimited"
        );
    }

    #[test]
    fn test_validate_rejects_empty_password() {
        let s = ReplicationSettings::new(Credentials::new("cn=replicator,o=gluu", ""));
        assert_eq!(
            s.validate(),
            Err(ConfigError::Empty {
                field: "replication.password"
            })
        );
    }

    #[test]
    fn test_validate_rejects_spaced_password() {
        let s = ReplicationSettings::new(Credentials::new("cn=replicator,o=gluu", "a b"));
        assert!(matches!(s.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_purge() {
        let s = settings().with_purge(PurgePolicy {
            processed_age: "7 days".to_string(),
            unprocessed_age: "01+00:00".to_string(),
        });
        assert!(matches!(
            s.validate(),
            Err(ConfigError::Invalid {
                field: "purge.processed_age",
                ..
            })
        ));
    }

    #[test]
    fn test_accesslog_root_password() {
        assert_eq!(settings().accesslog_root_dn(), "cn=admin,cn=accesslog");
        assert!(settings().with_accesslog_root_password("logpw").validate().is_ok());
        assert_eq!(
            settings().with_accesslog_root_password(" ").validate(),
            Err(ConfigError::Empty {
                field: "replication.accesslog_root_password"
            })
        );
    }

    #[test]
    fn test_raw_settings_conversion() {
        let raw: RawReplicationSettings = serde_json::from_str(
            r#"{"bind_dn": "cn=repl,o=example", "password": "pw", "search_base": "o=example"}"#,
        )
        .unwrap();
        let s = ReplicationSettings::from(raw);
        assert_eq!(s.replicator.bind_dn, "cn=repl,o=example");
        assert_eq!(s.replicator.password(), "pw");
        assert_eq!(s.search_base, "o=example");
        assert_eq!(s.retry, "60 +");
        assert!(s.validate().is_ok());
        assert!(s.accesslog_root_password.is_none());
    }

    #[test]
    fn test_orchestrator_config() {
        let config = OrchestratorConfig::new()
            .with_max_concurrent(2)
            .with_operation_timeout(500);
        assert_eq!(config.operation_timeout(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
        assert!(OrchestratorConfig::new().with_max_concurrent(0).validate().is_err());
    }
}
