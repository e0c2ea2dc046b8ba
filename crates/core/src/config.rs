//! Configuration structs for the engine and the sync coordinator.
//!
//! Loading from the environment happens in the host application; these types
//! only carry values and defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::sync::{
    ConflictPolicy, AUTOSAVE_DEBOUNCE_MS, SYNC_INTERVAL_SECS, SYNC_REQUEST_TIMEOUT_SECS,
};

/// Engine initialization config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Key under which snapshots (or the database file) are stored.
    pub partition_name: String,
    pub persistence_enabled: bool,
    /// Executed in order after a tier is selected. Each entry may hold several
    /// `;`-separated statements.
    pub schema_statements: Vec<String>,
    /// Sandbox directory for the file-backed tier. `None` disables that tier.
    pub data_dir: Option<PathBuf>,
    #[serde(with = "duration_millis")]
    pub autosave_debounce: Duration,
}

impl EngineConfig {
    pub fn new(partition_name: impl Into<String>) -> Self {
        Self {
            partition_name: partition_name.into(),
            persistence_enabled: true,
            schema_statements: Vec::new(),
            data_dir: None,
            autosave_debounce: Duration::from_millis(AUTOSAVE_DEBOUNCE_MS),
        }
    }

    pub fn with_persistence(mut self, enabled: bool) -> Self {
        self.persistence_enabled = enabled;
        self
    }

    pub fn with_schema<I, S>(mut self, statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schema_statements = statements.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_autosave_debounce(mut self, debounce: Duration) -> Self {
        self.autosave_debounce = debounce;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.partition_name.trim();
        if name.is_empty() {
            return Err(Error::config("Partition name must not be empty"));
        }
        if name
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control())
        {
            return Err(Error::config(format!(
                "Partition name '{}' contains path separators or control characters",
                self.partition_name
            )));
        }
        Ok(())
    }
}

/// A locally cached table whose rows carry an expiry timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheTableConfig {
    pub table: String,
    /// Column holding an ISO-8601 expiry timestamp.
    pub expires_at_column: String,
}

impl CacheTableConfig {
    pub fn new(table: impl Into<String>, expires_at_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            expires_at_column: expires_at_column.into(),
        }
    }

    /// Parses `table:column` (column defaults to `expires_at`).
    pub fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return None;
        }
        match spec.split_once(':') {
            Some((table, column)) if !table.trim().is_empty() && !column.trim().is_empty() => {
                Some(Self::new(table.trim(), column.trim()))
            }
            Some(_) => None,
            None => Some(Self::new(spec, "expires_at")),
        }
    }
}

/// Sync coordinator config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Base URL of the remote canonical store.
    pub api_url: String,
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    pub conflict_policy: ConflictPolicy,
    pub cache_tables: Vec<CacheTableConfig>,
}

impl SyncConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim().trim_end_matches('/').to_string(),
            interval: Duration::from_secs(SYNC_INTERVAL_SECS),
            request_timeout: Duration::from_secs(SYNC_REQUEST_TIMEOUT_SECS),
            conflict_policy: ConflictPolicy::default(),
            cache_tables: Vec::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn with_cache_table(mut self, table: CacheTableConfig) -> Self {
        self.cache_tables.push(table);
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
