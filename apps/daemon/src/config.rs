//! Daemon configuration loaded from environment variables.
//!
//! A `.env` file in the working directory is honored via `dotenvy`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use localbase_core::config::{CacheTableConfig, EngineConfig, SyncConfig};
use localbase_core::errors::{Error, Result};

pub const DEFAULT_PARTITION: &str = "default";

/// Top-level daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub engine: EngineConfig,
    /// SQLite file backing the key/blob snapshot store. `None` disables the
    /// snapshot tier.
    pub snapshot_store: Option<PathBuf>,
    /// Present when `LOCALBASE_SYNC_URL` is set.
    pub sync: Option<SyncSettings>,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub config: SyncConfig,
    pub token: Option<String>,
}

impl DaemonConfig {
    /// Loads `.env` (if any) and reads the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let partition = get("LOCALBASE_PARTITION").unwrap_or_else(|| DEFAULT_PARTITION.to_string());
        let persistence = match get("LOCALBASE_PERSISTENCE") {
            Some(value) => parse_bool("LOCALBASE_PERSISTENCE", &value)?,
            None => true,
        };

        let mut engine = EngineConfig::new(partition.trim()).with_persistence(persistence);
        if let Some(dir) = get("LOCALBASE_DATA_DIR") {
            engine = engine.with_data_dir(dir.trim());
        }
        if let Some(path) = get("LOCALBASE_SCHEMA_FILE") {
            engine = engine.with_schema(load_schema_file(Path::new(path.trim()))?);
        }
        engine.validate()?;

        let snapshot_store = get("LOCALBASE_SNAPSHOT_STORE").map(|path| PathBuf::from(path.trim()));

        let sync = match get("LOCALBASE_SYNC_URL") {
            Some(url) => {
                let mut config = SyncConfig::new(url);
                if let Some(secs) = get("LOCALBASE_SYNC_INTERVAL_SECS") {
                    let secs = secs.trim().parse::<u64>().map_err(|_| {
                        Error::config(format!(
                            "LOCALBASE_SYNC_INTERVAL_SECS must be a whole number of seconds, got '{}'",
                            secs
                        ))
                    })?;
                    if secs == 0 {
                        return Err(Error::config(
                            "LOCALBASE_SYNC_INTERVAL_SECS must be greater than zero",
                        ));
                    }
                    config = config.with_interval(Duration::from_secs(secs));
                }
                if let Some(caches) = get("LOCALBASE_CACHE_TABLES") {
                    for cache in parse_cache_tables(&caches)? {
                        config = config.with_cache_table(cache);
                    }
                }
                Some(SyncSettings {
                    config,
                    token: get("LOCALBASE_SYNC_TOKEN"),
                })
            }
            None => None,
        };

        Ok(Self {
            engine,
            snapshot_store,
            sync,
        })
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(Error::config(format!(
            "{} must be a boolean, got '{}'",
            key, other
        ))),
    }
}

/// Parses `table:column,table,...`.
fn parse_cache_tables(value: &str) -> Result<Vec<CacheTableConfig>> {
    value
        .split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| {
            CacheTableConfig::parse(entry).ok_or_else(|| {
                Error::config(format!("Invalid LOCALBASE_CACHE_TABLES entry '{}'", entry))
            })
        })
        .collect()
}

fn load_schema_file(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::config(format!(
            "Failed to read schema file {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(split_schema_scripts(&text))
}

/// Splits a schema file into scripts at lines holding only `;`. Each script
/// may itself contain several statements.
pub fn split_schema_scripts(text: &str) -> Vec<String> {
    let mut scripts = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.trim() == ";" {
            push_script(&mut scripts, &mut current);
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    push_script(&mut scripts, &mut current);
    scripts
}

fn push_script(scripts: &mut Vec<String>, current: &mut String) {
    let script = current.trim();
    if !script.is_empty() {
        scripts.push(script.to_string());
    }
    current.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<DaemonConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DaemonConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = load(&[]).unwrap();
        assert_eq!(config.engine.partition_name, DEFAULT_PARTITION);
        assert!(config.engine.persistence_enabled);
        assert!(config.engine.data_dir.is_none());
        assert!(config.snapshot_store.is_none());
        assert!(config.sync.is_none());
    }

    #[test]
    fn sync_settings_are_read_when_url_is_set() {
        let config = load(&[
            ("LOCALBASE_SYNC_URL", "https://sync.example.com/api/"),
            ("LOCALBASE_SYNC_TOKEN", "abc"),
            ("LOCALBASE_SYNC_INTERVAL_SECS", "30"),
            ("LOCALBASE_CACHE_TABLES", "quotes:valid_until, rates"),
        ])
        .unwrap();
        let sync = config.sync.expect("sync");
        assert_eq!(sync.config.api_url, "https://sync.example.com/api");
        assert_eq!(sync.config.interval, Duration::from_secs(30));
        assert_eq!(sync.token.as_deref(), Some("abc"));
        assert_eq!(
            sync.config.cache_tables,
            vec![
                CacheTableConfig::new("quotes", "valid_until"),
                CacheTableConfig::new("rates", "expires_at"),
            ]
        );
    }

    #[test]
    fn invalid_values_are_config_errors() {
        assert!(matches!(
            load(&[("LOCALBASE_PERSISTENCE", "maybe")]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            load(&[
                ("LOCALBASE_SYNC_URL", "http://x"),
                ("LOCALBASE_SYNC_INTERVAL_SECS", "0")
            ]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            load(&[("LOCALBASE_PARTITION", "a/b")]),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn schema_file_is_split_at_separator_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.sql");
        std::fs::write(
            &path,
            "CREATE TABLE a (x);\nCREATE INDEX a_x ON a (x);\n;\n\nCREATE TABLE b (y);\n;\n",
        )
        .unwrap();

        let config = load(&[("LOCALBASE_SCHEMA_FILE", path.to_str().unwrap())]).unwrap();
        assert_eq!(
            config.engine.schema_statements,
            vec![
                "CREATE TABLE a (x);\nCREATE INDEX a_x ON a (x);".to_string(),
                "CREATE TABLE b (y);".to_string(),
            ]
        );
    }

    #[test]
    fn missing_schema_file_is_reported() {
        let err = load(&[("LOCALBASE_SCHEMA_FILE", "/nonexistent/schema.sql")]).unwrap_err();
        assert!(err.to_string().contains("schema file"));
    }
}
