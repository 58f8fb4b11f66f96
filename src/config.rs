//! Runtime configuration, read from the process environment.
//!
//! An optional `.env` file in the working directory is layered underneath
//! the environment: it only supplies variables the environment does not
//! define. Both layers are read through the `config` crate.

use std::{
    collections::HashMap,
    env,
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
};

use thiserror::Error;

/// Only variables with this prefix are taken from the process environment.
pub const ENV_PREFIX: &str = "STOREFRONT_";
pub const DEFAULT_ENV_FILE: &str = ".env";

pub const ENV_LOCAL_DB: &str = "STOREFRONT_LOCAL_DB";
pub const ENV_REMOTE_DB: &str = "STOREFRONT_REMOTE_DB";
pub const ENV_SYNC_INTERVAL: &str = "STOREFRONT_SYNC_INTERVAL_SECS";
pub const ENV_SYNC_BACKOFF: &str = "STOREFRONT_SYNC_BACKOFF_SECS";
pub const ENV_SYNC_ACTOR: &str = "STOREFRONT_SYNC_ACTOR";
pub const ENV_RECONCILE_ORPHANS: &str = "STOREFRONT_RECONCILE_ORPHANS";
pub const ENV_DELIVERY_LEAD_DAYS: &str = "STOREFRONT_DELIVERY_LEAD_DAYS";
pub const ENV_LOG_DIR: &str = "STOREFRONT_LOG_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },

    #[error("failed to read configuration: {0}")]
    Source(#[from] ::config::ConfigError),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub local_db_path: PathBuf,
    pub remote_db_path: PathBuf,
    /// Pause between sweeps of the background sync loop.
    pub sync_interval_secs: u64,
    /// Pause after a sweep could not even list pending orders.
    pub sync_backoff_secs: u64,
    /// Actor name written to the sync log by the background loop.
    pub sync_actor: String,
    pub reconcile_orphans: bool,
    pub delivery_lead_days: i64,
    /// `None` means the platform default from `diagnostics::get_log_dir`.
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_db_path: PathBuf::from("data/local.db"),
            remote_db_path: PathBuf::from("data/remote.db"),
            sync_interval_secs: 60,
            sync_backoff_secs: 120,
            sync_actor: "background-sync".to_string(),
            reconcile_orphans: true,
            delivery_lead_days: 2,
            log_dir: None,
        }
    }
}

impl Config {
    /// Read `.env` (if present) layered under the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(DEFAULT_ENV_FILE), env::vars())
    }

    /// Layer `env_file` under `vars`; a key present in `vars` always wins.
    /// A missing file is not an error.
    pub fn load_from<I>(env_file: &Path, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        use ::config::{Environment, File, FileFormat};

        let prefixed: ::config::Map<String, String> = vars
            .into_iter()
            .filter(|(key, _)| key.starts_with(ENV_PREFIX))
            .collect();
        let environment = read_layer(Environment::default().source(Some(prefixed)))?;
        let file = read_layer(File::new(&env_file.to_string_lossy(), FileFormat::Ini).required(false))?;

        Self::from_lookup(|key| find_key(&environment, key).or_else(|| find_key(&file, key)))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let config = Self {
            local_db_path: lookup(ENV_LOCAL_DB)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.local_db_path),
            remote_db_path: lookup(ENV_REMOTE_DB)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.remote_db_path),
            sync_interval_secs: try_load(&lookup, ENV_SYNC_INTERVAL, defaults.sync_interval_secs)?,
            sync_backoff_secs: try_load(&lookup, ENV_SYNC_BACKOFF, defaults.sync_backoff_secs)?,
            sync_actor: lookup(ENV_SYNC_ACTOR)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.sync_actor),
            reconcile_orphans: match lookup(ENV_RECONCILE_ORPHANS) {
                Some(raw) => parse_bool(ENV_RECONCILE_ORPHANS, &raw)?,
                None => defaults.reconcile_orphans,
            },
            delivery_lead_days: try_load(&lookup, ENV_DELIVERY_LEAD_DAYS, defaults.delivery_lead_days)?,
            log_dir: lookup(ENV_LOG_DIR)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        };

        if config.sync_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: ENV_SYNC_INTERVAL,
                message: "must be greater than zero".into(),
            });
        }
        if config.delivery_lead_days < 0 {
            return Err(ConfigError::Invalid {
                key: ENV_DELIVERY_LEAD_DAYS,
                message: "must not be negative".into(),
            });
        }

        Ok(config)
    }
}

fn try_load<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Flatten one source into string keys and values.
fn read_layer<S>(source: S) -> Result<HashMap<String, String>, ConfigError>
where
    S: ::config::Source + Send + Sync + 'static,
{
    let layer = ::config::Config::builder().add_source(source).build()?;
    Ok(layer.try_deserialize()?)
}

/// Key lookup that ignores the case folding a source may apply.
fn find_key(layer: &HashMap<String, String>, key: &str) -> Option<String> {
    layer
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.clone())
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid {
            key,
            message: format!("expected a boolean, got {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.local_db_path, PathBuf::from("data/local.db"));
        assert_eq!(config.remote_db_path, PathBuf::from("data/remote.db"));
        assert_eq!(config.sync_interval_secs, 60);
        assert_eq!(config.sync_backoff_secs, 120);
        assert_eq!(config.sync_actor, "background-sync");
        assert!(config.reconcile_orphans);
        assert_eq!(config.delivery_lead_days, 2);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = Config::from_lookup(lookup_from(&[
            (ENV_LOCAL_DB, "/tmp/l.db"),
            (ENV_SYNC_INTERVAL, " 15 "),
            (ENV_RECONCILE_ORPHANS, "off"),
            (ENV_SYNC_ACTOR, "ops"),
            (ENV_LOG_DIR, "/var/log/sf"),
        ]))
        .unwrap();
        assert_eq!(config.local_db_path, PathBuf::from("/tmp/l.db"));
        assert_eq!(config.sync_interval_secs, 15);
        assert!(!config.reconcile_orphans);
        assert_eq!(config.sync_actor, "ops");
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/sf")));
    }

    #[test]
    fn test_bad_values_are_rejected() {
        let err = Config::from_lookup(lookup_from(&[(ENV_SYNC_INTERVAL, "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_SYNC_INTERVAL, .. }));

        let err = Config::from_lookup(lookup_from(&[(ENV_SYNC_INTERVAL, "0")])).unwrap_err();
        assert!(err.to_string().contains("greater than zero"));

        let err = Config::from_lookup(lookup_from(&[(ENV_RECONCILE_ORPHANS, "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_RECONCILE_ORPHANS, .. }));
    }

    fn temp_env_file(contents: &str) -> (PathBuf, PathBuf) {
        let dir = env::temp_dir().join(format!("storefront_env_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(".env");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_env_file_fills_gaps_but_environment_wins() {
        let (dir, path) = temp_env_file(&format!(
            "# local overrides\n{ENV_SYNC_ACTOR}=from-file\n{ENV_SYNC_BACKOFF}=300\n"
        ));

        let vars = vec![
            (ENV_SYNC_ACTOR.to_string(), "from-env".to_string()),
            ("UNRELATED_SETTING".to_string(), "ignored".to_string()),
        ];
        let config = Config::load_from(&path, vars).unwrap();
        assert_eq!(config.sync_actor, "from-env");
        assert_eq!(config.sync_backoff_secs, 300);
        assert_eq!(config.sync_interval_secs, 60);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_env_file_values_are_validated() {
        let (dir, path) = temp_env_file(&format!("{ENV_DELIVERY_LEAD_DAYS}=-1\n"));
        let err = Config::load_from(&path, Vec::new()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_DELIVERY_LEAD_DAYS, .. }));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_env_file_is_ok() {
        let path = env::temp_dir().join(format!("missing_{}.env", uuid::Uuid::new_v4()));
        let config = Config::load_from(&path, Vec::new()).unwrap();
        assert_eq!(config.sync_actor, "background-sync");
    }

    #[test]
    #[serial]
    fn test_load_reads_process_environment() {
        env::set_var(ENV_SYNC_INTERVAL, "45");
        env::set_var(ENV_RECONCILE_ORPHANS, "no");
        let config = Config::load_from(Path::new("definitely-missing.env"), env::vars());
        env::remove_var(ENV_SYNC_INTERVAL);
        env::remove_var(ENV_RECONCILE_ORPHANS);

        let config = config.unwrap();
        assert_eq!(config.sync_interval_secs, 45);
        assert!(!config.reconcile_orphans);
        assert_eq!(Config::from_env().unwrap().sync_interval_secs, 60);
    }
}
