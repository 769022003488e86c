//! Process-wide, periodically refreshed key/value configuration.
//!
//! The store keeps the last good snapshot of the `configuration` table behind
//! a single `Arc` that is swapped whole on every change, so readers never see
//! a half-applied update and never wait on I/O. A refresh that finds a
//! different snapshot publishes a [`ConfigChange`] carrying the previous one;
//! processor engines subscribe to it to reconfigure themselves.
//!
//! ```text
//!  configuration table ──load──▶ ConfigStore ──ConfigChange──▶ engines
//!                                    │
//!                                    └── get(key, default) (no I/O)
//! ```

use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use herald_core::storage::configuration;
use sqlx::{postgres::PgConnectOptions, ConnectOptions};
use tokio::{sync::broadcast, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ProcessorError, Result};

/// Default interval between refreshes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

const CHANGE_CHANNEL_CAPACITY: usize = 16;
const FALLBACK_LANG: &str = "en";

/// Immutable view of every configuration entry at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSnapshot {
    entries: HashMap<String, String>,
}

impl ConfigSnapshot {
    /// Raw value for `key`.
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys whose value differs between `self` and `other`, including keys
    /// present in only one of them.
    pub fn changed_keys(&self, other: &Self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(k, v)| other.entries.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .chain(other.entries.keys().filter(|k| !self.entries.contains_key(*k)).cloned())
            .collect();
        keys.sort();
        keys
    }
}

impl From<HashMap<String, String>> for ConfigSnapshot {
    fn from(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }
}

/// Published when a refresh replaced the snapshot.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    /// Snapshot that was current before the refresh.
    pub previous: Arc<ConfigSnapshot>,
    /// Snapshot installed by the refresh.
    pub current: Arc<ConfigSnapshot>,
}

/// Result of one refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The source returned the same entries.
    Unchanged,
    /// The snapshot was replaced and a change was published.
    Changed,
    /// The source failed; the previous snapshot is still in use.
    Failed,
}

/// Where configuration entries come from.
#[async_trait::async_trait]
pub trait ConfigSource: Send + Sync + fmt::Debug {
    /// Loads every entry.
    async fn load(&self) -> Result<HashMap<String, String>>;
}

/// Configuration source backed by the `configuration` table.
pub struct PgConfigSource {
    repository: Arc<configuration::Repository>,
}

impl PgConfigSource {
    /// Wraps the configuration repository.
    pub fn new(repository: Arc<configuration::Repository>) -> Self {
        Self { repository }
    }

    /// Writes entries through to the table.
    ///
    /// # Errors
    ///
    /// Returns `ProcessorError::Database` if the upsert fails.
    pub async fn upsert(&self, entries: &HashMap<String, String>) -> Result<()> {
        self.repository.upsert(entries).await.map_err(ProcessorError::from)
    }
}

impl fmt::Debug for PgConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConfigSource").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl ConfigSource for PgConfigSource {
    async fn load(&self) -> Result<HashMap<String, String>> {
        self.repository.load_all().await.map_err(|e| ProcessorError::config_load(e.to_string()))
    }
}

/// Minimal connection parameters for the one-off fetch used when the regular
/// source is unavailable at startup.
#[derive(Clone)]
pub struct BootstrapParams {
    /// Database host.
    pub host: String,
    /// Database port.
    pub port: u16,
    /// Database user.
    pub user: String,
    /// Database password.
    pub password: String,
    /// Database name.
    pub database: String,
    /// Upper bound on the whole fetch.
    pub timeout: Duration,
}

impl fmt::Debug for BootstrapParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("database", &self.database)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl BootstrapParams {
    /// Reads `DB_HOST`, `DB_PORT`, `DB_USER`, `DB_PASS` and `DB_NAME`.
    ///
    /// Returns `None` when `DB_HOST` is not set, since there is nothing to
    /// connect to. The other variables default to `5432` and `herald`.
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("DB_HOST").ok().filter(|h| !h.trim().is_empty())?;
        let var_or = |name: &str, default: &str| {
            std::env::var(name).unwrap_or_else(|_| default.to_string())
        };

        Some(Self {
            host,
            port: var_or("DB_PORT", "5432").parse().unwrap_or(5432),
            user: var_or("DB_USER", "herald"),
            password: var_or("DB_PASS", "herald"),
            database: var_or("DB_NAME", "herald"),
            timeout: Duration::from_secs(5),
        })
    }

    /// Opens a single connection and reads the table.
    ///
    /// # Errors
    ///
    /// Returns `ProcessorError::ConfigLoad` if connecting or querying fails
    /// or the timeout elapses.
    pub async fn fetch(&self) -> Result<HashMap<String, String>> {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database);

        let fetch = async {
            let mut conn = options
                .connect()
                .await
                .map_err(|e| ProcessorError::config_load(format!("bootstrap connect: {e}")))?;
            configuration::load_all_with(&mut conn)
                .await
                .map_err(|e| ProcessorError::config_load(format!("bootstrap query: {e}")))
        };

        tokio::time::timeout(self.timeout, fetch).await.map_err(|_| {
            let timeout = self.timeout;
            ProcessorError::config_load(format!("bootstrap fetch timed out after {timeout:?}"))
        })?
    }
}

/// Shared configuration cache with change notification.
pub struct ConfigStore {
    current: RwLock<Arc<ConfigSnapshot>>,
    source: Arc<dyn ConfigSource>,
    changes: broadcast::Sender<ConfigChange>,
}

impl fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigStore")
            .field("entries", &self.snapshot().len())
            .field("source", &self.source)
            .finish()
    }
}

impl ConfigStore {
    /// Creates a store holding `initial` without touching the source.
    pub fn with_snapshot(source: Arc<dyn ConfigSource>, initial: HashMap<String, String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { current: RwLock::new(Arc::new(ConfigSnapshot::from(initial))), source, changes }
    }

    /// Performs the first load.
    ///
    /// If the source fails, one direct fetch is attempted with `bootstrap`;
    /// if that is unavailable or fails too, the store starts empty and every
    /// lookup returns its default until a later refresh succeeds.
    pub async fn bootstrap(
        source: Arc<dyn ConfigSource>,
        bootstrap: Option<BootstrapParams>,
    ) -> Self {
        let initial = match source.load().await {
            Ok(entries) => {
                info!(entries = entries.len(), "loaded initial configuration");
                entries
            },
            Err(error) => {
                warn!(error = %error, "initial configuration load failed");
                match bootstrap {
                    Some(params) => match params.fetch().await {
                        Ok(entries) => {
                            info!(
                                entries = entries.len(),
                                host = %params.host,
                                "loaded initial configuration through bootstrap connection"
                            );
                            entries
                        },
                        Err(error) => {
                            warn!(
                                error = %error,
                                "bootstrap fetch failed, starting with empty configuration"
                            );
                            HashMap::new()
                        },
                    },
                    None => {
                        warn!("no bootstrap parameters, starting with empty configuration");
                        HashMap::new()
                    },
                }
            },
        };

        Self::with_snapshot(source, initial)
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Typed value for `key`, or `default` when missing or unparsable.
    pub fn get<T: FromStr>(&self, key: &str, default: T) -> T {
        let snapshot = self.snapshot();
        match snapshot.raw(key) {
            None => default,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(key, value = raw, "unparsable configuration value, using default");
                default
            }),
        }
    }

    /// Boolean value for `key`, accepting `true`/`false` in any case as well
    /// as `1`/`0` and `yes`/`no`.
    pub fn get_flag(&self, key: &str, default: bool) -> bool {
        let snapshot = self.snapshot();
        let Some(raw) = snapshot.raw(key) else {
            return default;
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => {
                warn!(key, value = raw, "unparsable configuration flag, using default");
                default
            },
        }
    }

    /// Localized string for `key` in `lang`.
    ///
    /// Looks up `key.lang`, then `key.en`, then yields an empty string. An
    /// empty `lang` means English. A trailing dot on `key` is accepted.
    pub fn get_string(&self, key: &str, lang: &str) -> String {
        let snapshot = self.snapshot();
        let base = key.strip_suffix('.').unwrap_or(key);
        let lang = lang.trim().to_ascii_lowercase();
        let lang = if lang.is_empty() { FALLBACK_LANG.to_string() } else { lang };

        snapshot
            .raw(&format!("{base}.{lang}"))
            .or_else(|| snapshot.raw(&format!("{base}.{FALLBACK_LANG}")))
            .unwrap_or_default()
            .to_string()
    }

    /// Subscribes to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.changes.subscribe()
    }

    /// Reloads from the source and publishes a change if the entries differ.
    ///
    /// Failures are logged and leave the current snapshot in place.
    pub async fn refresh(&self) -> RefreshOutcome {
        debug!("reloading configuration");
        let entries = match self.source.load().await {
            Ok(entries) => entries,
            Err(error) => {
                warn!(error = %error, "configuration refresh failed, keeping previous snapshot");
                return RefreshOutcome::Failed;
            },
        };

        let next = ConfigSnapshot::from(entries);
        let change = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            if **current == next {
                None
            } else {
                let installed = Arc::new(next);
                let previous = std::mem::replace(&mut *current, installed.clone());
                Some(ConfigChange { previous, current: installed })
            }
        };

        match change {
            None => RefreshOutcome::Unchanged,
            Some(change) => {
                info!(
                    entries = change.current.len(),
                    changed_keys = ?change.previous.changed_keys(&change.current),
                    "reloaded changed configuration"
                );
                // No subscribers is fine; engines also poll.
                let _ = self.changes.send(change);
                RefreshOutcome::Changed
            },
        }
    }

    /// Spawns the periodic refresh loop.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        interval: Duration,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; the store is already loaded.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        store.refresh().await;
                    }
                    () = cancellation_token.cancelled() => break,
                }
            }
            debug!("configuration refresh loop stopped");
        })
    }
}
