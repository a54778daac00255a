use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::adapter::{RetryPolicy, TokenBucket};
use crate::error::ErrorCode;
use crate::model::Field;
use crate::sync::{ExecutionStrategy, MergeConfig, MergeStrategy, ParallelSyncConfig, Side};

/// Project directory holding config and, by default, state.
pub const PROJECT_DIR: &str = ".storysync";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Read { .. } | Self::Parse { .. } => ErrorCode::ConfigParseError,
            Self::Invalid(_) => ErrorCode::ConfigInvalid,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub merge: MergeSection,
    #[serde(default)]
    pub parallel: ParallelSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub locks: LockSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSection {
    #[serde(default = "default_strategy")]
    pub default_strategy: MergeStrategy,
    /// Field name → strategy, e.g. `description = "merge_text"`.
    #[serde(default)]
    pub field_overrides: BTreeMap<String, MergeStrategy>,
    #[serde(default = "default_tie_breaker")]
    pub newest_tie_breaker: Side,
    #[serde(default)]
    pub comment_on_review: bool,
}

impl Default for MergeSection {
    fn default() -> Self {
        Self {
            default_strategy: default_strategy(),
            field_overrides: BTreeMap::new(),
            newest_tie_breaker: default_tie_breaker(),
            comment_on_review: false,
        }
    }
}

impl MergeSection {
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] for an unknown field name in
    /// `field_overrides`.
    pub fn to_merge_config(&self) -> Result<MergeConfig, ConfigError> {
        let mut field_overrides = BTreeMap::new();
        for (name, strategy) in &self.field_overrides {
            let field: Field = name
                .parse()
                .map_err(|err| ConfigError::Invalid(format!("merge.field_overrides: {err}")))?;
            field_overrides.insert(field, *strategy);
        }
        Ok(MergeConfig {
            default_strategy: self.default_strategy,
            field_overrides,
            newest_tie_breaker: self.newest_tie_breaker,
            comment_on_review: self.comment_on_review,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelSection {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub strategy: ExecutionStrategy,
    /// Per-epic timeout; unset means unbounded.
    #[serde(default)]
    pub epic_timeout_ms: Option<u64>,
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for ParallelSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            strategy: ExecutionStrategy::default(),
            epic_timeout_ms: None,
            fail_fast: false,
        }
    }
}

impl ParallelSection {
    #[must_use]
    pub fn to_parallel_config(&self) -> ParallelSyncConfig {
        ParallelSyncConfig {
            max_workers: self.max_workers,
            strategy: self.strategy,
            epic_timeout: self.epic_timeout_ms.map(Duration::from_millis),
            fail_fast: self.fail_fast,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_true(),
        }
    }
}

impl RetrySection {
    #[must_use]
    pub const fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSection {
    #[serde(default)]
    pub enabled: bool,
    /// Burst size.
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: default_capacity(),
            requests_per_second: default_requests_per_second(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl RateLimitSection {
    #[must_use]
    pub fn bucket(&self) -> TokenBucket {
        TokenBucket::new(self.capacity, self.requests_per_second)
    }

    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSection {
    /// Where base snapshots and replay logs live. Relative paths are
    /// resolved against the project root.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSection {
    /// Wait for an entity another epic is syncing.
    #[serde(default = "default_entity_timeout_ms")]
    pub entity_timeout_ms: u64,
    /// Wait for the state store's advisory file lock.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            entity_timeout_ms: default_entity_timeout_ms(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl LockSection {
    #[must_use]
    pub const fn entity_timeout(&self) -> Duration {
        Duration::from_millis(self.entity_timeout_ms)
    }

    #[must_use]
    pub const fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

impl SyncConfig {
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first out-of-range value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallel.max_workers == 0 {
            return Err(ConfigError::Invalid("parallel.max_workers must be at least 1".into()));
        }
        if self.parallel.epic_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid("parallel.epic_timeout_ms must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 || !self.retry.multiplier.is_finite() {
            return Err(ConfigError::Invalid("retry.multiplier must be a finite number >= 1".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid("retry.base_delay_ms exceeds retry.max_delay_ms".into()));
        }
        if self.rate_limit.capacity == 0 {
            return Err(ConfigError::Invalid("rate_limit.capacity must be at least 1".into()));
        }
        if self.rate_limit.requests_per_second <= 0.0 || !self.rate_limit.requests_per_second.is_finite() {
            return Err(ConfigError::Invalid("rate_limit.requests_per_second must be positive".into()));
        }
        self.merge.to_merge_config().map(|_| ())
    }
}

/// User-level settings, shared by every project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    /// Fallback state directory when the project sets none.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub max_workers: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub sync: SyncConfig,
    pub user: UserConfig,
    pub state_dir: PathBuf,
}

/// Load `<root>/.storysync/config.toml`; defaults if the file is missing.
///
/// # Errors
///
/// The file exists but cannot be read or parsed.
pub fn load_sync_config(project_root: &Path) -> Result<SyncConfig, ConfigError> {
    let path = project_root.join(PROJECT_DIR).join("config.toml");
    read_toml(&path).map(Option::unwrap_or_default)
}

/// Load `<config_dir>/storysync/config.toml`; defaults if missing.
///
/// # Errors
///
/// The file exists but cannot be read or parsed.
pub fn load_user_config() -> Result<UserConfig, ConfigError> {
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(UserConfig::default());
    };
    read_toml(&config_dir.join("storysync/config.toml")).map(Option::unwrap_or_default)
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<T>(&content)
        .map(Some)
        .map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

/// Project config, then user config, then environment; validated.
///
/// # Errors
///
/// Unreadable config files, bad environment values or out-of-range
/// settings.
pub fn resolve_config(project_root: &Path) -> Result<EffectiveConfig, ConfigError> {
    let mut sync = load_sync_config(project_root)?;
    let user = load_user_config()?;

    if let Some(workers) = user.max_workers {
        sync.parallel.max_workers = workers;
    }
    apply_env_overrides(
        &mut sync,
        env::var("STORYSYNC_MAX_WORKERS").ok().as_deref(),
        env::var("STORYSYNC_FAIL_FAST").ok().as_deref(),
    )?;
    sync.validate()?;

    let state_dir = resolve_state_dir(project_root, &sync, &user);
    tracing::debug!(state_dir = %state_dir.display(), workers = sync.parallel.max_workers, "config resolved");
    Ok(EffectiveConfig { sync, user, state_dir })
}

fn resolve_state_dir(project_root: &Path, sync: &SyncConfig, user: &UserConfig) -> PathBuf {
    let chosen = sync.store.state_dir.as_ref().or(user.state_dir.as_ref());
    match chosen {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => project_root.join(dir),
        None => project_root.join(PROJECT_DIR).join("state"),
    }
}

fn apply_env_overrides(
    sync: &mut SyncConfig,
    max_workers: Option<&str>,
    fail_fast: Option<&str>,
) -> Result<(), ConfigError> {
    if let Some(raw) = max_workers {
        sync.parallel.max_workers = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("STORYSYNC_MAX_WORKERS: '{raw}' is not a number")))?;
    }
    if let Some(raw) = fail_fast {
        sync.parallel.fail_fast = match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            _ => return Err(ConfigError::Invalid(format!("STORYSYNC_FAIL_FAST: '{raw}' is not a boolean"))),
        };
    }
    Ok(())
}

const fn default_true() -> bool {
    true
}

const fn default_strategy() -> MergeStrategy {
    MergeStrategy::PreferNewest
}

const fn default_tie_breaker() -> Side {
    Side::Remote
}

const fn default_max_workers() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    200
}

const fn default_max_delay_ms() -> u64 {
    10_000
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_capacity() -> u32 {
    10
}

const fn default_requests_per_second() -> f64 {
    5.0
}

const fn default_acquire_timeout_ms() -> u64 {
    30_000
}

const fn default_entity_timeout_ms() -> u64 {
    5_000
}

const fn default_store_timeout_ms() -> u64 {
    2_000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(root: &Path, content: &str) {
        let dir = root.join(PROJECT_DIR);
        std::fs::create_dir_all(&dir).expect("create config dir");
        std::fs::write(dir.join("config.toml"), content).expect("write config");
    }

    #[test]
    fn missing_project_config_uses_defaults() {
        let root = tempfile::tempdir().expect("tempdir");
        let cfg = load_sync_config(root.path()).expect("load should succeed");
        assert_eq!(cfg, SyncConfig::default());
        assert_eq!(cfg.merge.default_strategy, MergeStrategy::PreferNewest);
        assert_eq!(cfg.parallel.max_workers, 4);
        assert_eq!(cfg.retry.to_policy(), RetryPolicy::default());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn sections_parse_and_convert() {
        let root = tempfile::tempdir().expect("tempdir");
        write_config(
            root.path(),
            r#"
[merge]
default_strategy = "manual"
comment_on_review = true

[merge.field_overrides]
description = "merge_text"
points = "prefer_remote"

[parallel]
max_workers = 8
strategy = "sequential"
epic_timeout_ms = 1500
fail_fast = true

[retry]
max_attempts = 5

[locks]
entity_timeout_ms = 250
"#,
        );
        let cfg = load_sync_config(root.path()).expect("load should succeed");
        let merge = cfg.merge.to_merge_config().expect("valid overrides");
        assert_eq!(merge.default_strategy, MergeStrategy::Manual);
        assert_eq!(merge.strategy_for(Field::Description), MergeStrategy::MergeText);
        assert_eq!(merge.strategy_for(Field::StoryPoints), MergeStrategy::PreferRemote);
        assert!(merge.comment_on_review);

        let parallel = cfg.parallel.to_parallel_config();
        assert_eq!(parallel.max_workers, 8);
        assert_eq!(parallel.strategy, ExecutionStrategy::Sequential);
        assert_eq!(parallel.epic_timeout, Some(Duration::from_millis(1500)));
        assert!(parallel.fail_fast);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.base_delay_ms, 200);
        assert_eq!(cfg.locks.entity_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn parse_errors_carry_the_path() {
        let root = tempfile::tempdir().expect("tempdir");
        write_config(root.path(), "[parallel]\nmax_workers = \"many\"\n");
        let err = load_sync_config(root.path()).expect_err("must fail");
        assert_eq!(err.code(), ErrorCode::ConfigParseError);
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let mut cfg = SyncConfig::default();
        cfg.parallel.max_workers = 0;
        assert_eq!(cfg.validate().expect_err("zero workers").code(), ErrorCode::ConfigInvalid);

        let mut cfg = SyncConfig::default();
        cfg.retry.max_attempts = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SyncConfig::default();
        cfg.rate_limit.requests_per_second = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = SyncConfig::default();
        cfg.merge.field_overrides.insert("colour".into(), MergeStrategy::Manual);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_apply_and_validate() {
        let mut cfg = SyncConfig::default();
        apply_env_overrides(&mut cfg, Some("12"), Some("yes")).expect("valid overrides");
        assert_eq!(cfg.parallel.max_workers, 12);
        assert!(cfg.parallel.fail_fast);

        apply_env_overrides(&mut cfg, None, Some("off")).expect("valid overrides");
        assert!(!cfg.parallel.fail_fast);

        assert!(apply_env_overrides(&mut cfg, Some("lots"), None).is_err());
        assert!(apply_env_overrides(&mut cfg, None, Some("maybe")).is_err());
    }

    #[test]
    fn state_dir_prefers_project_then_user() {
        let root = Path::new("/work/app");
        let mut sync = SyncConfig::default();
        let mut user = UserConfig::default();
        assert_eq!(resolve_state_dir(root, &sync, &user), root.join(".storysync/state"));

        user.state_dir = Some(PathBuf::from("/var/lib/storysync"));
        assert_eq!(resolve_state_dir(root, &sync, &user), PathBuf::from("/var/lib/storysync"));

        sync.store.state_dir = Some(PathBuf::from("sync-state"));
        assert_eq!(resolve_state_dir(root, &sync, &user), root.join("sync-state"));
    }
}
