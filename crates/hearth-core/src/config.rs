//! Configuration
//!
//! `HearthConfig` is loaded from an optional TOML file, then overridden by
//! `HEARTH_*` environment variables. Every field has a default, so an empty
//! file (or no file) is a valid configuration.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::gaps::Dial;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: String, value: String },
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Database location and retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Data directory. Platform data dir when unset.
    pub data_dir: Option<PathBuf>,
    pub db_file: String,
    /// User assumed by callers that do not name one
    pub default_user: String,
    /// Ended sessions idle longer than this are pruned
    pub session_retention_days: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            db_file: "hearth.db".to_string(),
            default_user: "default".to_string(),
            session_retention_days: 30,
        }
    }
}

/// Prominence decay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayConfig {
    /// Half-life in days of an importance-5 memory
    pub base_half_life_days: f64,
    /// Latest memories below this prominence are archived
    pub archive_threshold: f64,
    /// Archived memories below this prominence may be pruned
    pub prune_threshold: f64,
    /// Minimum age before an archived memory can be pruned
    pub prune_min_age_days: i64,
    /// Rows updated per write batch
    pub batch_size: usize,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            base_half_life_days: 14.0,
            archive_threshold: 0.15,
            prune_threshold: 0.02,
            prune_min_age_days: 7,
            batch_size: 500,
        }
    }
}

/// Fact deduplication and classification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Cosine similarity at or above which a fact reinforces an existing memory
    pub dedup_threshold: f32,
    /// Minimum similarity for a forget request to delete a memory
    pub forget_threshold: f32,
    /// Minimum similarity for a correction to supersede a memory
    pub correction_threshold: f32,
    /// Confidence given to corrected facts
    pub correction_confidence: f64,
    /// Facts beyond this count in one batch are dropped with a warning
    pub max_facts_per_message: usize,
    /// Existing memories retrieved per fact for classification
    pub relevant_per_fact: usize,
    /// Existing memories below this similarity are not shown to the classifier
    pub relevance_floor: f32,
    /// A consolidation pass runs every N stored facts
    pub consolidation_interval: u64,
    pub consolidation_timeout_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            dedup_threshold: 0.95,
            forget_threshold: 0.5,
            correction_threshold: 0.4,
            correction_confidence: 0.95,
            max_facts_per_message: 20,
            relevant_per_fact: 5,
            relevance_floor: 0.6,
            consolidation_interval: 10,
            consolidation_timeout_secs: 30,
        }
    }
}

/// Scheduled-item queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Pending items created within this window are checked for duplicates
    pub dedup_window_days: i64,
    /// Non-recurring pending items overdue by more than this expire
    pub expire_grace_hours: i64,
    /// Terminal items older than this are purged
    pub purge_after_days: i64,
    /// Items left in `processing` longer than this go back to `pending`
    pub stale_processing_minutes: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dedup_window_days: 7,
            expire_grace_hours: 24,
            purge_after_days: 30,
            stale_processing_minutes: 30,
        }
    }
}

/// Tick cadence and the dream cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GardenerConfig {
    pub tick_secs: u64,
    /// Light ticks between sleep ticks (288 x 5 min = one day)
    pub sleep_threshold: u32,
    /// Quiet-hours window start hour (inclusive, UTC)
    pub quiet_start: u32,
    /// Quiet-hours window end hour (exclusive, UTC). An end below the
    /// start wraps past midnight. An end equal to the start (24 counts as
    /// 0) is an empty window, which disables sleep ticks entirely.
    pub quiet_end: u32,
    /// Smallest relation-linked cluster fused by NREM
    pub nrem_min_cluster: usize,
    pub nrem_max_clusters: usize,
    /// Memory pairs judged per REM pass
    pub rem_pairs: usize,
    pub rem_min_novelty: f64,
    pub rem_min_plausibility: f64,
    pub rem_min_usefulness: f64,
    pub rem_min_confidence: f64,
}

impl Default for GardenerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 300,
            sleep_threshold: 288,
            quiet_start: 2,
            quiet_end: 6,
            nrem_min_cluster: 3,
            nrem_max_clusters: 5,
            rem_pairs: 5,
            rem_min_novelty: 0.6,
            rem_min_plausibility: 0.6,
            rem_min_usefulness: 0.5,
            rem_min_confidence: 0.6,
        }
    }
}

/// Self-reflection stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionConfig {
    /// Reflection is skipped when no workspace is configured
    pub workspace: Option<PathBuf>,
    pub lookback_hours: i64,
    pub min_sessions: usize,
    pub min_messages: i64,
    /// Written per user under `workspace/<user>/`
    pub guidelines_file: String,
}

impl ReflectionConfig {
    /// The user's guidelines document, when a workspace is configured
    pub fn guidelines_path(&self, user_id: &str) -> Option<PathBuf> {
        let workspace = self.workspace.as_deref()?;
        Some(workspace.join(user_dir_name(user_id)).join(&self.guidelines_file))
    }
}

/// Directory name for a user id. Anything outside `[A-Za-z0-9_-]` is
/// percent-encoded, so distinct ids never share a directory and no id can
/// climb out of the workspace.
fn user_dir_name(user_id: &str) -> String {
    let mut name = String::with_capacity(user_id.len());
    for byte in user_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("%{:02X}", byte));
        }
    }
    if name.is_empty() {
        name.push('%');
    }
    name
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            workspace: None,
            lookback_hours: 24,
            min_sessions: 2,
            min_messages: 3,
            guidelines_file: "GUIDELINES.md".to_string(),
        }
    }
}

/// Gap/engagement pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GapConfig {
    pub dial: Dial,
    /// Goals untouched this long become signals
    pub stale_goal_days: i64,
    /// Events that passed within this window get a follow-up signal
    pub follow_up_days: i64,
    pub max_signals: usize,
    /// Session summaries this recent supply the judge's topic list
    pub topic_lookback_hours: i64,
    pub max_topics: usize,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            dial: Dial::Moderate,
            stale_goal_days: 7,
            follow_up_days: 3,
            max_signals: 20,
            topic_lookback_hours: 72,
            max_topics: 10,
        }
    }
}

/// Embedding batching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model: Option<String>,
    pub batch_size: usize,
    /// Batches in flight at once
    pub concurrency: usize,
    pub cache_capacity: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: None,
            batch_size: 32,
            concurrency: 2,
            cache_capacity: 256,
        }
    }
}

/// Remote completion endpoint (OpenAI-compatible)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
}

// ============================================================================
// TOP LEVEL
// ============================================================================

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HearthConfig {
    pub store: StoreConfig,
    pub decay: DecayConfig,
    pub dedup: DedupConfig,
    pub scheduler: SchedulerConfig,
    pub gardener: GardenerConfig,
    pub reflection: ReflectionConfig,
    pub gaps: GapConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
}

impl HearthConfig {
    /// Load from `path` (or the platform config file when None), then apply
    /// environment overrides. A missing default file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match Self::default_config_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => {
                    tracing::debug!("No config file, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&contents)?;
        tracing::debug!(path = %path.display(), "Loaded config from file");
        Ok(config)
    }

    /// `<platform config dir>/config.toml`
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "hearth", "core").map(|d| d.config_dir().join("config.toml"))
    }

    /// Apply `HEARTH_*` overrides from a variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("HEARTH_DATA_DIR") {
            self.store.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("HEARTH_DEFAULT_USER") {
            self.store.default_user = v;
        }
        if let Some(v) = get("HEARTH_TICK_SECS") {
            self.gardener.tick_secs = parse_env("HEARTH_TICK_SECS", &v)?;
        }
        if let Some(v) = get("HEARTH_QUIET_START") {
            self.gardener.quiet_start = parse_hour("HEARTH_QUIET_START", &v)?;
        }
        if let Some(v) = get("HEARTH_QUIET_END") {
            self.gardener.quiet_end = parse_hour("HEARTH_QUIET_END", &v)?;
        }
        if let Some(v) = get("HEARTH_WORKSPACE") {
            self.reflection.workspace = Some(PathBuf::from(v));
        }
        if let Some(v) = get("HEARTH_DIAL") {
            self.gaps.dial = v.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "HEARTH_DIAL".to_string(),
                value: v.clone(),
            })?;
        }
        if let Some(v) = get("HEARTH_LLM_URL") {
            self.llm.base_url = Some(v);
        }
        if let Some(v) = get("HEARTH_LLM_MODEL") {
            self.llm.model = Some(v);
        }
        if let Some(v) = get("HEARTH_LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = get("HEARTH_EMBED_MODEL") {
            self.embedding.model = Some(v);
        }
        Ok(())
    }

    /// Resolved data directory
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.store.data_dir.clone().or_else(|| {
            ProjectDirs::from("com", "hearth", "core").map(|d| d.data_dir().to_path_buf())
        })
    }

    /// Resolved database path
    pub fn db_path(&self) -> Option<PathBuf> {
        self.data_dir().map(|d| d.join(&self.store.db_file))
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}

fn parse_hour(var: &str, value: &str) -> Result<u32, ConfigError> {
    let hour: u32 = parse_env(var, value)?;
    if hour > 23 {
        return Err(ConfigError::InvalidEnv {
            var: var.to_string(),
            value: value.to_string(),
        });
    }
    Ok(hour)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_parse_empty_config() {
        let config: HearthConfig = toml::from_str("").unwrap();
        assert_eq!(config.gardener.sleep_threshold, 288);
        assert_eq!(config.dedup.dedup_threshold, 0.95);
        assert!(config.reflection.workspace.is_none());
    }

    #[test]
    fn test_parse_partial_sections() {
        let toml = r#"
[gardener]
quiet_start = 23
quiet_end = 5

[gaps]
dial = "eager"
"#;
        let config: HearthConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.gardener.quiet_start, 23);
        assert_eq!(config.gardener.quiet_end, 5);
        assert_eq!(config.gardener.tick_secs, 300);
        assert_eq!(config.gaps.dial, Dial::Eager);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = HearthConfig::default();
        config
            .apply_overrides(env(&[
                ("HEARTH_TICK_SECS", "60"),
                ("HEARTH_QUIET_START", "22"),
                ("HEARTH_WORKSPACE", "/tmp/ws"),
                ("HEARTH_DIAL", "conservative"),
                ("HEARTH_DEFAULT_USER", "alice"),
                ("HEARTH_LLM_MODEL", ""),
            ]))
            .unwrap();

        assert_eq!(config.gardener.tick_secs, 60);
        assert_eq!(config.gardener.quiet_start, 22);
        assert_eq!(config.reflection.workspace, Some(PathBuf::from("/tmp/ws")));
        assert_eq!(config.gaps.dial, Dial::Conservative);
        assert_eq!(config.store.default_user, "alice");
        // Blank values are ignored
        assert!(config.llm.model.is_none());
    }

    #[test]
    fn test_guidelines_path_is_per_user() {
        let config = ReflectionConfig {
            workspace: Some(PathBuf::from("/ws")),
            ..Default::default()
        };
        assert_eq!(
            config.guidelines_path("alice"),
            Some(PathBuf::from("/ws/alice/GUIDELINES.md"))
        );
        assert_ne!(config.guidelines_path("a/b"), config.guidelines_path("a_b"));
        assert_eq!(
            config.guidelines_path("../etc"),
            Some(PathBuf::from("/ws/%2E%2E%2Fetc/GUIDELINES.md"))
        );
        assert!(ReflectionConfig::default().guidelines_path("alice").is_none());
    }

    #[test]
    fn test_invalid_env_is_rejected() {
        let mut config = HearthConfig::default();
        assert!(config.apply_overrides(env(&[("HEARTH_QUIET_END", "25")])).is_err());
        assert!(config.apply_overrides(env(&[("HEARTH_TICK_SECS", "soon")])).is_err());
        assert!(config.apply_overrides(env(&[("HEARTH_DIAL", "reckless")])).is_err());
    }

    #[test]
    fn test_db_path_uses_data_dir() {
        let mut config = HearthConfig::default();
        config.store.data_dir = Some(PathBuf::from("/var/lib/hearth"));
        assert_eq!(
            config.db_path(),
            Some(PathBuf::from("/var/lib/hearth/hearth.db"))
        );
    }
}
