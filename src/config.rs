use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_ENV_PREFIX: &str = "THREAD_TRACKER";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub board: BoardConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub embeds: EmbedConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoardConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_media_base")]
    pub media_base: String,
    #[serde(default = "default_board")]
    pub board: String,
    #[serde(default = "default_keyword")]
    pub keyword: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_embed_parent")]
    pub embed_parent: String,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            media_base: default_media_base(),
            board: default_board(),
            keyword: default_keyword(),
            user_agent: default_user_agent(),
            embed_parent: default_embed_parent(),
        }
    }
}

fn default_api_base() -> String {
    "https://boards.4chan.org".into()
}

fn default_media_base() -> String {
    "https://i.4cdn.org".into()
}

fn default_board() -> String {
    "b".into()
}

fn default_keyword() -> String {
    "otk".into()
}

fn default_user_agent() -> String {
    format!("thread-tracker/{}", crate::VERSION)
}

fn default_embed_parent() -> String {
    "boards.4chan.org".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    #[serde(default = "default_background_interval", with = "humantime_serde")]
    pub background_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            background_interval: default_background_interval(),
        }
    }
}

fn default_background_interval() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbedConfig {
    /// Distance from the viewport edge, in rows/pixels of the host surface,
    /// at which a placeholder starts loading.
    #[serde(default = "default_proximity_margin")]
    pub proximity_margin: u32,
    #[serde(default = "default_media_timeout", with = "humantime_serde")]
    pub media_timeout: Duration,
    #[serde(default = "default_widget_timeout", with = "humantime_serde")]
    pub widget_timeout: Duration,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            proximity_margin: default_proximity_margin(),
            media_timeout: default_media_timeout(),
            widget_timeout: default_widget_timeout(),
            workers: default_workers(),
        }
    }
}

fn default_proximity_margin() -> u32 {
    crate::lifecycle::DEFAULT_PROXIMITY_ROWS
}

fn default_media_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_widget_timeout() -> Duration {
    Duration::from_secs(40)
}

fn default_workers() -> usize {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderConfig {
    #[serde(default = "default_scroll_attempts")]
    pub scroll_attempts: u32,
    #[serde(default = "default_scroll_retry_delay", with = "humantime_serde")]
    pub scroll_retry_delay: Duration,
    #[serde(default = "default_settle_delay", with = "humantime_serde")]
    pub settle_delay: Duration,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            scroll_attempts: default_scroll_attempts(),
            scroll_retry_delay: default_scroll_retry_delay(),
            settle_delay: default_settle_delay(),
        }
    }
}

fn default_scroll_attempts() -> u32 {
    5
}

fn default_scroll_retry_delay() -> Duration {
    Duration::from_millis(750)
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(50)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    if let Some(from_env) = load_env(prefix) {
        cfg = merge_config(cfg, from_env);
    }

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Applies `other` over `base`. Empty strings, zero counts and missing paths
/// in `other` leave `base` untouched.
fn merge_config(mut base: Config, other: Config) -> Config {
    let board = other.board;
    merge_string(&mut base.board.api_base, board.api_base);
    merge_string(&mut base.board.media_base, board.media_base);
    merge_string(&mut base.board.board, board.board);
    merge_string(&mut base.board.keyword, board.keyword);
    merge_string(&mut base.board.user_agent, board.user_agent);
    merge_string(&mut base.board.embed_parent, board.embed_parent);

    merge_duration(
        &mut base.sync.background_interval,
        other.sync.background_interval,
    );

    if other.embeds.proximity_margin != 0 {
        base.embeds.proximity_margin = other.embeds.proximity_margin;
    }
    merge_duration(&mut base.embeds.media_timeout, other.embeds.media_timeout);
    merge_duration(&mut base.embeds.widget_timeout, other.embeds.widget_timeout);
    if other.embeds.workers != 0 {
        base.embeds.workers = other.embeds.workers;
    }

    if other.render.scroll_attempts != 0 {
        base.render.scroll_attempts = other.render.scroll_attempts;
    }
    merge_duration(
        &mut base.render.scroll_retry_delay,
        other.render.scroll_retry_delay,
    );
    merge_duration(&mut base.render.settle_delay, other.render.settle_delay);

    if other.storage.path.is_some() {
        base.storage.path = other.storage.path;
    }

    merge_string(&mut base.log.level, other.log.level);
    if other.log.file.is_some() {
        base.log.file = other.log.file;
    }

    base
}

fn merge_string(base: &mut String, other: String) {
    if !other.trim().is_empty() {
        *base = other;
    }
}

fn merge_duration(base: &mut Duration, other: Duration) {
    if !other.is_zero() {
        *base = other;
    }
}

/// Environment layer. Keys look like `PREFIX_SECTION__FIELD`; fields that are
/// not set keep their "empty" value so the merge ignores them.
fn load_env(prefix: &str) -> Option<Config> {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    if map.is_empty() {
        return None;
    }

    let mut cfg = empty_config();
    for (key, value) in map {
        apply_env_value(&mut cfg, &key, value);
    }
    Some(cfg)
}

fn empty_config() -> Config {
    Config {
        board: BoardConfig {
            api_base: String::new(),
            media_base: String::new(),
            board: String::new(),
            keyword: String::new(),
            user_agent: String::new(),
            embed_parent: String::new(),
        },
        sync: SyncConfig {
            background_interval: Duration::ZERO,
        },
        embeds: EmbedConfig {
            proximity_margin: 0,
            media_timeout: Duration::ZERO,
            widget_timeout: Duration::ZERO,
            workers: 0,
        },
        render: RenderConfig {
            scroll_attempts: 0,
            scroll_retry_delay: Duration::ZERO,
            settle_delay: Duration::ZERO,
        },
        storage: StorageConfig { path: None },
        log: LogConfig {
            level: String::new(),
            file: None,
        },
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "board.api_base" => cfg.board.api_base = value,
        "board.media_base" => cfg.board.media_base = value,
        "board.board" => cfg.board.board = value,
        "board.keyword" => cfg.board.keyword = value,
        "board.user_agent" => cfg.board.user_agent = value,
        "board.embed_parent" => cfg.board.embed_parent = value,
        "sync.background_interval" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.sync.background_interval = duration;
            }
        }
        "embeds.proximity_margin" => {
            if let Ok(parsed) = value.parse::<u32>() {
                cfg.embeds.proximity_margin = parsed;
            }
        }
        "embeds.media_timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.embeds.media_timeout = duration;
            }
        }
        "embeds.widget_timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.embeds.widget_timeout = duration;
            }
        }
        "embeds.workers" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.embeds.workers = parsed;
            }
        }
        "render.scroll_attempts" => {
            if let Ok(parsed) = value.parse::<u32>() {
                cfg.render.scroll_attempts = parsed;
            }
        }
        "render.scroll_retry_delay" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.render.scroll_retry_delay = duration;
            }
        }
        "render.settle_delay" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.render.settle_delay = duration;
            }
        }
        "storage.path" => cfg.storage.path = Some(PathBuf::from(value)),
        "log.level" => cfg.log.level = value,
        "log.file" => cfg.log.file = Some(PathBuf::from(value)),
        _ => {}
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("thread-tracker").join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::tempdir;

    fn isolated() -> LoadOptions {
        LoadOptions {
            config_file: Some(PathBuf::from("/nonexistent/thread-tracker.yaml")),
            env_prefix: Some("THREAD_TRACKER_TEST_NONE".into()),
        }
    }

    #[test]
    fn load_defaults_without_files() {
        let cfg = load(isolated()).unwrap();
        assert_eq!(cfg.board.keyword, "otk");
        assert_eq!(cfg.sync.background_interval, Duration::from_secs(60));
        assert_eq!(cfg.embeds.widget_timeout, Duration::from_secs(40));
        assert_eq!(cfg.render.scroll_attempts, 5);
    }

    #[test]
    fn file_layer_keeps_unset_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "board:\n  keyword: general\nembeds:\n  media_timeout: 5s\n",
        )
        .unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("THREAD_TRACKER_TEST_NONE".into()),
        })
        .unwrap();
        assert_eq!(cfg.board.keyword, "general");
        assert_eq!(cfg.board.board, "b");
        assert_eq!(cfg.embeds.media_timeout, Duration::from_secs(5));
        assert_eq!(cfg.embeds.widget_timeout, Duration::from_secs(40));
    }

    #[test]
    fn env_overrides() {
        env::set_var("THREAD_TRACKER_ENVTEST_BOARD__KEYWORD", "ylyl");
        env::set_var("THREAD_TRACKER_ENVTEST_SYNC__BACKGROUND_INTERVAL", "5m");
        let cfg = load(LoadOptions {
            config_file: Some(PathBuf::from("/nonexistent/thread-tracker.yaml")),
            env_prefix: Some("THREAD_TRACKER_ENVTEST".into()),
        })
        .unwrap();
        assert_eq!(cfg.board.keyword, "ylyl");
        assert_eq!(cfg.sync.background_interval, Duration::from_secs(300));
        assert_eq!(cfg.board.api_base, "https://boards.4chan.org");
        env::remove_var("THREAD_TRACKER_ENVTEST_BOARD__KEYWORD");
        env::remove_var("THREAD_TRACKER_ENVTEST_SYNC__BACKGROUND_INTERVAL");
    }
}
