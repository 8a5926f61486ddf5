#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_AUDIO_FORMATS: &[&str] = &["mp3", "m4a", "aac", "opus", "flac", "wav"];
pub const DEFAULT_VIDEO_FORMATS: &[&str] = &["mp4", "webm", "mkv", "avi", "mov", "flv"];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub log: LogConfig,
    pub ytdlp: YtdlpConfig,
    pub storage: StorageConfig,
    pub tasks: TaskConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "console" | "pretty" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Everything the two yt-dlp invocations need.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct YtdlpConfig {
    pub path: PathBuf,
    pub ffmpeg_path: Option<PathBuf>,
    /// Scratch space for in-progress downloads, one sub directory per task.
    pub download_dir: PathBuf,
    pub cookies_path: Option<PathBuf>,
    pub proxy: Option<String>,
    pub max_downloads: usize,
    pub max_file_size: Option<u64>,
    pub audio_formats: Vec<String>,
    pub video_formats: Vec<String>,
}

impl Default for YtdlpConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("yt-dlp"),
            ffmpeg_path: None,
            download_dir: env::temp_dir().join("youtube-tools"),
            cookies_path: None,
            proxy: None,
            max_downloads: 5,
            max_file_size: None,
            audio_formats: to_owned_list(DEFAULT_AUDIO_FORMATS),
            video_formats: to_owned_list(DEFAULT_VIDEO_FORMATS),
        }
    }
}

/// Mounted object storage that holds the metadata cache and final artifacts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub mount: PathBuf,
    /// Public prefix joined with an artifact's relative path to build its
    /// download URL.
    pub url_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mount: PathBuf::from("/mnt/s3"),
            url_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub eviction_interval_secs: u64,
    pub retention_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            eviction_interval_secs: 5 * 60,
            retention_secs: 10 * 60,
        }
    }
}

impl TaskConfig {
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Values coming from the command line. They win over everything else.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub mount: Option<PathBuf>,
}

pub fn resolve_config(overrides: ConfigOverrides) -> Result<ServiceConfig> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    let config_path = overrides
        .config_path
        .clone()
        .or_else(|| lookup_value("CONFIG_PATH", &file_vars, &env_var_string).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let base = read_config_file(&config_path)?;
    Ok(build_config_with_overrides(
        base,
        &file_vars,
        env_var_string,
        overrides,
    ))
}

/// Parses the TOML config file. A missing file yields the defaults.
pub fn read_config_file(path: &Path) -> Result<ServiceConfig> {
    if !path.exists() {
        return Ok(ServiceConfig::default());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("Parsing {}", path.display()))
}

fn build_config_with_overrides(
    mut config: ServiceConfig,
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> ServiceConfig {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    if let Some(host) = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("YT_TOOLS_HOST"))
    {
        config.server.host = host;
    }
    if let Some(port) = overrides.port.or_else(|| {
        lookup("YT_TOOLS_PORT").and_then(|value| value.parse::<u16>().ok())
    }) {
        config.server.port = port;
    }
    if let Some(level) = lookup("YT_TOOLS_LOG_LEVEL") {
        config.log.level = level;
    }
    if let Some(format) = lookup("YT_TOOLS_LOG_FORMAT").and_then(|value| LogFormat::parse(&value))
    {
        config.log.format = format;
    }
    if let Some(path) = lookup("YTDLP_PATH") {
        config.ytdlp.path = PathBuf::from(path);
    }
    if let Some(path) = lookup("FFMPEG_PATH") {
        config.ytdlp.ffmpeg_path = Some(PathBuf::from(path));
    }
    if let Some(path) = lookup("YT_TOOLS_DOWNLOAD_DIR") {
        config.ytdlp.download_dir = PathBuf::from(path);
    }
    if let Some(path) = lookup("YTDLP_COOKIES") {
        config.ytdlp.cookies_path = Some(PathBuf::from(path));
    }
    if let Some(proxy) = lookup("YTDLP_PROXY") {
        config.ytdlp.proxy = Some(proxy);
    }
    if let Some(mount) = overrides
        .mount
        .or_else(|| lookup("S3_MOUNT").map(PathBuf::from))
    {
        config.storage.mount = mount;
    }
    if let Some(prefix) = lookup("S3_PREFIX") {
        config.storage.url_prefix = prefix;
    }

    config.ytdlp.proxy = config
        .ytdlp
        .proxy
        .filter(|value| !value.trim().is_empty());
    config.ytdlp.max_downloads = config.ytdlp.max_downloads.max(1);
    config.ytdlp.audio_formats =
        normalize_extensions(&config.ytdlp.audio_formats, DEFAULT_AUDIO_FORMATS);
    config.ytdlp.video_formats =
        normalize_extensions(&config.ytdlp.video_formats, DEFAULT_VIDEO_FORMATS);
    config
}

/// Lowercases, trims and de-duplicates while keeping the configured order.
/// An empty result falls back to `defaults`.
fn normalize_extensions(values: &[String], defaults: &[&str]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        let ext = value.trim().trim_start_matches('.').to_ascii_lowercase();
        if !ext.is_empty() && !ext.contains('|') && !out.contains(&ext) {
            out.push(ext);
        }
    }
    if out.is_empty() {
        to_owned_list(defaults)
    } else {
        out
    }
}

fn to_owned_list(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .filter(|value| !value.trim().is_empty())
            .cloned()
    })
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
