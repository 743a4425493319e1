//! 存储配置
//! 以 JSON 文件保存，文件不存在时使用默认值

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{ResultExt, StoreError, StoreResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// 为空时落到系统数据目录下的 vectorvault.sqlite3
    #[serde(default)]
    pub database_path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
    #[serde(default)]
    pub ann: AnnConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_maintenance_buffer")]
    pub maintenance_buffer: usize,
    /// ensure_embedded_batch 的并发上限
    #[serde(default = "default_embed_concurrency")]
    pub embed_concurrency: usize,
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout_secs() -> u64 {
    5
}

fn default_maintenance_buffer() -> usize {
    32
}

fn default_embed_concurrency() -> usize {
    4
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: String::new(),
            max_connections: default_max_connections(),
            busy_timeout_secs: default_busy_timeout_secs(),
            ann: AnnConfig::default(),
            backfill: BackfillConfig::default(),
            logging: LoggingConfig::default(),
            maintenance_buffer: default_maintenance_buffer(),
            embed_concurrency: default_embed_concurrency(),
        }
    }
}

/// 量化索引参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnConfig {
    /// 粗筛候选数 = k * overfetch_factor
    pub overfetch_factor: usize,
    /// 粗筛候选数下限；小分区上 1 bit 量化的区分度有限，靠这个下限保住召回
    pub min_candidates: usize,
    /// 脏行占分区比例超过该值时，增量刷新升级为全量重建
    pub drift_ratio: f64,
    /// 重建与线性扫描每页读取的行数
    pub scan_batch_size: i64,
}

impl Default for AnnConfig {
    fn default() -> Self {
        Self {
            overfetch_factor: 10,
            min_candidates: 400,
            drift_ratio: 0.1,
            scan_batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    pub batch_size: i64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self { batch_size: 1000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: default_log_level(),
        }
    }
}

impl StoreConfig {
    /// 加载配置（如果文件不存在则返回默认配置）
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)?;
            serde_json::from_str::<StoreConfig>(&raw).config_err("配置文件格式错误")?
        } else {
            tracing::info!(path = %path.display(), "Config file missing, using defaults");
            StoreConfig::default()
        };
        config.apply_defaults()?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> StoreResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw)?;
        Ok(())
    }

    pub fn apply_defaults(&mut self) -> StoreResult<()> {
        if self.database_path.trim().is_empty() {
            let path = default_data_dir()?.join("vectorvault.sqlite3");
            self.database_path = path.to_string_lossy().to_string();
        }
        Ok(())
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.max_connections == 0 {
            return Err(StoreError::Config("max_connections 必须大于 0".into()));
        }
        if self.ann.overfetch_factor == 0 {
            return Err(StoreError::Config("overfetch_factor 必须大于 0".into()));
        }
        if !(self.ann.drift_ratio > 0.0 && self.ann.drift_ratio <= 1.0) {
            return Err(StoreError::Config(format!(
                "drift_ratio 必须在 (0, 1] 之间: {}",
                self.ann.drift_ratio
            )));
        }
        if self.ann.scan_batch_size <= 0 || self.backfill.batch_size <= 0 {
            return Err(StoreError::Config("批大小必须大于 0".into()));
        }
        if self.embed_concurrency == 0 || self.maintenance_buffer == 0 {
            return Err(StoreError::Config("并发与队列容量必须大于 0".into()));
        }
        Ok(())
    }
}

/// macOS: ~/Library/Application Support/com.vectorvault.vectorvault
/// Linux: ~/.local/share/vectorvault
fn default_data_dir() -> StoreResult<PathBuf> {
    let proj_dirs = ProjectDirs::from("com", "vectorvault", "vectorvault")
        .ok_or_else(|| StoreError::Config("无法确定应用数据目录".into()))?;
    Ok(proj_dirs.data_dir().to_path_buf())
}
