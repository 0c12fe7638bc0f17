// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

use crate::transfer::plan::DEFAULT_SEGMENT_SIZE;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 持久化状态目录
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// 传输配置
    #[serde(default)]
    pub transfer: TransferConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            transfer: TransferConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .transfer
            .validate()
            .context("配置文件中的传输参数验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.transfer
            .validate()
            .context("保存配置失败：传输参数非法")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        Ok(())
    }
}

/// 传输配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// 分片大小（字节）
    #[serde(default = "default_segment_size")]
    pub segment_size: u64,
    /// 单任务并发分片数上限
    ///
    /// 这是背压控制而不只是性能旋钮：不设上限会耗尽远端连接配额
    /// 与本地资源预算
    #[serde(default = "default_parallel")]
    pub parallel: usize,
    /// 最大重试次数（总尝试次数 = max_retries + 1）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 首次退避时长（毫秒），之后按指数增长
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_segment_size() -> u64 {
    DEFAULT_SEGMENT_SIZE
}

fn default_parallel() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            segment_size: default_segment_size(),
            parallel: default_parallel(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl TransferConfig {
    /// 验证配置参数
    pub fn validate(&self) -> Result<()> {
        if self.segment_size == 0 {
            anyhow::bail!("分片大小必须大于 0");
        }
        if self.parallel == 0 {
            anyhow::bail!("并发上限必须大于 0");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("请求超时必须大于 0");
        }
        Ok(())
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}
