use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub bulk: BulkConfig,
    pub scheduler: SchedulerConfig,
}

/// Database connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connection_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    /// 连接被回收前允许的最大使用次数，防止长寿命连接泄漏资源
    pub max_uses_per_connection: u64,
    /// 空闲超过该秒数的连接在复用前先发送存活探测
    pub keepalive_idle_seconds: u64,
}

/// Bulk write engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkConfig {
    /// 单个事务内每块的记录数上限
    pub batch_size: usize,
}

/// Self-healing scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub default_max_retries: u32,
    pub default_retry_delays_seconds: Vec<u64>,
    pub default_timeout_seconds: u64,
    /// running 状态持续超过该秒数的作业视为卡死
    pub stuck_threshold_seconds: u64,
    pub health_check_interval_seconds: u64,
    pub recovery_sweep_interval_seconds: u64,
    pub maintenance_interval_seconds: u64,
    /// 健康快照与问题记录的日志目录
    pub journal_dir: String,
    /// 滚动日志保留的最近条目数
    pub journal_cap: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/ingest".to_string(),
                max_connections: std::cmp::max(10, cpus as u32 * 2),
                connection_timeout_seconds: 30,
                idle_timeout_seconds: 30,
                max_uses_per_connection: 7500,
                keepalive_idle_seconds: 10,
            },
            bulk: BulkConfig { batch_size: 1000 },
            scheduler: SchedulerConfig {
                default_max_retries: 5,
                default_retry_delays_seconds: vec![1, 5, 15, 60, 300],
                default_timeout_seconds: 300,
                stuck_threshold_seconds: 600,
                health_check_interval_seconds: 300,
                recovery_sweep_interval_seconds: 600,
                maintenance_interval_seconds: 86400,
                journal_dir: "logs".to_string(),
                journal_cap: 1000,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: INGEST_)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder().add_source(
            ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?,
        );

        if let Some(path) = config_path {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            for candidate in ["config/ingest.toml", "ingest.toml", "/etc/ingest/config.toml"] {
                if Path::new(candidate).exists() {
                    builder = builder.add_source(File::new(candidate, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("INGEST")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("加载配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (test helper)
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> Result<()> {
        self.database.validate()?;
        self.bulk.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(anyhow::anyhow!("数据库URL不能为空"));
        }

        let supported = self.url.starts_with("postgresql://")
            || self.url.starts_with("postgres://")
            || self.url.starts_with("sqlite:");
        if !supported {
            return Err(anyhow::anyhow!("数据库URL必须是PostgreSQL或SQLite格式"));
        }

        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("最大连接数必须大于0"));
        }

        if self.connection_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("连接超时时间必须大于0"));
        }

        if self.max_uses_per_connection == 0 {
            return Err(anyhow::anyhow!("单连接最大使用次数必须大于0"));
        }

        Ok(())
    }
}

impl BulkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(anyhow::anyhow!("批量块大小必须大于0"));
        }
        Ok(())
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_retry_delays_seconds.is_empty() {
            return Err(anyhow::anyhow!("重试间隔序列不能为空"));
        }

        if self.default_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("作业超时时间必须大于0"));
        }

        if self.journal_cap == 0 {
            return Err(anyhow::anyhow!("滚动日志容量必须大于0"));
        }

        Ok(())
    }
}
