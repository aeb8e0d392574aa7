//! 配置管理模块
//! 加载并解析服务配置，支持TOML/YAML格式与环境变量覆盖

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, Map};
use serde::{Deserialize, Serialize};

/// 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CasterConfig {
    /// NTRIP 服务绑定地址
    pub bind_addr: SocketAddr,

    /// 状态接口配置
    pub api: ApiConfig,

    /// 连接分发配置
    pub dispatcher: DispatcherConfig,

    /// 基准站配置
    pub station: StationConfig,

    /// 流动站配置
    pub rover: RoverConfig,

    /// 日志配置
    pub log: LogConfig,
}

/// 状态接口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// 是否启用
    pub enabled: bool,

    /// 绑定地址
    pub bind_addr: SocketAddr,
}

/// 连接分发配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// 请求头最大字节数
    pub max_header_bytes: usize,

    /// 请求头读取超时(秒)
    pub header_timeout_secs: u64,
}

/// 基准站（上传端）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// 读取缓冲区大小
    pub read_buffer_size: usize,

    /// 是否启用RTCM解析
    pub enable_rtcm_parsing: bool,

    /// 原始数据记录目录，为空则不记录
    pub capture_dir: Option<PathBuf>,

    /// 断开后挂载点保留时间(秒)
    pub retain_secs: u64,

    /// 过期挂载点清理间隔(秒)
    pub reap_interval_secs: u64,

    /// 每个基准站保留的状态上报条数
    pub max_status_updates: usize,

    /// 是否向基准站回复 ICY 200 OK
    pub source_ack: bool,
}

/// 流动站（下载端）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoverConfig {
    /// 发送队列深度（以数据块计），满则断开
    pub queue_depth: usize,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// 日志级别
    pub level: String,
}

impl Default for CasterConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 2101)),
            api: ApiConfig::default(),
            dispatcher: DispatcherConfig::default(),
            station: StationConfig::default(),
            rover: RoverConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5005)),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: 8192,
            header_timeout_secs: 10,
        }
    }
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 4096,
            enable_rtcm_parsing: true,
            capture_dir: Some(PathBuf::from(".")),
            retain_secs: 300,
            reap_interval_secs: 30,
            max_status_updates: 32,
            source_ack: true,
        }
    }
}

impl Default for RoverConfig {
    fn default() -> Self {
        Self { queue_depth: 64 }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn header_timeout(&self) -> Duration {
        Duration::from_secs(self.header_timeout_secs)
    }
}

impl StationConfig {
    pub fn retain(&self) -> Duration {
        Duration::from_secs(self.retain_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

/// 加载配置文件
///
/// 文件不存在时使用默认值；环境变量 `NTRIP__<SECTION>__<KEY>` 覆盖文件配置。
pub fn load(config_path: impl AsRef<Path>) -> Result<CasterConfig, ConfigError> {
    load_with_env(config_path, None)
}

/// 同 `load`，`env` 为 `Some` 时以其代替进程环境变量
fn load_with_env(
    config_path: impl AsRef<Path>,
    env: Option<Map<String, String>>,
) -> Result<CasterConfig, ConfigError> {
    Config::builder()
        .add_source(File::from(config_path.as_ref()).required(false))
        .add_source(
            Environment::with_prefix("NTRIP")
                .separator("__")
                .try_parsing(true)
                .source(env),
        )
        .build()?
        .try_deserialize()
}
