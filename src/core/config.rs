//! 配置管理模块
//!
//! 提供队列、帧循环、后端和日志配置的加载、解析和管理功能。
//! 支持从 TOML 配置文件加载，也支持命令行参数覆盖。
//!
//! # 配置文件格式 (config.toml)
//!
//! ```toml
//! [queue]
//! kind = "direct"          # direct, compute, copy
//! wait_timeout_ms = 1000   # 0 表示无限等待
//!
//! [frame]
//! buffer_count = 3         # 2（双缓冲）或 3（三缓冲）
//! frame_count = 240
//! timeout_policy = "skip"  # skip 或 fail
//!
//! [backend]
//! kind = "simulated"       # simulated, dx12, vulkan
//! gpu_latency_ms = 4
//! use_warp = false
//!
//! [logging]
//! level = "info"           # trace, debug, info, warn, error
//! file_output = false
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::error::{ConfigError, Result};
use crate::renderer::command::CommandListType;

/// 完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// 命令队列配置
    #[serde(default)]
    pub queue: QueueConfig,

    /// 帧循环配置
    #[serde(default)]
    pub frame: FrameConfig,

    /// 后端配置
    #[serde(default)]
    pub backend: BackendConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 命令队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// 队列承载的工作类型
    #[serde(default = "default_queue_kind")]
    pub kind: CommandListType,

    /// 每帧等待 Fence 的超时（毫秒），0 表示无限等待
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

/// 帧循环配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameConfig {
    /// 后台缓冲区数量
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,

    /// 演示程序渲染的帧数
    #[serde(default = "default_frame_count")]
    pub frame_count: u64,

    /// 等待超时后的处理策略
    #[serde(default = "default_timeout_policy")]
    pub timeout_policy: TimeoutPolicy,
}

/// 等待超时策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    /// 跳过本帧，下一帧继续等待
    Skip,
    /// 将超时作为错误返回给调用方
    Fail,
}

/// 后端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// 后端类型
    #[serde(default = "default_backend_kind")]
    pub kind: BackendKind,

    /// 模拟 GPU 完成每次提交所需的时间（毫秒）
    #[serde(default = "default_gpu_latency_ms")]
    pub gpu_latency_ms: u64,

    /// 使用 WARP 软件适配器（仅 DX12）
    #[serde(default)]
    pub use_warp: bool,
}

/// 后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// 模拟 GPU（无需硬件）
    Simulated,
    /// DirectX 12 后端
    Dx12,
    /// Vulkan 后端（时间线信号量）
    Vulkan,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// 是否输出到文件
    #[serde(default = "default_file_output")]
    pub file_output: bool,

    /// 日志文件路径
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

// 默认值函数
fn default_queue_kind() -> CommandListType { CommandListType::Direct }
fn default_wait_timeout_ms() -> u64 { 1000 }
fn default_buffer_count() -> usize { 3 }
fn default_frame_count() -> u64 { 240 }
fn default_timeout_policy() -> TimeoutPolicy { TimeoutPolicy::Skip }
fn default_backend_kind() -> BackendKind { BackendKind::Simulated }
fn default_gpu_latency_ms() -> u64 { 4 }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_file_output() -> bool { false }
fn default_log_file() -> String { "distqueue.log".to_string() }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            kind: default_queue_kind(),
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            buffer_count: default_buffer_count(),
            frame_count: default_frame_count(),
            timeout_policy: default_timeout_policy(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            gpu_latency_ms: default_gpu_latency_ms(),
            use_warp: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: default_file_output(),
            log_file: default_log_file(),
        }
    }
}

impl Config {
    /// 从配置文件加载
    ///
    /// # 示例
    ///
    /// ```no_run
    /// use dist_queue::core::Config;
    ///
    /// let config = Config::from_file("config.toml")?;
    /// # Ok::<(), dist_queue::core::DistQueueError>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path.to_path_buf()))?;

        Self::from_toml_str(&contents)
    }

    /// 从 TOML 字符串解析
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }

    /// 从配置文件加载，如果文件不存在或解析失败则使用默认配置
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::from_file(path).unwrap_or_default()
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// 从命令行参数覆盖配置
    ///
    /// 支持的参数：
    /// - `--dx12`: 使用 DirectX 12 后端
    /// - `--vulkan`: 使用 Vulkan 后端
    /// - `--warp`: DX12 使用 WARP 适配器
    /// - `--frames <value>`: 渲染帧数
    /// - `--buffers <value>`: 后台缓冲区数量
    /// - `--timeout-ms <value>`: Fence 等待超时
    pub fn apply_args<I>(&mut self, args: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();

        if args.iter().any(|a| a == "--dx12") {
            self.backend.kind = BackendKind::Dx12;
        }

        if args.iter().any(|a| a == "--vulkan") {
            self.backend.kind = BackendKind::Vulkan;
        }

        if args.iter().any(|a| a == "--warp") {
            self.backend.use_warp = true;
        }

        if let Some(frames) = parse_flag(&args, "--frames") {
            self.frame.frame_count = frames;
        }

        if let Some(buffers) = parse_flag(&args, "--buffers") {
            self.frame.buffer_count = buffers;
        }

        if let Some(timeout) = parse_flag(&args, "--timeout-ms") {
            self.queue.wait_timeout_ms = timeout;
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.frame.buffer_count, 2 | 3) {
            return Err(ConfigError::InvalidValue {
                field: "frame.buffer_count".to_string(),
                reason: "Buffer count must be 2 or 3".to_string(),
            }
            .into());
        }

        if self.backend.kind == BackendKind::Simulated && self.backend.gpu_latency_ms > 10_000 {
            return Err(ConfigError::InvalidValue {
                field: "backend.gpu_latency_ms".to_string(),
                reason: "Simulated latency must not exceed 10 seconds".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// 每帧 Fence 等待超时，`None` 表示无限等待
    pub fn wait_timeout(&self) -> Option<Duration> {
        match self.queue.wait_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

fn parse_flag<T: std::str::FromStr>(args: &[String], flag: &str) -> Option<T> {
    let idx = args.iter().position(|a| a == flag)?;
    args.get(idx + 1)?.parse().ok()
}

impl BackendKind {
    /// 获取后端名称
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Simulated => "Simulated",
            BackendKind::Dx12 => "DirectX 12",
            BackendKind::Vulkan => "Vulkan",
        }
    }
}
