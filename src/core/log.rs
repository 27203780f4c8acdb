//! 日志系统模块
//!
//! 基于 `tracing` 提供结构化的日志记录功能。
//!
//! # 特性
//!
//! - 结构化日志：Fence 值、上下文 ID 等以键值对记录
//! - 灵活输出：支持控制台和滚动文件输出
//! - 日志级别：trace, debug, info, warn, error
//!
//! # 使用示例
//!
//! ```no_run
//! use dist_queue::core::config::LogLevel;
//! use dist_queue::core::log;
//!
//! log::init_logger(LogLevel::Info, false, None)?;
//! tracing::info!(frames = 3, "Frame loop started");
//! # Ok::<(), dist_queue::core::DistQueueError>(())
//! ```

use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, fmt::format::FmtSpan, prelude::*, EnvFilter};

use super::config::LogLevel;
use super::error::{DistQueueError, Result};

const DEFAULT_LOG_FILE: &str = "distqueue.log";

/// 初始化日志系统
///
/// 必须在程序开始时调用一次，重复调用返回 `DistQueueError::Log`。
/// 设置了 `RUST_LOG` 时以环境变量为准。
///
/// # 参数
///
/// * `level` - 日志级别
/// * `file_output` - 是否同时输出到按天滚动的文件
/// * `log_file_path` - 日志文件路径（可选，默认为 "distqueue.log"）
pub fn init_logger(level: LogLevel, file_output: bool, log_file_path: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directive(level)));

    let file_layer = if file_output {
        let (directory, filename) = split_log_path(log_file_path.unwrap_or(DEFAULT_LOG_FILE));
        let appender = RollingFileAppender::new(Rotation::DAILY, directory, filename);
        Some(fmt::layer().with_target(true).with_ansi(false).with_writer(appender))
    } else {
        None
    };

    // Fence 等待线程有名字，控制台上带出来便于区分
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| DistQueueError::Log(e.to_string()))
}

/// 拆分为滚动日志需要的目录和文件名前缀
fn split_log_path(path: &str) -> (PathBuf, String) {
    let path = Path::new(path);
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_string();
    (directory, filename)
}

fn filter_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

/// 命令队列日志 - Debug 级别
#[macro_export]
macro_rules! queue_debug {
    ($($arg:tt)*) => {
        tracing::debug!(target: "distqueue::queue", $($arg)*)
    };
}

/// 命令队列日志 - Trace 级别
#[macro_export]
macro_rules! queue_trace {
    ($($arg:tt)*) => {
        tracing::trace!(target: "distqueue::queue", $($arg)*)
    };
}

/// 命令队列日志 - Warn 级别
#[macro_export]
macro_rules! queue_warn {
    ($($arg:tt)*) => {
        tracing::warn!(target: "distqueue::queue", $($arg)*)
    };
}

/// 帧循环日志 - Info 级别
#[macro_export]
macro_rules! frame_info {
    ($($arg:tt)*) => {
        tracing::info!(target: "distqueue::frame", $($arg)*)
    };
}

/// 帧循环日志 - Warn 级别
#[macro_export]
macro_rules! frame_warn {
    ($($arg:tt)*) => {
        tracing::warn!(target: "distqueue::frame", $($arg)*)
    };
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
    }

    #[test]
    fn test_split_log_path() {
        assert_eq!(split_log_path("distqueue.log"), (PathBuf::from("."), "distqueue.log".to_string()));
        assert_eq!(split_log_path("logs/queue.log"), (PathBuf::from("logs"), "queue.log".to_string()));
        assert_eq!(split_log_path("logs/"), (PathBuf::from("."), "logs".to_string()));
    }

    #[test]
    fn test_filter_directive() {
        assert_eq!(filter_directive(LogLevel::Trace), "trace");
        assert_eq!(filter_directive(LogLevel::Warn), "warn");
    }
}
