//! 错误处理模块
//!
//! 定义了同步核心中使用的统一错误类型，使用 `thiserror` 提供友好的错误消息。
//!
//! # 错误分类
//!
//! - **致命错误**：任何图形 API / 驱动调用失败（队列创建、Fence 创建、提交、signal），
//!   表示设备状态已损坏，不做本地重试，直接向上传播
//! - **超时（可恢复）**：`wait_until_reached` 超过期限，由调用方决定重试、跳帧还是升级
//! - **契约违规**：调用方误用接口（提交不属于本队列的上下文等），属于编程错误

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// 统一的 Result 类型
///
/// 所有可能返回错误的函数都应该使用这个类型。
pub type Result<T> = std::result::Result<T, DistQueueError>;

/// DistQueue 的错误类型
#[derive(Debug, Error)]
pub enum DistQueueError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// 图形 API 错误（致命）
    #[error("Graphics error: {0}")]
    Graphics(#[from] GraphicsError),

    /// 等待 Fence 超时（可恢复）
    #[error("Timed out after {timeout:?} waiting for fence value {value} (completed: {completed})")]
    Timeout {
        /// 等待的 Fence 值
        value: u64,
        /// 超时时硬件报告的已完成值
        completed: u64,
        /// 等待时长
        timeout: Duration,
    },

    /// 调用方违反接口契约
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 日志系统错误
    #[error("Log error: {0}")]
    Log(String),

    /// 初始化错误
    #[error("Initialization error: {0}")]
    Initialization(String),
}

/// 配置相关的错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置文件未找到
    #[error("Config file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// 配置文件解析失败
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// 配置值无效
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 图形 API 相关的错误
///
/// 这些错误都表示底层设备/驱动处于不可恢复状态。
#[derive(Debug, Error)]
pub enum GraphicsError {
    /// 设备创建失败
    #[error("Device creation failed: {0}")]
    DeviceCreation(String),

    /// 命令队列创建失败
    #[error("Command queue creation failed: {0}")]
    QueueCreation(String),

    /// Fence 创建失败
    #[error("Fence creation failed: {0}")]
    FenceCreation(String),

    /// 等待事件句柄创建失败
    #[error("Event creation failed: {0}")]
    EventCreation(String),

    /// 录制上下文（分配器 + 命令列表）分配失败
    #[error("Recording context allocation failed: {0}")]
    ContextAllocation(String),

    /// 录制上下文重置失败
    #[error("Recording context reset failed: {0}")]
    ContextReset(String),

    /// 命令提交失败
    #[error("Command submission failed: {0}")]
    Submission(String),

    /// Fence signal 失败
    #[error("Fence signal failed: {0}")]
    Signal(String),

    /// 等待 Fence 失败
    #[error("Fence wait failed: {0}")]
    Wait(String),

    /// 设备丢失
    #[error("Device lost: {0}")]
    DeviceLost(String),
}

impl DistQueueError {
    /// 是否为致命错误（图形 API 失败）
    pub fn is_fatal(&self) -> bool {
        matches!(self, DistQueueError::Graphics(_))
    }

    /// 是否为等待超时
    pub fn is_timeout(&self) -> bool {
        matches!(self, DistQueueError::Timeout { .. })
    }

    /// 是否为接口误用
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, DistQueueError::ContractViolation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let fatal: DistQueueError = GraphicsError::DeviceLost("removed".to_string()).into();
        assert!(fatal.is_fatal());
        assert!(!fatal.is_timeout());

        let timeout = DistQueueError::Timeout {
            value: 5,
            completed: 3,
            timeout: Duration::from_millis(10),
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_fatal());

        let misuse = DistQueueError::ContractViolation("foreign context".to_string());
        assert!(misuse.is_contract_violation());
    }

    #[test]
    fn test_error_messages() {
        let err: DistQueueError = ConfigError::InvalidValue {
            field: "frame.buffer_count".to_string(),
            reason: "must be 2 or 3".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid value for 'frame.buffer_count': must be 2 or 3"
        );

        let timeout = DistQueueError::Timeout {
            value: 5,
            completed: 3,
            timeout: Duration::from_millis(10),
        };
        assert!(timeout.to_string().contains("fence value 5"));
    }
}
