//! 核心功能模块
//!
//! 本模块提供了同步核心的基础设施：日志系统、配置管理和错误处理。
//! 这些模块独立于具体的图形 API，可以在任何后端中使用。
//!
//! # 模块组织
//!
//! - `log`：日志系统，提供结构化的日志记录功能
//! - `config`：配置管理，支持从配置文件加载队列与帧循环设置
//! - `error`：错误处理，定义统一的错误类型

pub mod log;
pub mod config;
pub mod error;

// 重新导出常用类型，方便使用
pub use error::{Result, DistQueueError, GraphicsError, ConfigError};
pub use config::Config;
