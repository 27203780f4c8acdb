//! 统一的队列后端接口
//!
//! 本模块定义了所有图形后端（DX12、Vulkan、模拟后端）都必须实现的队列能力接口。
//! 同步逻辑只依赖这个 trait，因此可以在没有真实 GPU 的情况下针对模拟后端测试。
//!
//! # 生命周期约定
//!
//! 后端在构造时创建硬件队列、初始值为 0 的 Fence 以及操作系统等待事件。
//! `CommandQueue` 只在空闲池没有可复用上下文时调用 `allocate_context`，
//! 稳态帧循环中不会产生新的分配。

use std::task::Waker;
use std::time::Duration;

use crate::core::error::Result;
use super::command::CommandListType;

/// 队列后端接口
///
/// # 方法说明
///
/// - `allocate_context()`: 分配一个新的录制上下文（命令分配器 + 命令列表），已处于可录制状态
/// - `reset_context()`: 重置已完成的上下文，使其重新可录制
/// - `close_context()`: 结束录制
/// - `execute()`: 把已关闭的上下文提交到硬件队列
/// - `signal()`: 在队列中插入 Fence signal 命令
/// - `completed_value()`: 硬件报告的最高已完成值
/// - `wait_for_value()`: 阻塞等待直到值到达或超时
/// - `notify_on_completion()`: 值到达时唤醒指定任务
///
/// 所有方法返回的错误都被视为致命错误。
pub trait QueueBackend: Send + Sync {
    /// 后端的录制上下文类型（分配器 + 命令列表对）
    type Context: Send;

    /// 后端名称，用于日志
    fn name(&self) -> &str;

    /// 分配新的录制上下文
    ///
    /// 返回的上下文已处于录制状态。
    fn allocate_context(&self, kind: CommandListType) -> Result<Self::Context>;

    /// 重置录制上下文
    ///
    /// 调用方保证该上下文上一次提交的工作已经完成。
    fn reset_context(&self, context: &mut Self::Context) -> Result<()>;

    /// 结束录制
    fn close_context(&self, context: &mut Self::Context) -> Result<()>;

    /// 提交已关闭的上下文到硬件队列
    fn execute(&self, context: &mut Self::Context) -> Result<()>;

    /// 在硬件队列中 signal 指定的 Fence 值
    fn signal(&self, value: u64) -> Result<()>;

    /// 硬件报告的最高已完成 Fence 值
    fn completed_value(&self) -> u64;

    /// 阻塞等待 Fence 值到达
    ///
    /// # 参数
    ///
    /// * `value` - 等待的 Fence 值
    /// * `timeout` - 超时时间，`None` 表示无限等待
    ///
    /// # 返回值
    ///
    /// - `Ok(true)`: 值已到达
    /// - `Ok(false)`: 超时
    /// - `Err(...)`: 等待原语本身失败
    fn wait_for_value(&self, value: u64, timeout: Option<Duration>) -> Result<bool>;

    /// 值到达时唤醒 `waker`
    ///
    /// 如果登记时值已经到达，实现可以立即唤醒。
    fn notify_on_completion(&self, value: u64, waker: Waker) -> Result<()>;
}
