//! 图形后端模块
//!
//! 本模块封装了不同图形 API 的队列与 Fence 实现，包括：
//! - 模拟后端：无需 GPU，用于测试和无头演示
//! - DirectX 12：Windows 平台的命令队列 + ID3D12Fence
//! - Vulkan：队列 + 时间线信号量
//!
//! 所有后端都实现了统一的 `QueueBackend` trait，
//! 同步核心不需要关心具体使用的是哪个图形 API。
//! 硬件后端的异步完成通知由 `waiter` 中的完成线程统一处理。

pub mod simulated;
pub(crate) mod waiter;
pub mod vulkan;
#[cfg(target_os = "windows")]
pub mod dx12;

pub use simulated::{SimulatedBackend, SimulatedCommandList};
pub use vulkan::{VulkanDevice, VulkanQueueBackend};
#[cfg(target_os = "windows")]
pub use dx12::Dx12QueueBackend;
