//! Vulkan 图形 API 实现模块
//!
//! 本模块包含了所有 Vulkan 相关的代码，包括：
//! - Device: 无头 Vulkan 实例、逻辑设备与队列
//! - Backend: 基于时间线信号量的队列后端

pub mod device;
pub mod backend;

// 重新导出常用类型
pub use device::VulkanDevice;
pub use backend::{VulkanCommandContext, VulkanQueueBackend};
