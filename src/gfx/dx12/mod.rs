//! DirectX 12 图形 API 实现模块
//!
//! 本模块包含了所有 DirectX 12 相关的代码，包括：
//! - Device: 调试层、适配器选择（硬件或 WARP）与 D3D12 设备创建
//! - Backend: 命令队列、Fence 与等待事件组成的队列后端

pub mod device;
pub mod backend;

// 重新导出常用类型
pub use device::create_device;
pub use backend::{Dx12CommandContext, Dx12QueueBackend};
