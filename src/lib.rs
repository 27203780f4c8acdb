//! DistQueue - GPU 命令队列同步核心
//!
//! 管理 CPU 录制与 GPU 执行之间的交接：每次提交都会得到一个单调递增的 Fence 值，
//! 录制上下文只有在 GPU 报告完成到该值之后才会被重置复用。
//!
//! # 模块结构
//!
//! - `core`: 基础设施（日志、配置、错误处理）
//! - `renderer`: 同步核心（Fence 值、命令队列、帧编排）
//! - `gfx`: 图形后端（模拟、DirectX 12、Vulkan）
//!
//! # 使用示例
//!
//! ```
//! use dist_queue::gfx::SimulatedBackend;
//! use dist_queue::renderer::{CommandListType, CommandQueue};
//!
//! let gpu = SimulatedBackend::new();
//! let queue = CommandQueue::new(gpu.clone(), CommandListType::Direct);
//!
//! let mut ctx = queue.acquire_recording_context()?;
//! ctx.commands_mut().record("draw");
//! let fence = queue.submit(ctx)?;
//!
//! gpu.complete_all();
//! queue.wait_until_reached(fence, None)?;
//! # Ok::<(), dist_queue::core::DistQueueError>(())
//! ```

pub mod core;
pub mod renderer;
pub mod gfx;
