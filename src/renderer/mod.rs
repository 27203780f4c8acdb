//! 渲染器同步核心
//!
//! 本模块实现与具体图形 API 无关的命令队列同步逻辑：
//! 单调递增的 Fence 值、录制上下文的回收池、命令队列本身，以及每帧的编排流程。
//! 具体的硬件队列和 Fence 由 `gfx` 模块中的后端提供。
//!
//! # 架构设计
//!
//! - `sync`：`FenceValue` 与异步等待的唤醒表
//! - `command`：录制上下文及其回收池
//! - `backend_trait`：后端需要提供的硬件原语
//! - `queue`：`CommandQueue`，保证上下文在 GPU 用完之前不会被重置
//! - `frame`：后台缓冲区槽位与帧编排器

pub mod sync;
pub mod command;
pub mod backend_trait;
pub mod queue;
pub mod frame;

pub use backend_trait::QueueBackend;
pub use command::{CommandListType, ContextId, QueueId, QueueStats, RecordingContext};
pub use frame::{
    FrameInfo, FrameOrchestrator, FrameOutcome, FrameRenderer, FrameSlots, FrameStats, HeadlessPresenter,
    Presenter, ResizeArgs, UpdateArgs,
};
pub use queue::{CommandQueue, FenceWait};
pub use sync::FenceValue;
