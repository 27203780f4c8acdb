//! 命令录制上下文管理模块
//!
//! 提供录制上下文（命令分配器 + 命令列表对）的类型和回收池。
//!
//! # 上下文生命周期
//!
//! ```text
//! 空闲（回收池） ──acquire──▶ 录制中（调用方持有）
//!      ▲                              │ submit
//!      │ Fence 值已到达              ▼
//!      └────────────────────── 已提交（标记 Fence 值）
//! ```
//!
//! 标记为 Fence 值 `v` 的上下文在队列确认已完成值 `>= v` 之前绝不能被重置或复用，
//! 否则 GPU 会读取正在被 CPU 重写的命令缓冲区。

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::sync::FenceValue;

/// 命令列表类型
///
/// 每个队列和它发出的每个上下文都属于同一种工作类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandListType {
    /// 图形 + 计算 + 复制命令
    Direct,
    /// 计算 + 复制命令
    Compute,
    /// 仅复制命令
    Copy,
}

impl CommandListType {
    /// 类型名称
    pub fn name(&self) -> &'static str {
        match self {
            CommandListType::Direct => "direct",
            CommandListType::Compute => "compute",
            CommandListType::Copy => "copy",
        }
    }
}

impl fmt::Display for CommandListType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 命令队列标识，进程内唯一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub(crate) u64);

/// 录制上下文标识，在所属队列内唯一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub(crate) u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 录制上下文
///
/// 由 `CommandQueue::acquire_recording_context` 发出，调用方独占持有直到
/// `CommandQueue::submit` 按值取回。
#[derive(Debug)]
pub struct RecordingContext<C> {
    id: ContextId,
    queue: QueueId,
    kind: CommandListType,
    inner: C,
}

impl<C> RecordingContext<C> {
    pub(crate) fn new(id: ContextId, queue: QueueId, kind: CommandListType, inner: C) -> Self {
        Self { id, queue, kind, inner }
    }

    /// 上下文标识
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// 发出该上下文的队列
    pub fn queue_id(&self) -> QueueId {
        self.queue
    }

    /// 命令列表类型
    pub fn kind(&self) -> CommandListType {
        self.kind
    }

    /// 后端命令列表
    pub fn commands(&self) -> &C {
        &self.inner
    }

    /// 后端命令列表（可变），渲染代码通过它录制命令
    pub fn commands_mut(&mut self) -> &mut C {
        &mut self.inner
    }

    pub(crate) fn into_parts(self) -> (ContextId, QueueId, C) {
        (self.id, self.queue, self.inner)
    }
}

/// 池中的上下文
#[derive(Debug)]
pub struct PooledContext<C> {
    pub(crate) id: ContextId,
    pub(crate) inner: C,
    pub(crate) last_fence: FenceValue,
}

impl<C> PooledContext<C> {
    /// 上下文标识
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// 最近一次提交标记的 Fence 值
    pub fn last_fence(&self) -> FenceValue {
        self.last_fence
    }
}

/// 录制上下文回收池
///
/// 维护两个集合：空闲上下文（最近一次提交已完成）和已提交上下文
/// （按提交顺序排列，Fence 值严格递增）。
#[derive(Debug)]
pub struct ContextPool<C> {
    free: Vec<PooledContext<C>>,
    submitted: VecDeque<PooledContext<C>>,
    allocated: u64,
    reused: u64,
    submitted_total: u64,
}

impl<C> Default for ContextPool<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ContextPool<C> {
    /// 创建空的回收池
    pub fn new() -> Self {
        Self {
            free: Vec::new(),
            submitted: VecDeque::new(),
            allocated: 0,
            reused: 0,
            submitted_total: 0,
        }
    }

    /// 把已完成（`last_fence <= completed`）的已提交上下文移入空闲池
    ///
    /// 返回移动的数量。
    pub fn retire(&mut self, completed: u64) -> usize {
        let mut retired = 0;
        while let Some(front) = self.submitted.front() {
            if !front.last_fence.is_reached_by(completed) {
                break;
            }
            if let Some(entry) = self.submitted.pop_front() {
                self.free.push(entry);
                retired += 1;
            }
        }
        retired
    }

    /// 等待 `value` 成功后释放标记值 `<= value` 的上下文
    pub fn release_through(&mut self, value: FenceValue) -> usize {
        self.retire(value.get())
    }

    /// 取出一个可复用的空闲上下文
    ///
    /// 重置成功后调用方再通过 [`note_reused`](Self::note_reused) 计数。
    pub fn take_free(&mut self) -> Option<PooledContext<C>> {
        self.free.pop()
    }

    /// 记录一次成功复用
    pub fn note_reused(&mut self) {
        self.reused += 1;
    }

    /// 记录一次新分配
    pub fn note_allocated(&mut self) {
        self.allocated += 1;
    }

    /// 放入已提交集合
    ///
    /// Fence 值必须大于集合中已有的所有值。
    pub fn push_submitted(&mut self, id: ContextId, inner: C, fence: FenceValue) {
        debug_assert!(
            self.submitted.back().map_or(true, |last| last.last_fence < fence),
            "submitted contexts must be tagged in increasing fence order"
        );
        self.submitted.push_back(PooledContext { id, inner, last_fence: fence });
        self.submitted_total += 1;
    }

    /// 空闲上下文数
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// 已提交但可能尚未完成的上下文数
    pub fn in_flight_len(&self) -> usize {
        self.submitted.len()
    }

    /// 最早提交且未回收的上下文的 Fence 值
    pub fn oldest_in_flight(&self) -> Option<FenceValue> {
        self.submitted.front().map(|entry| entry.last_fence)
    }

    /// 统计信息
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            allocated: self.allocated,
            reused: self.reused,
            submitted: self.submitted_total,
            in_flight: self.submitted.len(),
            free: self.free.len(),
        }
    }
}

/// 队列统计信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// 新分配的上下文总数
    pub allocated: u64,
    /// 从空闲池复用的次数
    pub reused: u64,
    /// 提交总数
    pub submitted: u64,
    /// 当前已提交未回收的上下文数
    pub in_flight: usize,
    /// 当前空闲上下文数
    pub free: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_list_type_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            kind: CommandListType,
        }

        let w: Wrapper = toml::from_str("kind = \"compute\"").unwrap();
        assert_eq!(w.kind, CommandListType::Compute);
        assert_eq!(CommandListType::Copy.to_string(), "copy");
    }

    #[test]
    fn test_recording_context_parts() {
        let mut ctx = RecordingContext::new(ContextId(7), QueueId(1), CommandListType::Direct, vec![1u8]);
        assert_eq!(ctx.id(), ContextId(7));
        ctx.commands_mut().push(2);
        assert_eq!(ctx.commands(), &vec![1, 2]);

        let (id, queue, inner) = ctx.into_parts();
        assert_eq!(id, ContextId(7));
        assert_eq!(queue, QueueId(1));
        assert_eq!(inner, vec![1, 2]);
    }

    #[test]
    fn test_pool_retire_in_order() {
        let mut pool: ContextPool<()> = ContextPool::new();
        pool.push_submitted(ContextId(0), (), FenceValue::new(1));
        pool.push_submitted(ContextId(1), (), FenceValue::new(2));
        pool.push_submitted(ContextId(2), (), FenceValue::new(3));

        assert_eq!(pool.retire(0), 0);
        assert!(pool.take_free().is_none());

        assert_eq!(pool.retire(2), 2);
        assert_eq!(pool.free_len(), 2);
        assert_eq!(pool.in_flight_len(), 1);
        assert_eq!(pool.oldest_in_flight(), Some(FenceValue::new(3)));

        let reused = pool.take_free().unwrap();
        assert!(reused.last_fence() <= FenceValue::new(2));
        assert_eq!(pool.stats().reused, 0);
        pool.note_reused();
        assert_eq!(pool.stats().reused, 1);
    }

    #[test]
    fn test_pool_release_through() {
        let mut pool: ContextPool<()> = ContextPool::new();
        pool.note_allocated();
        pool.push_submitted(ContextId(0), (), FenceValue::new(4));
        assert_eq!(pool.release_through(FenceValue::new(3)), 0);
        assert_eq!(pool.release_through(FenceValue::new(4)), 1);

        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.free, 1);
        assert_eq!(stats.in_flight, 0);
    }
}
