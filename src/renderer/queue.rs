//! 命令队列模块
//!
//! `CommandQueue` 封装一条硬件执行队列：发放可复用的录制上下文、提交录制结果，
//! 并针对 Fence 值提供阻塞与非阻塞的完成检查。
//!
//! # 数据流
//!
//! ```text
//! acquire_recording_context() ──▶ 渲染代码录制 ──▶ submit() ──▶ FenceValue
//!                                                                  │
//!          下次使用同一帧槽位之前 ◀── wait_until_reached(value) ◀────┘
//! ```
//!
//! # 并发
//!
//! 计数器和两个回收池由同一把锁保护，因此队列可以在线程间共享；
//! 阻塞等待硬件事件时从不持有这把锁。

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::error::{DistQueueError, Result};
use super::backend_trait::QueueBackend;
use super::command::{CommandListType, ContextId, ContextPool, QueueId, QueueStats, RecordingContext};
use super::sync::FenceValue;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

struct QueueState<C> {
    /// 最近一次 signal 的值
    fence_value: FenceValue,
    pool: ContextPool<C>,
    /// 已发放给调用方、尚未提交的上下文
    outstanding: HashSet<ContextId>,
    next_context_id: u64,
}

/// 命令队列
///
/// 每种工作类型创建一个。销毁时会先 flush，等待所有已提交的工作完成。
///
/// # 示例
///
/// ```
/// use dist_queue::gfx::SimulatedBackend;
/// use dist_queue::renderer::{CommandListType, CommandQueue};
///
/// let gpu = SimulatedBackend::new();
/// let queue = CommandQueue::new(gpu.clone(), CommandListType::Direct);
///
/// let mut ctx = queue.acquire_recording_context()?;
/// ctx.commands_mut().record("clear");
/// let fence = queue.submit(ctx)?;
///
/// gpu.complete_through(fence.get());
/// assert!(queue.is_reached(fence));
/// # Ok::<(), dist_queue::core::DistQueueError>(())
/// ```
pub struct CommandQueue<B: QueueBackend> {
    id: QueueId,
    kind: CommandListType,
    backend: B,
    state: Mutex<QueueState<B::Context>>,
}

impl<B: QueueBackend> CommandQueue<B> {
    /// 在已创建好硬件队列和 Fence 的后端之上创建命令队列
    pub fn new(backend: B, kind: CommandListType) -> Self {
        let id = QueueId(NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed));
        crate::queue_debug!(queue = id.0, %kind, backend = backend.name(), "Command queue created");

        Self {
            id,
            kind,
            backend,
            state: Mutex::new(QueueState {
                fence_value: FenceValue::owned_by(0, id),
                pool: ContextPool::new(),
                outstanding: HashSet::new(),
                next_context_id: 0,
            }),
        }
    }

    /// 队列标识
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// 队列的工作类型
    pub fn kind(&self) -> CommandListType {
        self.kind
    }

    /// 底层后端
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// 最近一次 signal 的 Fence 值
    pub fn last_signaled(&self) -> FenceValue {
        self.state.lock().fence_value
    }

    /// 硬件报告的已完成值
    pub fn completed_value(&self) -> FenceValue {
        FenceValue::new(self.backend.completed_value())
    }

    /// 统计信息
    pub fn stats(&self) -> QueueStats {
        self.state.lock().pool.stats()
    }

    /// 获取一个可录制的上下文
    ///
    /// 优先复用最近一次提交已经完成的上下文（重置其存储），
    /// 否则通过后端分配新的上下文。后端失败是致命错误。
    pub fn acquire_recording_context(&self) -> Result<RecordingContext<B::Context>> {
        let completed = self.backend.completed_value();
        let mut state = self.state.lock();
        state.pool.retire(completed);

        let (id, inner) = match state.pool.take_free() {
            Some(mut entry) => {
                debug_assert!(entry.last_fence().is_reached_by(completed));
                self.backend.reset_context(&mut entry.inner)?;
                state.pool.note_reused();
                crate::queue_trace!(
                    queue = self.id.0,
                    context = %entry.id,
                    last_fence = %entry.last_fence,
                    "Reusing recording context"
                );
                (entry.id, entry.inner)
            }
            None => {
                let inner = self.backend.allocate_context(self.kind)?;
                let id = ContextId(state.next_context_id);
                state.next_context_id += 1;
                state.pool.note_allocated();
                crate::queue_debug!(
                    queue = self.id.0,
                    context = %id,
                    in_flight = state.pool.in_flight_len(),
                    "Allocated new recording context"
                );
                (id, inner)
            }
        };

        state.outstanding.insert(id);
        Ok(RecordingContext::new(id, self.id, self.kind, inner))
    }

    /// 提交录制完成的上下文
    ///
    /// 关闭上下文、提交到硬件队列、signal 一个新的 Fence 值，
    /// 并把上下文标记为该值放入已提交池。返回的值标记这批工作的完成点。
    pub fn submit(&self, context: RecordingContext<B::Context>) -> Result<FenceValue> {
        if context.queue_id() != self.id {
            return Err(DistQueueError::ContractViolation(format!(
                "context {} was acquired from queue {} but submitted to queue {}",
                context.id(),
                context.queue_id().0,
                self.id.0
            )));
        }

        let (id, _, mut inner) = context.into_parts();
        let mut state = self.state.lock();

        if !state.outstanding.remove(&id) {
            return Err(DistQueueError::ContractViolation(format!(
                "context {} is not an outstanding recording context of queue {}",
                id, self.id.0
            )));
        }

        self.backend.close_context(&mut inner)?;
        self.backend.execute(&mut inner)?;
        let fence = match self.signal_locked(&mut state) {
            Ok(fence) => fence,
            Err(e) => {
                // 命令已进入硬件队列但没有可等待的值，销毁会释放 GPU 仍在读取的存储
                crate::queue_warn!(
                    queue = self.id.0,
                    context = %id,
                    error = %e,
                    "Signal failed after execute, leaking recording context"
                );
                std::mem::forget(inner);
                return Err(e);
            }
        };
        state.pool.push_submitted(id, inner, fence);

        crate::queue_trace!(queue = self.id.0, context = %id, fence = %fence, "Submitted recording context");
        Ok(fence)
    }

    /// 递增计数器并在硬件队列中 signal 新值
    pub fn signal(&self) -> Result<FenceValue> {
        let mut state = self.state.lock();
        self.signal_locked(&mut state)
    }

    fn signal_locked(&self, state: &mut QueueState<B::Context>) -> Result<FenceValue> {
        let next = state.fence_value.increment();
        self.backend.signal(next.get())?;
        state.fence_value = next;
        Ok(next)
    }

    /// 非阻塞查询：硬件是否已完成到 `value`
    ///
    /// 其他队列产生的值永远报告未到达，并记录一条警告。
    pub fn is_reached(&self, value: FenceValue) -> bool {
        if let Err(e) = self.check_owner(value) {
            crate::queue_warn!(queue = self.id.0, fence = %value, error = %e, "Foreign fence value queried");
            return false;
        }
        self.reached(value)
    }

    fn reached(&self, value: FenceValue) -> bool {
        value.is_reached_by(self.backend.completed_value())
    }

    /// 阻塞等待直到 `value` 到达
    ///
    /// # 参数
    ///
    /// * `value` - 等待的 Fence 值
    /// * `timeout` - 超时时间，`None` 表示无限等待
    ///
    /// # 返回值
    ///
    /// - `Ok(())`: 已到达，标记值 `<= value` 的已提交上下文被释放回空闲池
    /// - `Err(DistQueueError::Timeout)`: 超时仍未到达，可恢复
    /// - `Err(DistQueueError::ContractViolation)`: 无限等待一个本队列尚未 signal 的值，
    ///   或者等待其他队列产生的值
    /// - 其他错误：等待原语失败，致命
    ///
    /// 后端报告的"已触发"只是唤醒的理由，是否到达始终以硬件已完成值为准。
    pub fn wait_until_reached(&self, value: FenceValue, timeout: Option<Duration>) -> Result<()> {
        self.check_owner(value)?;
        if self.reached(value) {
            self.release_through(value);
            return Ok(());
        }

        self.check_waitable(value, timeout)?;

        crate::queue_debug!(
            queue = self.id.0,
            fence = %value,
            completed = self.backend.completed_value(),
            ?timeout,
            "Waiting for fence"
        );

        // 超时大到无法表示为截止时间时按无限等待处理
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            let remaining = match deadline {
                Some(deadline) => Some(deadline.saturating_duration_since(Instant::now())),
                None => timeout,
            };
            let signaled = self.backend.wait_for_value(value.get(), remaining)?;
            if self.reached(value) {
                break;
            }

            let expired = match deadline {
                Some(deadline) => Instant::now() >= deadline,
                None => !signaled,
            };
            if expired {
                let completed = self.backend.completed_value();
                crate::queue_warn!(queue = self.id.0, fence = %value, completed, ?timeout, "Fence wait timed out");
                return Err(DistQueueError::Timeout {
                    value: value.get(),
                    completed,
                    timeout: timeout.unwrap_or(Duration::MAX),
                });
            }

            if signaled {
                crate::queue_trace!(queue = self.id.0, fence = %value, "Spurious wake-up, waiting again");
            }
        }

        self.release_through(value);
        Ok(())
    }

    /// 异步等待直到 `value` 到达
    ///
    /// 在协作式调度环境中挂起当前任务，直到后端登记的完成事件触发。
    pub fn wait_until_reached_async(&self, value: FenceValue) -> FenceWait<'_, B> {
        FenceWait { queue: self, value, checked: false }
    }

    /// signal 一个新值并等待它到达
    ///
    /// 返回后所有此前提交的工作都已完成。
    pub fn flush(&self) -> Result<FenceValue> {
        let value = self.signal()?;
        self.wait_until_reached(value, None)?;
        crate::queue_debug!(queue = self.id.0, fence = %value, "Queue flushed");
        Ok(value)
    }

    /// 等待最近一次 signal 的值到达，不再额外 signal
    ///
    /// 所有提交都会 signal，因此返回后效果与 [`flush`](Self::flush) 相同。
    pub fn wait_idle(&self) -> Result<FenceValue> {
        let last = self.last_signaled();
        self.wait_until_reached(last, None)?;
        Ok(last)
    }

    fn check_owner(&self, value: FenceValue) -> Result<()> {
        match value.owner() {
            Some(owner) if owner != self.id => Err(DistQueueError::ContractViolation(format!(
                "fence value {} was produced by queue {} but waited on queue {}",
                value, owner.0, self.id.0
            ))),
            _ => Ok(()),
        }
    }

    fn check_waitable(&self, value: FenceValue, timeout: Option<Duration>) -> Result<()> {
        let last = self.last_signaled();
        if timeout.is_none() && value > last {
            return Err(DistQueueError::ContractViolation(format!(
                "infinite wait on fence value {} but queue {} has only signaled up to {}",
                value, self.id.0, last
            )));
        }
        Ok(())
    }

    fn release_through(&self, value: FenceValue) {
        let mut state = self.state.lock();
        let released = state.pool.release_through(value);
        if released > 0 {
            crate::queue_trace!(queue = self.id.0, fence = %value, released, "Released completed contexts");
        }
    }
}

impl<B: QueueBackend> Drop for CommandQueue<B> {
    fn drop(&mut self) {
        let last = self.last_signaled();
        if self.reached(last) {
            return;
        }

        if let Err(e) = self.wait_idle() {
            tracing::error!(queue = self.id.0, error = %e, "Failed to flush command queue on drop");
        }
    }
}

/// 异步 Fence 等待
///
/// 由 [`CommandQueue::wait_until_reached_async`] 创建。
pub struct FenceWait<'q, B: QueueBackend> {
    queue: &'q CommandQueue<B>,
    value: FenceValue,
    checked: bool,
}

impl<B: QueueBackend> Future for FenceWait<'_, B> {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let queue = self.queue;
        let value = self.value;

        if !self.checked {
            if let Err(e) = queue.check_owner(value) {
                return Poll::Ready(Err(e));
            }
            if queue.reached(value) {
                queue.release_through(value);
                return Poll::Ready(Ok(()));
            }
            if let Err(e) = queue.check_waitable(value, None) {
                return Poll::Ready(Err(e));
            }
            self.checked = true;
        } else if queue.reached(value) {
            queue.release_through(value);
            return Poll::Ready(Ok(()));
        }

        if let Err(e) = queue.backend.notify_on_completion(value.get(), cx.waker().clone()) {
            return Poll::Ready(Err(e));
        }

        // 登记之后再检查一次，避免错过登记前刚发生的完成
        if queue.reached(value) {
            queue.release_through(value);
            return Poll::Ready(Ok(()));
        }

        Poll::Pending
    }
}
