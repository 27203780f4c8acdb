//! 模拟 GPU 后端
//!
//! 不依赖任何图形 API 的队列后端，用于单元测试和无头演示。
//!
//! # 两种工作模式
//!
//! - **手动模式**（[`SimulatedBackend::new`]）：完成进度只通过
//!   [`SimulatedBackend::complete_through`] 注入，测试可以精确控制 GPU 的推进
//! - **自动模式**（[`SimulatedBackend::with_latency`]）：后台线程在固定延迟后
//!   依次完成每个 signal 的值，行为类似一块始终响应的 GPU
//!
//! 后端会检测过早复用：重置一个最近一次提交尚未完成的命令列表时计数加一。

use std::collections::VecDeque;
use std::sync::Arc;
use std::task::Waker;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::core::error::{GraphicsError, Result};
use crate::renderer::backend_trait::QueueBackend;
use crate::renderer::command::CommandListType;
use crate::renderer::sync::{self, CompletionWakers};

/// 保留的已执行批次上限
const HISTORY_LIMIT: usize = 1024;

/// 模拟命令列表
#[derive(Debug)]
pub struct SimulatedCommandList {
    id: u64,
    kind: CommandListType,
    commands: Vec<String>,
    closed: bool,
    /// 最近一次提交对应的 Fence 值
    last_submission: u64,
}

impl SimulatedCommandList {
    /// 录制一条命令
    pub fn record(&mut self, command: impl Into<String>) {
        debug_assert!(!self.closed, "recording into a closed command list");
        self.commands.push(command.into());
    }

    /// 已录制的命令
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// 是否已关闭
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// 命令列表类型
    pub fn kind(&self) -> CommandListType {
        self.kind
    }

    /// 后端内部编号
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// 一次已执行的提交
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedBatch {
    /// 命令列表编号
    pub list: u64,
    /// 标记完成的 Fence 值
    pub fence: u64,
    /// 命令内容
    pub commands: Vec<String>,
}

#[derive(Default)]
struct GpuState {
    signaled: u64,
    completed: u64,
    /// 自动模式下等待完成的 signal 值
    pending: VecDeque<u64>,
    wakers: CompletionWakers,
    history: VecDeque<ExecutedBatch>,
    next_list_id: u64,
    allocations: u64,
    resets: u64,
    executions: u64,
    premature_reuses: u64,
    fail_next_submit: bool,
    fail_next_signal: bool,
    device_lost: bool,
    stopping: bool,
}

struct Shared {
    state: Mutex<GpuState>,
    /// 已完成值推进
    completed_cv: Condvar,
    /// 自动模式有新工作
    work_cv: Condvar,
    latency: Option<Duration>,
}

impl Shared {
    /// 推进已完成值，返回需要在释放锁之后唤醒的任务
    #[must_use]
    fn complete_locked(&self, state: &mut GpuState, value: u64) -> Vec<Waker> {
        let target = value.min(state.signaled);
        if target <= state.completed {
            return Vec::new();
        }
        state.completed = target;
        self.completed_cv.notify_all();
        state.wakers.take_reached(target)
    }

    fn check_device(&self, state: &GpuState) -> Result<()> {
        if state.device_lost {
            return Err(GraphicsError::DeviceLost("simulated device removed".to_string()).into());
        }
        Ok(())
    }
}

struct Worker {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        let wakers = {
            let mut state = self.shared.state.lock();
            state.stopping = true;
            state.wakers.take_all()
        };
        sync::wake_all(wakers);
        self.shared.work_cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// 模拟队列后端
///
/// 克隆得到的句柄共享同一块模拟 GPU，测试可以一边把后端交给 `CommandQueue`，
/// 一边保留句柄注入完成进度。
#[derive(Clone)]
pub struct SimulatedBackend {
    shared: Arc<Shared>,
    _worker: Option<Arc<Worker>>,
}

impl SimulatedBackend {
    /// 手动模式：完成进度由测试注入
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(GpuState::default()),
                completed_cv: Condvar::new(),
                work_cv: Condvar::new(),
                latency: None,
            }),
            _worker: None,
        }
    }

    /// 自动模式：每个 signal 的值在 `latency` 之后完成
    pub fn with_latency(latency: Duration) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(GpuState::default()),
            completed_cv: Condvar::new(),
            work_cv: Condvar::new(),
            latency: Some(latency),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("simulated-gpu".to_string())
            .spawn(move || run_gpu(worker_shared, latency))
            .ok();

        if handle.is_none() {
            warn!("Failed to spawn simulated GPU thread, completions must be injected manually");
        }

        Self {
            _worker: Some(Arc::new(Worker { shared: Arc::clone(&shared), handle })),
            shared,
        }
    }

    /// 是否为自动模式
    pub fn is_automatic(&self) -> bool {
        self.shared.latency.is_some()
    }

    /// 注入完成进度：硬件报告完成到 `value`（不超过已 signal 的值）
    pub fn complete_through(&self, value: u64) {
        let wakers = {
            let mut state = self.shared.state.lock();
            self.shared.complete_locked(&mut state, value)
        };
        sync::wake_all(wakers);
    }

    /// 完成所有已 signal 的工作
    pub fn complete_all(&self) {
        let wakers = {
            let mut state = self.shared.state.lock();
            let signaled = state.signaled;
            self.shared.complete_locked(&mut state, signaled)
        };
        sync::wake_all(wakers);
    }

    /// 最近一次 signal 的值
    pub fn signaled_value(&self) -> u64 {
        self.shared.state.lock().signaled
    }

    /// 硬件报告的已完成值
    pub fn completed_value(&self) -> u64 {
        self.shared.state.lock().completed
    }

    /// 新分配的命令列表数
    pub fn allocations(&self) -> u64 {
        self.shared.state.lock().allocations
    }

    /// 重置次数
    pub fn resets(&self) -> u64 {
        self.shared.state.lock().resets
    }

    /// 成功执行的提交数
    pub fn executions(&self) -> u64 {
        self.shared.state.lock().executions
    }

    /// 检测到的过早复用次数，正确的队列实现下始终为 0
    pub fn premature_reuses(&self) -> u64 {
        self.shared.state.lock().premature_reuses
    }

    /// 尚未唤醒的异步等待数
    pub fn pending_wakers(&self) -> usize {
        self.shared.state.lock().wakers.len()
    }

    /// 最近执行的批次（最多保留 1024 个）
    pub fn executed_batches(&self) -> Vec<ExecutedBatch> {
        self.shared.state.lock().history.iter().cloned().collect()
    }

    /// 下一次提交返回错误
    pub fn fail_next_submit(&self) {
        self.shared.state.lock().fail_next_submit = true;
    }

    /// 下一次 signal 返回错误（提交本身成功）
    pub fn fail_next_signal(&self) {
        self.shared.state.lock().fail_next_signal = true;
    }

    /// 模拟设备丢失，之后所有硬件调用都失败
    pub fn lose_device(&self) {
        let wakers = {
            let mut state = self.shared.state.lock();
            state.device_lost = true;
            self.shared.completed_cv.notify_all();
            state.wakers.take_all()
        };
        sync::wake_all(wakers);
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn run_gpu(shared: Arc<Shared>, latency: Duration) {
    debug!(?latency, "Simulated GPU started");
    let mut state = shared.state.lock();
    loop {
        if state.stopping {
            break;
        }

        if state.pending.is_empty() {
            shared.work_cv.wait(&mut state);
            continue;
        }

        parking_lot::MutexGuard::unlocked(&mut state, || thread::sleep(latency));

        if let Some(value) = state.pending.pop_front() {
            let wakers = shared.complete_locked(&mut state, value);
            if !wakers.is_empty() {
                parking_lot::MutexGuard::unlocked(&mut state, || sync::wake_all(wakers));
            }
        }
    }
    debug!("Simulated GPU stopped");
}

impl QueueBackend for SimulatedBackend {
    type Context = SimulatedCommandList;

    fn name(&self) -> &str {
        "Simulated"
    }

    fn allocate_context(&self, kind: CommandListType) -> Result<Self::Context> {
        let mut state = self.shared.state.lock();
        self.shared.check_device(&state)?;

        let id = state.next_list_id;
        state.next_list_id += 1;
        state.allocations += 1;

        Ok(SimulatedCommandList {
            id,
            kind,
            commands: Vec::new(),
            closed: false,
            last_submission: 0,
        })
    }

    fn reset_context(&self, context: &mut Self::Context) -> Result<()> {
        let mut state = self.shared.state.lock();
        self.shared.check_device(&state)?;

        if context.last_submission > state.completed {
            state.premature_reuses += 1;
            warn!(
                list = context.id,
                last_submission = context.last_submission,
                completed = state.completed,
                "Command list reset while the GPU may still read it"
            );
        }

        state.resets += 1;
        context.commands.clear();
        context.closed = false;
        Ok(())
    }

    fn close_context(&self, context: &mut Self::Context) -> Result<()> {
        if context.closed {
            return Err(GraphicsError::Submission(format!(
                "command list {} is already closed",
                context.id
            ))
            .into());
        }
        context.closed = true;
        Ok(())
    }

    fn execute(&self, context: &mut Self::Context) -> Result<()> {
        let mut state = self.shared.state.lock();
        self.shared.check_device(&state)?;

        if std::mem::take(&mut state.fail_next_submit) {
            return Err(GraphicsError::Submission("injected submission failure".to_string()).into());
        }
        if !context.closed {
            return Err(GraphicsError::Submission(format!(
                "command list {} executed while still recording",
                context.id
            ))
            .into());
        }

        // 队列在同一把锁内紧接着 signal，本次提交的完成值即下一个 signal 值
        context.last_submission = state.signaled + 1;
        state.executions += 1;

        if state.history.len() == HISTORY_LIMIT {
            state.history.pop_front();
        }
        let batch = ExecutedBatch {
            list: context.id,
            fence: context.last_submission,
            commands: context.commands.clone(),
        };
        state.history.push_back(batch);
        Ok(())
    }

    fn signal(&self, value: u64) -> Result<()> {
        let mut state = self.shared.state.lock();
        self.shared.check_device(&state)?;

        if std::mem::take(&mut state.fail_next_signal) {
            return Err(GraphicsError::Signal("injected signal failure".to_string()).into());
        }
        if value <= state.signaled {
            return Err(GraphicsError::Signal(format!(
                "fence value {} does not advance past {}",
                value, state.signaled
            ))
            .into());
        }

        state.signaled = value;
        if self.shared.latency.is_some() {
            state.pending.push_back(value);
            self.shared.work_cv.notify_one();
        }
        Ok(())
    }

    fn completed_value(&self) -> u64 {
        self.shared.state.lock().completed
    }

    fn wait_for_value(&self, value: u64, timeout: Option<Duration>) -> Result<bool> {
        // 无法表示的截止时间按无限等待处理
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.shared.state.lock();

        while state.completed < value {
            self.shared.check_device(&state)?;
            if state.stopping {
                return Ok(false);
            }
            match deadline {
                None => self.shared.completed_cv.wait(&mut state),
                Some(deadline) => {
                    if self.shared.completed_cv.wait_until(&mut state, deadline).timed_out() {
                        return Ok(state.completed >= value);
                    }
                }
            }
        }
        Ok(true)
    }

    fn notify_on_completion(&self, value: u64, waker: Waker) -> Result<()> {
        let mut state = self.shared.state.lock();
        self.shared.check_device(&state)?;

        if state.completed >= value {
            drop(state);
            waker.wake();
        } else {
            state.wakers.register(value, waker);
        }
        Ok(())
    }
}
