//! DirectX 12 队列后端
//!
//! 持有 `ID3D12CommandQueue`、初始值为 0 的 `ID3D12Fence` 和一个 Win32 自动重置事件。
//! 录制上下文是一对 `ID3D12CommandAllocator` + `ID3D12GraphicsCommandList`，
//! 二者一起复用：只有分配器上一次提交的命令执行完毕后才能重置。
//!
//! 超时返回后，早先的 `SetEventOnCompletion` 登记仍然有效，对应的值完成时会置位事件，
//! 所以事件触发只说明"某个登记过的值"到达了，等待之后总要再读一次 `GetCompletedValue`。

use std::task::Waker;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};
use windows::{
    core::PCSTR,
    Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT},
    Win32::Graphics::Direct3D12::*,
    Win32::Graphics::Dxgi::{DXGI_ERROR_DEVICE_HUNG, DXGI_ERROR_DEVICE_REMOVED, DXGI_ERROR_DEVICE_RESET},
    Win32::System::Threading::{CreateEventA, WaitForSingleObject, INFINITE},
};

use crate::core::error::{DistQueueError, GraphicsError, Result};
use crate::renderer::backend_trait::QueueBackend;
use crate::renderer::command::CommandListType;
use crate::gfx::waiter::CompletionThread;

/// DX12 录制上下文：命令分配器 + 图形命令列表
pub struct Dx12CommandContext {
    allocator: ID3D12CommandAllocator,
    list: ID3D12GraphicsCommandList,
}

impl Dx12CommandContext {
    /// 图形命令列表，渲染代码通过它录制命令
    pub fn list(&self) -> &ID3D12GraphicsCommandList {
        &self.list
    }

    /// 命令分配器
    pub fn allocator(&self) -> &ID3D12CommandAllocator {
        &self.allocator
    }
}

// COM 接口本身是线程安全的，上下文在任一时刻只有一个所有者
unsafe impl Send for Dx12CommandContext {}

/// 完成线程独占的 Fence 和事件，事件随线程结束关闭
struct ThreadFence {
    fence: ID3D12Fence,
    event: HANDLE,
}

// 只在完成线程中使用
unsafe impl Send for ThreadFence {}

impl ThreadFence {
    fn wait(&self, target: u64, slice: Duration) -> Result<u64> {
        unsafe {
            let completed = self.fence.GetCompletedValue();
            if completed >= target {
                return Ok(completed);
            }
            self.fence
                .SetEventOnCompletion(target, self.event)
                .map_err(|e| map_hresult(e, GraphicsError::Wait))?;
            let result = WaitForSingleObject(self.event, timeout_millis(Some(slice)));
            if result != WAIT_OBJECT_0 && result != WAIT_TIMEOUT {
                return Err(GraphicsError::Wait(format!("WaitForSingleObject returned {:#x}", result.0)).into());
            }
            Ok(self.fence.GetCompletedValue())
        }
    }
}

impl Drop for ThreadFence {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = CloseHandle(self.event) {
                warn!(error = %e, "Failed to close completion event");
            }
        }
    }
}

/// DX12 队列后端
pub struct Dx12QueueBackend {
    device: ID3D12Device,
    queue: ID3D12CommandQueue,
    fence: ID3D12Fence,
    fence_event: HANDLE,
    list_type: D3D12_COMMAND_LIST_TYPE,
    /// 同一个自动重置事件一次只服务一个等待者
    wait_lock: Mutex<()>,
    /// 首次异步等待时启动
    completion: Mutex<Option<CompletionThread>>,
}

unsafe impl Send for Dx12QueueBackend {}
unsafe impl Sync for Dx12QueueBackend {}

impl Dx12QueueBackend {
    /// 创建命令队列、Fence 和等待事件
    pub fn new(device: &ID3D12Device, kind: CommandListType) -> Result<Self> {
        let list_type = list_type(kind);

        unsafe {
            let queue_desc = D3D12_COMMAND_QUEUE_DESC {
                Type: list_type,
                Priority: D3D12_COMMAND_QUEUE_PRIORITY_NORMAL.0,
                Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
                NodeMask: 0,
            };
            let queue: ID3D12CommandQueue = device
                .CreateCommandQueue(&queue_desc)
                .map_err(|e| map_hresult(e, GraphicsError::QueueCreation))?;

            let fence: ID3D12Fence = device
                .CreateFence(0, D3D12_FENCE_FLAG_NONE)
                .map_err(|e| map_hresult(e, GraphicsError::FenceCreation))?;

            let fence_event = CreateEventA(None, false, false, PCSTR::null())
                .map_err(|e| GraphicsError::EventCreation(e.to_string()))?;

            debug!(%kind, "DX12 command queue, fence and event created");
            Ok(Self {
                device: device.clone(),
                queue,
                fence,
                fence_event,
                list_type,
                wait_lock: Mutex::new(()),
                completion: Mutex::new(None),
            })
        }
    }

    fn spawn_completion_thread(&self) -> Result<CompletionThread> {
        let event = unsafe { CreateEventA(None, false, false, PCSTR::null()) }
            .map_err(|e| GraphicsError::EventCreation(e.to_string()))?;
        let thread_fence = ThreadFence {
            fence: self.fence.clone(),
            event,
        };
        CompletionThread::spawn("d3d12-completion", move |target, slice| thread_fence.wait(target, slice))
    }

    /// 底层命令队列（交换链创建需要）
    pub fn command_queue(&self) -> &ID3D12CommandQueue {
        &self.queue
    }
}

impl Drop for Dx12QueueBackend {
    fn drop(&mut self) {
        drop(self.completion.lock().take());
        unsafe {
            if let Err(e) = CloseHandle(self.fence_event) {
                warn!(error = %e, "Failed to close fence event");
            }
        }
    }
}

fn list_type(kind: CommandListType) -> D3D12_COMMAND_LIST_TYPE {
    match kind {
        CommandListType::Direct => D3D12_COMMAND_LIST_TYPE_DIRECT,
        CommandListType::Compute => D3D12_COMMAND_LIST_TYPE_COMPUTE,
        CommandListType::Copy => D3D12_COMMAND_LIST_TYPE_COPY,
    }
}

fn map_hresult(error: windows::core::Error, wrap: fn(String) -> GraphicsError) -> DistQueueError {
    let code = error.code();
    if code == DXGI_ERROR_DEVICE_REMOVED || code == DXGI_ERROR_DEVICE_HUNG || code == DXGI_ERROR_DEVICE_RESET {
        GraphicsError::DeviceLost(error.to_string()).into()
    } else {
        wrap(error.to_string()).into()
    }
}

/// 距离截止时间的剩余时长，`None` 表示无限
fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

fn timeout_millis(timeout: Option<Duration>) -> u32 {
    match timeout {
        None => INFINITE,
        Some(t) => u32::try_from(t.as_millis()).unwrap_or(INFINITE - 1).min(INFINITE - 1),
    }
}

impl QueueBackend for Dx12QueueBackend {
    type Context = Dx12CommandContext;

    fn name(&self) -> &str {
        "DirectX 12"
    }

    fn allocate_context(&self, kind: CommandListType) -> Result<Self::Context> {
        let ty = list_type(kind);
        debug_assert_eq!(ty, self.list_type);

        unsafe {
            let allocator: ID3D12CommandAllocator = self
                .device
                .CreateCommandAllocator(ty)
                .map_err(|e| map_hresult(e, GraphicsError::ContextAllocation))?;

            // 新建的命令列表处于录制状态
            let list: ID3D12GraphicsCommandList = self
                .device
                .CreateCommandList(0, ty, &allocator, None::<&ID3D12PipelineState>)
                .map_err(|e| map_hresult(e, GraphicsError::ContextAllocation))?;

            Ok(Dx12CommandContext { allocator, list })
        }
    }

    fn reset_context(&self, context: &mut Self::Context) -> Result<()> {
        unsafe {
            context
                .allocator
                .Reset()
                .map_err(|e| map_hresult(e, GraphicsError::ContextReset))?;
            context
                .list
                .Reset(&context.allocator, None::<&ID3D12PipelineState>)
                .map_err(|e| map_hresult(e, GraphicsError::ContextReset))
        }
    }

    fn close_context(&self, context: &mut Self::Context) -> Result<()> {
        unsafe { context.list.Close() }.map_err(|e| map_hresult(e, GraphicsError::Submission))
    }

    fn execute(&self, context: &mut Self::Context) -> Result<()> {
        let lists: [Option<ID3D12CommandList>; 1] = [Some(context.list.clone().into())];
        unsafe { self.queue.ExecuteCommandLists(&lists) };
        Ok(())
    }

    fn signal(&self, value: u64) -> Result<()> {
        unsafe { self.queue.Signal(&self.fence, value) }.map_err(|e| map_hresult(e, GraphicsError::Signal))
    }

    fn completed_value(&self) -> u64 {
        unsafe { self.fence.GetCompletedValue() }
    }

    fn wait_for_value(&self, value: u64, timeout: Option<Duration>) -> Result<bool> {
        if self.completed_value() >= value {
            return Ok(true);
        }

        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let _guard = self.wait_lock.lock();
        loop {
            let wait = if deadline.is_some() { remaining(deadline) } else { timeout };
            unsafe {
                self.fence
                    .SetEventOnCompletion(value, self.fence_event)
                    .map_err(|e| map_hresult(e, GraphicsError::Wait))?;

                let result = WaitForSingleObject(self.fence_event, timeout_millis(wait));
                if result != WAIT_OBJECT_0 && result != WAIT_TIMEOUT {
                    return Err(GraphicsError::Wait(format!("WaitForSingleObject returned {:#x}", result.0)).into());
                }
                if self.completed_value() >= value {
                    return Ok(true);
                }
                if result == WAIT_TIMEOUT {
                    return Ok(false);
                }
            }

            // 事件来自更早的登记，值还没到
            if remaining(deadline) == Some(Duration::ZERO) {
                return Ok(false);
            }
        }
    }

    fn notify_on_completion(&self, value: u64, waker: Waker) -> Result<()> {
        if self.completed_value() >= value {
            waker.wake();
            return Ok(());
        }

        let mut completion = self.completion.lock();
        if completion.is_none() {
            *completion = Some(self.spawn_completion_thread()?);
        }
        if let Some(thread) = completion.as_ref() {
            thread.register(value, waker);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_millis() {
        assert_eq!(timeout_millis(None), INFINITE);
        assert_eq!(timeout_millis(Some(Duration::from_millis(16))), 16);
        assert_eq!(timeout_millis(Some(Duration::MAX)), INFINITE - 1);
    }

    #[test]
    fn test_remaining_saturates() {
        assert_eq!(remaining(None), None);
        let past = Instant::now();
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(remaining(Some(past)), Some(Duration::ZERO));
        let future = Instant::now() + Duration::from_secs(60);
        assert!(remaining(Some(future)).is_some_and(|left| left > Duration::ZERO));
    }

    #[test]
    fn test_list_type_mapping() {
        assert_eq!(list_type(CommandListType::Direct), D3D12_COMMAND_LIST_TYPE_DIRECT);
        assert_eq!(list_type(CommandListType::Copy), D3D12_COMMAND_LIST_TYPE_COPY);
    }
}
