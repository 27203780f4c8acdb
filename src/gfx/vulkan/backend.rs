//! Vulkan 队列后端
//!
//! 用时间线信号量充当 Fence：
//!
//! - `signal(v)`：提交一个不含命令缓冲区、只 signal 信号量到 `v` 的批次。
//!   按提交顺序，它在此前所有批次完成后才会触发
//! - `completed_value()`：`vkGetSemaphoreCounterValue`
//! - `wait_for_value()`：`vkWaitSemaphores`，超时以纳秒传入
//! - `notify_on_completion()`：登记到后端唯一的完成线程
//!
//! 每个录制上下文是一个独立的命令池加一个主命令缓冲区，重置时整池重置。
//!
//! `completed_value()` 不能返回错误，读取计数器时遇到 `VK_ERROR_DEVICE_LOST`
//! 会先记下来，由下一次可失败的调用报告。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Waker;
use std::time::Duration;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::core::error::{DistQueueError, GraphicsError, Result};
use crate::renderer::backend_trait::QueueBackend;
use crate::renderer::command::CommandListType;
use crate::gfx::waiter::CompletionThread;
use super::device::VulkanDevice;

/// Vulkan 录制上下文：命令池 + 主命令缓冲区
pub struct VulkanCommandContext {
    device: Arc<VulkanDevice>,
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    kind: CommandListType,
}

impl VulkanCommandContext {
    /// 命令缓冲区句柄，渲染代码通过它录制命令
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// 命令列表类型
    pub fn kind(&self) -> CommandListType {
        self.kind
    }
}

impl Drop for VulkanCommandContext {
    fn drop(&mut self) {
        // 命令缓冲区随命令池一起释放
        unsafe { self.device.device().destroy_command_pool(self.pool, None) };
    }
}

/// 记录不可失败的调用中观察到的设备丢失
#[derive(Debug, Default)]
struct DeviceLostLatch(AtomicBool);

impl DeviceLostLatch {
    fn observe(&self, result: vk::Result) {
        if result == vk::Result::ERROR_DEVICE_LOST {
            self.0.store(true, Ordering::Release);
        }
    }

    fn check(&self) -> Result<()> {
        if self.0.load(Ordering::Acquire) {
            return Err(GraphicsError::DeviceLost(
                "vkGetSemaphoreCounterValue reported VK_ERROR_DEVICE_LOST".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

/// 计数器读取失败时记下设备丢失，并按"尚未完成"处理
fn counter_or_zero(result: ash::prelude::VkResult<u64>, latch: &DeviceLostLatch) -> u64 {
    match result {
        Ok(value) => value,
        Err(e) => {
            latch.observe(e);
            warn!(error = %e, "vkGetSemaphoreCounterValue failed");
            0
        }
    }
}

/// Vulkan 队列后端
pub struct VulkanQueueBackend {
    device: Arc<VulkanDevice>,
    timeline: vk::Semaphore,
    /// `VkQueue` 的提交需要外部同步
    submit_lock: Mutex<()>,
    device_lost: Arc<DeviceLostLatch>,
    /// 首次异步等待时启动
    completion: Mutex<Option<CompletionThread>>,
}

impl VulkanQueueBackend {
    /// 在设备的队列上创建后端，时间线信号量初始值为 0
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);

        let timeline = unsafe { device.device().create_semaphore(&create_info, None) }
            .map_err(|e| GraphicsError::FenceCreation(format!("vkCreateSemaphore: {e}")))?;

        debug!(device = device.name(), "Timeline semaphore created");
        Ok(Self {
            device,
            timeline,
            submit_lock: Mutex::new(()),
            device_lost: Arc::new(DeviceLostLatch::default()),
            completion: Mutex::new(None),
        })
    }

    fn spawn_completion_thread(&self) -> Result<CompletionThread> {
        let device = Arc::clone(&self.device);
        let timeline = self.timeline;
        let device_lost = Arc::clone(&self.device_lost);

        CompletionThread::spawn("vk-completion", move |target, slice| {
            device_lost.check()?;
            let semaphores = [timeline];
            let values = [target];
            let wait_info = vk::SemaphoreWaitInfo::builder()
                .semaphores(&semaphores)
                .values(&values);
            match unsafe { device.device().wait_semaphores(&wait_info, timeout_nanos(Some(slice))) } {
                Ok(()) | Err(vk::Result::TIMEOUT) => {}
                Err(e) => {
                    device_lost.observe(e);
                    return Err(map_vk_error(e, GraphicsError::Wait));
                }
            }
            unsafe { device.device().get_semaphore_counter_value(timeline) }.map_err(|e| {
                device_lost.observe(e);
                map_vk_error(e, GraphicsError::Wait)
            })
        })
    }

    fn begin(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.device().begin_command_buffer(command_buffer, &begin_info) }
            .map_err(|e| map_vk_error(e, GraphicsError::ContextReset))
    }
}

impl Drop for VulkanQueueBackend {
    fn drop(&mut self) {
        // 完成线程可能正在等待信号量，先停下它
        drop(self.completion.lock().take());
        unsafe { self.device.device().destroy_semaphore(self.timeline, None) };
    }
}

fn map_vk_error(result: vk::Result, wrap: fn(String) -> GraphicsError) -> DistQueueError {
    match result {
        vk::Result::ERROR_DEVICE_LOST => GraphicsError::DeviceLost(result.to_string()).into(),
        other => wrap(other.to_string()).into(),
    }
}

fn timeout_nanos(timeout: Option<Duration>) -> u64 {
    timeout.map_or(u64::MAX, |t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX))
}

impl QueueBackend for VulkanQueueBackend {
    type Context = VulkanCommandContext;

    fn name(&self) -> &str {
        "Vulkan"
    }

    fn allocate_context(&self, kind: CommandListType) -> Result<Self::Context> {
        self.device_lost.check()?;
        let device = self.device.device();

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(self.device.queue_family_index())
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(|e| map_vk_error(e, GraphicsError::ContextAllocation))?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = match unsafe { device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(map_vk_error(e, GraphicsError::ContextAllocation));
            }
        };

        let context = VulkanCommandContext {
            device: Arc::clone(&self.device),
            pool,
            command_buffer,
            kind,
        };
        self.begin(context.command_buffer)?;
        Ok(context)
    }

    fn reset_context(&self, context: &mut Self::Context) -> Result<()> {
        self.device_lost.check()?;
        unsafe {
            self.device
                .device()
                .reset_command_pool(context.pool, vk::CommandPoolResetFlags::empty())
        }
        .map_err(|e| map_vk_error(e, GraphicsError::ContextReset))?;
        self.begin(context.command_buffer)
    }

    fn close_context(&self, context: &mut Self::Context) -> Result<()> {
        unsafe { self.device.device().end_command_buffer(context.command_buffer) }
            .map_err(|e| map_vk_error(e, GraphicsError::Submission))
    }

    fn execute(&self, context: &mut Self::Context) -> Result<()> {
        self.device_lost.check()?;
        let command_buffers = [context.command_buffer];
        let submit = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        let _guard = self.submit_lock.lock();
        unsafe {
            self.device
                .device()
                .queue_submit(self.device.queue(), &[submit.build()], vk::Fence::null())
        }
        .map_err(|e| map_vk_error(e, GraphicsError::Submission))
    }

    fn signal(&self, value: u64) -> Result<()> {
        self.device_lost.check()?;
        let semaphores = [self.timeline];
        let values = [value];
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&values);
        let submit = vk::SubmitInfo::builder()
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline_info);

        let _guard = self.submit_lock.lock();
        unsafe {
            self.device
                .device()
                .queue_submit(self.device.queue(), &[submit.build()], vk::Fence::null())
        }
        .map_err(|e| map_vk_error(e, GraphicsError::Signal))
    }

    fn completed_value(&self) -> u64 {
        counter_or_zero(
            unsafe { self.device.device().get_semaphore_counter_value(self.timeline) },
            &self.device_lost,
        )
    }

    fn wait_for_value(&self, value: u64, timeout: Option<Duration>) -> Result<bool> {
        self.device_lost.check()?;
        let semaphores = [self.timeline];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);

        match unsafe { self.device.device().wait_semaphores(&wait_info, timeout_nanos(timeout)) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => {
                self.device_lost.observe(e);
                Err(map_vk_error(e, GraphicsError::Wait))
            }
        }
    }

    fn notify_on_completion(&self, value: u64, waker: Waker) -> Result<()> {
        let completed = self.completed_value();
        self.device_lost.check()?;
        if completed >= value {
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
    fn test_timeout_nanos() {
        assert_eq!(timeout_nanos(None), u64::MAX);
        assert_eq!(timeout_nanos(Some(Duration::from_millis(2))), 2_000_000);
        assert_eq!(timeout_nanos(Some(Duration::MAX)), u64::MAX);
    }

    #[test]
    fn test_device_lost_mapping() {
        let err = map_vk_error(vk::Result::ERROR_DEVICE_LOST, GraphicsError::Submission);
        assert!(matches!(err, DistQueueError::Graphics(GraphicsError::DeviceLost(_))));

        let err = map_vk_error(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY, GraphicsError::Signal);
        assert!(matches!(err, DistQueueError::Graphics(GraphicsError::Signal(_))));
    }

    #[test]
    fn test_counter_failure_latches_device_loss() {
        let latch = DeviceLostLatch::default();
        assert_eq!(counter_or_zero(Ok(7), &latch), 7);
        assert!(latch.check().is_ok());

        assert_eq!(counter_or_zero(Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY), &latch), 0);
        assert!(latch.check().is_ok());

        assert_eq!(counter_or_zero(Err(vk::Result::ERROR_DEVICE_LOST), &latch), 0);
        let err = latch.check().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, DistQueueError::Graphics(GraphicsError::DeviceLost(_))));
    }
}
