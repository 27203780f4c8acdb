//! 帧循环
//!
//! 每帧的固定流程：
//!
//! 1. 取得当前后台缓冲区槽位
//! 2. 等待该槽位上一次使用时记录的 Fence 值，之后才能改写它的帧资源
//! 3. 获取录制上下文，交给渲染器录制
//! 4. 提交，把返回的 Fence 值记录到槽位
//! 5. 呈现
//!
//! 双缓冲/三缓冲纪律由 [`FrameOrchestrator`] 负责，[`CommandQueue`] 只提供原语。

use std::time::{Duration, Instant};

use crate::core::config::TimeoutPolicy;
use crate::core::error::{ConfigError, Result};
use crate::renderer::backend_trait::QueueBackend;
use crate::renderer::command::RecordingContext;
use crate::renderer::queue::CommandQueue;
use crate::renderer::sync::FenceValue;

/// 帧更新参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateArgs {
    /// 距上一帧的时间
    pub elapsed: Duration,
    /// 自加载以来的总时间
    pub total: Duration,
}

/// 窗口尺寸变化参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeArgs {
    pub width: u32,
    pub height: u32,
}

/// 渲染器在录制时看到的帧信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// 帧序号，从 0 开始，只在成功渲染后递增
    pub frame_number: u64,
    /// 本帧使用的后台缓冲区槽位
    pub slot: usize,
    pub width: u32,
    pub height: u32,
}

/// 单个后台缓冲区槽位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    /// 槽位索引
    pub index: usize,
    /// 最近一次使用该槽位的提交返回的 Fence 值
    pub fence: FenceValue,
    /// 最近一次使用该槽位的帧序号
    pub frame_number: Option<u64>,
}

/// 后台缓冲区槽位表
///
/// 保存"槽位 N 最近一次关联的 Fence 值"。初始值为 0，总是已到达。
#[derive(Debug, Clone)]
pub struct FrameSlots {
    slots: Vec<FrameSlot>,
}

impl FrameSlots {
    /// 创建 `count` 个槽位（至少 2 个）
    pub fn new(count: usize) -> Result<Self> {
        if count < 2 {
            return Err(ConfigError::InvalidValue {
                field: "frame.buffer_count".to_string(),
                reason: format!("at least 2 back buffers required, got {count}"),
            }
            .into());
        }

        let slots = (0..count)
            .map(|index| FrameSlot { index, fence: FenceValue::ZERO, frame_number: None })
            .collect();
        Ok(Self { slots })
    }

    /// 槽位数量
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 根据索引获取槽位
    pub fn get(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    /// 槽位上一次使用时记录的 Fence 值，越界的索引视为从未使用
    pub fn fence_for(&self, index: usize) -> FenceValue {
        self.slots.get(index).map_or(FenceValue::ZERO, |slot| slot.fence)
    }

    /// 记录槽位的新 Fence 值
    pub fn record(&mut self, index: usize, fence: FenceValue, frame_number: u64) {
        if let Some(slot) = self.slots.get_mut(index) {
            debug_assert!(fence >= slot.fence);
            slot.fence = fence;
            slot.frame_number = Some(frame_number);
        }
    }

    /// 尚未被 `completed` 覆盖的槽位数
    pub fn in_flight(&self, completed: FenceValue) -> usize {
        self.slots
            .iter()
            .filter(|slot| !slot.fence.is_reached_by(completed.get()))
            .count()
    }

    /// 所有槽位中最大的 Fence 值
    pub fn latest_fence(&self) -> FenceValue {
        self.slots.iter().map(|slot| slot.fence).max().unwrap_or(FenceValue::ZERO)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameSlot> {
        self.slots.iter()
    }
}

/// 呈现目标
///
/// 提供每帧的后台缓冲区索引，并在录制提交后呈现。
pub trait Presenter {
    /// 后台缓冲区数量
    fn buffer_count(&self) -> usize;

    /// 当前帧应使用的后台缓冲区
    fn current_back_buffer(&self) -> usize;

    /// 呈现并切换到下一个后台缓冲区
    fn present(&mut self) -> Result<()>;

    /// 调整后台缓冲区尺寸，调用前 GPU 必须已经空闲
    fn resize(&mut self, width: u32, height: u32) -> Result<()>;

    /// 当前尺寸
    fn size(&self) -> (u32, u32);
}

/// 无窗口呈现：轮转后台缓冲区索引
#[derive(Debug, Clone)]
pub struct HeadlessPresenter {
    buffer_count: usize,
    current: usize,
    width: u32,
    height: u32,
    presented: u64,
}

impl HeadlessPresenter {
    pub fn new(buffer_count: usize, width: u32, height: u32) -> Self {
        Self {
            buffer_count: buffer_count.max(1),
            current: 0,
            width,
            height,
            presented: 0,
        }
    }

    /// 已呈现的帧数
    pub fn presented(&self) -> u64 {
        self.presented
    }
}

impl Presenter for HeadlessPresenter {
    fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    fn current_back_buffer(&self) -> usize {
        self.current
    }

    fn present(&mut self) -> Result<()> {
        self.presented += 1;
        self.current = (self.current + 1) % self.buffer_count;
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.width = width;
        self.height = height;
        self.current = 0;
        Ok(())
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// 外部渲染代码
///
/// 负责往录制上下文里填充命令。
pub trait FrameRenderer<B: QueueBackend> {
    /// 加载资源，可以借用队列提交上传工作
    fn load_resources(&mut self, _queue: &CommandQueue<B>) -> Result<()> {
        Ok(())
    }

    /// 每帧更新
    fn update(&mut self, _args: &UpdateArgs) {}

    /// 录制本帧命令
    fn render(&mut self, context: &mut RecordingContext<B::Context>, frame: &FrameInfo) -> Result<()>;

    /// 尺寸变化，调用时 GPU 已空闲
    fn resize(&mut self, _args: &ResizeArgs) -> Result<()> {
        Ok(())
    }

    /// 释放资源，调用时 GPU 已空闲
    fn unload_resources(&mut self) {}
}

/// 单帧结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// 已渲染并呈现
    Rendered { slot: usize, fence: FenceValue },
    /// 槽位的 Fence 等待超时，本帧被跳过
    Skipped { slot: usize, pending: FenceValue },
}

/// 帧统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub rendered: u64,
    pub skipped: u64,
}

/// 帧编排器
///
/// 显式持有队列、渲染器和呈现目标。销毁前会等待 GPU 空闲并卸载渲染器资源。
pub struct FrameOrchestrator<B, R, P>
where
    B: QueueBackend,
    R: FrameRenderer<B>,
    P: Presenter,
{
    queue: CommandQueue<B>,
    renderer: R,
    presenter: P,
    slots: FrameSlots,
    policy: TimeoutPolicy,
    slot_timeout: Option<Duration>,
    frame_number: u64,
    stats: FrameStats,
    started: Option<Instant>,
    last_frame: Option<Instant>,
    shut_down: bool,
}

impl<B, R, P> FrameOrchestrator<B, R, P>
where
    B: QueueBackend,
    R: FrameRenderer<B>,
    P: Presenter,
{
    /// 创建编排器，槽位数与呈现目标的后台缓冲区数一致
    ///
    /// `slot_timeout` 为等待槽位 Fence 的超时，`None` 表示无限等待。
    pub fn new(
        queue: CommandQueue<B>,
        renderer: R,
        presenter: P,
        policy: TimeoutPolicy,
        slot_timeout: Option<Duration>,
    ) -> Result<Self> {
        let slots = FrameSlots::new(presenter.buffer_count())?;
        Ok(Self {
            queue,
            renderer,
            presenter,
            slots,
            policy,
            slot_timeout,
            frame_number: 0,
            stats: FrameStats::default(),
            started: None,
            last_frame: None,
            shut_down: false,
        })
    }

    /// 加载渲染器资源
    pub fn load(&mut self) -> Result<()> {
        self.renderer.load_resources(&self.queue)?;
        let now = Instant::now();
        self.started = Some(now);
        self.last_frame = Some(now);
        crate::frame_info!(
            backend = self.queue.backend().name(),
            buffers = self.slots.len(),
            policy = ?self.policy,
            "Frame orchestrator loaded"
        );
        Ok(())
    }

    /// 运行一帧
    ///
    /// 槽位 Fence 等待超时按 [`TimeoutPolicy`] 处理：`Skip` 返回
    /// [`FrameOutcome::Skipped`]，`Fail` 返回超时错误。其他错误直接传播。
    pub fn run_frame(&mut self) -> Result<FrameOutcome> {
        let slot = self.presenter.current_back_buffer();
        let pending = self.slots.fence_for(slot);

        if let Err(e) = self.queue.wait_until_reached(pending, self.slot_timeout) {
            if e.is_timeout() && self.policy == TimeoutPolicy::Skip {
                self.stats.skipped += 1;
                crate::frame_warn!(slot, fence = %pending, frame = self.frame_number, "Frame slot still in flight, skipping frame");
                return Ok(FrameOutcome::Skipped { slot, pending });
            }
            return Err(e);
        }

        let now = Instant::now();
        let started = *self.started.get_or_insert(now);
        let last = self.last_frame.replace(now).unwrap_or(now);
        self.renderer.update(&UpdateArgs {
            elapsed: now.duration_since(last),
            total: now.duration_since(started),
        });

        let (width, height) = self.presenter.size();
        let info = FrameInfo { frame_number: self.frame_number, slot, width, height };

        let mut context = self.queue.acquire_recording_context()?;
        self.renderer.render(&mut context, &info)?;
        let fence = self.queue.submit(context)?;

        self.slots.record(slot, fence, self.frame_number);
        self.presenter.present()?;

        self.frame_number += 1;
        self.stats.rendered += 1;
        Ok(FrameOutcome::Rendered { slot, fence })
    }

    /// 调整尺寸：先等待 GPU 空闲，再调整呈现目标和渲染器
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.queue.wait_idle()?;
        self.presenter.resize(width, height)?;
        self.renderer.resize(&ResizeArgs { width, height })?;
        crate::frame_info!(width, height, "Resized");
        Ok(())
    }

    /// 等待 GPU 空闲并卸载渲染器资源，可重复调用
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.queue.wait_idle()?;
        self.renderer.unload_resources();
        self.shut_down = true;
        crate::frame_info!(
            rendered = self.stats.rendered,
            skipped = self.stats.skipped,
            "Frame orchestrator shut down"
        );
        Ok(())
    }

    pub fn queue(&self) -> &CommandQueue<B> {
        &self.queue
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }

    pub fn slots(&self) -> &FrameSlots {
        &self.slots
    }

    /// 下一帧的帧序号
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }
}

impl<B, R, P> Drop for FrameOrchestrator<B, R, P>
where
    B: QueueBackend,
    R: FrameRenderer<B>,
    P: Presenter,
{
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "Failed to shut down frame orchestrator");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::DistQueueError;
    use crate::gfx::simulated::{SimulatedBackend, SimulatedCommandList};
    use crate::renderer::command::CommandListType;

    #[derive(Default)]
    struct RecordingRenderer {
        loaded: bool,
        unloaded: bool,
        updates: u64,
        frames: Vec<FrameInfo>,
        resizes: Vec<ResizeArgs>,
    }

    impl FrameRenderer<SimulatedBackend> for RecordingRenderer {
        fn load_resources(&mut self, _queue: &CommandQueue<SimulatedBackend>) -> Result<()> {
            self.loaded = true;
            Ok(())
        }

        fn update(&mut self, _args: &UpdateArgs) {
            self.updates += 1;
        }

        fn render(&mut self, context: &mut RecordingContext<SimulatedCommandList>, frame: &FrameInfo) -> Result<()> {
            context.commands_mut().record(format!("draw frame {}", frame.frame_number));
            self.frames.push(*frame);
            Ok(())
        }

        fn resize(&mut self, args: &ResizeArgs) -> Result<()> {
            self.resizes.push(*args);
            Ok(())
        }

        fn unload_resources(&mut self) {
            self.unloaded = true;
        }
    }

    type TestOrchestrator = FrameOrchestrator<SimulatedBackend, RecordingRenderer, HeadlessPresenter>;

    fn orchestrator(policy: TimeoutPolicy, buffers: usize) -> (SimulatedBackend, TestOrchestrator) {
        let gpu = SimulatedBackend::new();
        let queue = CommandQueue::new(gpu.clone(), CommandListType::Direct);
        let mut orchestrator = FrameOrchestrator::new(
            queue,
            RecordingRenderer::default(),
            HeadlessPresenter::new(buffers, 640, 480),
            policy,
            Some(Duration::from_millis(5)),
        )
        .unwrap();
        orchestrator.load().unwrap();
        (gpu, orchestrator)
    }

    #[test]
    fn test_frame_slots_require_two_buffers() {
        assert!(FrameSlots::new(1).is_err());
        let slots = FrameSlots::new(2).unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots.fence_for(0), FenceValue::ZERO);
        assert_eq!(slots.fence_for(7), FenceValue::ZERO);
    }

    #[test]
    fn test_frame_slots_record() {
        let mut slots = FrameSlots::new(3).unwrap();
        assert_eq!(slots.len(), 3);
        slots.record(0, FenceValue::new(1), 0);
        slots.record(1, FenceValue::new(2), 1);

        assert_eq!(slots.latest_fence(), FenceValue::new(2));
        assert_eq!(slots.in_flight(FenceValue::new(1)), 1);
        assert_eq!(slots.get(1).and_then(|slot| slot.frame_number), Some(1));
        assert_eq!(slots.get(2).and_then(|slot| slot.frame_number), None);
    }

    #[test]
    fn test_headless_presenter_rotates() {
        let mut presenter = HeadlessPresenter::new(3, 1, 1);
        let order: Vec<usize> = (0..5)
            .map(|_| {
                let index = presenter.current_back_buffer();
                presenter.present().unwrap();
                index
            })
            .collect();
        assert_eq!(order, vec![0, 1, 2, 0, 1]);
        assert_eq!(presenter.presented(), 5);
    }

    #[test]
    fn test_frames_fill_every_slot_before_waiting() {
        let (gpu, mut orchestrator) = orchestrator(TimeoutPolicy::Fail, 3);

        for expected in 1..=3u64 {
            match orchestrator.run_frame().unwrap() {
                FrameOutcome::Rendered { slot, fence } => {
                    assert_eq!(slot as u64, expected - 1);
                    assert_eq!(fence, FenceValue::new(expected));
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(orchestrator.slots().in_flight(orchestrator.queue().completed_value()), 3);

        // 槽位 0 上的第 1 帧完成后才能开始第 4 帧
        gpu.complete_through(1);
        let outcome = orchestrator.run_frame().unwrap();
        assert_eq!(outcome, FrameOutcome::Rendered { slot: 0, fence: FenceValue::new(4) });

        gpu.complete_all();
        assert_eq!(gpu.premature_reuses(), 0);
    }

    #[test]
    fn test_skip_policy_skips_busy_slot() {
        let (gpu, mut orchestrator) = orchestrator(TimeoutPolicy::Skip, 2);
        orchestrator.run_frame().unwrap();
        orchestrator.run_frame().unwrap();

        let outcome = orchestrator.run_frame().unwrap();
        assert_eq!(outcome, FrameOutcome::Skipped { slot: 0, pending: FenceValue::new(1) });
        assert_eq!(orchestrator.stats(), FrameStats { rendered: 2, skipped: 1 });
        assert_eq!(orchestrator.frame_number(), 2);

        gpu.complete_all();
        assert!(matches!(orchestrator.run_frame().unwrap(), FrameOutcome::Rendered { slot: 0, .. }));
        gpu.complete_all();
    }

    #[test]
    fn test_fail_policy_returns_timeout() {
        let (gpu, mut orchestrator) = orchestrator(TimeoutPolicy::Fail, 2);
        orchestrator.run_frame().unwrap();
        orchestrator.run_frame().unwrap();

        let err = orchestrator.run_frame().unwrap_err();
        assert!(matches!(err, DistQueueError::Timeout { value: 1, completed: 0, .. }));
        gpu.complete_all();
    }

    #[test]
    fn test_resize_waits_for_idle() {
        let gpu = SimulatedBackend::with_latency(Duration::from_millis(1));
        let queue = CommandQueue::new(gpu.clone(), CommandListType::Direct);
        let mut orchestrator = FrameOrchestrator::new(
            queue,
            RecordingRenderer::default(),
            HeadlessPresenter::new(2, 640, 480),
            TimeoutPolicy::Fail,
            None,
        )
        .unwrap();
        orchestrator.load().unwrap();

        orchestrator.run_frame().unwrap();
        orchestrator.run_frame().unwrap();
        orchestrator.resize(1280, 720).unwrap();

        let last = orchestrator.queue().last_signaled();
        assert!(orchestrator.queue().is_reached(last));
        assert_eq!(orchestrator.presenter().size(), (1280, 720));
        assert_eq!(orchestrator.renderer().resizes, vec![ResizeArgs { width: 1280, height: 720 }]);

        orchestrator.run_frame().unwrap();
        assert_eq!(orchestrator.renderer().frames.last().map(|f| (f.width, f.height)), Some((1280, 720)));
    }

    #[test]
    fn test_shutdown_unloads_once() {
        let (gpu, mut orchestrator) = orchestrator(TimeoutPolicy::Fail, 2);
        orchestrator.run_frame().unwrap();
        gpu.complete_all();

        orchestrator.shutdown().unwrap();
        orchestrator.shutdown().unwrap();
        assert!(orchestrator.renderer().loaded);
        assert!(orchestrator.renderer().unloaded);
        assert_eq!(orchestrator.renderer().updates, 1);
    }
}
