//! DistQueue - 命令队列同步演示
//!
//! 在无头模式下驱动一个旋转立方体的"渲染器"，跑完固定帧数后输出队列统计。
//! 可以通过配置文件或命令行参数选择后端。
//!
//! # 使用方法
//!
//! ```bash
//! # 使用配置文件（默认模拟后端）
//! cargo run
//!
//! # 使用 Vulkan，渲染 600 帧
//! cargo run -- --vulkan --frames 600
//!
//! # 使用 DirectX 12 的 WARP 适配器
//! cargo run -- --dx12 --warp
//! ```
//!
//! # 每帧流程
//!
//! ```text
//! 后台缓冲区槽位 ──► 等待槽位 Fence ──► 获取录制上下文
//!        ▲                                     │
//!        │                                     ▼
//!      呈现 ◄──── 记录 Fence 值 ◄──── 录制 + 提交
//! ```

use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use dist_queue::core::config::BackendKind;
use dist_queue::core::{log, Config};
use dist_queue::gfx::simulated::SimulatedCommandList;
use dist_queue::gfx::vulkan::{VulkanCommandContext, VulkanDevice, VulkanQueueBackend};
use dist_queue::gfx::SimulatedBackend;
use dist_queue::renderer::{
    CommandQueue, FrameInfo, FrameOrchestrator, FrameOutcome, FrameRenderer, HeadlessPresenter, QueueBackend,
    RecordingContext, ResizeArgs, UpdateArgs,
};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

/// 演示渲染器往各后端上下文录制命令的方式
trait DemoCommands {
    fn draw_box(&mut self, frame: &FrameInfo, angle: f32);
}

impl DemoCommands for SimulatedCommandList {
    fn draw_box(&mut self, frame: &FrameInfo, angle: f32) {
        self.record(format!("clear back buffer {}", frame.slot));
        self.record(format!("draw box angle={angle:.3} viewport={}x{}", frame.width, frame.height));
    }
}

// 无头模式没有渲染目标，只提交空命令缓冲区
impl DemoCommands for VulkanCommandContext {
    fn draw_box(&mut self, _frame: &FrameInfo, _angle: f32) {}
}

#[cfg(target_os = "windows")]
impl DemoCommands for dist_queue::gfx::dx12::Dx12CommandContext {
    fn draw_box(&mut self, _frame: &FrameInfo, _angle: f32) {}
}

/// 旋转立方体
struct SpinningBox {
    /// 弧度
    angle: f32,
    /// 弧度/秒
    speed: f32,
    aspect: f32,
}

impl SpinningBox {
    fn new() -> Self {
        Self {
            angle: 0.0,
            speed: TAU / 4.0,
            aspect: WIDTH as f32 / HEIGHT as f32,
        }
    }
}

impl<B> FrameRenderer<B> for SpinningBox
where
    B: QueueBackend,
    B::Context: DemoCommands,
{
    fn load_resources(&mut self, queue: &CommandQueue<B>) -> dist_queue::core::Result<()> {
        debug!(backend = queue.backend().name(), "Loading spinning box resources");
        Ok(())
    }

    fn update(&mut self, args: &UpdateArgs) {
        self.angle = (self.angle + self.speed * args.elapsed.as_secs_f32()) % TAU;
    }

    fn render(&mut self, context: &mut RecordingContext<B::Context>, frame: &FrameInfo) -> dist_queue::core::Result<()> {
        context.commands_mut().draw_box(frame, self.angle);
        Ok(())
    }

    fn resize(&mut self, args: &ResizeArgs) -> dist_queue::core::Result<()> {
        self.aspect = args.width as f32 / args.height.max(1) as f32;
        debug!(aspect = self.aspect, "Projection updated");
        Ok(())
    }
}

/// 应用程序入口点
///
/// # 初始化流程
///
/// 1. 加载配置文件（config.toml）
/// 2. 应用命令行参数覆盖
/// 3. 验证配置
/// 4. 初始化日志系统
/// 5. 创建后端并运行帧循环
fn main() -> Result<()> {
    let mut config = Config::from_file_or_default("config.toml");
    config.apply_args(std::env::args());
    config.validate().context("invalid configuration")?;

    let log_file = if config.logging.file_output {
        Some(config.logging.log_file.as_str())
    } else {
        None
    };
    log::init_logger(config.logging.level, config.logging.file_output, log_file)
        .context("failed to initialize logging")?;

    info!(version = env!("CARGO_PKG_VERSION"), "DistQueue starting...");
    info!(
        backend = config.backend.kind.name(),
        kind = %config.queue.kind,
        buffers = config.frame.buffer_count,
        frames = config.frame.frame_count,
        timeout = ?config.wait_timeout(),
        policy = ?config.frame.timeout_policy,
        "Configuration"
    );

    match config.backend.kind {
        BackendKind::Simulated => {
            let gpu = SimulatedBackend::with_latency(Duration::from_millis(config.backend.gpu_latency_ms));
            run(gpu, &config)
        }
        BackendKind::Vulkan => {
            let device = Arc::new(VulkanDevice::new(config.queue.kind).context("failed to create Vulkan device")?);
            let backend = VulkanQueueBackend::new(device)?;
            run(backend, &config)
        }
        BackendKind::Dx12 => run_dx12(&config),
    }
}

#[cfg(target_os = "windows")]
fn run_dx12(config: &Config) -> Result<()> {
    use dist_queue::gfx::dx12::{create_device, Dx12QueueBackend};

    let device = create_device(config.backend.use_warp).context("failed to create D3D12 device")?;
    let backend = Dx12QueueBackend::new(&device, config.queue.kind)?;
    run(backend, config)
}

#[cfg(not(target_os = "windows"))]
fn run_dx12(_config: &Config) -> Result<()> {
    anyhow::bail!("DirectX 12 backend is only available on Windows")
}

fn run<B>(backend: B, config: &Config) -> Result<()>
where
    B: QueueBackend,
    B::Context: DemoCommands,
{
    let queue = CommandQueue::new(backend, config.queue.kind);
    let presenter = HeadlessPresenter::new(config.frame.buffer_count, WIDTH, HEIGHT);
    let mut orchestrator = FrameOrchestrator::new(
        queue,
        SpinningBox::new(),
        presenter,
        config.frame.timeout_policy,
        config.wait_timeout(),
    )?;
    orchestrator.load()?;

    let frame_count = config.frame.frame_count;
    for frame in 0..frame_count {
        if frame == frame_count / 2 {
            orchestrator.resize(WIDTH * 3 / 2, HEIGHT * 3 / 2)?;
        }

        match orchestrator.run_frame()? {
            FrameOutcome::Rendered { slot, fence } => debug!(frame, slot, %fence, "Frame rendered"),
            FrameOutcome::Skipped { slot, pending } => debug!(frame, slot, %pending, "Frame skipped"),
        }
    }

    let queue = orchestrator.queue();
    let last = queue.last_signaled();
    pollster::block_on(queue.wait_until_reached_async(last)).context("failed to wait for the last frame")?;

    let stats = queue.stats();
    let frames = orchestrator.stats();
    info!(
        rendered = frames.rendered,
        skipped = frames.skipped,
        allocated = stats.allocated,
        reused = stats.reused,
        submitted = stats.submitted,
        in_flight = stats.in_flight,
        free = stats.free,
        completed = %queue.completed_value(),
        "Queue statistics"
    );

    orchestrator.shutdown()?;
    info!("DistQueue finished");
    Ok(())
}
