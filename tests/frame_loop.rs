//! 帧循环端到端测试：模拟后端 + 帧编排器

use std::time::Duration;

use dist_queue::core::config::TimeoutPolicy;
use dist_queue::core::{Config, DistQueueError, Result};
use dist_queue::gfx::simulated::SimulatedCommandList;
use dist_queue::gfx::SimulatedBackend;
use dist_queue::renderer::{
    CommandListType, CommandQueue, FenceValue, FrameInfo, FrameOrchestrator, FrameOutcome, FrameRenderer,
    HeadlessPresenter, RecordingContext,
};

struct Clear;

impl FrameRenderer<SimulatedBackend> for Clear {
    fn render(&mut self, context: &mut RecordingContext<SimulatedCommandList>, frame: &FrameInfo) -> Result<()> {
        context.commands_mut().record(format!("clear {}", frame.frame_number));
        Ok(())
    }
}

/// 渲染失败的帧
struct FailsOnFrame(u64);

impl FrameRenderer<SimulatedBackend> for FailsOnFrame {
    fn render(&mut self, _context: &mut RecordingContext<SimulatedCommandList>, frame: &FrameInfo) -> Result<()> {
        if frame.frame_number == self.0 {
            return Err(DistQueueError::ContractViolation("renderer rejected the frame".to_string()));
        }
        Ok(())
    }
}

#[test]
fn triple_buffered_loop_never_reuses_early() {
    let gpu = SimulatedBackend::with_latency(Duration::from_micros(200));
    let queue = CommandQueue::new(gpu.clone(), CommandListType::Direct);
    let mut orchestrator = FrameOrchestrator::new(
        queue,
        Clear,
        HeadlessPresenter::new(3, 320, 240),
        TimeoutPolicy::Fail,
        None,
    )
    .unwrap();
    orchestrator.load().unwrap();

    let mut fences = Vec::new();
    for _ in 0..60 {
        match orchestrator.run_frame().unwrap() {
            FrameOutcome::Rendered { fence, .. } => fences.push(fence),
            FrameOutcome::Skipped { .. } => panic!("infinite waits never skip"),
        }
    }
    orchestrator.shutdown().unwrap();

    assert!(fences.windows(2).all(|pair| pair[1] == pair[0].increment()));
    assert_eq!(gpu.premature_reuses(), 0);

    // 同时在途的帧不超过槽位数，上下文数量也不会超过它
    let stats = orchestrator.queue().stats();
    assert!(stats.allocated <= 3, "allocated {} contexts", stats.allocated);
    assert_eq!(stats.submitted, 60);
    assert_eq!(stats.allocated + stats.reused, 60);

    let batches = gpu.executed_batches();
    assert_eq!(batches.len(), 60);
    assert_eq!(batches[59].commands, vec!["clear 59".to_string()]);
}

#[test]
fn skipped_frames_are_retried_on_the_same_slot() {
    let gpu = SimulatedBackend::new();
    let queue = CommandQueue::new(gpu.clone(), CommandListType::Direct);
    let mut orchestrator = FrameOrchestrator::new(
        queue,
        Clear,
        HeadlessPresenter::new(2, 320, 240),
        TimeoutPolicy::Skip,
        Some(Duration::from_millis(1)),
    )
    .unwrap();
    orchestrator.load().unwrap();

    orchestrator.run_frame().unwrap();
    orchestrator.run_frame().unwrap();
    for _ in 0..3 {
        assert_eq!(
            orchestrator.run_frame().unwrap(),
            FrameOutcome::Skipped { slot: 0, pending: FenceValue::new(1) }
        );
    }

    gpu.complete_through(1);
    assert_eq!(
        orchestrator.run_frame().unwrap(),
        FrameOutcome::Rendered { slot: 0, fence: FenceValue::new(3) }
    );
    assert_eq!(orchestrator.stats().skipped, 3);
    assert_eq!(orchestrator.frame_number(), 3);

    gpu.complete_all();
    orchestrator.shutdown().unwrap();
    assert_eq!(gpu.premature_reuses(), 0);
}

#[test]
fn renderer_errors_propagate() {
    let gpu = SimulatedBackend::with_latency(Duration::from_micros(100));
    let queue = CommandQueue::new(gpu.clone(), CommandListType::Direct);
    let mut orchestrator = FrameOrchestrator::new(
        queue,
        FailsOnFrame(2),
        HeadlessPresenter::new(2, 320, 240),
        TimeoutPolicy::Fail,
        None,
    )
    .unwrap();
    orchestrator.load().unwrap();

    orchestrator.run_frame().unwrap();
    orchestrator.run_frame().unwrap();
    let err = orchestrator.run_frame().unwrap_err();
    assert!(err.is_contract_violation());
    assert_eq!(orchestrator.frame_number(), 2);
}

#[test]
fn device_loss_is_fatal_for_the_frame() {
    let gpu = SimulatedBackend::new();
    let queue = CommandQueue::new(gpu.clone(), CommandListType::Direct);
    let mut orchestrator = FrameOrchestrator::new(
        queue,
        Clear,
        HeadlessPresenter::new(2, 320, 240),
        TimeoutPolicy::Skip,
        Some(Duration::from_millis(1)),
    )
    .unwrap();
    orchestrator.load().unwrap();

    orchestrator.run_frame().unwrap();
    gpu.complete_all();
    gpu.lose_device();

    let err = orchestrator.run_frame().unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn copy_queue_upload_gates_direct_queue() {
    let gpu = SimulatedBackend::with_latency(Duration::from_micros(100));
    let copy = CommandQueue::new(gpu.clone(), CommandListType::Copy);

    let mut upload = copy.acquire_recording_context().unwrap();
    upload.commands_mut().record("copy vertex buffer");
    let uploaded = copy.submit(upload).unwrap();

    let direct_gpu = SimulatedBackend::with_latency(Duration::from_micros(100));
    let direct = CommandQueue::new(direct_gpu.clone(), CommandListType::Direct);

    copy.wait_until_reached(uploaded, None).unwrap();
    assert!(copy.is_reached(uploaded));

    let mut draw = direct.acquire_recording_context().unwrap();
    assert_eq!(draw.kind(), CommandListType::Direct);
    draw.commands_mut().record("draw uploaded mesh");
    let drawn = direct.submit(draw).unwrap();
    direct.flush().unwrap();

    assert!(direct.is_reached(drawn));
    assert_ne!(copy.id(), direct.id());
}

#[test]
fn config_drives_orchestrator() {
    let mut config = Config::from_toml_str(
        r#"
        [queue]
        kind = "direct"
        wait_timeout_ms = 0

        [frame]
        buffer_count = 2
        frame_count = 8
        timeout_policy = "fail"
        "#,
    )
    .unwrap();
    config.apply_args(["dist_queue", "--buffers", "3"]);
    config.validate().unwrap();

    let gpu = SimulatedBackend::with_latency(Duration::from_micros(100));
    let queue = CommandQueue::new(gpu.clone(), config.queue.kind);
    let mut orchestrator = FrameOrchestrator::new(
        queue,
        Clear,
        HeadlessPresenter::new(config.frame.buffer_count, 320, 240),
        config.frame.timeout_policy,
        config.wait_timeout(),
    )
    .unwrap();
    orchestrator.load().unwrap();

    for _ in 0..config.frame.frame_count {
        orchestrator.run_frame().unwrap();
    }
    assert_eq!(orchestrator.slots().len(), 3);
    assert_eq!(orchestrator.queue().last_signaled(), FenceValue::new(8));
}
