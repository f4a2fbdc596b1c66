// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Single-node pipeline stage.

use super::{PipeConfig, PipeId, PipeState, PipeStage, RunningTable};
use crate::buffer::{Buffer, Position};
use crate::frame::{BufferPolicy, EntityState, Frame};
use crate::manager::BufferPool;
use crate::meta::{compute_node_group, NodeGroup, PipelineParams, ShotMeta};
use crate::node::{VideoNode, CTRL_FORCE_DONE};
use crate::queue::{FrameQueue, FrameSender};
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Flags and counters shared between a stage and its worker threads.
pub(crate) struct StageShared {
    /// Graceful drain: the worker idles without consuming input.
    pub(crate) stop: AtomicBool,
    /// Hard exit request for the worker thread.
    pub(crate) exit: AtomicBool,
    /// Buffers submitted to the device and not yet reaped.
    pub(crate) in_flight: AtomicUsize,
    /// The worker hit a fatal invariant violation and quit.
    pub(crate) failed: AtomicBool,
}

impl StageShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(StageShared {
            stop: AtomicBool::new(false),
            exit: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
        })
    }
}

/// Everything a worker needs to run submit/reap cycles; shared verbatim by
/// the dual-node stage's two workers.
pub(crate) struct StageCtx {
    pub(crate) id: PipeId,
    pub(crate) shared: Arc<StageShared>,
    pub(crate) running: Arc<Mutex<RunningTable>>,
    pub(crate) output: Option<FrameSender<Arc<Frame>>>,
    pub(crate) params: Arc<PipelineParams>,
    pub(crate) pool: Option<Arc<dyn BufferPool>>,
    pub(crate) wait: Duration,
}

impl StageCtx {
    pub(crate) fn forward(&self, frame: Arc<Frame>) {
        match &self.output {
            Some(output) => {
                if let Err(e) = output.push(frame) {
                    log::error!("pipe {}: forward failed: {}", self.id, e);
                }
            }
            None => log::debug!("pipe {}: terminal stage, frame retained by owner", self.id),
        }
    }

    /// Completes the entity invalid and forwards the frame so downstream
    /// consumers drop it instead of stalling.
    pub(crate) fn finish_invalid(&self, frame: &Arc<Frame>) {
        if let Err(e) = frame.entity_done(self.id, false) {
            log::error!("pipe {}: cannot invalidate frame {}: {}", self.id, frame.count(), e);
        }
        self.forward(frame.clone());
    }

    /// Resolves the output buffer for a frame, leasing on request.
    ///
    /// Returns `None` after forwarding the frame invalid when no buffer can
    /// be delivered; a started pipe drops such requests rather than
    /// queueing them.
    pub(crate) fn resolve_buffer(&self, frame: &Arc<Frame>) -> Option<Buffer> {
        let entity = match frame.entity(self.id) {
            Some(entity) => entity,
            None => {
                log::warn!(
                    "pipe {}: frame {} carries no entity for this stage",
                    self.id,
                    frame.count()
                );
                self.finish_invalid(frame);
                return None;
            }
        };
        if let Some(buffer) = entity.dst {
            return Some(buffer);
        }
        match entity.policy {
            BufferPolicy::OnRequest => {
                let Some(pool) = &self.pool else {
                    log::warn!("pipe {}: on-request entity without a pool", self.id);
                    self.finish_invalid(frame);
                    return None;
                };
                match pool.get_buffer(None, Position::Device) {
                    Ok(buffer) => {
                        let _ = frame.set_dst_buffer(self.id, buffer.clone());
                        Some(buffer)
                    }
                    Err(e) => {
                        log::warn!(
                            "pipe {}: buffer delivery for frame {} dropped: {}",
                            self.id,
                            frame.count(),
                            e
                        );
                        self.finish_invalid(frame);
                        None
                    }
                }
            }
            BufferPolicy::Bound => {
                log::warn!(
                    "pipe {}: frame {} has no bound buffer",
                    self.id,
                    frame.count()
                );
                self.finish_invalid(frame);
                None
            }
        }
    }

    /// Fast-zoom shortcut: recompute the crop chain when the pipeline
    /// zoom generation moved since this frame was stamped.
    pub(crate) fn refresh_roi(&self, frame: &Arc<Frame>) {
        let (state, generation) = self.params.snapshot();
        if frame.shot().zoom_generation == generation {
            return;
        }
        frame.store_node_group(self.id, compute_node_group(&state));
        frame.update_shot(|shot| {
            shot.zoom_percent = state.zoom_percent;
            shot.zoom_generation = generation;
        });
        log::debug!(
            "pipe {}: recomputed crop chain for frame {} (generation {})",
            self.id,
            frame.count(),
            generation
        );
    }

    /// Stamps shot metadata and the node group into the buffer's metadata
    /// plane. Failure here costs the metadata, not the frame.
    pub(crate) fn stamp(&self, frame: &Arc<Frame>, buffer: &Buffer) {
        if buffer.meta_plane().is_none() {
            return;
        }
        let mut map = match buffer.map_meta_plane() {
            Ok(map) => map,
            Err(e) => {
                log::warn!("pipe {}: metadata plane map failed: {}", self.id, e);
                return;
            }
        };
        if let Err(e) = frame.shot().write_to(&mut map) {
            log::warn!("pipe {}: metadata stamp failed: {}", self.id, e);
            return;
        }
        if let Some(group) = frame.node_group(self.id) {
            let at = ShotMeta::LEN;
            if map.len() >= at + NodeGroup::encoded_len(group.captures.len()) {
                let _ = group.write_to(&mut map[at..]);
            }
        }
    }

    /// Submits one frame to the device. `Err` is fatal to the worker
    /// (invariant violation); device-side trouble is absorbed per frame.
    /// Returns whether the buffer actually reached the device.
    pub(crate) fn submit(
        &self,
        node: &Arc<Mutex<Box<dyn VideoNode>>>,
        frame: Arc<Frame>,
    ) -> Result<bool> {
        let _ = frame.set_entity_state(self.id, EntityState::Queued);
        let Some(buffer) = self.resolve_buffer(&frame) else {
            return Ok(false);
        };

        self.refresh_roi(&frame);
        self.stamp(&frame, &buffer);

        // A colliding slot is a programming bug; never overwrite it.
        lock(&self.running).check_free(buffer.index())?;

        match lock(node).queue_buffer(&buffer) {
            Ok(()) => {
                lock(&self.running).insert(buffer.index(), frame.clone())?;
                let _ = frame.set_entity_state(self.id, EntityState::Processing);
                self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
                Ok(true)
            }
            Err(e) => {
                log::warn!(
                    "pipe {}: submit of frame {} failed: {}",
                    self.id,
                    frame.count(),
                    e
                );
                self.finish_invalid(&frame);
                Ok(false)
            }
        }
    }

    fn read_back(&self, frame: &Arc<Frame>, timestamp_ns: i64) {
        if let Some(buffer) = frame.dst_buffer(self.id) {
            if buffer.meta_plane().is_some() {
                if let Ok(map) = buffer.map_meta_plane() {
                    if let Ok(mut shot) = ShotMeta::read_from(&map) {
                        shot.timestamp_ns = timestamp_ns;
                        frame.set_shot(shot);
                        return;
                    }
                }
            }
        }
        frame.update_shot(|shot| shot.timestamp_ns = timestamp_ns);
    }

    /// Fabricates a not-valid completion for the oldest submission so the
    /// stream keeps moving after a hard device failure.
    fn fabricate_completion(&self) {
        if let Some((index, frame)) = lock(&self.running).take_oldest() {
            self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            log::warn!(
                "pipe {}: fabricated invalid completion for slot {}",
                self.id,
                index
            );
            let _ = frame.entity_done(self.id, false);
            self.forward(frame);
        }
    }

    /// Reaps one completed buffer. The frame is looked up by the slot the
    /// device reports, so out-of-order completion is handled by
    /// construction.
    pub(crate) fn reap(&self, node: &Arc<Mutex<Box<dyn VideoNode>>>) {
        // Probe the device first; a poll failure means the node stalled or
        // fell out of streaming underneath us.
        match lock(node).poll_ready(self.wait) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                log::warn!("pipe {}: device poll failed: {}", self.id, e);
                self.fabricate_completion();
                return;
            }
        }
        let done = lock(node).dequeue_buffer(self.wait);
        match done {
            Ok(done) => {
                let Some(frame) = lock(&self.running).take(done.index) else {
                    log::error!("pipe {}: device completed unknown slot {}", self.id, done.index);
                    return;
                };
                self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                if done.ok {
                    let ns = done.timestamp.seconds() * 1_000_000_000
                        + done.timestamp.subsec(9) as i64;
                    self.read_back(&frame, ns);
                    let _ = frame.entity_done(self.id, true);
                } else {
                    log::warn!(
                        "pipe {}: device flagged frame {} invalid",
                        self.id,
                        frame.count()
                    );
                    let _ = frame.entity_done(self.id, false);
                }
                self.forward(frame);
            }
            Err(Error::Timeout) => {}
            Err(e) => {
                log::warn!("pipe {}: device reap failed: {}", self.id, e);
                self.fabricate_completion();
            }
        }
    }
}

fn run_worker(
    ctx: StageCtx,
    node: Arc<Mutex<Box<dyn VideoNode>>>,
    input: Arc<FrameQueue<Arc<Frame>>>,
) {
    log::debug!("pipe {}: worker running", ctx.id);
    loop {
        if ctx.shared.exit.load(Ordering::Acquire) {
            break;
        }
        if ctx.shared.stop.load(Ordering::Acquire) {
            // Drain mode: leave queued input alone, let in-flight work
            // finish below.
            thread::sleep(Duration::from_millis(5));
        } else {
            match input.pop(ctx.wait) {
                Ok(Some(frame)) => {
                    if let Err(e) = ctx.submit(&node, frame) {
                        log::error!("pipe {}: fatal submit error: {}", ctx.id, e);
                        ctx.shared.failed.store(true, Ordering::Release);
                        break;
                    }
                }
                Ok(None) => {} // woken, re-check flags
                Err(Error::Timeout) => {
                    log::warn!("pipe {}: input wait timed out", ctx.id);
                }
                Err(e) => {
                    log::error!("pipe {}: input queue failed: {}", ctx.id, e);
                    break;
                }
            }
        }
        if ctx.shared.in_flight.load(Ordering::Acquire) > 0 {
            ctx.reap(&node);
        }
    }
    log::debug!("pipe {}: worker exited", ctx.id);
}

/// Pipeline stage over one device node.
pub struct Pipe {
    id: PipeId,
    config: PipeConfig,
    node: Arc<Mutex<Box<dyn VideoNode>>>,
    input: Arc<FrameQueue<Arc<Frame>>>,
    output: Option<FrameSender<Arc<Frame>>>,
    running: Arc<Mutex<RunningTable>>,
    shared: Arc<StageShared>,
    params: Arc<PipelineParams>,
    worker: Option<thread::JoinHandle<()>>,
    state: PipeState,
}

impl Pipe {
    pub fn new(
        id: PipeId,
        node: Box<dyn VideoNode>,
        config: PipeConfig,
        params: Arc<PipelineParams>,
    ) -> Self {
        Pipe {
            id,
            config,
            node: Arc::new(Mutex::new(node)),
            input: Arc::new(FrameQueue::new()),
            output: None,
            running: Arc::new(Mutex::new(RunningTable::new())),
            shared: StageShared::new(),
            params,
            worker: None,
            state: PipeState::Created,
        }
    }

    /// Whether the worker aborted on an invariant violation.
    pub fn failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    fn ensure(&self, expected: PipeState, what: &str) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidOperation(format!(
                "pipe {}: {} in state {:?} (expected {:?})",
                self.id, what, self.state, expected
            )));
        }
        Ok(())
    }

    fn ctx(&self) -> StageCtx {
        StageCtx {
            id: self.id,
            shared: self.shared.clone(),
            running: self.running.clone(),
            output: self.output.clone(),
            params: self.params.clone(),
            pool: self.config.pool.clone(),
            wait: self.config.wait,
        }
    }
}

impl PipeStage for Pipe {
    fn id(&self) -> PipeId {
        self.id
    }

    fn state(&self) -> PipeState {
        self.state
    }

    fn setup(&mut self) -> Result<()> {
        self.ensure(PipeState::Created, "setup")?;
        {
            let mut node = lock(&self.node);
            node.open(self.config.node_id)?;
            node.set_input(self.config.input)?;
            node.set_format(&self.config.format)?;
            node.req_buffers(self.config.buffer_count)?;
        }
        self.state = PipeState::Configured;
        log::info!(
            "pipe {}: configured node {} ({} buffers, {})",
            self.id,
            self.config.node_id,
            self.config.buffer_count,
            self.config.format.size
        );
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        self.ensure(PipeState::Configured, "prepare")?;
        if let Some(pool) = &self.config.pool {
            if pool.available_count() == 0 {
                return Err(Error::InvalidOperation(format!(
                    "pipe {}: buffer pool empty at prepare",
                    self.id
                )));
            }
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.ensure(PipeState::Configured, "start")?;
        lock(&self.node).stream_on()?;
        self.shared.stop.store(false, Ordering::Release);
        self.state = PipeState::Started;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.state == PipeState::Running {
            self.stop_thread()?;
        }
        self.ensure(PipeState::Started, "stop")?;

        let dropped = self.input.clear();
        if dropped > 0 {
            log::debug!("pipe {}: dropped {} queued frames on stop", self.id, dropped);
        }
        {
            let mut node = lock(&self.node);
            if self.shared.in_flight.load(Ordering::Acquire) > 0 {
                node.set_control(CTRL_FORCE_DONE, 1)?;
            }
            node.stream_off()?;
        }
        lock(&self.running).clear();
        self.shared.in_flight.store(0, Ordering::Release);
        self.state = PipeState::Configured;
        log::info!("pipe {}: stopped", self.id);
        Ok(())
    }

    fn start_thread(&mut self) -> Result<()> {
        self.ensure(PipeState::Started, "start_thread")?;
        self.shared.exit.store(false, Ordering::Release);
        self.shared.failed.store(false, Ordering::Release);
        let ctx = self.ctx();
        let node = self.node.clone();
        let input = self.input.clone();
        let handle = thread::Builder::new()
            .name(format!("pipe-{}", self.id))
            .spawn(move || run_worker(ctx, node, input))
            .map_err(Error::Io)?;
        self.worker = Some(handle);
        self.state = PipeState::Running;
        Ok(())
    }

    fn stop_thread(&mut self) -> Result<()> {
        self.ensure(PipeState::Running, "stop_thread")?;
        self.shared.exit.store(true, Ordering::Release);
        // Unblock a pop that would otherwise wait out its full timeout.
        self.input.sender().wake();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        self.shared.exit.store(false, Ordering::Release);
        self.state = PipeState::Started;
        Ok(())
    }

    fn set_stop_flag(&self, stop: bool) {
        self.shared.stop.store(stop, Ordering::Release);
    }

    fn input(&self) -> FrameSender<Arc<Frame>> {
        self.input.sender()
    }

    fn set_output(&mut self, output: FrameSender<Arc<Frame>>) {
        self.output = Some(output);
    }

    fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    fn destroy(&mut self) -> Result<()> {
        if self.state == PipeState::Running {
            self.stop_thread()?;
        }
        if self.state == PipeState::Started {
            self.stop()?;
        }
        if self.state == PipeState::Configured {
            lock(&self.node).clear_buffers()?;
        }
        self.state = PipeState::Destroyed;
        Ok(())
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        if self.state != PipeState::Destroyed {
            let _ = self.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::HeapBackend;
    use crate::fourcc::FourCC;
    use crate::frame::Entity;
    use crate::manager::{BufferManager, PoolInfo};
    use crate::meta::Size;
    use crate::node::{NodeFormat, SimFault, SimNode};
    use std::time::Instant;

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn pool(count: usize) -> Arc<BufferManager> {
        let mgr = BufferManager::new("pipe-test", Box::new(HeapBackend::new()));
        mgr.set_info(PoolInfo::new(vec![1024], count).with_meta_plane())
            .unwrap();
        mgr.alloc().unwrap();
        mgr
    }

    fn format() -> NodeFormat {
        NodeFormat::new(Size::new(64, 32), FourCC(*b"YUYV"))
    }

    fn pipe_with(node: SimNode, pool: Arc<BufferManager>) -> (Pipe, Arc<FrameQueue<Arc<Frame>>>) {
        let params = Arc::new(PipelineParams::default());
        let config = PipeConfig::new(0, format())
            .with_buffer_count(4)
            .with_wait(Duration::from_millis(50))
            .with_pool(pool);
        let mut pipe = Pipe::new(PipeId::Isp, Box::new(node), config, params);
        let output = Arc::new(FrameQueue::new());
        pipe.set_output(output.sender());
        (pipe, output)
    }

    fn request_frame(count: u32) -> Arc<Frame> {
        Arc::new(Frame::new(
            count,
            vec![Entity::new(PipeId::Isp, None, true, BufferPolicy::OnRequest)],
            ShotMeta::default(),
        ))
    }

    #[test]
    fn test_lifecycle_and_frame_flow() {
        let (mut pipe, output) = pipe_with(SimNode::new("isp"), pool(4));
        pipe.setup().unwrap();
        pipe.prepare().unwrap();
        pipe.start().unwrap();
        pipe.start_thread().unwrap();
        assert_eq!(pipe.state(), PipeState::Running);

        let input = pipe.input();
        for i in 0..3 {
            input.push(request_frame(i)).unwrap();
        }

        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(output.pop(Duration::from_secs(2)).unwrap().unwrap());
        }
        for frame in &got {
            assert!(frame.done());
            assert!(!frame.is_invalid());
            assert_eq!(frame.entity_state(PipeId::Isp), Some(EntityState::Done));
        }
        // Reap cleared every running slot.
        wait_until("in-flight drain", || pipe.in_flight() == 0);

        pipe.stop_thread().unwrap();
        pipe.stop().unwrap();
        assert_eq!(pipe.state(), PipeState::Configured);
    }

    #[test]
    fn test_setup_failure_is_fatal() {
        let mut node = SimNode::new("isp");
        node.inject_fault(SimFault::SetFormat);
        let params = Arc::new(PipelineParams::default());
        let mut pipe = Pipe::new(PipeId::Isp, Box::new(node), PipeConfig::new(0, format()), params);
        assert!(matches!(pipe.setup(), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_reap_failure_forwards_invalid_frame() {
        // A device error during reap must not wedge the stage;
        // the frame comes out done-but-invalid and the slot is cleared.
        let pool = pool(4);
        let (mut pipe, output) = pipe_with(SimNode::new("isp"), pool);
        pipe.setup().unwrap();
        pipe.start().unwrap();

        // Drive the cycle manually to inject the fault between submit and
        // reap.
        let ctx = pipe.ctx();
        let frame = request_frame(1);
        ctx.submit(&pipe.node, frame.clone()).unwrap();
        assert_eq!(pipe.in_flight(), 1);

        lock(&pipe.node)
            .set_control(CTRL_FORCE_DONE, 1)
            .unwrap(); // drop the pending completion
        ctx.reap(&pipe.node); // nothing ready yet, no fabrication
        assert_eq!(pipe.in_flight(), 1);

        // Now a hard device error: fabricate the invalid completion.
        {
            let mut node = lock(&pipe.node);
            node.stream_off().unwrap();
        }
        ctx.reap(&pipe.node);
        let done = output.pop(Duration::from_secs(1)).unwrap().unwrap();
        assert!(done.is_invalid());
        assert_eq!(done.entity_state(PipeId::Isp), Some(EntityState::Done));
        assert!(done.entity(PipeId::Isp).unwrap().invalid);
        assert_eq!(pipe.in_flight(), 0);
        assert_eq!(lock(&pipe.running).len(), 0);

        lock(&pipe.node).stream_on().unwrap();
        pipe.stop().unwrap();
    }

    #[test]
    fn test_device_flagged_error_completion() {
        // The device reports a completed slot with the error flag set: the
        // frame finishes invalid and the running slot is cleared.
        let mut node = SimNode::new("isp");
        node.inject_fault(SimFault::Dequeue);
        let (mut pipe, output) = pipe_with(node, pool(4));
        pipe.setup().unwrap();
        pipe.start().unwrap();

        let ctx = pipe.ctx();
        let frame = request_frame(9);
        ctx.submit(&pipe.node, frame).unwrap();
        ctx.reap(&pipe.node);

        let done = output.pop(Duration::from_secs(1)).unwrap().unwrap();
        assert!(done.done());
        assert!(done.is_invalid());
        assert_eq!(pipe.in_flight(), 0);
        assert_eq!(lock(&pipe.running).len(), 0);
        pipe.stop().unwrap();
    }

    #[test]
    fn test_double_submit_same_slot_is_fatal() {
        let pool = pool(4);
        let (mut pipe, _output) = pipe_with(SimNode::new("isp"), pool.clone());
        pipe.setup().unwrap();
        pipe.start().unwrap();

        let ctx = pipe.ctx();
        // Bind both frames to the same slot explicitly.
        let leased = pool.get_buffer(Some(0), Position::Hal).unwrap();
        let first = request_frame(1);
        first.set_dst_buffer(PipeId::Isp, leased.clone()).unwrap();
        let second = request_frame(2);
        second.set_dst_buffer(PipeId::Isp, leased).unwrap();

        ctx.submit(&pipe.node, first).unwrap();
        let err = ctx.submit(&pipe.node, second).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(pipe.in_flight(), 1);
        pipe.stop().unwrap();
    }

    #[test]
    fn test_stop_flag_then_stop_thread_skips_queued_frame() {
        // With the stop flag raised, a queued frame must survive
        // unprocessed and stop_thread must return promptly.
        let (mut pipe, output) = pipe_with(SimNode::new("isp"), pool(4));
        pipe.setup().unwrap();
        pipe.start().unwrap();
        pipe.start_thread().unwrap();

        pipe.set_stop_flag(true);
        thread::sleep(Duration::from_millis(20));
        pipe.input().push(request_frame(42)).unwrap();

        let begin = Instant::now();
        pipe.stop_thread().unwrap();
        assert!(begin.elapsed() < Duration::from_secs(1));

        // The queued frame was never consumed.
        assert!(output.is_empty());
        assert_eq!(pipe.in_flight(), 0);
        assert_eq!(pipe.input.len(), 1);
        pipe.stop().unwrap();
    }

    #[test]
    fn test_exhausted_pool_drops_request() {
        let pool = pool(1);
        let (mut pipe, output) = pipe_with(SimNode::new("isp"), pool.clone());
        pipe.setup().unwrap();
        pipe.start().unwrap();

        let ctx = pipe.ctx();
        // Hold the only buffer so delivery fails.
        let _held = pool.get_buffer(None, Position::Hal).unwrap();
        let frame = request_frame(5);
        ctx.submit(&pipe.node, frame).unwrap();

        let dropped = output.pop(Duration::from_secs(1)).unwrap().unwrap();
        assert!(dropped.is_invalid());
        assert!(dropped.done());
        assert_eq!(pipe.in_flight(), 0);
        pipe.stop().unwrap();
    }

    #[test]
    fn test_fast_zoom_restamps_node_group() {
        let pool = pool(4);
        let params = Arc::new(PipelineParams::default());
        let config = PipeConfig::new(0, format())
            .with_wait(Duration::from_millis(50))
            .with_pool(pool);
        let mut pipe = Pipe::new(PipeId::Isp, Box::new(SimNode::new("isp")), config, params.clone());
        let output = Arc::new(FrameQueue::new());
        pipe.set_output(output.sender());
        pipe.setup().unwrap();
        pipe.start().unwrap();

        let generation = params.set_zoom(200);
        let ctx = pipe.ctx();
        let frame = request_frame(1);
        ctx.submit(&pipe.node, frame.clone()).unwrap();

        // The stale generation triggered a recompute before stamping.
        let shot = frame.shot();
        assert_eq!(shot.zoom_generation, generation);
        assert_eq!(shot.zoom_percent, 200);
        let group = frame.node_group(PipeId::Isp).unwrap();
        assert!(group.leader.request);

        // Metadata plane round-trips the stamped shot.
        let buffer = frame.dst_buffer(PipeId::Isp).unwrap();
        let map = buffer.map_meta_plane().unwrap();
        let stamped = ShotMeta::read_from(&map).unwrap();
        assert_eq!(stamped.zoom_percent, 200);
        pipe.stop().unwrap();
    }
}
