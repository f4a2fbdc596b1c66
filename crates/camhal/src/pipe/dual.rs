// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Two-node pipeline stage.
//!
//! The sensor front-end feeds the ISP input on a second device node: a
//! buffer completed by the first device is resubmitted to the second
//! before the frame entity finishes. The two devices run at independent
//! cadences, so each gets its own worker thread joined by an internal
//! completed-buffer queue - the first device's output rate never
//! head-of-line blocks the second device's intake.
//!
//! The stage presents itself as one [`PipeStage`]: one pipe id, one entity
//! per frame, one in-flight counter covering the whole front-to-back trip.

use super::single::{lock, StageCtx, StageShared};
use super::{PipeConfig, PipeId, PipeState, PipeStage, RunningTable};
use crate::frame::Frame;
use crate::meta::PipelineParams;
use crate::node::{VideoNode, CTRL_FORCE_DONE};
use crate::queue::{FrameQueue, FrameSender};
use crate::{Error, Result};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

type Bridge = FrameQueue<(Arc<Frame>, usize)>;

fn run_front(
    ctx: StageCtx,
    node: Arc<Mutex<Box<dyn VideoNode>>>,
    input: Arc<FrameQueue<Arc<Frame>>>,
    bridge: FrameSender<(Arc<Frame>, usize)>,
) {
    log::debug!("pipe {}: front worker running", ctx.id);
    let mut pending = 0usize;
    loop {
        if ctx.shared.exit.load(Ordering::Acquire) {
            break;
        }
        if ctx.shared.stop.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(5));
        } else {
            match input.pop(ctx.wait) {
                Ok(Some(frame)) => match ctx.submit(&node, frame) {
                    Ok(true) => pending += 1,
                    Ok(false) => {}
                    Err(e) => {
                        log::error!("pipe {}: fatal submit error: {}", ctx.id, e);
                        ctx.shared.failed.store(true, Ordering::Release);
                        break;
                    }
                },
                Ok(None) => {}
                Err(Error::Timeout) => {
                    log::warn!("pipe {}: input wait timed out", ctx.id);
                }
                Err(e) => {
                    log::error!("pipe {}: input queue failed: {}", ctx.id, e);
                    break;
                }
            }
        }

        if pending == 0 {
            continue;
        }
        // Hand first-device completions across to the back worker.
        let done = lock(&node).dequeue_buffer(ctx.wait);
        match done {
            Ok(done) if done.ok => {
                pending -= 1;
                match lock(&ctx.running).get(done.index) {
                    Some(frame) => {
                        if bridge.push((frame, done.index)).is_err() {
                            log::error!("pipe {}: bridge closed", ctx.id);
                            break;
                        }
                    }
                    None => log::error!(
                        "pipe {}: front device completed unknown slot {}",
                        ctx.id,
                        done.index
                    ),
                }
            }
            Ok(done) => {
                // Error-flagged by the first device: the frame never
                // reaches the second one.
                pending -= 1;
                if let Some(frame) = lock(&ctx.running).take(done.index) {
                    ctx.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                    log::warn!(
                        "pipe {}: front device flagged frame {} invalid",
                        ctx.id,
                        frame.count()
                    );
                    let _ = frame.entity_done(ctx.id, false);
                    ctx.forward(frame);
                }
            }
            Err(Error::Timeout) => {}
            Err(e) => {
                log::warn!("pipe {}: front device reap failed: {}", ctx.id, e);
                pending = pending.saturating_sub(1);
                if let Some((index, frame)) = lock(&ctx.running).take_oldest() {
                    ctx.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                    log::warn!(
                        "pipe {}: fabricated invalid completion for slot {}",
                        ctx.id,
                        index
                    );
                    let _ = frame.entity_done(ctx.id, false);
                    ctx.forward(frame);
                }
            }
        }
    }
    log::debug!("pipe {}: front worker exited", ctx.id);
}

fn run_back(ctx: StageCtx, node: Arc<Mutex<Box<dyn VideoNode>>>, bridge: Arc<Bridge>) {
    log::debug!("pipe {}: back worker running", ctx.id);
    let mut pending = 0usize;
    loop {
        if ctx.shared.exit.load(Ordering::Acquire) {
            break;
        }
        // The back half keeps draining while the stop flag is up; only the
        // front stops accepting work.
        match bridge.pop(ctx.wait) {
            Ok(Some((frame, index))) => {
                let buffer = frame.dst_buffer(ctx.id).filter(|b| b.index() == index);
                let queued = match buffer {
                    Some(buffer) => lock(&node).queue_buffer(&buffer),
                    None => Err(Error::InvalidOperation(format!(
                        "frame {} lost its buffer between devices",
                        frame.count()
                    ))),
                };
                match queued {
                    Ok(()) => pending += 1,
                    Err(e) => {
                        log::warn!(
                            "pipe {}: back submit of frame {} failed: {}",
                            ctx.id,
                            frame.count(),
                            e
                        );
                        if lock(&ctx.running).take(index).is_some() {
                            ctx.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                        }
                        let _ = frame.entity_done(ctx.id, false);
                        ctx.forward(frame);
                    }
                }
            }
            Ok(None) => {}
            Err(Error::Timeout) => {}
            Err(e) => {
                log::error!("pipe {}: bridge failed: {}", ctx.id, e);
                break;
            }
        }

        if pending > 0 {
            // Final reap finishes the entity; this is the only place the
            // stage-wide in-flight counter falls on the healthy path.
            let done = lock(&node).dequeue_buffer(ctx.wait);
            match done {
                Ok(done) => {
                    let Some(frame) = lock(&ctx.running).take(done.index) else {
                        log::error!(
                            "pipe {}: back device completed unknown slot {}",
                            ctx.id,
                            done.index
                        );
                        pending -= 1;
                        continue;
                    };
                    pending -= 1;
                    ctx.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                    let _ = frame.entity_done(ctx.id, done.ok);
                    if !done.ok {
                        log::warn!(
                            "pipe {}: back device flagged frame {} invalid",
                            ctx.id,
                            frame.count()
                        );
                    }
                    ctx.forward(frame);
                }
                Err(Error::Timeout) => {}
                Err(e) => {
                    log::warn!("pipe {}: back device reap failed: {}", ctx.id, e);
                    pending = pending.saturating_sub(1);
                    if let Some((index, frame)) = lock(&ctx.running).take_oldest() {
                        ctx.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                        log::warn!(
                            "pipe {}: fabricated invalid completion for slot {}",
                            ctx.id,
                            index
                        );
                        let _ = frame.entity_done(ctx.id, false);
                        ctx.forward(frame);
                    }
                }
            }
        }
    }
    log::debug!("pipe {}: back worker exited", ctx.id);
}

/// Pipeline stage over two cooperating device nodes.
pub struct DualPipe {
    id: PipeId,
    front_config: PipeConfig,
    back_config: PipeConfig,
    front_node: Arc<Mutex<Box<dyn VideoNode>>>,
    back_node: Arc<Mutex<Box<dyn VideoNode>>>,
    input: Arc<FrameQueue<Arc<Frame>>>,
    bridge: Arc<Bridge>,
    output: Option<FrameSender<Arc<Frame>>>,
    running: Arc<Mutex<RunningTable>>,
    shared: Arc<StageShared>,
    params: Arc<PipelineParams>,
    front_worker: Option<thread::JoinHandle<()>>,
    back_worker: Option<thread::JoinHandle<()>>,
    state: PipeState,
}

impl DualPipe {
    pub fn new(
        id: PipeId,
        front_node: Box<dyn VideoNode>,
        front_config: PipeConfig,
        back_node: Box<dyn VideoNode>,
        back_config: PipeConfig,
        params: Arc<PipelineParams>,
    ) -> Self {
        DualPipe {
            id,
            front_config,
            back_config,
            front_node: Arc::new(Mutex::new(front_node)),
            back_node: Arc::new(Mutex::new(back_node)),
            input: Arc::new(FrameQueue::new()),
            bridge: Arc::new(FrameQueue::new()),
            output: None,
            running: Arc::new(Mutex::new(RunningTable::new())),
            shared: StageShared::new(),
            params,
            front_worker: None,
            back_worker: None,
            state: PipeState::Created,
        }
    }

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
            pool: self.front_config.pool.clone(),
            wait: self.front_config.wait,
        }
    }

    fn configure_node(node: &Arc<Mutex<Box<dyn VideoNode>>>, config: &PipeConfig) -> Result<()> {
        let mut node = lock(node);
        node.open(config.node_id)?;
        node.set_input(config.input)?;
        node.set_format(&config.format)?;
        node.req_buffers(config.buffer_count)?;
        Ok(())
    }
}

impl PipeStage for DualPipe {
    fn id(&self) -> PipeId {
        self.id
    }

    fn state(&self) -> PipeState {
        self.state
    }

    fn setup(&mut self) -> Result<()> {
        self.ensure(PipeState::Created, "setup")?;
        Self::configure_node(&self.front_node, &self.front_config)?;
        Self::configure_node(&self.back_node, &self.back_config)?;
        self.state = PipeState::Configured;
        log::info!(
            "pipe {}: configured nodes {} -> {}",
            self.id,
            self.front_config.node_id,
            self.back_config.node_id
        );
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        self.ensure(PipeState::Configured, "prepare")?;
        if let Some(pool) = &self.front_config.pool {
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
        // Consumer first: the back device must be streaming before the
        // front can emit into it.
        lock(&self.back_node).stream_on()?;
        lock(&self.front_node).stream_on()?;
        self.shared.stop.store(false, Ordering::Release);
        self.state = PipeState::Started;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.state == PipeState::Running {
            self.stop_thread()?;
        }
        self.ensure(PipeState::Started, "stop")?;

        let dropped = self.input.clear() + self.bridge.clear();
        if dropped > 0 {
            log::debug!("pipe {}: dropped {} queued items on stop", self.id, dropped);
        }
        if self.shared.in_flight.load(Ordering::Acquire) > 0 {
            lock(&self.front_node).set_control(CTRL_FORCE_DONE, 1)?;
            lock(&self.back_node).set_control(CTRL_FORCE_DONE, 1)?;
        }
        // Producer first on the way down.
        lock(&self.front_node).stream_off()?;
        lock(&self.back_node).stream_off()?;
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

        let front = thread::Builder::new()
            .name(format!("pipe-{}-front", self.id))
            .spawn({
                let ctx = self.ctx();
                let node = self.front_node.clone();
                let input = self.input.clone();
                let bridge = self.bridge.sender();
                move || run_front(ctx, node, input, bridge)
            })
            .map_err(Error::Io)?;
        let back = thread::Builder::new()
            .name(format!("pipe-{}-back", self.id))
            .spawn({
                let ctx = self.ctx();
                let node = self.back_node.clone();
                let bridge = self.bridge.clone();
                move || run_back(ctx, node, bridge)
            })
            .map_err(Error::Io)?;

        self.front_worker = Some(front);
        self.back_worker = Some(back);
        self.state = PipeState::Running;
        Ok(())
    }

    fn stop_thread(&mut self) -> Result<()> {
        self.ensure(PipeState::Running, "stop_thread")?;
        self.shared.exit.store(true, Ordering::Release);
        self.input.sender().wake();
        self.bridge.sender().wake();
        if let Some(handle) = self.front_worker.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.back_worker.take() {
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
            lock(&self.front_node).clear_buffers()?;
            lock(&self.back_node).clear_buffers()?;
        }
        self.state = PipeState::Destroyed;
        Ok(())
    }
}

impl Drop for DualPipe {
    fn drop(&mut self) {
        if self.state != PipeState::Destroyed {
            let _ = self.destroy();
        }
    }
}
