// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Frame-graph topologies and their factory.
//!
//! A topology is a compile-time table of stages: the pipe each entity runs
//! on, the producer it consumes from, whether its completion counts toward
//! the request and how it obtains buffers. Optional stages (DIS, the
//! capture-scaler tap, pure-bayer reprocessing) are switched by
//! [`FactoryFlags`] before the factory is built; there is no dynamic graph
//! rewriting beyond that.
//!
//! The [`FrameFactory`] owns the stage objects for one logical camera
//! pipeline, stamps new frames with routing and region-of-interest data,
//! and drives startup/shutdown in dependency order: a consumer stage's
//! device always streams before its producer is told to emit, and teardown
//! walks the same order in reverse.

use crate::frame::{BufferPolicy, Entity, Frame};
use crate::manager::BufferManager;
use crate::meta::{compute_node_group, PipelineParams, ShotMeta};
use crate::pipe::{DualPipe, Pipe, PipeConfig, PipeId, PipeStage};
use crate::queue::{FrameQueue, FrameSender};
use crate::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Logical camera pipeline graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyId {
    /// Live preview: sensor front-end through 3A and ISP to the preview
    /// scaler.
    Preview,
    /// Still capture / reprocessing: a captured bayer buffer re-runs
    /// through ISP, capture scaler and the GSC+JPEG chain.
    Still,
    /// Front camera: shortened graph without the 3A stage.
    Front,
    /// Vision-only single-stage graph.
    Vision,
}

/// Optional stage gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageGate {
    StatsCapture,
    ScalerCapture,
    Dis,
    PureBayerReproc,
}

/// Optional-stage switches, fixed before the factory is created.
#[derive(Debug, Clone, Copy, Default)]
pub struct FactoryFlags {
    pub stats_capture: bool,
    pub scaler_capture: bool,
    pub dis: bool,
    pub pure_bayer_reproc: bool,
}

impl FactoryFlags {
    fn enabled(&self, gate: StageGate) -> bool {
        match gate {
            StageGate::StatsCapture => self.stats_capture,
            StageGate::ScalerCapture => self.scaler_capture,
            StageGate::Dis => self.dis,
            StageGate::PureBayerReproc => self.pure_bayer_reproc,
        }
    }

    fn request_bits(&self) -> u32 {
        u32::from(self.stats_capture)
            | u32::from(self.scaler_capture) << 1
            | u32::from(self.dis) << 2
            | u32::from(self.pure_bayer_reproc) << 3
    }
}

/// One stage of a topology table.
#[derive(Debug, Clone, Copy)]
pub struct StageSpec {
    pub pipe: PipeId,
    /// Producer this stage consumes from; `None` for roots. When the
    /// named producer is gated off, the stage reparents to the producer's
    /// own parent.
    pub parent: Option<PipeId>,
    /// Whether completion counts toward the frame request.
    pub counted: bool,
    pub policy: BufferPolicy,
    /// Flag gating this stage, if any.
    pub gate: Option<StageGate>,
    /// Cross-device stage backed by two cooperating nodes.
    pub dual: bool,
}

/// Fixed topology description.
pub struct Topology {
    pub id: TopologyId,
    pub name: &'static str,
    pub stages: &'static [StageSpec],
}

const PREVIEW_STAGES: &[StageSpec] = &[
    StageSpec {
        pipe: PipeId::Sensor,
        parent: None,
        counted: true,
        policy: BufferPolicy::OnRequest,
        gate: None,
        dual: true,
    },
    StageSpec {
        pipe: PipeId::Stats3a,
        parent: Some(PipeId::Sensor),
        counted: true,
        policy: BufferPolicy::OnRequest,
        gate: None,
        dual: false,
    },
    StageSpec {
        pipe: PipeId::Isp,
        parent: Some(PipeId::Stats3a),
        counted: true,
        policy: BufferPolicy::OnRequest,
        gate: None,
        dual: false,
    },
    StageSpec {
        pipe: PipeId::Dis,
        parent: Some(PipeId::Isp),
        counted: false,
        policy: BufferPolicy::OnRequest,
        gate: Some(StageGate::Dis),
        dual: false,
    },
    StageSpec {
        pipe: PipeId::ScalerCapture,
        parent: Some(PipeId::Isp),
        counted: true,
        policy: BufferPolicy::OnRequest,
        gate: Some(StageGate::ScalerCapture),
        dual: false,
    },
    StageSpec {
        pipe: PipeId::ScalerPreview,
        parent: Some(PipeId::Dis),
        counted: true,
        policy: BufferPolicy::OnRequest,
        gate: None,
        dual: false,
    },
];

const STILL_STAGES: &[StageSpec] = &[
    StageSpec {
        pipe: PipeId::Stats3aReproc,
        parent: None,
        counted: true,
        policy: BufferPolicy::OnRequest,
        gate: Some(StageGate::PureBayerReproc),
        dual: false,
    },
    StageSpec {
        pipe: PipeId::IspReproc,
        parent: Some(PipeId::Stats3aReproc),
        counted: true,
        policy: BufferPolicy::OnRequest,
        gate: None,
        dual: false,
    },
    StageSpec {
        pipe: PipeId::ScalerCapture,
        parent: Some(PipeId::IspReproc),
        counted: true,
        policy: BufferPolicy::OnRequest,
        gate: None,
        dual: false,
    },
    StageSpec {
        pipe: PipeId::Gsc,
        parent: Some(PipeId::ScalerCapture),
        counted: true,
        policy: BufferPolicy::OnRequest,
        gate: None,
        dual: false,
    },
    // The JPEG encoder completes under the GSC acknowledgement; the pair
    // counts once.
    StageSpec {
        pipe: PipeId::Jpeg,
        parent: Some(PipeId::Gsc),
        counted: false,
        policy: BufferPolicy::OnRequest,
        gate: None,
        dual: false,
    },
];

const FRONT_STAGES: &[StageSpec] = &[
    StageSpec {
        pipe: PipeId::Sensor,
        parent: None,
        counted: true,
        policy: BufferPolicy::OnRequest,
        gate: None,
        dual: true,
    },
    StageSpec {
        pipe: PipeId::Isp,
        parent: Some(PipeId::Sensor),
        counted: true,
        policy: BufferPolicy::OnRequest,
        gate: None,
        dual: false,
    },
    StageSpec {
        pipe: PipeId::ScalerPreview,
        parent: Some(PipeId::Isp),
        counted: true,
        policy: BufferPolicy::OnRequest,
        gate: None,
        dual: false,
    },
];

const VISION_STAGES: &[StageSpec] = &[StageSpec {
    pipe: PipeId::Sensor,
    parent: None,
    counted: true,
    policy: BufferPolicy::OnRequest,
    gate: None,
    dual: false,
}];

const TOPOLOGIES: &[Topology] = &[
    Topology {
        id: TopologyId::Preview,
        name: "preview",
        stages: PREVIEW_STAGES,
    },
    Topology {
        id: TopologyId::Still,
        name: "still",
        stages: STILL_STAGES,
    },
    Topology {
        id: TopologyId::Front,
        name: "front",
        stages: FRONT_STAGES,
    },
    Topology {
        id: TopologyId::Vision,
        name: "vision",
        stages: VISION_STAGES,
    },
];

/// Looks up a topology table.
pub fn topology(id: TopologyId) -> &'static Topology {
    TOPOLOGIES
        .iter()
        .find(|t| t.id == id)
        .expect("every TopologyId has a table")
}

/// All built-in topologies, for tooling.
pub fn topologies() -> &'static [Topology] {
    TOPOLOGIES
}

/// Factory for one logical camera pipeline.
pub struct FrameFactory {
    topology: &'static Topology,
    flags: FactoryFlags,
    params: Arc<PipelineParams>,
    stages: Vec<Box<dyn PipeStage>>,
    pools: Vec<Arc<BufferManager>>,
    output: Arc<FrameQueue<Arc<Frame>>>,
    counter: AtomicU32,
}

impl FrameFactory {
    /// Builds a factory over caller-provided stages.
    ///
    /// `stages` must contain exactly the active stages of the topology, in
    /// table order; the factory wires each stage's output to the next
    /// stage's input and the last stage to the factory output queue.
    pub fn new(
        id: TopologyId,
        flags: FactoryFlags,
        params: Arc<PipelineParams>,
        mut stages: Vec<Box<dyn PipeStage>>,
    ) -> Result<Self> {
        let table = topology(id);
        let active: Vec<&StageSpec> = table
            .stages
            .iter()
            .filter(|s| s.gate.map_or(true, |g| flags.enabled(g)))
            .collect();
        if stages.len() != active.len() {
            return Err(Error::BadValue(format!(
                "{} stages supplied for the {} active stages of {}",
                stages.len(),
                active.len(),
                table.name
            )));
        }
        for (stage, spec) in stages.iter().zip(&active) {
            if stage.id() != spec.pipe {
                return Err(Error::BadValue(format!(
                    "stage order mismatch: {} supplied where {} expected",
                    stage.id(),
                    spec.pipe
                )));
            }
        }

        let output = Arc::new(FrameQueue::new());
        // Forwarding follows the linearized table order; the terminal
        // stage feeds the factory's done queue.
        for i in (0..stages.len()).rev() {
            let sender: FrameSender<Arc<Frame>> = if i + 1 < stages.len() {
                stages[i + 1].input()
            } else {
                output.sender()
            };
            stages[i].set_output(sender);
        }

        log::info!(
            "frame factory {}: {} stages ({} request entities)",
            table.name,
            stages.len(),
            active.iter().filter(|s| s.counted).count()
        );
        Ok(FrameFactory {
            topology: table,
            flags,
            params,
            stages,
            pools: Vec::new(),
            output,
            counter: AtomicU32::new(0),
        })
    }

    /// Builds a factory whose stages run on software device nodes, one
    /// heap-backed buffer pool per stage. Used by tests and tooling.
    pub fn with_sim_nodes(
        id: TopologyId,
        flags: FactoryFlags,
        params: Arc<PipelineParams>,
    ) -> Result<Self> {
        use crate::alloc::HeapBackend;
        use crate::fourcc::FourCC;
        use crate::manager::PoolInfo;
        use crate::meta::Size;
        use crate::node::{NodeFormat, SimNode};

        let table = topology(id);
        let mut stages: Vec<Box<dyn PipeStage>> = Vec::new();
        let mut pools = Vec::new();
        let mut node_id = 0u32;
        let format = NodeFormat::new(Size::new(1280, 720), FourCC(*b"NV12"));

        for spec in table.stages {
            if let Some(gate) = spec.gate {
                if !flags.enabled(gate) {
                    continue;
                }
            }
            let pool = BufferManager::new(
                &format!("{}-{}", table.name, spec.pipe),
                Box::new(HeapBackend::new()),
            );
            pool.set_info(PoolInfo::new(vec![1280 * 720 * 2], 4).with_meta_plane())?;
            pools.push(pool.clone());

            let config = PipeConfig::new(node_id, format)
                .with_buffer_count(4)
                .with_wait(Duration::from_millis(100))
                .with_pool(pool);
            node_id += 1;

            let stage: Box<dyn PipeStage> = if spec.dual {
                let back_config = PipeConfig::new(node_id, format)
                    .with_buffer_count(4)
                    .with_wait(Duration::from_millis(100));
                node_id += 1;
                Box::new(DualPipe::new(
                    spec.pipe,
                    Box::new(SimNode::new(&format!("{}-front", spec.pipe))),
                    config,
                    Box::new(SimNode::new(&format!("{}-back", spec.pipe))),
                    back_config,
                    params.clone(),
                ))
            } else {
                Box::new(Pipe::new(
                    spec.pipe,
                    Box::new(SimNode::new(spec.pipe.name())),
                    config,
                    params.clone(),
                ))
            };
            stages.push(stage);
        }

        let mut factory = Self::new(id, flags, params, stages)?;
        factory.pools = pools;
        Ok(factory)
    }

    pub fn name(&self) -> &'static str {
        self.topology.name
    }

    pub fn flags(&self) -> FactoryFlags {
        self.flags
    }

    /// Active stage ids in table order.
    pub fn stage_ids(&self) -> Vec<PipeId> {
        self.stages.iter().map(|s| s.id()).collect()
    }

    fn active_specs(&self) -> Vec<&'static StageSpec> {
        self.topology
            .stages
            .iter()
            .filter(|s| s.gate.map_or(true, |g| self.flags.enabled(g)))
            .collect()
    }

    fn is_active(&self, pipe: PipeId) -> bool {
        self.active_specs().iter().any(|s| s.pipe == pipe)
    }

    /// Walks a stage's producer chain until an active stage (or a root).
    fn resolve_parent(&self, spec: &StageSpec) -> Option<PipeId> {
        let mut parent = spec.parent;
        while let Some(pipe) = parent {
            if self.is_active(pipe) {
                return Some(pipe);
            }
            parent = self
                .topology
                .stages
                .iter()
                .find(|s| s.pipe == pipe)
                .and_then(|s| s.parent);
        }
        None
    }

    /// Configures device formats and buffer counts for every stage.
    pub fn init_pipes(&mut self) -> Result<()> {
        for stage in self.stages.iter_mut() {
            stage.setup()?;
        }
        Ok(())
    }

    /// Primes each stage's initial buffer batch.
    pub fn prepare_pipes(&mut self) -> Result<()> {
        for pool in &self.pools {
            if !pool.is_allocated() {
                pool.alloc()?;
            }
        }
        for stage in self.stages.iter_mut() {
            stage.prepare()?;
        }
        Ok(())
    }

    /// Streams devices on, innermost consumer first.
    pub fn start_pipes(&mut self) -> Result<()> {
        for stage in self.stages.iter_mut().rev() {
            stage.start()?;
        }
        Ok(())
    }

    /// Starts worker threads in the same dependency order as the devices.
    pub fn start_threads(&mut self) -> Result<()> {
        for stage in self.stages.iter_mut().rev() {
            stage.start_thread()?;
        }
        Ok(())
    }

    /// Raises or clears the graceful-drain flag on every stage.
    pub fn set_stop_flag(&self, stop: bool) {
        for stage in &self.stages {
            stage.set_stop_flag(stop);
        }
    }

    /// Stops the pipeline, producers first, forcing in-flight work done
    /// so no stage is torn down while an upstream stage might still push
    /// into it.
    pub fn stop_pipes(&mut self) -> Result<()> {
        self.set_stop_flag(true);
        let mut first_error = None;
        for stage in self.stages.iter_mut() {
            if let Err(e) = stage.stop() {
                log::error!("frame factory: stopping {} failed: {}", stage.id(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Allocates a new frame wired for this topology: one entity per
    /// active stage, producer edges resolved across disabled stages, the
    /// request count derived from the counted entities, and the crop chain
    /// stamped for the current parameters.
    pub fn create_frame(&self) -> Result<Arc<Frame>> {
        let specs = self.active_specs();
        if specs.is_empty() {
            return Err(Error::InvalidOperation(format!(
                "topology {} has no active stages",
                self.topology.name
            )));
        }
        let mut entities = Vec::with_capacity(specs.len());
        for spec in &specs {
            entities.push(Entity::new(
                spec.pipe,
                self.resolve_parent(spec),
                spec.counted,
                spec.policy,
            ));
        }

        let count = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        let (state, generation) = self.params.snapshot();
        let shot = ShotMeta {
            frame_count: count,
            zoom_percent: state.zoom_percent,
            zoom_generation: generation,
            request_flags: self.flags.request_bits(),
            timestamp_ns: 0,
        };
        let frame = Frame::new(count, entities, shot);
        frame.store_node_group(specs[0].pipe, compute_node_group(&state));
        Ok(Arc::new(frame))
    }

    /// Number of frames created so far.
    pub fn frame_count(&self) -> u32 {
        self.counter.load(Ordering::Acquire)
    }

    /// Pushes a frame into the topology's first stage.
    pub fn push_frame(&self, frame: Arc<Frame>) -> Result<()> {
        let first = self
            .stages
            .first()
            .ok_or_else(|| Error::InvalidOperation("factory has no stages".to_string()))?;
        first.input().push(frame)
    }

    /// Pops the next completed frame off the terminal queue.
    pub fn pop_done(&self, timeout: Duration) -> Result<Option<Arc<Frame>>> {
        self.output.pop(timeout)
    }

    /// Total frames currently submitted to devices across all stages.
    pub fn in_flight(&self) -> usize {
        self.stages.iter().map(|s| s.in_flight()).sum()
    }

    /// Returns every stage buffer a finished frame still holds to its
    /// pool. Called by the frame's owner once all entities are done;
    /// stale descriptors are rejected by the epoch check.
    pub fn recycle(&self, frame: &Frame) -> Result<()> {
        for (i, stage) in self.stages.iter().enumerate() {
            let Some(pool) = self.pools.get(i) else {
                continue;
            };
            if let Some(buffer) = frame.dst_buffer(stage.id()) {
                pool.return_buffer(&buffer)?;
            }
        }
        Ok(())
    }

    /// Per-stage pool statistics, when the factory owns the pools.
    pub fn pool_stats(&self) -> Vec<(String, crate::manager::PoolStats)> {
        self.pools
            .iter()
            .map(|p| (p.name().to_string(), p.stats()))
            .collect()
    }

    /// Tears every stage down, producers first.
    pub fn destroy(&mut self) -> Result<()> {
        let mut first_error = None;
        for stage in self.stages.iter_mut() {
            if let Err(e) = stage.destroy() {
                log::error!("frame factory: destroying {} failed: {}", stage.id(), e);
                first_error.get_or_insert(e);
            }
        }
        for pool in &self.pools {
            pool.free_buffers();
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
