// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Pipeline stages.
//!
//! A pipe bridges one (or two cooperating) device nodes to the frame graph.
//! Each cycle has two roles: *submit* (bind a leased buffer and the frame's
//! region-of-interest metadata, hand it to the device) and *reap* (pull the
//! completed buffer back, mark the frame entity done, forward the frame to
//! the next stage). One worker thread per stage; the two-node variant runs
//! a second worker decoupled through an internal queue so devices running
//! at different cadences never head-of-line block each other.
//!
//! There is no inheritance between stage kinds: [`Pipe`] and [`DualPipe`]
//! are plain structs composing device nodes, queues and a running-frame
//! table behind the common [`PipeStage`] trait.

mod dual;
mod single;

pub use dual::DualPipe;
pub use single::Pipe;

use crate::frame::Frame;
use crate::manager::BufferPool;
use crate::node::NodeFormat;
use crate::queue::{FrameSender, DEFAULT_WAIT};
use crate::{Error, Result, MAX_BUFFERS};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Pipeline stage identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PipeId {
    /// Sensor front-end capture.
    #[default]
    Sensor,
    /// 3A statistics engine.
    Stats3a,
    /// Image signal processor.
    Isp,
    /// Digital image stabilization.
    Dis,
    /// Still-capture scaler (SCC).
    ScalerCapture,
    /// Preview scaler (SCP).
    ScalerPreview,
    /// General-purpose scaler.
    Gsc,
    /// JPEG encoder.
    Jpeg,
    /// 3A engine on the reprocessing path.
    Stats3aReproc,
    /// ISP on the reprocessing path.
    IspReproc,
}

impl PipeId {
    pub fn name(&self) -> &'static str {
        match self {
            PipeId::Sensor => "sensor",
            PipeId::Stats3a => "3a",
            PipeId::Isp => "isp",
            PipeId::Dis => "dis",
            PipeId::ScalerCapture => "scc",
            PipeId::ScalerPreview => "scp",
            PipeId::Gsc => "gsc",
            PipeId::Jpeg => "jpeg",
            PipeId::Stats3aReproc => "3a-reproc",
            PipeId::IspReproc => "isp-reproc",
        }
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle of a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Created,
    /// Device opened, routed, formatted (`setup` done).
    Configured,
    /// Device streaming.
    Started,
    /// Worker thread running.
    Running,
    Destroyed,
}

/// Per-stage configuration applied during `setup`.
#[derive(Clone)]
pub struct PipeConfig {
    pub node_id: u32,
    pub input: u32,
    pub format: NodeFormat,
    pub buffer_count: usize,
    /// Queue/device wait used by the worker.
    pub wait: Duration,
    /// Pool backing on-request buffer leases for this stage.
    pub pool: Option<Arc<dyn BufferPool>>,
}

impl PipeConfig {
    pub fn new(node_id: u32, format: NodeFormat) -> Self {
        PipeConfig {
            node_id,
            input: 0,
            format,
            buffer_count: 4,
            wait: DEFAULT_WAIT,
            pool: None,
        }
    }

    pub fn with_input(mut self, input: u32) -> Self {
        self.input = input;
        self
    }

    pub fn with_buffer_count(mut self, count: usize) -> Self {
        self.buffer_count = count;
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_pool(mut self, pool: Arc<dyn BufferPool>) -> Self {
        self.pool = Some(pool);
        self
    }
}

/// Slot-indexed table of the frames currently submitted to a stage's
/// device. Written only by that stage's own worker threads; the entry
/// count always equals the stage's in-flight counter.
pub(crate) struct RunningTable {
    slots: Vec<Option<Arc<Frame>>>,
    order: std::collections::VecDeque<usize>,
}

impl RunningTable {
    pub(crate) fn new() -> Self {
        RunningTable {
            slots: (0..MAX_BUFFERS).map(|_| None).collect(),
            order: std::collections::VecDeque::new(),
        }
    }

    /// Fails when the slot already holds a different frame: a second
    /// submit against a running buffer index is a programming bug, never
    /// silently overwritten.
    pub(crate) fn check_free(&self, index: usize) -> Result<()> {
        match self.slots.get(index) {
            Some(None) => Ok(()),
            Some(Some(frame)) => Err(Error::InvalidOperation(format!(
                "slot {} already runs frame {}",
                index,
                frame.count()
            ))),
            None => Err(Error::BadValue(format!("slot {} out of range", index))),
        }
    }

    pub(crate) fn insert(&mut self, index: usize, frame: Arc<Frame>) -> Result<()> {
        self.check_free(index)?;
        self.slots[index] = Some(frame);
        self.order.push_back(index);
        Ok(())
    }

    pub(crate) fn get(&self, index: usize) -> Option<Arc<Frame>> {
        self.slots.get(index).and_then(|s| s.clone())
    }

    pub(crate) fn take(&mut self, index: usize) -> Option<Arc<Frame>> {
        let frame = self.slots.get_mut(index)?.take();
        if frame.is_some() {
            self.order.retain(|&i| i != index);
        }
        frame
    }

    /// Removes the longest-submitted entry; used to fabricate a completion
    /// when the device fails without reporting a slot.
    pub(crate) fn take_oldest(&mut self) -> Option<(usize, Arc<Frame>)> {
        let index = self.order.pop_front()?;
        self.slots[index].take().map(|f| (index, f))
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.order.clear();
    }
}

/// Common contract of pipeline stages, single- or dual-node.
pub trait PipeStage: Send {
    fn id(&self) -> PipeId;
    fn state(&self) -> PipeState;

    /// Opens and configures the device node(s). Fatal on failure.
    fn setup(&mut self) -> Result<()>;

    /// Verifies the stage's initial buffer batch is in place.
    fn prepare(&mut self) -> Result<()>;

    /// Streams the device(s) on.
    fn start(&mut self) -> Result<()>;

    /// Streams off, forcing in-flight work done first, and drains queues.
    fn stop(&mut self) -> Result<()>;

    fn start_thread(&mut self) -> Result<()>;
    fn stop_thread(&mut self) -> Result<()>;

    /// Graceful-drain flag: the worker idles without consuming new input.
    fn set_stop_flag(&self, stop: bool);

    /// Push handle of this stage's input queue.
    fn input(&self) -> FrameSender<Arc<Frame>>;

    /// Queue the stage forwards completed frames into.
    fn set_output(&mut self, output: FrameSender<Arc<Frame>>);

    /// Frames currently submitted to the device(s).
    fn in_flight(&self) -> usize;

    /// Tears the stage down; it cannot be reused afterwards.
    fn destroy(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Entity;
    use crate::meta::ShotMeta;

    fn frame(count: u32) -> Arc<Frame> {
        Arc::new(Frame::new(
            count,
            vec![Entity::new(PipeId::Isp, None, true, Default::default())],
            ShotMeta::default(),
        ))
    }

    #[test]
    fn test_running_table_accounting() {
        let mut table = RunningTable::new();
        table.insert(2, frame(1)).unwrap();
        table.insert(5, frame(2)).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(2).unwrap().count(), 1);

        let taken = table.take(5).unwrap();
        assert_eq!(taken.count(), 2);
        assert_eq!(table.len(), 1);
        assert!(table.take(5).is_none());
    }

    #[test]
    fn test_running_table_rejects_double_submit() {
        let mut table = RunningTable::new();
        table.insert(3, frame(1)).unwrap();
        assert!(matches!(
            table.insert(3, frame(2)),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            table.insert(MAX_BUFFERS, frame(3)),
            Err(Error::BadValue(_))
        ));
    }

    #[test]
    fn test_running_table_oldest_order() {
        let mut table = RunningTable::new();
        table.insert(4, frame(10)).unwrap();
        table.insert(1, frame(11)).unwrap();
        let (index, oldest) = table.take_oldest().unwrap();
        assert_eq!(index, 4);
        assert_eq!(oldest.count(), 10);
        // Out-of-order take keeps the order list consistent.
        table.insert(6, frame(12)).unwrap();
        table.take(6).unwrap();
        let (index, _) = table.take_oldest().unwrap();
        assert_eq!(index, 1);
        assert!(table.take_oldest().is_none());
    }
}
