// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Device-node contract.
//!
//! Pipeline stages talk to their hardware through the narrow [`VideoNode`]
//! trait: configure once (input routing, format, buffer count), stream
//! on/off, then per-cycle queue/dequeue of buffer slots. Nothing above this
//! trait knows about the underlying driver ABI.
//!
//! [`SimNode`] is the software implementation used by tests and the CLI:
//! it enforces the same state machine a kernel node would, completes queued
//! buffers in FIFO order (optionally reordered), and supports one-shot
//! fault injection for failure-path coverage.

use crate::buffer::Buffer;
use crate::fourcc::FourCC;
use crate::meta::Size;
use crate::{Error, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use unix_ts::Timestamp;

/// Control id: force the device to return all in-flight buffers.
pub const CTRL_FORCE_DONE: u32 = 0x0100;

/// Control id: frame-rate hint forwarded to the sensor.
pub const CTRL_FRAME_RATE: u32 = 0x0101;

/// Format configuration applied once per [`VideoNode::set_format`].
#[derive(Debug, Clone, Copy)]
pub struct NodeFormat {
    pub size: Size,
    pub fourcc: FourCC,
    pub plane_count: usize,
}

impl NodeFormat {
    pub fn new(size: Size, fourcc: FourCC) -> Self {
        NodeFormat {
            size,
            fourcc,
            plane_count: fourcc.plane_count(),
        }
    }
}

/// A completed buffer reported by the device.
#[derive(Debug, Clone, Copy)]
pub struct DoneBuffer {
    /// Slot index the device reports; completion order is not guaranteed.
    pub index: usize,
    /// False when the device flags the payload as unusable.
    pub ok: bool,
    pub timestamp: Timestamp,
}

/// Narrow driver contract each pipeline stage depends on.
pub trait VideoNode: Send {
    fn name(&self) -> &str;

    fn open(&mut self, node_id: u32) -> Result<()>;
    fn set_input(&mut self, input: u32) -> Result<()>;
    fn set_format(&mut self, format: &NodeFormat) -> Result<()>;
    fn req_buffers(&mut self, count: usize) -> Result<()>;
    fn clear_buffers(&mut self) -> Result<()>;

    fn stream_on(&mut self) -> Result<()>;
    fn stream_off(&mut self) -> Result<()>;

    /// Submits a buffer slot to the device.
    fn queue_buffer(&mut self, buffer: &Buffer) -> Result<()>;

    /// Retrieves the next completed buffer, waiting up to `timeout`.
    fn dequeue_buffer(&mut self, timeout: Duration) -> Result<DoneBuffer>;

    fn set_control(&mut self, id: u32, value: i32) -> Result<()>;
    fn get_control(&mut self, id: u32) -> Result<i32>;

    /// Readiness probe used to detect device stalls proactively.
    fn poll_ready(&mut self, timeout: Duration) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Closed,
    Open,
    Configured,
    Streaming,
}

/// One-shot fault injected into a [`SimNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimFault {
    Open,
    SetFormat,
    ReqBuffers,
    StreamOn,
    StreamOff,
    Dequeue,
}

fn now_timestamp() -> Timestamp {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Timestamp::new(now.as_secs() as i64, now.subsec_nanos())
}

/// Software device node.
pub struct SimNode {
    name: String,
    state: NodeState,
    node_id: Option<u32>,
    input: Option<u32>,
    format: Option<NodeFormat>,
    buffer_count: usize,
    pending: VecDeque<usize>,
    reorder_window: usize,
    reorder_toggle: bool,
    faults: HashSet<SimFault>,
    controls: HashMap<u32, i32>,
    queued_total: u64,
    completed_total: u64,
}

impl SimNode {
    pub fn new(name: &str) -> Self {
        SimNode {
            name: name.to_string(),
            state: NodeState::Closed,
            node_id: None,
            input: None,
            format: None,
            buffer_count: 0,
            pending: VecDeque::new(),
            reorder_window: 1,
            reorder_toggle: false,
            faults: HashSet::new(),
            controls: HashMap::new(),
            queued_total: 0,
            completed_total: 0,
        }
    }

    /// Completes every other pair of buffers out of order, exercising the
    /// index-based reap path.
    pub fn with_reorder(mut self, window: usize) -> Self {
        self.reorder_window = window.max(1);
        self
    }

    /// Arms a one-shot fault on the given operation.
    pub fn inject_fault(&mut self, fault: SimFault) {
        self.faults.insert(fault);
    }

    fn take_fault(&mut self, fault: SimFault) -> bool {
        self.faults.remove(&fault)
    }

    fn check_fault(&mut self, fault: SimFault, what: &str) -> Result<()> {
        if self.take_fault(fault) {
            return Err(Error::InvalidOperation(format!(
                "{}: injected {} failure",
                self.name, what
            )));
        }
        Ok(())
    }

    pub fn node_id(&self) -> Option<u32> {
        self.node_id
    }

    pub fn input(&self) -> Option<u32> {
        self.input
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn queued_total(&self) -> u64 {
        self.queued_total
    }

    pub fn completed_total(&self) -> u64 {
        self.completed_total
    }
}

impl VideoNode for SimNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, node_id: u32) -> Result<()> {
        self.check_fault(SimFault::Open, "open")?;
        if self.state != NodeState::Closed {
            return Err(Error::InvalidOperation(format!(
                "{}: open on a node that is not closed",
                self.name
            )));
        }
        self.node_id = Some(node_id);
        self.state = NodeState::Open;
        log::debug!("{}: opened as node {}", self.name, node_id);
        Ok(())
    }

    fn set_input(&mut self, input: u32) -> Result<()> {
        if self.state == NodeState::Closed {
            return Err(Error::InvalidOperation(format!(
                "{}: set_input before open",
                self.name
            )));
        }
        self.input = Some(input);
        Ok(())
    }

    fn set_format(&mut self, format: &NodeFormat) -> Result<()> {
        self.check_fault(SimFault::SetFormat, "set_format")?;
        if self.state != NodeState::Open && self.state != NodeState::Configured {
            return Err(Error::InvalidOperation(format!(
                "{}: set_format in state {:?}",
                self.name, self.state
            )));
        }
        if format.size.width == 0 || format.size.height == 0 {
            return Err(Error::BadValue(format!(
                "{}: zero-sized format {}",
                self.name, format.size
            )));
        }
        self.format = Some(*format);
        Ok(())
    }

    fn req_buffers(&mut self, count: usize) -> Result<()> {
        self.check_fault(SimFault::ReqBuffers, "req_buffers")?;
        if self.format.is_none() {
            return Err(Error::InvalidOperation(format!(
                "{}: req_buffers before set_format",
                self.name
            )));
        }
        if count == 0 || count > crate::MAX_BUFFERS {
            return Err(Error::BadValue(format!(
                "{}: buffer count {} out of range",
                self.name, count
            )));
        }
        self.buffer_count = count;
        self.state = NodeState::Configured;
        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<()> {
        if self.state == NodeState::Streaming {
            return Err(Error::InvalidOperation(format!(
                "{}: clear_buffers while streaming",
                self.name
            )));
        }
        self.pending.clear();
        self.buffer_count = 0;
        if self.state == NodeState::Configured {
            self.state = NodeState::Open;
        }
        Ok(())
    }

    fn stream_on(&mut self) -> Result<()> {
        self.check_fault(SimFault::StreamOn, "stream_on")?;
        if self.state != NodeState::Configured {
            return Err(Error::InvalidOperation(format!(
                "{}: stream_on in state {:?}",
                self.name, self.state
            )));
        }
        self.state = NodeState::Streaming;
        log::debug!("{}: streaming on", self.name);
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.check_fault(SimFault::StreamOff, "stream_off")?;
        if self.state != NodeState::Streaming {
            return Err(Error::InvalidOperation(format!(
                "{}: stream_off in state {:?}",
                self.name, self.state
            )));
        }
        // Stream-off implicitly returns every queued buffer.
        if !self.pending.is_empty() {
            log::debug!(
                "{}: dropping {} queued buffers on stream_off",
                self.name,
                self.pending.len()
            );
            self.pending.clear();
        }
        self.state = NodeState::Configured;
        Ok(())
    }

    fn queue_buffer(&mut self, buffer: &Buffer) -> Result<()> {
        if self.state != NodeState::Configured && self.state != NodeState::Streaming {
            return Err(Error::InvalidOperation(format!(
                "{}: queue_buffer in state {:?}",
                self.name, self.state
            )));
        }
        let index = buffer.index();
        if index >= self.buffer_count {
            return Err(Error::BadValue(format!(
                "{}: slot {} beyond requested count {}",
                self.name, index, self.buffer_count
            )));
        }
        if self.pending.contains(&index) {
            return Err(Error::InvalidOperation(format!(
                "{}: slot {} queued twice",
                self.name, index
            )));
        }
        self.pending.push_back(index);
        self.queued_total += 1;
        Ok(())
    }

    fn dequeue_buffer(&mut self, timeout: Duration) -> Result<DoneBuffer> {
        if self.state != NodeState::Streaming {
            return Err(Error::InvalidOperation(format!(
                "{}: dequeue_buffer in state {:?}",
                self.name, self.state
            )));
        }
        if self.take_fault(SimFault::Dequeue) {
            // A device error surfaces either as a failed call or as a
            // completion flagged not-ok; report the slot when one exists.
            return match self.pending.pop_front() {
                Some(index) => {
                    self.completed_total += 1;
                    Ok(DoneBuffer {
                        index,
                        ok: false,
                        timestamp: now_timestamp(),
                    })
                }
                None => Err(Error::InvalidOperation(format!(
                    "{}: injected dequeue failure",
                    self.name
                ))),
            };
        }
        if self.pending.is_empty() {
            // Nothing in flight can complete; behave like an expired wait.
            std::thread::sleep(timeout.min(Duration::from_millis(2)));
            return Err(Error::Timeout);
        }

        let index = if self.reorder_window > 1 && self.pending.len() >= 2 {
            self.reorder_toggle = !self.reorder_toggle;
            if self.reorder_toggle {
                // Complete the second-oldest first.
                let second = self.pending.remove(1);
                second.unwrap_or_else(|| self.pending.pop_front().unwrap_or_default())
            } else {
                self.pending.pop_front().unwrap_or_default()
            }
        } else {
            self.pending.pop_front().unwrap_or_default()
        };
        self.completed_total += 1;
        Ok(DoneBuffer {
            index,
            ok: true,
            timestamp: now_timestamp(),
        })
    }

    fn set_control(&mut self, id: u32, value: i32) -> Result<()> {
        if self.state == NodeState::Closed {
            return Err(Error::InvalidOperation(format!(
                "{}: set_control before open",
                self.name
            )));
        }
        if id == CTRL_FORCE_DONE && !self.pending.is_empty() {
            log::debug!(
                "{}: force-done returns {} queued buffers",
                self.name,
                self.pending.len()
            );
            self.pending.clear();
        }
        self.controls.insert(id, value);
        Ok(())
    }

    fn get_control(&mut self, id: u32) -> Result<i32> {
        self.controls
            .get(&id)
            .copied()
            .ok_or_else(|| Error::BadValue(format!("{}: unknown control {:#x}", self.name, id)))
    }

    fn poll_ready(&mut self, _timeout: Duration) -> Result<bool> {
        if self.state != NodeState::Streaming {
            return Err(Error::InvalidOperation(format!(
                "{}: poll on a non-streaming node",
                self.name
            )));
        }
        Ok(!self.pending.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Buffer, BufferKind};

    fn configured(name: &str) -> SimNode {
        let mut node = SimNode::new(name);
        node.open(0).unwrap();
        node.set_input(0).unwrap();
        node.set_format(&NodeFormat::new(Size::new(64, 32), FourCC(*b"YUYV")))
            .unwrap();
        node.req_buffers(4).unwrap();
        node
    }

    fn slot(index: usize) -> Buffer {
        Buffer::new(index, 0, BufferKind::DriverManaged)
    }

    #[test]
    fn test_state_machine_enforced() {
        let mut node = SimNode::new("sim");
        assert!(node.stream_on().is_err());
        node.open(3).unwrap();
        assert_eq!(node.node_id(), Some(3));
        assert!(node.req_buffers(4).is_err()); // format first
        node.set_format(&NodeFormat::new(Size::new(64, 32), FourCC(*b"YUYV")))
            .unwrap();
        node.req_buffers(4).unwrap();
        node.stream_on().unwrap();
        assert!(node.open(3).is_err());
        assert!(node.clear_buffers().is_err()); // not while streaming
        node.stream_off().unwrap();
        node.clear_buffers().unwrap();
    }

    #[test]
    fn test_fifo_completion() {
        let mut node = configured("sim");
        node.stream_on().unwrap();
        node.queue_buffer(&slot(2)).unwrap();
        node.queue_buffer(&slot(0)).unwrap();
        let first = node.dequeue_buffer(Duration::from_millis(10)).unwrap();
        assert!(first.ok);
        assert_eq!(first.index, 2);
        assert_eq!(
            node.dequeue_buffer(Duration::from_millis(10)).unwrap().index,
            0
        );
    }

    #[test]
    fn test_double_queue_rejected() {
        let mut node = configured("sim");
        node.queue_buffer(&slot(1)).unwrap();
        assert!(matches!(
            node.queue_buffer(&slot(1)),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(node.queue_buffer(&slot(9)), Err(Error::BadValue(_))));
    }

    #[test]
    fn test_dequeue_empty_times_out() {
        let mut node = configured("sim");
        node.stream_on().unwrap();
        assert!(matches!(
            node.dequeue_buffer(Duration::from_millis(1)),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn test_reorder_completion() {
        let mut node = configured("sim").with_reorder(2);
        node.stream_on().unwrap();
        for i in 0..4 {
            node.queue_buffer(&slot(i)).unwrap();
        }
        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(node.dequeue_buffer(Duration::from_millis(10)).unwrap().index);
        }
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2, 3]);
        assert_ne!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_injected_dequeue_error_reports_slot() {
        let mut node = configured("sim");
        node.stream_on().unwrap();
        node.queue_buffer(&slot(3)).unwrap();
        node.inject_fault(SimFault::Dequeue);
        let done = node.dequeue_buffer(Duration::from_millis(10)).unwrap();
        assert!(!done.ok);
        assert_eq!(done.index, 3);
        // One-shot: the next cycle is healthy again.
        node.queue_buffer(&slot(1)).unwrap();
        assert!(node.dequeue_buffer(Duration::from_millis(10)).unwrap().ok);
    }

    #[test]
    fn test_force_done_drains_pending() {
        let mut node = configured("sim");
        node.stream_on().unwrap();
        node.queue_buffer(&slot(0)).unwrap();
        node.queue_buffer(&slot(1)).unwrap();
        node.set_control(CTRL_FORCE_DONE, 1).unwrap();
        assert_eq!(node.pending_len(), 0);
        assert_eq!(node.get_control(CTRL_FORCE_DONE).unwrap(), 1);
        assert!(!node.poll_ready(Duration::ZERO).unwrap());
    }

    #[test]
    fn test_configure_fault_injection() {
        let mut node = SimNode::new("sim");
        node.inject_fault(SimFault::Open);
        assert!(node.open(0).is_err());
        node.open(0).unwrap();
    }
}
