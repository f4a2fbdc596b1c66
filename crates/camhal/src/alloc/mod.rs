// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Memory-provider backends for buffer pools.
//!
//! A pool owns slots of multi-planar memory but never cares where the bytes
//! come from. The [`PoolBackend`] strategy hides the three providers this
//! HAL supports:
//!
//! - [`HeapBackend`] - anonymous heap memory through memfd, optionally one
//!   allocation logically split across all buffers ("multi" mode).
//! - [`DmaHeapBackend`] - kernel DMA heap (CMA) allocations, one dmabuf fd
//!   per plane, for zero-copy hand-off between devices.
//! - [`surface::SurfacePool`] - display-compositor buffers, which follow a
//!   dequeue/enqueue custody protocol instead of up-front allocation and
//!   therefore implement the pool contract directly rather than this trait.

mod dmaheap;
mod heap;
pub mod surface;

pub use dmaheap::{read_plane, DmaHeapBackend};
pub use heap::HeapBackend;

use crate::Result;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// Owned memory of one buffer plane.
///
/// The file descriptor is shared (`Arc`) because multi-mode heap
/// allocations back several planes with one descriptor at different
/// offsets.
#[derive(Debug, Clone)]
pub struct PlaneMemory {
    pub fd: Option<Arc<OwnedFd>>,
    pub len: usize,
    pub offset: usize,
}

impl PlaneMemory {
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }
}

/// Owned memory of one buffer slot (all planes).
#[derive(Debug, Default)]
pub struct SlotMemory {
    pub planes: Vec<PlaneMemory>,
}

/// Allocation strategy behind a [`crate::manager::BufferManager`].
///
/// `allocate` returns `count` fully-populated slots or fails; partially
/// allocated batches are returned to the caller anyway so teardown can
/// release them (the pool does not roll back on its own).
pub trait PoolBackend: Send {
    /// Provider name for logging.
    fn name(&self) -> &'static str;

    /// Allocates `count` slots with the given per-plane byte lengths.
    fn allocate(&mut self, plane_lens: &[usize], count: usize) -> Result<Vec<SlotMemory>>;

    /// Releases slots previously handed out by `allocate`.
    ///
    /// The default implementation drops the owned descriptors, which closes
    /// them; providers with an explicit free protocol override this.
    fn release(&mut self, slots: Vec<SlotMemory>) {
        drop(slots);
    }
}
