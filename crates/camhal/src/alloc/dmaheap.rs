// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Kernel DMA-heap memory provider.
//!
//! Allocates one dmabuf descriptor per plane from the CMA heap so buffers
//! can travel between the sensor front-end, ISP and encoders without a
//! copy. CPU readback goes through the dma-buf mapping protocol, which
//! brackets access with the kernel's begin/end sync.

use super::{PlaneMemory, PoolBackend, SlotMemory};
use crate::{Error, Result};
use dma_buf::DmaBuf;
use dma_heap::{Heap, HeapKind};
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;

/// DMA-heap (CMA) provider.
pub struct DmaHeapBackend {
    kind: HeapKind,
    heap: Option<Heap>,
}

impl DmaHeapBackend {
    /// Provider over the default CMA heap.
    pub fn new() -> Self {
        DmaHeapBackend {
            kind: HeapKind::Cma,
            heap: None,
        }
    }

    /// Provider over an explicit heap kind (CMA or system).
    pub fn with_kind(kind: HeapKind) -> Self {
        DmaHeapBackend { kind, heap: None }
    }

    fn heap(&mut self) -> Result<&Heap> {
        if self.heap.is_none() {
            let heap = Heap::new(self.kind.clone())
                .map_err(|e| Error::InvalidOperation(format!("DMA heap open failed: {}", e)))?;
            self.heap = Some(heap);
        }
        Ok(self.heap.as_ref().unwrap())
    }
}

impl Default for DmaHeapBackend {
    fn default() -> Self {
        DmaHeapBackend::new()
    }
}

impl PoolBackend for DmaHeapBackend {
    fn name(&self) -> &'static str {
        "dma-heap"
    }

    fn allocate(&mut self, plane_lens: &[usize], count: usize) -> Result<Vec<SlotMemory>> {
        if plane_lens.is_empty() || count == 0 {
            return Err(Error::BadValue(
                "DMA allocation needs at least one plane and one buffer".to_string(),
            ));
        }

        let heap = self.heap()?;
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            let mut planes = Vec::with_capacity(plane_lens.len());
            for &len in plane_lens {
                let fd: OwnedFd = heap
                    .allocate(len)
                    .map_err(|e| Error::InvalidOperation(format!("DMA alloc failed: {}", e)))?;
                planes.push(PlaneMemory {
                    fd: Some(Arc::new(fd)),
                    len,
                    offset: 0,
                });
            }
            slots.push(SlotMemory { planes });
        }
        log::debug!(
            "dma-heap allocation: {} buffers x {} planes",
            count,
            plane_lens.len()
        );
        Ok(slots)
    }
}

/// Reads a DMA plane through the dma-buf sync protocol.
///
/// The descriptor is duplicated for the duration of the read; `f` sees the
/// synced CPU view of the plane.
pub fn read_plane<A, R>(
    plane: &PlaneMemory,
    f: fn(&[u8], Option<A>) -> std::result::Result<R, Box<dyn std::error::Error>>,
    arg: Option<A>,
) -> Result<R> {
    let fd = plane.raw_fd().ok_or_else(|| {
        Error::InvalidOperation("plane carries no file descriptor".to_string())
    })?;
    // SAFETY: dup gives the DmaBuf a descriptor it exclusively owns.
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let dma = unsafe { DmaBuf::from_raw_fd(dup) };
    let mem = dma
        .memory_map()
        .map_err(|e| Error::InvalidOperation(format!("DMA map error: {}", e)))?;
    mem.read(f, arg)
        .map_err(|e| Error::InvalidOperation(format!("DMA read error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[ignore = "test requires a CMA DMA heap (run with --include-ignored on target hardware)"]
    #[test]
    #[serial]
    fn test_allocate_and_read() -> Result<()> {
        let mut backend = DmaHeapBackend::new();
        let slots = backend.allocate(&[4096], 2)?;
        assert_eq!(slots.len(), 2);

        let len = read_plane(&slots[0].planes[0], |data, _: Option<()>| Ok(data.len()), None)?;
        assert_eq!(len, 4096);
        Ok(())
    }

    #[test]
    fn test_rejects_empty_request() {
        let mut backend = DmaHeapBackend::new();
        assert!(backend.allocate(&[], 1).is_err());
        assert!(backend.allocate(&[4096], 0).is_err());
    }
}
