// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Heap memory provider backed by memfd.
//!
//! Used when the pipeline owner supplies plain (CPU-visible) memory instead
//! of device memory: statistics planes, metadata planes and software-only
//! test runs. Supports a "multi" mode where one memfd holds every buffer of
//! the pool and planes address it at offsets, matching providers that hand
//! the HAL a single heap block to carve up.

use super::{PlaneMemory, PoolBackend, SlotMemory};
use crate::{Error, Result};
use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

/// memfd-backed heap provider.
#[derive(Debug, Default)]
pub struct HeapBackend {
    /// One shared allocation split across all buffers instead of one memfd
    /// per plane.
    multi: bool,
    allocations: usize,
}

fn page_size() -> usize {
    // SAFETY: sysconf with a valid constant.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

fn align_page(len: usize, page: usize) -> usize {
    len.div_euclid(page) * page + if len % page == 0 { 0 } else { page }
}

impl HeapBackend {
    pub fn new() -> Self {
        HeapBackend::default()
    }

    /// Heap provider in multi mode: a single block logically split into the
    /// requested buffer count.
    pub fn multi() -> Self {
        HeapBackend {
            multi: true,
            allocations: 0,
        }
    }

    fn create_memfd(&mut self, len: usize) -> Result<OwnedFd> {
        let name = CString::new(format!("camhal-heap-{}", self.allocations))
            .map_err(|e| Error::BadValue(e.to_string()))?;
        self.allocations += 1;

        // SAFETY: memfd_create with a valid C string; the returned fd is
        // owned here and nowhere else.
        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };

        // SAFETY: plain ftruncate on an fd we own.
        if unsafe { libc::ftruncate(owned.as_raw_fd(), len as libc::off_t) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(owned)
    }
}

impl PoolBackend for HeapBackend {
    fn name(&self) -> &'static str {
        "heap"
    }

    fn allocate(&mut self, plane_lens: &[usize], count: usize) -> Result<Vec<SlotMemory>> {
        if plane_lens.is_empty() || count == 0 {
            return Err(Error::BadValue(
                "heap allocation needs at least one plane and one buffer".to_string(),
            ));
        }

        let slot_len: usize = plane_lens.iter().sum();
        let mut slots = Vec::with_capacity(count);

        if self.multi {
            // Plane windows start on page boundaries so they stay
            // individually mappable.
            let page = page_size();
            let spans: Vec<usize> = plane_lens.iter().map(|&l| align_page(l, page)).collect();
            let slot_span: usize = spans.iter().sum();
            let block = Arc::new(self.create_memfd(slot_span * count)?);
            for slot in 0..count {
                let mut planes = Vec::with_capacity(plane_lens.len());
                let mut offset = slot * slot_span;
                for (i, &len) in plane_lens.iter().enumerate() {
                    planes.push(PlaneMemory {
                        fd: Some(block.clone()),
                        len,
                        offset,
                    });
                    offset += spans[i];
                }
                slots.push(SlotMemory { planes });
            }
            log::debug!(
                "heap multi allocation: {} buffers x {} planes in one {} byte block",
                count,
                plane_lens.len(),
                slot_span * count
            );
        } else {
            for _ in 0..count {
                let mut planes = Vec::with_capacity(plane_lens.len());
                for &len in plane_lens {
                    planes.push(PlaneMemory {
                        fd: Some(Arc::new(self.create_memfd(len)?)),
                        len,
                        offset: 0,
                    });
                }
                slots.push(SlotMemory { planes });
            }
            log::debug!(
                "heap allocation: {} buffers x {} planes ({} bytes per buffer)",
                count,
                plane_lens.len(),
                slot_len
            );
        }

        Ok(slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memmap2::MmapOptions;
    use std::fs::File;

    fn map_plane(plane: &PlaneMemory) -> memmap2::MmapMut {
        let fd = plane.raw_fd().unwrap();
        let dup = unsafe { libc::dup(fd) };
        assert!(dup >= 0);
        let file = unsafe { File::from_raw_fd(dup) };
        unsafe {
            MmapOptions::new()
                .offset(plane.offset as u64)
                .len(plane.len)
                .map_mut(&file)
                .unwrap()
        }
    }
    use std::os::fd::FromRawFd;

    #[test]
    fn test_allocate_per_plane_fds() {
        let mut backend = HeapBackend::new();
        let slots = backend.allocate(&[4096, 2048], 3).unwrap();
        assert_eq!(slots.len(), 3);
        for slot in &slots {
            assert_eq!(slot.planes.len(), 2);
            assert_eq!(slot.planes[0].len, 4096);
            assert_eq!(slot.planes[1].len, 2048);
            assert_eq!(slot.planes[0].offset, 0);
        }
        // Distinct descriptors per plane in non-multi mode.
        let a = slots[0].planes[0].raw_fd().unwrap();
        let b = slots[1].planes[0].raw_fd().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_multi_mode_shares_one_fd() {
        let mut backend = HeapBackend::multi();
        let slots = backend.allocate(&[4096, 2048], 2).unwrap();
        let fd = slots[0].planes[0].raw_fd().unwrap();
        for slot in &slots {
            for plane in &slot.planes {
                assert_eq!(plane.raw_fd().unwrap(), fd);
            }
        }
        // Offsets are page-aligned and tile the block without overlap.
        let page = page_size();
        let mut windows: Vec<(usize, usize)> = slots
            .iter()
            .flat_map(|s| s.planes.iter().map(|p| (p.offset, p.len)))
            .collect();
        windows.sort();
        for pair in windows.windows(2) {
            assert_eq!(pair[0].0 % page, 0);
            assert!(pair[0].0 + pair[0].1 <= pair[1].0, "plane windows overlap");
        }
    }

    #[test]
    fn test_multi_mode_planes_are_disjoint() {
        let mut backend = HeapBackend::multi();
        let slots = backend.allocate(&[64], 2).unwrap();

        let mut first = map_plane(&slots[0].planes[0]);
        let mut second = map_plane(&slots[1].planes[0]);
        first.fill(0x11);
        second.fill(0x22);
        assert!(first.iter().all(|&b| b == 0x11));
        assert!(second.iter().all(|&b| b == 0x22));
    }

    #[test]
    fn test_rejects_empty_request() {
        let mut backend = HeapBackend::new();
        assert!(backend.allocate(&[], 2).is_err());
        assert!(backend.allocate(&[4096], 0).is_err());
    }
}
