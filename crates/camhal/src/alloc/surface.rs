// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Display-compositor buffer pool.
//!
//! Preview output buffers are owned by the display side, not the HAL: the
//! pool dequeues a slot from the compositor, hands it to the pipeline, and
//! gives it back with enqueue (displayed) or cancel (dropped). The
//! compositor keeps a driver-imposed minimum number of buffers undequeued,
//! so the pool can never drain the display.
//!
//! [`SurfacePool`] implements the same [`BufferPool`] contract as
//! [`crate::manager::BufferManager`]; pipeline stages do not care which
//! side owns the memory.

use crate::buffer::{Buffer, BufferKind, BufferStatus, Permission, Plane, Position};
use crate::fourcc::FourCC;
use crate::manager::BufferPool;
use crate::{Error, Result};
use std::collections::VecDeque;
use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Geometry applied to every surface buffer.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceGeometry {
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
    pub stride: usize,
}

impl SurfaceGeometry {
    pub fn frame_len(&self) -> usize {
        self.fourcc
            .plane_lens(self.width, self.height)
            .iter()
            .sum()
    }
}

/// Narrow contract of the display side (ANativeWindow-style ops table).
pub trait SurfaceProvider: Send {
    fn set_buffer_count(&mut self, count: usize) -> Result<()>;
    fn set_geometry(&mut self, geometry: &SurfaceGeometry) -> Result<()>;

    /// Buffers the provider insists on keeping queued at all times.
    fn min_undequeued(&self) -> usize;

    /// Acquires a buffer slot from the provider.
    fn dequeue(&mut self) -> Result<usize>;

    /// Maps the planes of a dequeued slot for producer access.
    fn lock_planes(&mut self, slot: usize) -> Result<Vec<Plane>>;

    /// Hands a filled buffer to the display.
    fn enqueue(&mut self, slot: usize) -> Result<()>;

    /// Returns an unused buffer without displaying it.
    fn cancel(&mut self, slot: usize) -> Result<()>;
}

struct Inner {
    provider: Box<dyn SurfaceProvider>,
    dequeued: Vec<bool>,
}

/// Buffer pool over compositor-owned memory.
pub struct SurfacePool {
    name: String,
    count: usize,
    inner: Mutex<Inner>,
}

impl SurfacePool {
    /// Configures the provider and wraps it as a pool.
    ///
    /// `count` must leave at least one dequeueable buffer above the
    /// provider's minimum-undequeued requirement.
    pub fn new(
        name: &str,
        mut provider: Box<dyn SurfaceProvider>,
        count: usize,
        geometry: &SurfaceGeometry,
    ) -> Result<Arc<Self>> {
        if count <= provider.min_undequeued() {
            return Err(Error::BadValue(format!(
                "{}: {} buffers cannot satisfy min-undequeued {}",
                name,
                count,
                provider.min_undequeued()
            )));
        }
        provider.set_buffer_count(count)?;
        provider.set_geometry(geometry)?;
        log::info!(
            "{}: surface pool of {} buffers ({}x{} {})",
            name,
            count,
            geometry.width,
            geometry.height,
            geometry.fourcc
        );
        Ok(Arc::new(SurfacePool {
            name: name.to_string(),
            count,
            inner: Mutex::new(Inner {
                provider,
                dequeued: vec![false; count],
            }),
        }))
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl BufferPool for SurfacePool {
    fn get_buffer(&self, _want: Option<usize>, position: Position) -> Result<Buffer> {
        // The compositor picks the slot; a requested index cannot be
        // honored here.
        let mut inner = lock(&self.inner);
        let slot = inner.provider.dequeue()?;
        let planes = inner.provider.lock_planes(slot)?;
        inner.dequeued[slot] = true;

        let mut buffer = Buffer::new(slot, 0, BufferKind::Reserved);
        for plane in planes {
            buffer.push_plane(plane)?;
        }
        buffer.status = BufferStatus {
            position,
            permission: Permission::InProcess,
        };
        Ok(buffer)
    }

    fn put_buffer(&self, index: usize, _position: Position) -> Result<()> {
        let mut inner = lock(&self.inner);
        if index >= self.count {
            return Err(Error::BadValue(format!("surface slot {} out of range", index)));
        }
        if !inner.dequeued[index] {
            log::warn!("{}: surface buffer {} enqueued twice", self.name, index);
            return Ok(());
        }
        inner.provider.enqueue(index)?;
        inner.dequeued[index] = false;
        Ok(())
    }

    fn cancel_buffer(&self, index: usize) -> Result<()> {
        let mut inner = lock(&self.inner);
        if index >= self.count {
            return Err(Error::BadValue(format!("surface slot {} out of range", index)));
        }
        if !inner.dequeued[index] {
            log::warn!("{}: surface buffer {} cancelled twice", self.name, index);
            return Ok(());
        }
        inner.provider.cancel(index)?;
        inner.dequeued[index] = false;
        Ok(())
    }

    fn available_count(&self) -> usize {
        let inner = lock(&self.inner);
        let held = inner.dequeued.iter().filter(|&&d| d).count();
        self.count
            .saturating_sub(inner.provider.min_undequeued())
            .saturating_sub(held)
    }
}

/// In-memory surface provider used by tests and the software pipeline:
/// memfd-backed slots, immediate display consumption on enqueue.
pub struct TestSurface {
    min_undequeued: usize,
    geometry: Option<SurfaceGeometry>,
    slots: Vec<SurfaceSlot>,
    free: VecDeque<usize>,
}

struct SurfaceSlot {
    fd: OwnedFd,
    len: usize,
    stride: usize,
}

impl TestSurface {
    pub fn new(min_undequeued: usize) -> Self {
        TestSurface {
            min_undequeued,
            geometry: None,
            slots: Vec::new(),
            free: VecDeque::new(),
        }
    }

    fn held(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

impl SurfaceProvider for TestSurface {
    fn set_buffer_count(&mut self, count: usize) -> Result<()> {
        self.slots.clear();
        self.free.clear();
        for i in 0..count {
            let name = CString::new(format!("camhal-surface-{}", i))
                .map_err(|e| Error::BadValue(e.to_string()))?;
            // SAFETY: memfd_create with a valid C string; fd owned here.
            let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
            if fd < 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            self.slots.push(SurfaceSlot {
                fd: unsafe { OwnedFd::from_raw_fd(fd) },
                len: 0,
                stride: 0,
            });
            self.free.push_back(i);
        }
        Ok(())
    }

    fn set_geometry(&mut self, geometry: &SurfaceGeometry) -> Result<()> {
        let len = geometry.frame_len();
        for slot in &mut self.slots {
            // SAFETY: plain ftruncate on an fd we own.
            if unsafe { libc::ftruncate(slot.fd.as_raw_fd(), len as libc::off_t) } != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            slot.len = len;
            slot.stride = geometry.stride;
        }
        self.geometry = Some(*geometry);
        Ok(())
    }

    fn min_undequeued(&self) -> usize {
        self.min_undequeued
    }

    fn dequeue(&mut self) -> Result<usize> {
        if self.geometry.is_none() {
            return Err(Error::InvalidOperation(
                "surface geometry not configured".to_string(),
            ));
        }
        if self.held() >= self.slots.len().saturating_sub(self.min_undequeued) {
            return Err(Error::NoBuffer);
        }
        self.free.pop_front().ok_or(Error::NoBuffer)
    }

    fn lock_planes(&mut self, slot: usize) -> Result<Vec<Plane>> {
        let s = self
            .slots
            .get(slot)
            .ok_or_else(|| Error::BadValue(format!("surface slot {} out of range", slot)))?;
        Ok(vec![Plane {
            fd: Some(s.fd.as_raw_fd()),
            len: s.len,
            stride: s.stride,
            offset: 0,
        }])
    }

    fn enqueue(&mut self, slot: usize) -> Result<()> {
        // The test display consumes instantly; the slot is free again.
        self.free.push_back(slot);
        Ok(())
    }

    fn cancel(&mut self, slot: usize) -> Result<()> {
        self.free.push_back(slot);
        Ok(())
    }
}
