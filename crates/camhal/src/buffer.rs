// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Multi-planar buffer descriptors.
//!
//! A [`Buffer`] is a fixed-size descriptor for up to [`MAX_PLANES`] memory
//! planes plus a status tag recording where the buffer currently sits
//! (driver or HAL side) and who may touch it. Descriptors are value types:
//! pools hand out copies and reclaim custody by slot index, so a descriptor
//! never owns the underlying memory. Plane file descriptors stay owned by
//! the pool for the lifetime of an allocation epoch.

use crate::{Error, Result, MAX_PLANES};
use memmap2::{MmapMut, MmapOptions};
use std::fmt;
use std::fs::File;
use std::ops::{Deref, DerefMut};
use std::os::fd::{FromRawFd, RawFd};

/// Where a buffer currently sits in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Position {
    /// Not handed out anywhere.
    #[default]
    Unbound,
    /// Queued to a device node (in service).
    Device,
    /// Held by HAL-side code.
    Hal,
}

/// Who is allowed to touch a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Permission {
    /// Slot exists but has never been released into the pool.
    #[default]
    Unbound,
    /// Free for leasing.
    Available,
    /// Leased to exactly one in-flight frame.
    InProcess,
}

/// Combined status tag stamped onto every leased descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStatus {
    pub position: Position,
    pub permission: Permission,
}

impl fmt::Display for BufferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.position, self.permission)
    }
}

/// Memory class backing a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferKind {
    /// Memory owned by the driver / DMA heap, uncached.
    #[default]
    DriverManaged,
    /// CPU-cached memory for stages that read back pixels.
    Cached,
    /// Carved out of a reserved region.
    Reserved,
}

/// One memory plane of a buffer.
///
/// `offset` is the byte offset inside `fd` where the plane starts; pools
/// that split one allocation across several buffers use non-zero offsets.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plane {
    pub fd: Option<RawFd>,
    pub len: usize,
    pub stride: usize,
    pub offset: usize,
}

/// Multi-planar buffer descriptor.
///
/// Identity is the slot `index`, stable for the lifetime of an allocation
/// `epoch`. A descriptor leased under an older epoch is rejected when
/// returned, which catches stale-index bugs instead of silently corrupting
/// the pool.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    index: usize,
    epoch: u32,
    kind: BufferKind,
    plane_count: usize,
    planes: [Plane; MAX_PLANES],
    has_meta_plane: bool,
    pub status: BufferStatus,
}

impl Buffer {
    pub fn new(index: usize, epoch: u32, kind: BufferKind) -> Self {
        Buffer {
            index,
            epoch,
            kind,
            ..Default::default()
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Image planes plus the metadata plane when present.
    pub fn plane_count(&self) -> usize {
        self.plane_count
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes[..self.plane_count]
    }

    /// Appends a plane to the descriptor.
    ///
    /// Fails with [`Error::BadValue`] once all [`MAX_PLANES`] slots are
    /// taken.
    pub fn push_plane(&mut self, plane: Plane) -> Result<()> {
        if self.plane_count >= MAX_PLANES {
            return Err(Error::BadValue(format!(
                "buffer {} already carries {} planes",
                self.index, self.plane_count
            )));
        }
        self.planes[self.plane_count] = plane;
        self.plane_count += 1;
        Ok(())
    }

    /// Marks the last pushed plane as the per-frame metadata plane.
    pub fn set_meta_plane(&mut self) {
        self.has_meta_plane = self.plane_count > 0;
    }

    /// The metadata plane, when the pool was configured with one.
    pub fn meta_plane(&self) -> Option<&Plane> {
        if self.has_meta_plane {
            self.planes[..self.plane_count].last()
        } else {
            None
        }
    }

    /// Total payload bytes across image planes (metadata excluded).
    pub fn image_len(&self) -> usize {
        let image_planes = if self.has_meta_plane {
            self.plane_count.saturating_sub(1)
        } else {
            self.plane_count
        };
        self.planes[..image_planes].iter().map(|p| p.len).sum()
    }

    /// Maps one plane for CPU access.
    ///
    /// The plane's file descriptor is duplicated so the mapping stays valid
    /// independent of the caller; the pool still owns the original fd.
    pub fn map_plane(&self, plane: usize) -> Result<MappedPlane> {
        let p = self
            .planes
            .get(plane)
            .filter(|_| plane < self.plane_count)
            .ok_or_else(|| {
                Error::BadValue(format!("buffer {} has no plane {}", self.index, plane))
            })?;
        let fd = p.fd.ok_or_else(|| {
            Error::InvalidOperation(format!(
                "buffer {} plane {} carries no file descriptor",
                self.index, plane
            ))
        })?;
        MappedPlane::new(fd, p.len, p.offset)
    }

    /// Maps the metadata plane for CPU access.
    pub fn map_meta_plane(&self) -> Result<MappedPlane> {
        if !self.has_meta_plane {
            return Err(Error::InvalidOperation(format!(
                "buffer {} has no metadata plane",
                self.index
            )));
        }
        self.map_plane(self.plane_count - 1)
    }
}

impl fmt::Display for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "buffer[{}] epoch {} planes {} {}",
            self.index, self.epoch, self.plane_count, self.status
        )
    }
}

/// A CPU mapping of a single buffer plane.
///
/// Holds its own duplicated file descriptor; dropping the mapping releases
/// both the mapping and the duplicate.
pub struct MappedPlane {
    map: MmapMut,
    _file: File,
}

impl MappedPlane {
    fn new(fd: RawFd, len: usize, offset: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::BadValue("cannot map a zero-length plane".to_string()));
        }
        // SAFETY: dup gives us a descriptor we exclusively own; File assumes
        // ownership and closes it on drop.
        let dup = unsafe { libc::dup(fd) };
        if dup < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let file = unsafe { File::from_raw_fd(dup) };
        // SAFETY: the fd refers to pool-owned memory that outlives this
        // mapping; aliasing is bounded by the pool's exclusive-lease rule.
        let map = unsafe { MmapOptions::new().offset(offset as u64).len(len).map_mut(&file)? };
        Ok(MappedPlane { map, _file: file })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Deref for MappedPlane {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.map
    }
}

impl DerefMut for MappedPlane {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }
}
