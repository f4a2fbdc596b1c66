// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Buffer pool with exclusive ownership transfer.
//!
//! A [`BufferManager`] owns a fixed-capacity array of buffer slots and
//! arbitrates leasing and reclaiming them across pipeline threads. Exactly
//! one in-flight frame may hold a buffer at a time; returning it to the
//! pool is the only legal way back.
//!
//! Three allocation modes are supported:
//!
//! - [`AllocMode::Upfront`] - everything allocated by [`BufferManager::alloc`].
//! - [`AllocMode::OnDemand`] - the requested batch up front, then grow by one
//!   on lease misses up to the configured maximum.
//! - [`AllocMode::Background`] - like on-demand, but the remaining growth is
//!   performed by a worker thread that never blocks the leasing path for
//!   longer than one grow iteration.
//!
//! Locking follows the two-mutex layout the pipeline relies on: pool state
//! (slots, backend, epoch) and the available-index queue are guarded
//! separately so a lease/return does not contend with reconfiguration
//! unless they actually touch the same data.

use crate::alloc::PoolBackend;
use crate::buffer::{Buffer, BufferKind, BufferStatus, Permission, Plane, Position};
use crate::{Error, Result, MAX_BUFFERS, MAX_PLANES, META_PLANE_LEN};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;

/// Recovers the guard from a poisoned mutex; pool state stays consistent
/// because every mutation is completed before unlocking.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Pool allocation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocMode {
    /// Allocate the full requested count during `alloc()`.
    #[default]
    Upfront,
    /// Allocate the requested count, grow lazily on lease misses.
    OnDemand,
    /// On-demand plus a background worker filling up to the maximum.
    Background,
}

/// Pool configuration handed to [`BufferManager::set_info`].
#[derive(Debug, Clone)]
pub struct PoolInfo {
    pub plane_lens: Vec<usize>,
    pub plane_strides: Vec<usize>,
    pub requested: usize,
    pub max: usize,
    pub kind: BufferKind,
    pub mode: AllocMode,
    pub meta_plane: bool,
    pub need_map: bool,
}

impl PoolInfo {
    /// Configuration with image plane byte lengths and the initial buffer
    /// count; everything else defaults (upfront mode, driver-managed
    /// memory, no metadata plane).
    pub fn new(plane_lens: Vec<usize>, requested: usize) -> Self {
        PoolInfo {
            plane_strides: vec![0; plane_lens.len()],
            plane_lens,
            requested,
            max: requested,
            kind: BufferKind::default(),
            mode: AllocMode::default(),
            meta_plane: false,
            need_map: false,
        }
    }

    pub fn with_mode(mut self, mode: AllocMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max(mut self, max: usize) -> Self {
        self.max = max;
        self
    }

    pub fn with_kind(mut self, kind: BufferKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_strides(mut self, strides: Vec<usize>) -> Self {
        self.plane_strides = strides;
        self
    }

    /// Appends the fixed-size per-frame metadata plane.
    pub fn with_meta_plane(mut self) -> Self {
        self.meta_plane = true;
        self
    }

    /// Requests CPU mappability validation at allocation time.
    pub fn with_cpu_mapping(mut self) -> Self {
        self.need_map = true;
        self
    }

    /// Per-plane lengths including the metadata plane when configured.
    fn total_lens(&self) -> Vec<usize> {
        let mut lens = self.plane_lens.clone();
        if self.meta_plane {
            lens.push(META_PLANE_LEN);
        }
        lens
    }

    fn validate(&self) -> Result<()> {
        let image_limit = if self.meta_plane {
            MAX_PLANES - 1
        } else {
            MAX_PLANES
        };
        if self.plane_lens.is_empty() || self.plane_lens.len() > image_limit {
            return Err(Error::BadValue(format!(
                "plane count {} out of range 1..={}",
                self.plane_lens.len(),
                image_limit
            )));
        }
        if let Some(len) = self.plane_lens.iter().find(|&&l| l == 0) {
            return Err(Error::BadValue(format!("plane length {} must be > 0", len)));
        }
        if self.plane_strides.len() != self.plane_lens.len() {
            return Err(Error::BadValue(format!(
                "{} strides for {} planes",
                self.plane_strides.len(),
                self.plane_lens.len()
            )));
        }
        if self.requested == 0 || self.requested > MAX_BUFFERS {
            return Err(Error::BadValue(format!(
                "buffer count {} out of range 1..={}",
                self.requested, MAX_BUFFERS
            )));
        }
        Ok(())
    }

    /// Clamps the maximum to at least the requested count and at most the
    /// pool capacity.
    fn clamped(mut self) -> Self {
        self.max = self.max.max(self.requested).min(MAX_BUFFERS);
        self
    }
}

/// Counters exposed for tooling and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub leases: u64,
    pub returns: u64,
    pub grows: u64,
}

/// Orchestrator-facing pool contract shared by [`BufferManager`] and the
/// display-surface pool.
pub trait BufferPool: Send + Sync {
    /// Leases a buffer, preferring `want` when it names an available slot.
    fn get_buffer(&self, want: Option<usize>, position: Position) -> Result<Buffer>;

    /// Returns a leased buffer to the pool. Idempotent against
    /// double-return.
    fn put_buffer(&self, index: usize, position: Position) -> Result<()>;

    /// Returns a buffer that was never used. Idempotent.
    fn cancel_buffer(&self, index: usize) -> Result<()>;

    /// Number of buffers free for leasing right now.
    fn available_count(&self) -> usize;
}

struct Slot {
    memory: crate::alloc::SlotMemory,
    status: BufferStatus,
}

struct PoolState {
    backend: Box<dyn PoolBackend>,
    info: Option<PoolInfo>,
    slots: Vec<Slot>,
    epoch: u32,
    allocated: bool,
    skip_next_alloc: bool,
    stats: PoolStats,
}

/// Fixed-capacity buffer pool over a pluggable memory provider.
pub struct BufferManager {
    name: String,
    pool: Mutex<PoolState>,
    avail: Mutex<VecDeque<usize>>,
    grower: Mutex<Option<thread::JoinHandle<()>>>,
    grow_stop: Arc<AtomicBool>,
}

impl BufferManager {
    pub fn new(name: &str, backend: Box<dyn PoolBackend>) -> Arc<Self> {
        Arc::new(BufferManager {
            name: name.to_string(),
            pool: Mutex::new(PoolState {
                backend,
                info: None,
                slots: Vec::new(),
                epoch: 0,
                allocated: false,
                skip_next_alloc: false,
                stats: PoolStats::default(),
            }),
            avail: Mutex::new(VecDeque::new()),
            grower: Mutex::new(None),
            grow_stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Validates and stores the pool configuration.
    ///
    /// Rejected with [`Error::BadValue`] before touching any memory;
    /// rejected with [`Error::InvalidOperation`] while the pool is
    /// allocated.
    pub fn set_info(&self, info: PoolInfo) -> Result<()> {
        info.validate()?;
        let mut pool = lock(&self.pool);
        if pool.allocated {
            return Err(Error::InvalidOperation(format!(
                "{}: cannot reconfigure an allocated pool",
                self.name
            )));
        }
        pool.info = Some(info.clamped());
        Ok(())
    }

    /// Allocates the initial buffer batch according to the configured mode.
    ///
    /// The first call after [`BufferManager::reset_buffers`] is silently
    /// skipped so a logical reset stays cheap.
    pub fn alloc(self: &Arc<Self>) -> Result<()> {
        let (count, spawn_grower) = {
            let mut pool = lock(&self.pool);
            if pool.skip_next_alloc {
                pool.skip_next_alloc = false;
                log::debug!("{}: alloc skipped after logical reset", self.name);
                return Ok(());
            }
            if pool.allocated {
                log::warn!("{}: alloc called on an allocated pool", self.name);
                return Ok(());
            }
            let info = pool
                .info
                .clone()
                .ok_or_else(|| {
                    Error::InvalidOperation(format!("{}: alloc before set_info", self.name))
                })?;

            let lens = info.total_lens();
            let batch = pool.backend.allocate(&lens, info.requested)?;
            for memory in batch {
                pool.slots.push(Slot {
                    memory,
                    status: BufferStatus {
                        position: Position::Unbound,
                        permission: Permission::Available,
                    },
                });
            }
            pool.allocated = true;

            if info.need_map {
                // Catch unmappable providers now rather than on the first
                // metadata stamp in the streaming path.
                let probe = Self::descriptor(&pool, 0, &info)?;
                probe.map_plane(0)?;
            }

            log::info!(
                "{}: allocated {} buffers ({} mode, max {})",
                self.name,
                info.requested,
                match info.mode {
                    AllocMode::Upfront => "upfront",
                    AllocMode::OnDemand => "on-demand",
                    AllocMode::Background => "background",
                },
                info.max
            );
            (
                pool.slots.len(),
                info.mode == AllocMode::Background && info.max > info.requested,
            )
        };

        {
            let mut avail = lock(&self.avail);
            avail.clear();
            avail.extend(0..count);
        }

        if spawn_grower {
            self.spawn_grower()?;
        }
        Ok(())
    }

    /// Releases every slot and invalidates outstanding descriptors by
    /// bumping the allocation epoch. Safe to call after a failed `alloc`.
    pub fn free_buffers(&self) {
        self.stop_grower();
        let mut pool = lock(&self.pool);
        let slots: Vec<_> = pool.slots.drain(..).map(|s| s.memory).collect();
        if !slots.is_empty() {
            log::info!("{}: freeing {} buffers", self.name, slots.len());
        }
        pool.backend.release(slots);
        pool.allocated = false;
        pool.skip_next_alloc = false;
        pool.epoch = pool.epoch.wrapping_add(1);
        drop(pool);
        lock(&self.avail).clear();
    }

    /// Drains in-flight buffers logically: every slot becomes available
    /// again without releasing the underlying memory. The next `alloc()`
    /// call is skipped once.
    pub fn reset_buffers(&self) -> Result<()> {
        let count = {
            let mut pool = lock(&self.pool);
            if !pool.allocated {
                return Err(Error::InvalidOperation(format!(
                    "{}: reset on an unallocated pool",
                    self.name
                )));
            }
            for slot in pool.slots.iter_mut() {
                slot.status = BufferStatus {
                    position: Position::Unbound,
                    permission: Permission::Available,
                };
            }
            pool.skip_next_alloc = true;
            pool.slots.len()
        };
        let mut avail = lock(&self.avail);
        avail.clear();
        avail.extend(0..count);
        log::debug!("{}: reset {} buffers to available", self.name, count);
        Ok(())
    }

    pub fn is_allocated(&self) -> bool {
        lock(&self.pool).allocated
    }

    pub fn allocated_count(&self) -> usize {
        lock(&self.pool).slots.len()
    }

    pub fn stats(&self) -> PoolStats {
        lock(&self.pool).stats
    }

    /// Returns a leased descriptor after checking it against the current
    /// allocation epoch, catching stale-index bugs at the boundary.
    pub fn return_buffer(&self, buffer: &Buffer) -> Result<()> {
        {
            let pool = lock(&self.pool);
            if buffer.epoch() != pool.epoch {
                return Err(Error::BadValue(format!(
                    "{}: stale buffer {} (epoch {} != {})",
                    self.name,
                    buffer.index(),
                    buffer.epoch(),
                    pool.epoch
                )));
            }
        }
        self.put_buffer(buffer.index(), Position::Unbound)
    }

    fn descriptor(pool: &PoolState, index: usize, info: &PoolInfo) -> Result<Buffer> {
        let slot = pool
            .slots
            .get(index)
            .ok_or_else(|| Error::BadValue(format!("slot {} out of range", index)))?;
        let mut buffer = Buffer::new(index, pool.epoch, info.kind);
        for (i, mem) in slot.memory.planes.iter().enumerate() {
            buffer.push_plane(Plane {
                fd: mem.raw_fd(),
                len: mem.len,
                stride: info.plane_strides.get(i).copied().unwrap_or(0),
                offset: mem.offset,
            })?;
        }
        if info.meta_plane {
            buffer.set_meta_plane();
        }
        buffer.status = slot.status;
        Ok(buffer)
    }

    /// Grows the pool by one slot for a lease that found the queue empty.
    /// The new index is known to no other thread, so the caller may lease
    /// it without re-queueing.
    fn grow_for_lease(&self) -> Result<usize> {
        let mut pool = lock(&self.pool);
        let info = pool
            .info
            .clone()
            .ok_or_else(|| Error::InvalidOperation(format!("{}: unconfigured pool", self.name)))?;
        if info.mode == AllocMode::Upfront {
            return Err(Error::NoBuffer);
        }
        if pool.slots.len() >= info.max {
            return Err(Error::NoBuffer);
        }
        let lens = info.total_lens();
        let batch = pool.backend.allocate(&lens, 1)?;
        for memory in batch {
            pool.slots.push(Slot {
                memory,
                status: BufferStatus {
                    position: Position::Unbound,
                    permission: Permission::Available,
                },
            });
        }
        pool.stats.grows += 1;
        let index = pool.slots.len() - 1;
        log::debug!(
            "{}: grew pool to {} buffers on lease miss",
            self.name,
            pool.slots.len()
        );
        Ok(index)
    }

    /// One background-growth iteration. Returns false when the pool is at
    /// its maximum (or gone).
    fn grow_one_background(&self) -> Result<bool> {
        let index = {
            let mut pool = lock(&self.pool);
            let Some(info) = pool.info.clone() else {
                return Ok(false);
            };
            if !pool.allocated || pool.slots.len() >= info.max {
                return Ok(false);
            }
            let lens = info.total_lens();
            let batch = pool.backend.allocate(&lens, 1)?;
            for memory in batch {
                pool.slots.push(Slot {
                    memory,
                    status: BufferStatus {
                        position: Position::Unbound,
                        permission: Permission::Available,
                    },
                });
            }
            pool.stats.grows += 1;
            pool.slots.len() - 1
        };
        lock(&self.avail).push_back(index);
        Ok(true)
    }

    fn spawn_grower(self: &Arc<Self>) -> Result<()> {
        let weak: Weak<BufferManager> = Arc::downgrade(self);
        let stop = self.grow_stop.clone();
        stop.store(false, Ordering::Relaxed);
        let name = format!("{}-grow", self.name);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || loop {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let Some(mgr) = weak.upgrade() else { break };
                match mgr.grow_one_background() {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        log::warn!("background pool growth stopped: {}", e);
                        break;
                    }
                }
                // Keep the pool mutex mostly free for the leasing path.
                thread::sleep(Duration::from_millis(1));
            })
            .map_err(Error::Io)?;
        *lock(&self.grower) = Some(handle);
        log::debug!("{}: background growth worker started", name);
        Ok(())
    }

    fn stop_grower(&self) {
        self.grow_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = lock(&self.grower).take() {
            // The worker itself can trigger teardown by dropping the last
            // strong reference; it must not join its own handle.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    #[cfg(test)]
    fn permission_counts(&self) -> (usize, usize) {
        let pool = lock(&self.pool);
        let available = pool
            .slots
            .iter()
            .filter(|s| s.status.permission == Permission::Available)
            .count();
        let in_process = pool
            .slots
            .iter()
            .filter(|s| s.status.permission == Permission::InProcess)
            .count();
        (available, in_process)
    }
}

impl BufferPool for BufferManager {
    fn get_buffer(&self, want: Option<usize>, position: Position) -> Result<Buffer> {
        let popped = {
            let mut avail = lock(&self.avail);
            match want {
                Some(idx) => match avail.iter().position(|&i| i == idx) {
                    Some(at) => avail.remove(at),
                    None => avail.pop_front(),
                },
                None => avail.pop_front(),
            }
        };

        let index = match popped {
            Some(index) => index,
            None => self.grow_for_lease().map_err(|e| {
                if matches!(e, Error::NoBuffer) {
                    log::warn!("{}: no buffer available", self.name);
                }
                e
            })?,
        };

        let mut pool = lock(&self.pool);
        let info = pool
            .info
            .clone()
            .ok_or_else(|| Error::InvalidOperation(format!("{}: unconfigured pool", self.name)))?;
        let slot = pool
            .slots
            .get_mut(index)
            .ok_or_else(|| Error::BadValue(format!("slot {} out of range", index)))?;
        if slot.status.permission == Permission::InProcess {
            // The available queue and slot status disagree; refusing the
            // lease keeps custody single-owner.
            return Err(Error::InvalidOperation(format!(
                "{}: slot {} already leased",
                self.name, index
            )));
        }
        slot.status = BufferStatus {
            position,
            permission: Permission::InProcess,
        };
        pool.stats.leases += 1;
        Self::descriptor(&pool, index, &info)
    }

    fn put_buffer(&self, index: usize, position: Position) -> Result<()> {
        {
            let mut pool = lock(&self.pool);
            let slot = pool
                .slots
                .get_mut(index)
                .ok_or_else(|| Error::BadValue(format!("slot {} out of range", index)))?;
            if slot.status.permission == Permission::Available {
                log::warn!("{}: buffer {} returned twice", self.name, index);
                return Ok(());
            }
            slot.status = BufferStatus {
                position,
                permission: Permission::Available,
            };
            pool.stats.returns += 1;
        }
        lock(&self.avail).push_back(index);
        Ok(())
    }

    fn cancel_buffer(&self, index: usize) -> Result<()> {
        self.put_buffer(index, Position::Unbound)
    }

    fn available_count(&self) -> usize {
        lock(&self.avail).len()
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        self.stop_grower();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::HeapBackend;
    use std::time::Instant;

    fn manager(info: PoolInfo) -> Arc<BufferManager> {
        let mgr = BufferManager::new("test", Box::new(HeapBackend::new()));
        mgr.set_info(info).unwrap();
        mgr
    }

    #[test]
    fn test_upfront_pool_exhaustion() {
        // 4 buffers, planes {6144, 2048}, everything up front.
        let mgr = manager(PoolInfo::new(vec![6144, 2048], 4));
        mgr.alloc().unwrap();
        assert!(mgr.is_allocated());
        assert_eq!(mgr.available_count(), 4);

        let mut leased = Vec::new();
        for _ in 0..4 {
            leased.push(mgr.get_buffer(None, Position::Hal).unwrap());
        }
        assert_eq!(mgr.available_count(), 0);
        assert!(matches!(
            mgr.get_buffer(None, Position::Hal),
            Err(Error::NoBuffer)
        ));
    }

    #[test]
    fn test_on_demand_growth() {
        // Requested 2, max 4; the third lease grows by one.
        let mgr = manager(
            PoolInfo::new(vec![4096], 2)
                .with_mode(AllocMode::OnDemand)
                .with_max(4),
        );
        mgr.alloc().unwrap();
        assert_eq!(mgr.allocated_count(), 2);

        let a = mgr.get_buffer(None, Position::Hal).unwrap();
        let b = mgr.get_buffer(None, Position::Hal).unwrap();
        let c = mgr.get_buffer(None, Position::Hal).unwrap();
        assert_eq!(mgr.allocated_count(), 3);
        assert_eq!(mgr.stats().grows, 1);

        for buf in [&a, &b, &c] {
            mgr.put_buffer(buf.index(), Position::Unbound).unwrap();
        }
        assert_eq!(mgr.available_count(), 3);
    }

    #[test]
    fn test_growth_stops_at_max() {
        let mgr = manager(
            PoolInfo::new(vec![1024], 2)
                .with_mode(AllocMode::OnDemand)
                .with_max(4),
        );
        mgr.alloc().unwrap();

        let mut leased = Vec::new();
        for _ in 0..4 {
            leased.push(mgr.get_buffer(None, Position::Hal).unwrap());
        }
        assert_eq!(mgr.allocated_count(), 4);
        assert!(matches!(
            mgr.get_buffer(None, Position::Hal),
            Err(Error::NoBuffer)
        ));
        // Existing slots unharmed by the failed grow.
        assert_eq!(mgr.allocated_count(), 4);
        for buf in &leased {
            assert_eq!(buf.planes()[0].len, 1024);
        }
    }

    #[test]
    fn test_lease_exclusivity_and_conservation() {
        let mgr = manager(PoolInfo::new(vec![2048], 6));
        mgr.alloc().unwrap();

        let mut seen = std::collections::HashSet::new();
        let mut leased = Vec::new();
        for _ in 0..6 {
            let buf = mgr.get_buffer(None, Position::Device).unwrap();
            assert!(seen.insert(buf.index()), "index leased twice");
            leased.push(buf);

            let (available, in_process) = mgr.permission_counts();
            assert_eq!(available + in_process, mgr.allocated_count());
        }

        for buf in leased.drain(..) {
            mgr.put_buffer(buf.index(), Position::Unbound).unwrap();
            let (available, in_process) = mgr.permission_counts();
            assert_eq!(available + in_process, mgr.allocated_count());
        }
        assert_eq!(mgr.available_count(), 6);
    }

    #[test]
    fn test_requested_index_preferred() {
        let mgr = manager(PoolInfo::new(vec![1024], 4));
        mgr.alloc().unwrap();

        let buf = mgr.get_buffer(Some(2), Position::Hal).unwrap();
        assert_eq!(buf.index(), 2);
        mgr.put_buffer(2, Position::Unbound).unwrap();

        // A taken index falls back to the queue head.
        let first = mgr.get_buffer(Some(0), Position::Hal).unwrap();
        assert_eq!(first.index(), 0);
        let other = mgr.get_buffer(Some(0), Position::Hal).unwrap();
        assert_ne!(other.index(), 0);
    }

    #[test]
    fn test_double_return_is_noop() {
        let mgr = manager(PoolInfo::new(vec![1024], 2));
        mgr.alloc().unwrap();

        let buf = mgr.get_buffer(None, Position::Hal).unwrap();
        mgr.cancel_buffer(buf.index()).unwrap();
        mgr.cancel_buffer(buf.index()).unwrap();
        // No phantom queue entry from the second return.
        assert_eq!(mgr.available_count(), 2);
        let a = mgr.get_buffer(None, Position::Hal).unwrap();
        let b = mgr.get_buffer(None, Position::Hal).unwrap();
        assert_ne!(a.index(), b.index());
        assert!(matches!(
            mgr.get_buffer(None, Position::Hal),
            Err(Error::NoBuffer)
        ));
    }

    #[test]
    fn test_reset_skips_next_alloc() {
        let mgr = manager(PoolInfo::new(vec![1024], 3));
        mgr.alloc().unwrap();
        let _leased = mgr.get_buffer(None, Position::Device).unwrap();
        assert_eq!(mgr.available_count(), 2);

        mgr.reset_buffers().unwrap();
        assert_eq!(mgr.available_count(), 3);
        // The paired alloc() of the re-configure path is a no-op.
        mgr.alloc().unwrap();
        assert_eq!(mgr.allocated_count(), 3);
        // Only once: the flag is one-shot.
        mgr.alloc().unwrap();
        assert_eq!(mgr.allocated_count(), 3);
    }

    #[test]
    fn test_stale_epoch_rejected() {
        let mgr = manager(PoolInfo::new(vec![1024], 2));
        mgr.alloc().unwrap();
        let stale = mgr.get_buffer(None, Position::Hal).unwrap();

        mgr.free_buffers();
        mgr.alloc().unwrap();
        assert!(matches!(mgr.return_buffer(&stale), Err(Error::BadValue(_))));
    }

    #[test]
    fn test_set_info_validation() {
        let mgr = BufferManager::new("test", Box::new(HeapBackend::new()));
        assert!(matches!(
            mgr.set_info(PoolInfo::new(vec![], 2)),
            Err(Error::BadValue(_))
        ));
        assert!(matches!(
            mgr.set_info(PoolInfo::new(vec![1024, 0], 2)),
            Err(Error::BadValue(_))
        ));
        assert!(matches!(
            mgr.set_info(PoolInfo::new(vec![1024], 0)),
            Err(Error::BadValue(_))
        ));
        assert!(matches!(
            mgr.set_info(PoolInfo::new(vec![1024], MAX_BUFFERS + 1)),
            Err(Error::BadValue(_))
        ));
        // Metadata plane shrinks the image-plane budget by one.
        assert!(matches!(
            mgr.set_info(PoolInfo::new(vec![1; MAX_PLANES], 2).with_meta_plane()),
            Err(Error::BadValue(_))
        ));
        assert!(mgr.set_info(PoolInfo::new(vec![1024], 2).with_max(1)).is_ok());
    }

    #[test]
    fn test_alloc_without_info_fails() {
        let mgr = BufferManager::new("test", Box::new(HeapBackend::new()));
        assert!(matches!(mgr.alloc(), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_meta_plane_appended() {
        let mgr = manager(PoolInfo::new(vec![4096], 2).with_meta_plane().with_cpu_mapping());
        mgr.alloc().unwrap();
        let buf = mgr.get_buffer(None, Position::Hal).unwrap();
        assert_eq!(buf.plane_count(), 2);
        assert_eq!(buf.meta_plane().unwrap().len, META_PLANE_LEN);
        let map = buf.map_meta_plane().unwrap();
        assert_eq!(map.len(), META_PLANE_LEN);
    }

    #[test]
    fn test_background_growth_fills_to_max() {
        let mgr = manager(
            PoolInfo::new(vec![1024], 1)
                .with_mode(AllocMode::Background)
                .with_max(4),
        );
        mgr.alloc().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while mgr.allocated_count() < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(mgr.allocated_count(), 4);
        assert_eq!(mgr.available_count(), 4);

        // Growth and leasing shared the pool mutex; leases still work.
        let buf = mgr.get_buffer(None, Position::Hal).unwrap();
        mgr.put_buffer(buf.index(), Position::Unbound).unwrap();
    }

    #[test]
    fn test_randomized_lease_return_conservation() {
        use rand::Rng;

        let mgr = manager(
            PoolInfo::new(vec![512], 4)
                .with_mode(AllocMode::OnDemand)
                .with_max(8),
        );
        mgr.alloc().unwrap();

        let mut rng = rand::rng();
        let mut held: Vec<Buffer> = Vec::new();
        for _ in 0..500 {
            if held.is_empty() || (held.len() < 8 && rng.random_range(0..2) == 0) {
                match mgr.get_buffer(None, Position::Hal) {
                    Ok(buf) => {
                        assert!(
                            held.iter().all(|h| h.index() != buf.index()),
                            "index {} leased twice",
                            buf.index()
                        );
                        held.push(buf);
                    }
                    Err(Error::NoBuffer) => {}
                    Err(e) => panic!("unexpected lease failure: {}", e),
                }
            } else {
                let buf = held.swap_remove(rng.random_range(0..held.len()));
                mgr.put_buffer(buf.index(), Position::Unbound).unwrap();
            }
            let (available, in_process) = mgr.permission_counts();
            assert_eq!(available + in_process, mgr.allocated_count());
            assert_eq!(in_process, held.len());
        }
    }

    #[test]
    fn test_multi_mode_backend() {
        let mgr = BufferManager::new("multi", Box::new(HeapBackend::multi()));
        mgr.set_info(PoolInfo::new(vec![2048, 1024], 3)).unwrap();
        mgr.alloc().unwrap();
        let a = mgr.get_buffer(None, Position::Hal).unwrap();
        let b = mgr.get_buffer(None, Position::Hal).unwrap();
        // One shared descriptor, distinct plane windows.
        assert_eq!(a.planes()[0].fd, b.planes()[0].fd);
        assert_ne!(a.planes()[0].offset, b.planes()[0].offset);
    }
}
