// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Per-request frame object.
//!
//! A [`Frame`] is one capture request traveling through a topology: one
//! [`Entity`] per participating pipe, the producer/consumer edges between
//! them, the stored region-of-interest groups and the shot metadata
//! snapshot. Frames are shared (`Arc`) between the factory and the pipe
//! workers; all mutable state sits behind an internal mutex.
//!
//! A frame is done once every entity that counts toward the request has
//! completed. Entities completing with a device error mark the frame
//! invalid but still complete it, so a consumer drops the output instead
//! of stalling the pipeline.

use crate::buffer::Buffer;
use crate::meta::{NodeGroup, ShotMeta};
use crate::pipe::PipeId;
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-pipe progress of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntityState {
    /// Not yet seen by the pipe.
    #[default]
    Idle,
    /// Popped from the input queue, buffer bound.
    Queued,
    /// Submitted to the device.
    Processing,
    /// Completed (possibly invalid).
    Done,
}

/// How an entity obtains its output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferPolicy {
    /// The buffer is bound before the frame enters the pipe.
    #[default]
    Bound,
    /// The pipe leases a buffer from its pool at submit time.
    OnRequest,
}

/// One pipe's view of a frame.
#[derive(Debug, Clone, Default)]
pub struct Entity {
    pub pipe: PipeId,
    /// Producing pipe this entity consumes from; `None` for graph roots.
    pub parent: Option<PipeId>,
    /// Whether completion of this entity counts toward the request.
    pub counted: bool,
    pub policy: BufferPolicy,
    pub state: EntityState,
    pub invalid: bool,
    pub src: Option<Buffer>,
    pub dst: Option<Buffer>,
}

impl Entity {
    pub fn new(pipe: PipeId, parent: Option<PipeId>, counted: bool, policy: BufferPolicy) -> Self {
        Entity {
            pipe,
            parent,
            counted,
            policy,
            ..Default::default()
        }
    }
}

struct FrameInner {
    entities: Vec<Entity>,
    result_count: usize,
    invalid: bool,
    node_groups: HashMap<PipeId, NodeGroup>,
    shot: ShotMeta,
}

/// One capture request's routing and state.
pub struct Frame {
    count: u32,
    request_count: usize,
    inner: Mutex<FrameInner>,
}

impl Frame {
    pub fn new(count: u32, entities: Vec<Entity>, shot: ShotMeta) -> Self {
        let request_count = entities.iter().filter(|e| e.counted).count();
        Frame {
            count,
            request_count,
            inner: Mutex::new(FrameInner {
                entities,
                result_count: 0,
                invalid: false,
                node_groups: HashMap::new(),
                shot,
            }),
        }
    }

    /// Monotonic frame number within its factory.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Entities that must complete before the frame is done.
    pub fn request_count(&self) -> usize {
        self.request_count
    }

    pub fn entities(&self) -> Vec<Entity> {
        lock(&self.inner).entities.clone()
    }

    pub fn entity(&self, pipe: PipeId) -> Option<Entity> {
        lock(&self.inner)
            .entities
            .iter()
            .find(|e| e.pipe == pipe)
            .cloned()
    }

    pub fn parent_of(&self, pipe: PipeId) -> Option<PipeId> {
        lock(&self.inner)
            .entities
            .iter()
            .find(|e| e.pipe == pipe)
            .and_then(|e| e.parent)
    }

    fn with_entity<R>(&self, pipe: PipeId, f: impl FnOnce(&mut Entity) -> R) -> Result<R> {
        let mut inner = lock(&self.inner);
        let entity = inner
            .entities
            .iter_mut()
            .find(|e| e.pipe == pipe)
            .ok_or_else(|| {
                Error::BadValue(format!("frame {} has no entity for {}", self.count, pipe))
            })?;
        Ok(f(entity))
    }

    pub fn set_src_buffer(&self, pipe: PipeId, buffer: Buffer) -> Result<()> {
        self.with_entity(pipe, |e| e.src = Some(buffer))
    }

    pub fn set_dst_buffer(&self, pipe: PipeId, buffer: Buffer) -> Result<()> {
        self.with_entity(pipe, |e| e.dst = Some(buffer))
    }

    pub fn src_buffer(&self, pipe: PipeId) -> Option<Buffer> {
        self.entity(pipe).and_then(|e| e.src)
    }

    pub fn dst_buffer(&self, pipe: PipeId) -> Option<Buffer> {
        self.entity(pipe).and_then(|e| e.dst)
    }

    pub fn entity_state(&self, pipe: PipeId) -> Option<EntityState> {
        self.entity(pipe).map(|e| e.state)
    }

    pub fn set_entity_state(&self, pipe: PipeId, state: EntityState) -> Result<()> {
        self.with_entity(pipe, |e| e.state = state)
    }

    /// Completes one entity and returns whether the whole frame is done.
    ///
    /// Invalid completions poison the frame but still count: downstream
    /// consumers must observe a finished (if unusable) frame rather than
    /// wait forever.
    pub fn entity_done(&self, pipe: PipeId, valid: bool) -> Result<bool> {
        let mut inner = lock(&self.inner);
        let count = self.count;
        let entity = inner
            .entities
            .iter_mut()
            .find(|e| e.pipe == pipe)
            .ok_or_else(|| Error::BadValue(format!("frame {} has no entity for {}", count, pipe)))?;

        let first_completion = entity.state != EntityState::Done;
        entity.state = EntityState::Done;
        if !valid {
            entity.invalid = true;
        }
        let counted = entity.counted;

        if !valid {
            inner.invalid = true;
        }
        if first_completion && counted {
            inner.result_count += 1;
        } else if !first_completion {
            log::warn!("frame {}: duplicate completion from {}", count, pipe);
        }
        Ok(inner.result_count >= self.request_count)
    }

    pub fn done(&self) -> bool {
        lock(&self.inner).result_count >= self.request_count
    }

    pub fn mark_invalid(&self) {
        lock(&self.inner).invalid = true;
    }

    pub fn is_invalid(&self) -> bool {
        lock(&self.inner).invalid
    }

    pub fn shot(&self) -> ShotMeta {
        lock(&self.inner).shot
    }

    pub fn set_shot(&self, shot: ShotMeta) {
        lock(&self.inner).shot = shot;
    }

    pub fn update_shot(&self, f: impl FnOnce(&mut ShotMeta)) {
        f(&mut lock(&self.inner).shot);
    }

    pub fn store_node_group(&self, pipe: PipeId, group: NodeGroup) {
        lock(&self.inner).node_groups.insert(pipe, group);
    }

    pub fn node_group(&self, pipe: PipeId) -> Option<NodeGroup> {
        lock(&self.inner).node_groups.get(&pipe).cloned()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("Frame")
            .field("count", &self.count)
            .field("request_count", &self.request_count)
            .field("result_count", &inner.result_count)
            .field("invalid", &inner.invalid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Buffer, BufferKind};

    fn frame() -> Frame {
        Frame::new(
            7,
            vec![
                Entity::new(PipeId::Sensor, None, true, BufferPolicy::OnRequest),
                Entity::new(PipeId::Isp, Some(PipeId::Sensor), true, BufferPolicy::Bound),
                Entity::new(PipeId::Jpeg, Some(PipeId::Isp), false, BufferPolicy::Bound),
            ],
            ShotMeta::default(),
        )
    }

    #[test]
    fn test_request_count_from_counted_entities() {
        let frame = frame();
        assert_eq!(frame.request_count(), 2);
        assert_eq!(frame.parent_of(PipeId::Isp), Some(PipeId::Sensor));
        assert_eq!(frame.parent_of(PipeId::Sensor), None);
    }

    #[test]
    fn test_done_accounting() {
        let frame = frame();
        assert!(!frame.entity_done(PipeId::Sensor, true).unwrap());
        assert!(!frame.done());
        // The uncounted entity completing does not finish the frame.
        assert!(!frame.entity_done(PipeId::Jpeg, true).unwrap());
        assert!(frame.entity_done(PipeId::Isp, true).unwrap());
        assert!(frame.done());
        assert!(!frame.is_invalid());
    }

    #[test]
    fn test_duplicate_completion_counts_once() {
        let frame = frame();
        frame.entity_done(PipeId::Sensor, true).unwrap();
        frame.entity_done(PipeId::Sensor, true).unwrap();
        assert!(!frame.done());
    }

    #[test]
    fn test_invalid_completion_poisons_frame() {
        let frame = frame();
        frame.entity_done(PipeId::Sensor, false).unwrap();
        assert!(frame.is_invalid());
        assert_eq!(
            frame.entity(PipeId::Sensor).unwrap().state,
            EntityState::Done
        );
        assert!(frame.entity(PipeId::Sensor).unwrap().invalid);
        // The frame still completes so consumers can drop it.
        assert!(frame.entity_done(PipeId::Isp, true).unwrap());
    }

    #[test]
    fn test_buffer_binding() {
        let frame = frame();
        let buf = Buffer::new(3, 0, BufferKind::DriverManaged);
        frame.set_dst_buffer(PipeId::Isp, buf).unwrap();
        assert_eq!(frame.dst_buffer(PipeId::Isp).unwrap().index(), 3);
        assert!(frame.dst_buffer(PipeId::Sensor).is_none());
        assert!(frame
            .set_dst_buffer(PipeId::ScalerPreview, Buffer::default())
            .is_err());
    }
}
