// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Region-of-interest metadata and the crop chain.
//!
//! Every frame carries a node group: the crop/scale rectangles for the
//! pipeline leader (sensor-domain crop and bayer downscale) and for each
//! capture node (scaler output). The group is recomputed whenever the
//! pipeline zoom generation moves and stamped into the buffer's metadata
//! plane right before device submission, so a zoom change takes effect on
//! the next frame through the pipe instead of waiting for a fresh frame
//! from the orchestrator.

use crate::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Scalers in this pipeline upscale at most 4x per axis.
pub const MAX_SCALE_RATIO: u32 = 4;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Rectangle region inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    /// The left-most pixel offset for the rectangle
    pub x: i32,
    /// The top-most pixel offset for the rectangle
    pub y: i32,
    /// The width in pixels of the rectangle (end position is x+width)
    pub width: i32,
    /// The height in pixels of the rectangle (end position is y+height)
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Rect {
            x,
            y,
            width,
            height,
        }
    }

    pub fn size(&self) -> Size {
        Size {
            width: self.width.max(0) as u32,
            height: self.height.max(0) as u32,
        }
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rect({}, {}, {}x{})",
            self.x, self.y, self.width, self.height
        )
    }
}

/// Width x height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Size { width, height }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Crop pair of one pipeline node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeRect {
    /// Whether this node participates in the current request.
    pub request: bool,
    pub input: Rect,
    pub output: Rect,
}

/// Region-of-interest set for one trip through a topology: the leader's
/// sensor-domain crop chain plus one entry per capture node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeGroup {
    pub leader: NodeRect,
    pub captures: Vec<NodeRect>,
}

fn align2(v: u32) -> u32 {
    v & !1
}

/// Largest centered crop of `src` matching the aspect ratio of `target`,
/// aligned down to even pixel positions.
pub fn aspect_crop(src: Size, target: Size) -> Rect {
    if src.width == 0 || src.height == 0 || target.width == 0 || target.height == 0 {
        return Rect::default();
    }
    // Compare src.w/src.h with target.w/target.h without division.
    let lhs = src.width as u64 * target.height as u64;
    let rhs = target.width as u64 * src.height as u64;
    let (width, height) = if lhs > rhs {
        // Source is wider: pillarbox crop.
        let width = (rhs / target.height as u64) as u32;
        (align2(width), src.height)
    } else if lhs < rhs {
        // Source is taller: letterbox crop.
        let height = (src.width as u64 * target.height as u64 / target.width as u64) as u32;
        (src.width, align2(height))
    } else {
        (src.width, src.height)
    };
    let x = align2((src.width - width) / 2);
    let y = align2((src.height - height) / 2);
    Rect::new(x as i32, y as i32, width as i32, height as i32)
}

/// Shrinks `base` around its center by the zoom factor (percent, 100 =
/// no zoom), aligned to even positions.
pub fn zoom_crop(base: Rect, zoom_percent: u32) -> Rect {
    let zoom = zoom_percent.max(100);
    let width = align2((base.width as u64 * 100 / zoom as u64) as u32).max(2);
    let height = align2((base.height as u64 * 100 / zoom as u64) as u32).max(2);
    let x = base.x + align2((base.width as u32 - width) / 2) as i32;
    let y = base.y + align2((base.height as u32 - height) / 2) as i32;
    Rect::new(x, y, width as i32, height as i32)
}

/// Crop/scale pair of a capture node feeding `target` from `src`.
///
/// The input crop matches the target aspect; when the node would have to
/// upscale by more than [`MAX_SCALE_RATIO`] the input crop is widened (the
/// output is a hardware-fixed size and can never be clamped).
pub fn fit_scaler(src: Size, target: Size) -> NodeRect {
    let mut input = aspect_crop(src, target);
    let min_w = align2((target.width + MAX_SCALE_RATIO - 1) / MAX_SCALE_RATIO).max(2);
    let min_h = align2((target.height + MAX_SCALE_RATIO - 1) / MAX_SCALE_RATIO).max(2);
    if (input.width as u32) < min_w || (input.height as u32) < min_h {
        let width = min_w.min(src.width);
        let height = min_h.min(src.height);
        input = Rect::new(
            align2((src.width - width) / 2) as i32,
            align2((src.height - height) / 2) as i32,
            width as i32,
            height as i32,
        );
    }
    NodeRect {
        request: true,
        input,
        output: Rect::new(0, 0, target.width as i32, target.height as i32),
    }
}

/// Derives the full crop chain for the current parameters: sensor ->
/// bayer crop -> bayer downscale (leader) and the per-capture-node crops.
pub fn compute_node_group(state: &ParamState) -> NodeGroup {
    let bayer = aspect_crop(state.sensor, state.preview);
    let zoomed = zoom_crop(bayer, state.zoom_percent);

    // Bayer downscale only ever shrinks.
    let bds = Size::new(
        align2(state.preview.width.min(zoomed.width as u32)).max(2),
        align2(state.preview.height.min(zoomed.height as u32)).max(2),
    );

    let leader = NodeRect {
        request: true,
        input: zoomed,
        output: Rect::new(0, 0, bds.width as i32, bds.height as i32),
    };

    let captures = vec![fit_scaler(bds, state.preview), fit_scaler(bds, state.picture)];
    NodeGroup { leader, captures }
}

/// Live pipeline parameters shared between the orchestrator and the pipe
/// workers. Every mutation bumps the generation; pipes compare it against
/// the generation stored in a frame to trigger the fast-zoom recompute.
pub struct PipelineParams {
    state: Mutex<ParamState>,
    generation: AtomicU64,
}

/// Snapshot of the tunable pipeline parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamState {
    pub sensor: Size,
    pub preview: Size,
    pub picture: Size,
    pub zoom_percent: u32,
}

impl Default for ParamState {
    fn default() -> Self {
        ParamState {
            sensor: Size::new(2560, 1920),
            preview: Size::new(1280, 720),
            picture: Size::new(2560, 1920),
            zoom_percent: 100,
        }
    }
}

impl Default for PipelineParams {
    fn default() -> Self {
        PipelineParams {
            state: Mutex::new(ParamState::default()),
            generation: AtomicU64::new(0),
        }
    }
}

impl PipelineParams {
    pub fn with_state(state: ParamState) -> Self {
        PipelineParams {
            state: Mutex::new(state),
            generation: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> (ParamState, u64) {
        let state = *lock(&self.state);
        (state, self.generation())
    }

    /// Sets the zoom factor in percent (100..=400); returns the new
    /// generation.
    pub fn set_zoom(&self, percent: u32) -> u64 {
        let clamped = percent.clamp(100, 100 * MAX_SCALE_RATIO);
        lock(&self.state).zoom_percent = clamped;
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn set_sizes(&self, sensor: Size, preview: Size, picture: Size) -> u64 {
        {
            let mut state = lock(&self.state);
            state.sensor = sensor;
            state.preview = preview;
            state.picture = picture;
        }
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}

const SHOT_MAGIC: u32 = u32::from_le_bytes(*b"SHOT");

/// Per-frame capture metadata stamped into the buffer's metadata plane
/// before submission and read back after completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShotMeta {
    pub frame_count: u32,
    pub zoom_percent: u32,
    pub zoom_generation: u64,
    pub request_flags: u32,
    pub timestamp_ns: i64,
}

impl ShotMeta {
    /// Encoded length of a shot block.
    pub const LEN: usize = 32;

    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::LEN {
            return Err(Error::BadValue(format!(
                "metadata block too small: {} < {}",
                buf.len(),
                Self::LEN
            )));
        }
        buf[0..4].copy_from_slice(&SHOT_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.frame_count.to_le_bytes());
        buf[8..12].copy_from_slice(&self.zoom_percent.to_le_bytes());
        buf[12..20].copy_from_slice(&self.zoom_generation.to_le_bytes());
        buf[20..24].copy_from_slice(&self.request_flags.to_le_bytes());
        buf[24..32].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        Ok(())
    }

    pub fn read_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::BadValue("metadata block truncated".to_string()));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap_or_default());
        if magic != SHOT_MAGIC {
            return Err(Error::BadValue("metadata block magic mismatch".to_string()));
        }
        Ok(ShotMeta {
            frame_count: u32::from_le_bytes(buf[4..8].try_into().unwrap_or_default()),
            zoom_percent: u32::from_le_bytes(buf[8..12].try_into().unwrap_or_default()),
            zoom_generation: u64::from_le_bytes(buf[12..20].try_into().unwrap_or_default()),
            request_flags: u32::from_le_bytes(buf[20..24].try_into().unwrap_or_default()),
            timestamp_ns: i64::from_le_bytes(buf[24..32].try_into().unwrap_or_default()),
        })
    }
}

fn write_rect(buf: &mut [u8], rect: &Rect) {
    buf[0..4].copy_from_slice(&rect.x.to_le_bytes());
    buf[4..8].copy_from_slice(&rect.y.to_le_bytes());
    buf[8..12].copy_from_slice(&rect.width.to_le_bytes());
    buf[12..16].copy_from_slice(&rect.height.to_le_bytes());
}

fn read_rect(buf: &[u8]) -> Rect {
    Rect {
        x: i32::from_le_bytes(buf[0..4].try_into().unwrap_or_default()),
        y: i32::from_le_bytes(buf[4..8].try_into().unwrap_or_default()),
        width: i32::from_le_bytes(buf[8..12].try_into().unwrap_or_default()),
        height: i32::from_le_bytes(buf[12..16].try_into().unwrap_or_default()),
    }
}

impl NodeRect {
    const LEN: usize = 36;

    fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&u32::from(self.request).to_le_bytes());
        write_rect(&mut buf[4..20], &self.input);
        write_rect(&mut buf[20..36], &self.output);
    }

    fn read_from(buf: &[u8]) -> Self {
        NodeRect {
            request: u32::from_le_bytes(buf[0..4].try_into().unwrap_or_default()) != 0,
            input: read_rect(&buf[4..20]),
            output: read_rect(&buf[20..36]),
        }
    }
}

impl NodeGroup {
    /// Encoded length with `captures` capture nodes.
    pub fn encoded_len(captures: usize) -> usize {
        NodeRect::LEN + 4 + captures * NodeRect::LEN
    }

    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        let need = Self::encoded_len(self.captures.len());
        if buf.len() < need {
            return Err(Error::BadValue(format!(
                "node group block too small: {} < {}",
                buf.len(),
                need
            )));
        }
        self.leader.write_to(&mut buf[0..NodeRect::LEN]);
        let mut at = NodeRect::LEN;
        buf[at..at + 4].copy_from_slice(&(self.captures.len() as u32).to_le_bytes());
        at += 4;
        for capture in &self.captures {
            capture.write_to(&mut buf[at..at + NodeRect::LEN]);
            at += NodeRect::LEN;
        }
        Ok(())
    }

    pub fn read_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < NodeRect::LEN + 4 {
            return Err(Error::BadValue("node group block truncated".to_string()));
        }
        let leader = NodeRect::read_from(&buf[0..NodeRect::LEN]);
        let mut at = NodeRect::LEN;
        let count = u32::from_le_bytes(buf[at..at + 4].try_into().unwrap_or_default()) as usize;
        at += 4;
        if count > crate::MAX_PLANES * 2 || buf.len() < at + count * NodeRect::LEN {
            return Err(Error::BadValue("node group capture count invalid".to_string()));
        }
        let mut captures = Vec::with_capacity(count);
        for _ in 0..count {
            captures.push(NodeRect::read_from(&buf[at..at + NodeRect::LEN]));
            at += NodeRect::LEN;
        }
        Ok(NodeGroup { leader, captures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aspect_crop_wider_source() {
        // 4:3 sensor cropped for a 16:9 preview keeps the width.
        let crop = aspect_crop(Size::new(2560, 1920), Size::new(1280, 720));
        assert_eq!(crop, Rect::new(0, 240, 2560, 1440));
    }

    #[test]
    fn test_aspect_crop_taller_source() {
        let crop = aspect_crop(Size::new(1440, 1920), Size::new(1280, 720));
        assert_eq!(crop.width, 1440);
        assert_eq!(crop.height, 810 & !1);
        assert_eq!(crop.x, 0);
    }

    #[test]
    fn test_zoom_crop_halves_at_200() {
        let base = Rect::new(0, 240, 2560, 1440);
        let zoomed = zoom_crop(base, 200);
        assert_eq!(zoomed.width, 1280);
        assert_eq!(zoomed.height, 720);
        // Centered inside the base crop.
        assert_eq!(zoomed.x, 640);
        assert_eq!(zoomed.y, 240 + 360);
    }

    #[test]
    fn test_zoom_crop_clamps_below_100() {
        let base = Rect::new(0, 0, 640, 480);
        assert_eq!(zoom_crop(base, 50), base);
    }

    #[test]
    fn test_fit_scaler_caps_upscale() {
        // 64x36 source feeding 1280x720 would be a 20x upscale; the input
        // crop stays at the minimum the 4x limit allows.
        let node = fit_scaler(Size::new(64, 36), Size::new(1280, 720));
        assert!(node.input.width as u32 >= 1280 / MAX_SCALE_RATIO || node.input.width == 64);
        assert_eq!(node.output, Rect::new(0, 0, 1280, 720));

        // Comfortable downscale is a plain aspect crop.
        let node = fit_scaler(Size::new(1920, 1080), Size::new(1280, 720));
        assert_eq!(node.input, Rect::new(0, 0, 1920, 1080));
    }

    #[test]
    fn test_compute_node_group_default() {
        let group = compute_node_group(&ParamState::default());
        assert!(group.leader.request);
        assert_eq!(group.leader.input, Rect::new(0, 240, 2560, 1440));
        assert_eq!(group.leader.output.size(), Size::new(1280, 720));
        assert_eq!(group.captures.len(), 2);
        assert_eq!(group.captures[0].output.size(), Size::new(1280, 720));
    }

    #[test]
    fn test_params_generation_moves() {
        let params = PipelineParams::default();
        assert_eq!(params.generation(), 0);
        assert_eq!(params.set_zoom(150), 1);
        let (state, generation) = params.snapshot();
        assert_eq!(state.zoom_percent, 150);
        assert_eq!(generation, 1);
        // Zoom beyond the scaler limit is clamped.
        params.set_zoom(1000);
        assert_eq!(params.snapshot().0.zoom_percent, 400);
    }

    #[test]
    fn test_shot_meta_roundtrip() {
        let shot = ShotMeta {
            frame_count: 17,
            zoom_percent: 130,
            zoom_generation: 3,
            request_flags: 0b101,
            timestamp_ns: 1_234_567,
        };
        let mut buf = [0u8; 64];
        shot.write_to(&mut buf).unwrap();
        assert_eq!(ShotMeta::read_from(&buf).unwrap(), shot);
    }

    #[test]
    fn test_shot_meta_rejects_garbage() {
        let buf = [0u8; 64];
        assert!(ShotMeta::read_from(&buf).is_err());
        assert!(ShotMeta::read_from(&buf[..4]).is_err());
    }

    #[test]
    fn test_node_group_roundtrip() {
        let group = compute_node_group(&ParamState::default());
        let mut buf = vec![0u8; NodeGroup::encoded_len(group.captures.len())];
        group.write_to(&mut buf).unwrap();
        assert_eq!(NodeGroup::read_from(&buf).unwrap(), group);
    }
}
