// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Camera ISP Pipeline HAL
//!
//! Core library binding a camera service to a chain of kernel video-capture
//! devices (sensor front-end, 3A statistics engine, ISP, scalers, JPEG
//! encoder) through a narrow, V4L2-like device-node contract.
//!
//! The library is built around three subsystems:
//!
//! - **Buffer management** ([`manager::BufferManager`]) - fixed-capacity pools
//!   of multi-planar frame buffers with exclusive ownership transfer, backed
//!   by interchangeable memory providers (DMA heap, plain heap memory,
//!   display-compositor surfaces).
//! - **Pipeline stages** ([`pipe::Pipe`], [`pipe::DualPipe`]) - one worker
//!   thread per stage advancing frames through submit/reap cycles against a
//!   device node, with bounded in-flight accounting.
//! - **Frame graph** ([`factory::FrameFactory`]) - fixed topologies wiring
//!   stages into preview, still-capture/reprocessing, front-camera and
//!   vision graphs, stamping per-frame region-of-interest metadata.
//!
//! # Quick Start
//!
//! ```no_run
//! use camhal::factory::{FactoryFlags, FrameFactory, TopologyId};
//! use camhal::meta::PipelineParams;
//! use std::sync::Arc;
//!
//! let params = Arc::new(PipelineParams::default());
//! let mut factory = FrameFactory::with_sim_nodes(
//!     TopologyId::Preview,
//!     FactoryFlags::default(),
//!     params,
//! )?;
//! factory.init_pipes()?;
//! factory.prepare_pipes()?;
//! factory.start_pipes()?;
//! factory.start_threads()?;
//!
//! let frame = factory.create_frame()?;
//! factory.push_frame(frame)?;
//! # Ok::<(), camhal::Error>(())
//! ```

use std::{error, fmt, io};

/// Maximum number of planes carried by a single buffer, including the
/// optional metadata plane.
pub const MAX_PLANES: usize = 4;

/// Maximum number of buffer slots a single pool can hold.
pub const MAX_BUFFERS: usize = 32;

/// Fixed byte length of the metadata plane appended to image planes when a
/// pool is configured with per-frame metadata.
pub const META_PLANE_LEN: usize = 4096;

/// Error type for HAL operations
#[derive(Debug)]
pub enum Error {
    /// Argument validation failure (out-of-range plane counts, sizes, buffer
    /// counts, stale buffer epochs). Rejected before any allocation attempt.
    BadValue(String),

    /// Fatal configuration or invariant failure: device configure/start/stop
    /// errors, operations against an unconfigured pool, buffer-slot
    /// double-ownership.
    InvalidOperation(String),

    /// A blocking wait expired. Retryable: callers log and try again.
    Timeout,

    /// Buffer pool exhausted under a fixed allocation mode.
    NoBuffer,

    /// I/O error from underlying system calls (memfd, mmap, DMA heap)
    Io(io::Error),
}

impl Error {
    /// Whether the operation may simply be retried.
    ///
    /// Only queue/device wait expiry is retryable; everything else reflects
    /// state that will not improve on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::BadValue(msg) => write!(f, "bad value: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "invalid operation: {}", msg),
            Error::Timeout => write!(f, "operation timed out"),
            Error::NoBuffer => write!(f, "no buffer available"),
            Error::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// Convenience result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The alloc module provides the memory-provider backends for buffer pools.
pub mod alloc;

/// The buffer module provides the multi-planar buffer descriptor and its
/// status tags.
pub mod buffer;

/// The factory module wires pipeline stages into fixed frame-graph
/// topologies.
pub mod factory;

/// The fourcc module provides portable handling of fourcc codes.
pub mod fourcc;

/// The frame module provides the per-request frame object and its per-stage
/// entities.
pub mod frame;

/// The manager module provides the buffer pool with its allocation modes.
pub mod manager;

/// The meta module provides region-of-interest metadata and the crop chain.
pub mod meta;

/// The node module defines the device-node contract and the software
/// simulator used by tests and tooling.
pub mod node;

/// The pipe module provides the pipeline stage state machine and workers.
pub mod pipe;

/// The queue module provides the inter-stage frame handoff queue.
pub mod queue;

/// Get the HAL library version string
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }

    #[test]
    fn test_error_display() {
        let err = Error::BadValue("plane count 9".to_string());
        assert_eq!(format!("{}", err), "bad value: plane count 9");
        assert!(!err.is_retryable());
        assert!(Error::Timeout.is_retryable());
    }

    #[test]
    fn test_error_from_io() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::Io(_)));
    }
}
