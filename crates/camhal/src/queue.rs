// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Inter-stage frame handoff.
//!
//! Each pipeline stage pops frames from its own [`FrameQueue`] and pushes
//! into the next stage's queue (or the terminal output queue). Pushing
//! never blocks - the queue grows - while popping blocks with a timeout so
//! worker threads stay responsive. A wake sentinel unblocks a waiting
//! consumer without delivering an item, which is how a stopping pipe
//! escapes the pop without waiting out the full timeout.

use crate::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Default pop timeout observed across the pipeline.
pub const DEFAULT_WAIT: Duration = Duration::from_millis(500);

enum Envelope<T> {
    Item(T),
    Wake,
}

/// Push side of a frame queue. Cheap to clone; both the frame factory and
/// the upstream stage hold one.
pub struct FrameSender<T> {
    tx: Sender<Envelope<T>>,
}

impl<T> Clone for FrameSender<T> {
    fn clone(&self) -> Self {
        FrameSender {
            tx: self.tx.clone(),
        }
    }
}

impl<T> FrameSender<T> {
    /// Enqueues an item. Never blocks.
    pub fn push(&self, item: T) -> Result<()> {
        self.tx
            .send(Envelope::Item(item))
            .map_err(|_| Error::InvalidOperation("frame queue closed".to_string()))
    }

    /// Unblocks one pending pop without delivering an item.
    pub fn wake(&self) {
        let _ = self.tx.send(Envelope::Wake);
    }
}

/// Blocking frame queue with timeout pop and wake sentinel.
pub struct FrameQueue<T> {
    tx: Sender<Envelope<T>>,
    rx: Receiver<Envelope<T>>,
}

impl<T> Default for FrameQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        FrameQueue { tx, rx }
    }

    pub fn sender(&self) -> FrameSender<T> {
        FrameSender {
            tx: self.tx.clone(),
        }
    }

    /// Enqueues an item. Never blocks.
    pub fn push(&self, item: T) -> Result<()> {
        self.sender().push(item)
    }

    /// Pops the next item, waiting up to `timeout`.
    ///
    /// Returns `Ok(None)` when a wake sentinel arrived instead of an item
    /// (callers re-check their stop flags) and [`Error::Timeout`] when the
    /// wait expired, which is a retry signal rather than an error.
    pub fn pop(&self, timeout: Duration) -> Result<Option<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(Envelope::Item(item)) => Ok(Some(item)),
            Ok(Envelope::Wake) => Ok(None),
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(Error::InvalidOperation(
                "frame queue closed".to_string(),
            )),
        }
    }

    /// Pops without waiting.
    pub fn try_pop(&self) -> Option<T> {
        while let Ok(envelope) = self.rx.try_recv() {
            if let Envelope::Item(item) = envelope {
                return Some(item);
            }
        }
        None
    }

    /// Items currently queued (wake sentinels included until consumed).
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Drops everything queued, returning how many items were discarded.
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        while let Ok(envelope) = self.rx.try_recv() {
            if matches!(envelope, Envelope::Item(_)) {
                dropped += 1;
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_push_pop_order() {
        let queue = FrameQueue::new();
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert_eq!(queue.pop(DEFAULT_WAIT).unwrap(), Some(1));
        assert_eq!(queue.pop(DEFAULT_WAIT).unwrap(), Some(2));
    }

    #[test]
    fn test_pop_timeout_is_retryable() {
        let queue: FrameQueue<u32> = FrameQueue::new();
        let start = Instant::now();
        let err = queue.pop(Duration::from_millis(20)).unwrap_err();
        assert!(err.is_retryable());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wake_unblocks_without_item() {
        let queue: FrameQueue<u32> = FrameQueue::new();
        let sender = queue.sender();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            sender.wake();
        });
        let start = Instant::now();
        assert_eq!(queue.pop(Duration::from_secs(5)).unwrap(), None);
        assert!(start.elapsed() < Duration::from_secs(1));
        waker.join().unwrap();
    }

    #[test]
    fn test_clear_counts_items_only() {
        let queue = FrameQueue::new();
        queue.push("a").unwrap();
        queue.push("b").unwrap();
        queue.sender().wake();
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_multiple_producers() {
        let queue = FrameQueue::new();
        let s1 = queue.sender();
        let s2 = queue.sender();
        let h1 = thread::spawn(move || s1.push(10).unwrap());
        let h2 = thread::spawn(move || s2.push(20).unwrap());
        h1.join().unwrap();
        h2.join().unwrap();
        let mut got = vec![
            queue.pop(DEFAULT_WAIT).unwrap().unwrap(),
            queue.pop(DEFAULT_WAIT).unwrap().unwrap(),
        ];
        got.sort();
        assert_eq!(got, vec![10, 20]);
    }
}
