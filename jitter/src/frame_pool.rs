//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use log::*;

use crate::frame_buffer::FrameBuffer;

/// Recycled frame buffers. Grows lazily up to a hard cap and never shrinks, so steady state
/// operation allocates nothing.
#[derive(Debug)]
pub struct FramePool {
    free: Vec<FrameBuffer>,
    allocated: usize,
    limit: usize,
}

impl FramePool {
    pub fn new(initial: usize, limit: usize) -> Self {
        let initial = initial.min(limit);
        Self {
            free: (0..initial).map(|_| FrameBuffer::new()).collect(),
            allocated: initial,
            limit,
        }
    }

    /// Returns a reset frame, allocating a new one if none are free and the cap allows.
    pub fn get(&mut self) -> Option<FrameBuffer> {
        if let Some(frame) = self.free.pop() {
            return Some(frame);
        }
        if self.allocated < self.limit {
            self.allocated += 1;
            debug!("jitter buffer increased to {} frames", self.allocated);
            return Some(FrameBuffer::new());
        }
        None
    }

    pub fn recycle(&mut self, mut frame: FrameBuffer) {
        if self.free.len() >= self.allocated {
            warn!("dropping a frame that did not come from this pool");
            return;
        }
        frame.reset();
        self.free.push(frame);
    }

    /// Frames ever allocated, free or not.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn free(&self) -> usize {
        self.free.len()
    }

    #[cfg(test)]
    pub fn limit(&self) -> usize {
        self.limit
    }
}
