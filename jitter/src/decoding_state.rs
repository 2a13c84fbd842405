//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use ps_common::WrappingCounter;

use crate::{
    frame_buffer::FrameBuffer,
    packet::{FrameType, Packet, TruncatedSequenceNumber, TruncatedTimestamp},
};

/// Where the stream was when the last frame was handed to the decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodingState {
    seqnum: TruncatedSequenceNumber,
    timestamp: TruncatedTimestamp,
    in_initial_state: bool,
}

impl Default for DecodingState {
    fn default() -> Self {
        Self {
            seqnum: 0,
            timestamp: 0,
            in_initial_state: true,
        }
    }
}

impl DecodingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn seqnum(&self) -> TruncatedSequenceNumber {
        self.seqnum
    }

    pub fn timestamp(&self) -> TruncatedTimestamp {
        self.timestamp
    }

    pub fn in_initial_state(&self) -> bool {
        self.in_initial_state
    }

    /// Records a released frame as the new reference point.
    pub fn set_state(&mut self, frame: &FrameBuffer) {
        if let Some(high_seqnum) = frame.high_seqnum() {
            self.seqnum = high_seqnum;
        }
        if let Some(timestamp) = frame.timestamp() {
            self.timestamp = timestamp;
        }
        self.in_initial_state = false;
    }

    pub fn continuous_seqnum(&self, seqnum: TruncatedSequenceNumber) -> bool {
        seqnum == self.seqnum.wrapping_add(1)
    }

    /// A key frame (with its first packet) never depends on earlier frames. Anything else has to
    /// pick up right where the last released frame ended.
    pub fn continuous_frame(&self, frame: &FrameBuffer) -> bool {
        if frame.frame_type() == FrameType::Key && frame.have_first_packet() {
            return true;
        }
        if self.in_initial_state {
            return false;
        }
        frame
            .low_seqnum()
            .is_some_and(|low| self.continuous_seqnum(low))
    }

    pub fn is_old_frame(&self, frame: &FrameBuffer) -> bool {
        match frame.timestamp() {
            Some(timestamp) => self.is_old_timestamp(timestamp),
            None => false,
        }
    }

    pub fn is_old_packet(&self, packet: &Packet) -> bool {
        self.is_old_timestamp(packet.timestamp)
    }

    fn is_old_timestamp(&self, timestamp: TruncatedTimestamp) -> bool {
        !self.in_initial_state && !timestamp.is_newer_than(self.timestamp)
    }

    /// A late packet of the last released frame still moves the sequence number forward.
    pub fn update_old_packet(&mut self, packet: &Packet) {
        if packet.timestamp == self.timestamp {
            self.seqnum = packet.seqnum.latest(self.seqnum);
        }
    }

    /// Returns true if a frame without media can be dropped, advancing past it if needed.
    pub fn update_empty_frame(&mut self, frame: &FrameBuffer) -> bool {
        let (Some(low), Some(high)) = (frame.low_seqnum(), frame.high_seqnum()) else {
            return false;
        };
        let single_packet = low == high;
        if self.in_initial_state && single_packet {
            // Nothing to stay continuous with yet.
            return true;
        }
        if (single_packet && self.continuous_seqnum(high)) || self.continuous_frame(frame) {
            self.seqnum = high;
            if let Some(timestamp) = frame.timestamp() {
                self.timestamp = timestamp;
            }
            return true;
        }
        false
    }
}
