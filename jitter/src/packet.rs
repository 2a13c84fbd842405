//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use ps_common::{expand_truncated_counter_near, expand_truncated_counter_seeded};

use crate::ps;

pub type FullSequenceNumber = u64; // Expanded so that it sorts across rollovers
pub type TruncatedSequenceNumber = u16; // What actually goes in the packet
pub type FullTimestamp = u64;
pub type TruncatedTimestamp = u32;

/// The video clock rate of the stream, used to turn timestamp spans into time.
pub const VIDEO_CLOCK_RATE_KHZ: u64 = 90;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Carries no payload (filler/padding).
    #[default]
    Empty,
    /// Decodable without any earlier frame.
    Key,
    Delta,
}

/// One arrived RTP payload. Borrowed from the receive path for the duration of a single
/// insertion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Packet<'payload> {
    pub seqnum: TruncatedSequenceNumber,
    pub timestamp: TruncatedTimestamp,
    /// Set on the last packet of a frame.
    pub marker: bool,
    pub payload: &'payload [u8],
    /// Set on the packet that starts a frame.
    pub is_first_packet: bool,
    /// Only meaningful on the first packet of a frame.
    pub frame_type: FrameType,
}

impl<'payload> Packet<'payload> {
    /// Builds a packet, deriving the frame boundary and type from the program stream payload.
    pub fn parse(
        seqnum: TruncatedSequenceNumber,
        timestamp: TruncatedTimestamp,
        marker: bool,
        payload: &'payload [u8],
    ) -> Self {
        let (is_first_packet, frame_type) = ps::classify(payload);
        Self {
            seqnum,
            timestamp,
            marker,
            payload,
            is_first_packet,
            frame_type,
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// The first sequence number expanded seeds `max_seqnum`.
pub fn expand_seqnum(
    seqnum: TruncatedSequenceNumber,
    max_seqnum: &mut Option<FullSequenceNumber>,
) -> FullSequenceNumber {
    expand_truncated_counter_seeded(seqnum, max_seqnum)
}

/// The first timestamp expanded seeds `max_timestamp`.
pub fn expand_timestamp(
    timestamp: TruncatedTimestamp,
    max_timestamp: &mut Option<FullTimestamp>,
) -> FullTimestamp {
    expand_truncated_counter_seeded(timestamp, max_timestamp)
}

pub fn expand_timestamp_near(
    timestamp: TruncatedTimestamp,
    max_timestamp: FullTimestamp,
) -> FullTimestamp {
    expand_truncated_counter_near(timestamp, max_timestamp)
}
