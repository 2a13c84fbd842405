//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Reassembly of one frame (all packets sharing a timestamp) into a contiguous byte stream.

use std::time::Duration;

use log::*;
use ps_common::WrappingCounter;
use thiserror::Error;

use crate::{
    config::DecodeErrorMode,
    packet::{FrameType, Packet, TruncatedSequenceNumber, TruncatedTimestamp},
};

pub const MAX_PACKETS_PER_FRAME: usize = 800;
/// Storage grows in multiples of this.
pub const BUFFER_GROWTH_STEP: usize = 30_000;
pub const MAX_FRAME_SIZE: usize = 4_000_000;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    #[error("frame would exceed {MAX_PACKETS_PER_FRAME} packets or {MAX_FRAME_SIZE} bytes")]
    SizeError,
    #[error("duplicate packet")]
    DuplicatePacket,
    #[error("packet is outside of the frame's first and last packets")]
    OutOfBounds,
}

/// The result of a successful insertion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertStatus {
    Incomplete,
    Decodable,
    Complete,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameState {
    /// No media packets yet (possibly some empty ones).
    #[default]
    Empty,
    Incomplete,
    Decodable,
    Complete,
}

/// What the buffer knows about the stream when a packet is inserted.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameData {
    pub rtt: Duration,
    pub rolling_average_packets_per_frame: f32,
}

#[derive(Clone, Copy, Debug)]
struct PacketInfo {
    seqnum: TruncatedSequenceNumber,
    /// Where the payload starts within the frame's data.
    offset: usize,
    size: usize,
}

/// Owns the bytes of exactly one frame. Instances are recycled via [`FrameBuffer::reset`]
/// rather than dropped, so the allocated storage is reused across frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    // Allocated region; only data[..length] is in use.
    data: Vec<u8>,
    length: usize,
    // Sorted by sequence number.
    packets: Vec<PacketInfo>,
    timestamp: Option<TruncatedTimestamp>,
    frame_type: FrameType,
    first_packet_seqnum: Option<TruncatedSequenceNumber>,
    last_packet_seqnum: Option<TruncatedSequenceNumber>,
    empty_seqnum_low: Option<TruncatedSequenceNumber>,
    empty_seqnum_high: Option<TruncatedSequenceNumber>,
    complete: bool,
    decodable: bool,
    state: FrameState,
    missing_frame: bool,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The caller looks frames up by timestamp, so the packet is assumed to belong to this one.
    pub fn insert_packet(
        &mut self,
        packet: &Packet,
        mode: &DecodeErrorMode,
        frame_data: FrameData,
    ) -> Result<InsertStatus, InsertError> {
        if packet.frame_type == FrameType::Empty {
            self.timestamp = Some(packet.timestamp);
            self.remember_empty_packet(packet.seqnum);
            return Ok(self.status());
        }

        if self.packets.len() >= MAX_PACKETS_PER_FRAME {
            warn!(
                "max number of packets per frame has been reached (timestamp {})",
                packet.timestamp
            );
            return Err(InsertError::SizeError);
        }

        // Scan backwards for the last packet this one is not older than.
        let preceding = self
            .packets
            .iter()
            .rposition(|p| packet.seqnum.latest(p.seqnum) == packet.seqnum);
        if let Some(index) = preceding {
            let existing = &self.packets[index];
            if existing.seqnum == packet.seqnum && existing.size > 0 {
                return Err(InsertError::DuplicatePacket);
            }
        }
        let position = preceding.map_or(0, |index| index + 1);

        let mut frame_type = self.frame_type;
        let mut first_packet_seqnum = self.first_packet_seqnum;
        let mut last_packet_seqnum = self.last_packet_seqnum;
        if packet.is_first_packet && first_packet_seqnum.is_none() {
            // The first packet of a frame decides its type.
            frame_type = packet.frame_type;
            first_packet_seqnum = Some(packet.seqnum);
        } else if first_packet_seqnum.is_some_and(|first| first.is_newer_than(packet.seqnum)) {
            warn!(
                "received packet {} before the first packet of frame {}",
                packet.seqnum, packet.timestamp
            );
            return Err(InsertError::OutOfBounds);
        } else if frame_type == FrameType::Empty {
            frame_type = packet.frame_type;
        }
        if packet.marker && last_packet_seqnum.is_none() {
            last_packet_seqnum = Some(packet.seqnum);
        } else if last_packet_seqnum.is_some_and(|last| packet.seqnum.is_newer_than(last)) {
            warn!(
                "received packet {} after the last packet of frame {}",
                packet.seqnum, packet.timestamp
            );
            return Err(InsertError::OutOfBounds);
        }

        let required = self.length + packet.size();
        if required > MAX_FRAME_SIZE {
            error!(
                "failed to insert packet {}: frame {} would be {} bytes",
                packet.seqnum, packet.timestamp, required
            );
            return Err(InsertError::SizeError);
        }
        if required > self.data.len() {
            let new_size =
                (required.div_ceil(BUFFER_GROWTH_STEP) * BUFFER_GROWTH_STEP).min(MAX_FRAME_SIZE);
            // Offsets are relative to the start of the data, so growing needs no fix-up.
            self.data.resize(new_size, 0);
        }

        self.timestamp = Some(packet.timestamp);
        self.frame_type = frame_type;
        self.first_packet_seqnum = first_packet_seqnum;
        self.last_packet_seqnum = last_packet_seqnum;
        if self.state == FrameState::Empty {
            self.state = FrameState::Incomplete;
        }
        self.insert_bytes(position, packet);

        self.update_complete();
        match mode {
            DecodeErrorMode::Strict => {}
            DecodeErrorMode::Tolerant => self.decodable = true,
            DecodeErrorMode::Selective(config) => {
                if !self.complete && !self.decodable {
                    let packets = self.packets.len() as f32;
                    let average = frame_data.rolling_average_packets_per_frame;
                    let uncertain = packets <= config.high_packet_ratio * average
                        && packets > config.low_packet_ratio * average;
                    self.decodable = frame_data.rtt >= config.rtt_threshold
                        && self.frame_type != FrameType::Key
                        && self.have_first_packet()
                        && !uncertain;
                }
            }
        }
        Ok(self.status())
    }

    // Opens a gap at the packet's position and copies the payload into it.
    fn insert_bytes(&mut self, position: usize, packet: &Packet) {
        let size = packet.size();
        let offset = match position.checked_sub(1) {
            Some(previous) => self.packets[previous].offset + self.packets[previous].size,
            None => 0,
        };
        self.data.copy_within(offset..self.length, offset + size);
        self.data[offset..offset + size].copy_from_slice(packet.payload);
        for following in &mut self.packets[position..] {
            following.offset += size;
        }
        self.packets.insert(
            position,
            PacketInfo {
                seqnum: packet.seqnum,
                offset,
                size,
            },
        );
        self.length += size;
    }

    // Empty packets are filler following the media packets, so tracking the range is enough.
    fn remember_empty_packet(&mut self, seqnum: TruncatedSequenceNumber) {
        self.empty_seqnum_high = Some(match self.empty_seqnum_high {
            Some(high) => seqnum.latest(high),
            None => seqnum,
        });
        if self
            .empty_seqnum_low
            .map_or(true, |low| low.is_newer_than(seqnum))
        {
            self.empty_seqnum_low = Some(seqnum);
        }
    }

    fn update_complete(&mut self) {
        self.complete = self.first_packet_seqnum.is_some()
            && self.last_packet_seqnum.is_some()
            && self
                .packets
                .windows(2)
                .all(|pair| pair[0].seqnum.wrapping_add(1) == pair[1].seqnum);
    }

    fn status(&mut self) -> InsertStatus {
        if self.complete {
            self.state = FrameState::Complete;
            InsertStatus::Complete
        } else if self.decodable {
            self.state = FrameState::Decodable;
            InsertStatus::Decodable
        } else {
            InsertStatus::Incomplete
        }
    }

    /// Clears the frame for reuse, keeping the allocated storage.
    pub fn reset(&mut self) {
        let data = std::mem::take(&mut self.data);
        let mut packets = std::mem::take(&mut self.packets);
        packets.clear();
        *self = Self {
            data,
            packets,
            ..Self::default()
        };
    }

    pub(crate) fn prepare_for_decode(&mut self, continuous: bool) {
        self.missing_frame = !continuous;
    }

    /// The reassembled frame.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.length]
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn timestamp(&self) -> Option<TruncatedTimestamp> {
        self.timestamp
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_decodable(&self) -> bool {
        self.decodable
    }

    /// Number of media packets in the frame.
    pub fn num_packets(&self) -> usize {
        self.packets.len()
    }

    pub fn have_first_packet(&self) -> bool {
        self.first_packet_seqnum.is_some()
    }

    pub fn have_last_packet(&self) -> bool {
        self.last_packet_seqnum.is_some()
    }

    /// Set when the frame was extracted without being continuous with the previous one.
    pub fn missing_frame(&self) -> bool {
        self.missing_frame
    }

    pub fn low_seqnum(&self) -> Option<TruncatedSequenceNumber> {
        match self.packets.first() {
            Some(first) => Some(first.seqnum),
            None => self.empty_seqnum_low,
        }
    }

    pub fn high_seqnum(&self) -> Option<TruncatedSequenceNumber> {
        match (self.packets.last(), self.empty_seqnum_high) {
            (Some(last), Some(empty_high)) => Some(last.seqnum.latest(empty_high)),
            (Some(last), None) => Some(last.seqnum),
            (None, empty_high) => empty_high,
        }
    }

    /// The lowest sequence number the frame may start at. Without the first packet it's a guess
    /// that is only right if at most one leading packet was lost.
    pub fn estimated_low_seqnum(&self) -> Option<TruncatedSequenceNumber> {
        let low = self.low_seqnum()?;
        if self.have_first_packet() {
            Some(low)
        } else {
            Some(low.wrapping_sub(1))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ps::{PACK_START_CODE, SYSTEM_HEADER_START_CODE};

    const TIMESTAMP: TruncatedTimestamp = 3000;

    fn first_payload(key: bool, len: usize) -> Vec<u8> {
        let mut payload = PACK_START_CODE.to_vec();
        payload.extend_from_slice(&[0x44, 0x00, 0x04, 0x00, 0x04, 0x01, 0x01, 0x86, 0xa3, 0xf8]);
        if key {
            payload.extend_from_slice(&SYSTEM_HEADER_START_CODE);
        }
        payload.resize(payload.len().max(len), 0xe0);
        payload
    }

    fn insert(
        frame: &mut FrameBuffer,
        seqnum: TruncatedSequenceNumber,
        marker: bool,
        payload: &[u8],
    ) -> Result<InsertStatus, InsertError> {
        let packet = Packet::parse(seqnum, TIMESTAMP, marker, payload);
        frame.insert_packet(&packet, &DecodeErrorMode::Strict, FrameData::default())
    }

    #[test]
    fn reordered_packets_complete_in_order() {
        let first = first_payload(true, 20);
        let payloads: Vec<Vec<u8>> = vec![
            first.clone(),
            vec![2; 11],
            vec![3; 12],
            vec![4; 13],
            vec![5; 14],
        ];

        let mut frame = FrameBuffer::new();
        for seqnum in [1u16, 2, 4, 5] {
            let marker = seqnum == 5;
            assert_eq!(
                Ok(InsertStatus::Incomplete),
                insert(&mut frame, seqnum, marker, &payloads[seqnum as usize - 1])
            );
            assert!(!frame.is_complete());
        }
        assert_eq!(
            Ok(InsertStatus::Complete),
            insert(&mut frame, 3, false, &payloads[2])
        );
        assert_eq!(FrameState::Complete, frame.state());
        assert_eq!(FrameType::Key, frame.frame_type());
        assert_eq!(payloads.concat(), frame.payload());
        assert_eq!(20 + 11 + 12 + 13 + 14, frame.len());
        assert_eq!(Some(1), frame.low_seqnum());
        assert_eq!(Some(5), frame.high_seqnum());
    }

    #[test]
    fn duplicates_are_rejected_without_changes() {
        let mut frame = FrameBuffer::new();
        insert(&mut frame, 10, false, &first_payload(false, 30)).unwrap();
        insert(&mut frame, 11, false, &[7; 9]).unwrap();
        let before = frame.payload().to_vec();

        assert_eq!(
            Err(InsertError::DuplicatePacket),
            insert(&mut frame, 11, false, &[7; 9])
        );
        assert_eq!(
            Err(InsertError::DuplicatePacket),
            insert(&mut frame, 10, false, &first_payload(false, 30))
        );
        assert_eq!(before, frame.payload());
        assert_eq!(2, frame.num_packets());
    }

    #[test]
    fn completes_across_seqnum_rollover() {
        let mut frame = FrameBuffer::new();
        assert_eq!(
            Ok(InsertStatus::Incomplete),
            insert(&mut frame, 1, true, &[3; 5])
        );
        assert_eq!(
            Ok(InsertStatus::Incomplete),
            insert(&mut frame, 0xfffe, false, &first_payload(false, 16))
        );
        assert_eq!(
            Ok(InsertStatus::Incomplete),
            insert(&mut frame, 0, false, &[2; 5])
        );
        assert_eq!(
            Ok(InsertStatus::Complete),
            insert(&mut frame, 0xffff, false, &[1; 5])
        );
        let expected = [first_payload(false, 16), vec![1; 5], vec![2; 5], vec![3; 5]].concat();
        assert_eq!(expected, frame.payload());
        assert_eq!(Some(0xfffe), frame.low_seqnum());
        assert_eq!(Some(1), frame.high_seqnum());
    }

    #[test]
    fn not_complete_without_first_or_last_packet() {
        let mut frame = FrameBuffer::new();
        insert(&mut frame, 5, false, &[1; 4]).unwrap();
        assert_eq!(
            Ok(InsertStatus::Incomplete),
            insert(&mut frame, 6, true, &[1; 4])
        );
        assert!(frame.have_last_packet());
        assert!(!frame.have_first_packet());
        assert_eq!(Some(4), frame.estimated_low_seqnum());
        assert_eq!(
            Ok(InsertStatus::Complete),
            insert(&mut frame, 4, false, &first_payload(false, 4))
        );
        assert_eq!(Some(4), frame.estimated_low_seqnum());
    }

    #[test]
    fn out_of_bounds_packets() {
        let mut frame = FrameBuffer::new();
        insert(&mut frame, 100, false, &first_payload(false, 20)).unwrap();
        insert(&mut frame, 102, true, &[1; 4]).unwrap();
        assert_eq!(
            Err(InsertError::OutOfBounds),
            insert(&mut frame, 99, false, &[1; 4])
        );
        assert_eq!(
            Err(InsertError::OutOfBounds),
            insert(&mut frame, 103, false, &[1; 4])
        );
        assert_eq!(2, frame.num_packets());
    }

    #[test]
    fn grows_in_steps_and_keeps_contents() {
        let mut frame = FrameBuffer::new();
        let big = vec![9u8; BUFFER_GROWTH_STEP - 10];
        insert(&mut frame, 2, false, &big).unwrap();
        assert_eq!(BUFFER_GROWTH_STEP, frame.capacity());

        let first = first_payload(false, 100);
        insert(&mut frame, 1, false, &first).unwrap();
        assert_eq!(2 * BUFFER_GROWTH_STEP, frame.capacity());
        assert_eq!([first, big].concat(), frame.payload());

        frame.reset();
        assert_eq!(2 * BUFFER_GROWTH_STEP, frame.capacity());
        assert_eq!(0, frame.len());
        assert_eq!(FrameState::Empty, frame.state());
        assert_eq!(None, frame.timestamp());
        assert_eq!(None, frame.low_seqnum());
    }

    #[test]
    fn size_limits() {
        let mut frame = FrameBuffer::new();
        let chunk = vec![1u8; MAX_FRAME_SIZE / 2];
        insert(&mut frame, 1, false, &chunk).unwrap();
        insert(&mut frame, 2, false, &chunk).unwrap();
        assert_eq!(
            Err(InsertError::SizeError),
            insert(&mut frame, 3, false, &[1])
        );
        assert_eq!(MAX_FRAME_SIZE, frame.len());
        assert_eq!(2, frame.num_packets());

        let mut frame = FrameBuffer::new();
        for seqnum in 0..MAX_PACKETS_PER_FRAME as u16 {
            insert(&mut frame, seqnum, false, &[1]).unwrap();
        }
        assert_eq!(
            Err(InsertError::SizeError),
            insert(&mut frame, MAX_PACKETS_PER_FRAME as u16, false, &[1])
        );
    }

    #[test]
    fn empty_packets_only_track_seqnums() {
        let mut frame = FrameBuffer::new();
        assert_eq!(Ok(InsertStatus::Incomplete), insert(&mut frame, 9, false, &[]));
        assert_eq!(Ok(InsertStatus::Incomplete), insert(&mut frame, 7, false, &[]));
        assert_eq!(FrameState::Empty, frame.state());
        assert_eq!(0, frame.len());
        assert_eq!(0, frame.capacity());
        assert_eq!(Some(7), frame.low_seqnum());
        assert_eq!(Some(9), frame.high_seqnum());
        assert_eq!(Some(TIMESTAMP), frame.timestamp());
    }

    #[test]
    fn high_seqnum_includes_trailing_empty_packets() {
        let mut frame = FrameBuffer::new();
        insert(&mut frame, 20, true, &first_payload(false, 20)).unwrap();
        insert(&mut frame, 22, false, &[]).unwrap();
        assert_eq!(Some(20), frame.low_seqnum());
        assert_eq!(Some(22), frame.high_seqnum());
        assert!(frame.is_complete());
    }

    #[test]
    fn tolerant_mode_is_decodable_after_any_packet() {
        let mut frame = FrameBuffer::new();
        let packet = Packet::parse(5, TIMESTAMP, false, &[1; 10]);
        assert_eq!(
            Ok(InsertStatus::Decodable),
            frame.insert_packet(&packet, &DecodeErrorMode::Tolerant, FrameData::default())
        );
        assert_eq!(FrameState::Decodable, frame.state());
    }

    #[test]
    fn selective_mode() {
        let mode = DecodeErrorMode::Selective(crate::config::SelectiveConfig::default());
        let high_rtt = FrameData {
            rtt: Duration::from_millis(150),
            rolling_average_packets_per_frame: 10.0,
        };
        let low_rtt = FrameData {
            rtt: Duration::from_millis(20),
            ..high_rtt
        };

        // Low RTT: wait for retransmissions instead.
        let mut frame = FrameBuffer::new();
        let first = first_payload(false, 20);
        let packet = Packet::parse(1, TIMESTAMP, false, &first);
        assert_eq!(
            Ok(InsertStatus::Incomplete),
            frame.insert_packet(&packet, &mode, low_rtt)
        );

        // 1 of ~10 packets is below the uncertain band.
        let mut frame = FrameBuffer::new();
        assert_eq!(
            Ok(InsertStatus::Decodable),
            frame.insert_packet(&packet, &mode, high_rtt)
        );

        // 4 of ~10 packets is within the band.
        let mut frame = FrameBuffer::new();
        frame.insert_packet(&packet, &mode, low_rtt).unwrap();
        for seqnum in 2..=3 {
            let packet = Packet::parse(seqnum, TIMESTAMP, false, &[1; 10]);
            frame.insert_packet(&packet, &mode, low_rtt).unwrap();
        }
        for seqnum in 4..=8 {
            let packet = Packet::parse(seqnum, TIMESTAMP, false, &[1; 10]);
            assert_eq!(
                Ok(InsertStatus::Incomplete),
                frame.insert_packet(&packet, &mode, high_rtt)
            );
        }

        // 9 of ~10 packets is above it.
        let packet = Packet::parse(9, TIMESTAMP, false, &[1; 10]);
        assert_eq!(
            Ok(InsertStatus::Decodable),
            frame.insert_packet(&packet, &mode, high_rtt)
        );

        // Key frames always wait.
        let mut frame = FrameBuffer::new();
        let key = first_payload(true, 20);
        let packet = Packet::parse(1, TIMESTAMP, false, &key);
        assert_eq!(
            Ok(InsertStatus::Incomplete),
            frame.insert_packet(&packet, &mode, high_rtt)
        );
    }
}
