//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::collections::BTreeMap;

use log::*;

use crate::{
    decoding_state::DecodingState,
    frame_buffer::{FrameBuffer, FrameState},
    frame_pool::FramePool,
    packet::{FrameType, FullTimestamp},
};

/// Frames sorted by (expanded) timestamp, at most one per timestamp.
#[derive(Debug, Default)]
pub struct FrameList {
    frame_by_timestamp: BTreeMap<FullTimestamp, FrameBuffer>,
}

impl FrameList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, timestamp: FullTimestamp, frame: FrameBuffer) {
        if let Some(replaced) = self.frame_by_timestamp.insert(timestamp, frame) {
            // Callers pop before inserting, so this shouldn't happen.
            error!("replaced frame with timestamp {:?}", replaced.timestamp());
        }
    }

    pub fn pop(&mut self, timestamp: FullTimestamp) -> Option<FrameBuffer> {
        self.frame_by_timestamp.remove(&timestamp)
    }

    pub fn get(&self, timestamp: FullTimestamp) -> Option<&FrameBuffer> {
        self.frame_by_timestamp.get(&timestamp)
    }

    pub fn front(&self) -> Option<(FullTimestamp, &FrameBuffer)> {
        self.frame_by_timestamp
            .first_key_value()
            .map(|(timestamp, frame)| (*timestamp, frame))
    }

    pub fn back(&self) -> Option<(FullTimestamp, &FrameBuffer)> {
        self.frame_by_timestamp
            .last_key_value()
            .map(|(timestamp, frame)| (*timestamp, frame))
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (FullTimestamp, &FrameBuffer)> + '_ {
        self.frame_by_timestamp
            .iter()
            .map(|(timestamp, frame)| (*timestamp, frame))
    }

    pub fn timestamps(&self) -> Vec<FullTimestamp> {
        self.frame_by_timestamp.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.frame_by_timestamp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame_by_timestamp.is_empty()
    }

    /// Drops frames from the front (at least one) until the front is a key frame.
    /// Returns the number dropped and the timestamp of the key frame, if one was found.
    pub fn recycle_until_key_frame(
        &mut self,
        pool: &mut FramePool,
    ) -> (usize, Option<FullTimestamp>) {
        let mut dropped = 0;
        while let Some((_, frame)) = self.frame_by_timestamp.pop_first() {
            pool.recycle(frame);
            dropped += 1;
            if let Some((timestamp, frame)) = self.frame_by_timestamp.first_key_value() {
                if frame.frame_type() == FrameType::Key {
                    return (dropped, Some(*timestamp));
                }
            }
        }
        (dropped, None)
    }

    /// Drops every frame before the given timestamp.
    pub fn recycle_older_than(&mut self, timestamp: FullTimestamp, pool: &mut FramePool) -> usize {
        let newer = self.frame_by_timestamp.split_off(&timestamp);
        let older = std::mem::replace(&mut self.frame_by_timestamp, newer);
        let dropped = older.len();
        for frame in older.into_values() {
            pool.recycle(frame);
        }
        dropped
    }

    /// Drops frames from the front that were already passed by the decoder, or that are empty
    /// and can be skipped (unless it's the only frame).
    pub fn cleanup_old_or_empty(
        &mut self,
        decoding_state: &mut DecodingState,
        pool: &mut FramePool,
    ) -> usize {
        let mut dropped = 0;
        loop {
            let len = self.frame_by_timestamp.len();
            let Some(entry) = self.frame_by_timestamp.first_entry() else {
                break;
            };
            let frame = entry.get();
            let remove = if frame.state() == FrameState::Empty && len > 1 {
                decoding_state.update_empty_frame(frame)
            } else {
                decoding_state.is_old_frame(frame)
            };
            if !remove {
                break;
            }
            let frame = entry.remove();
            debug!("dropping old or empty frame {:?}", frame.timestamp());
            pool.recycle(frame);
            dropped += 1;
        }
        dropped
    }

    /// Drops all frames.
    pub fn reset(&mut self, pool: &mut FramePool) {
        for frame in std::mem::take(&mut self.frame_by_timestamp).into_values() {
            pool.recycle(frame);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::DecodeErrorMode,
        frame_buffer::FrameData,
        packet::{Packet, TruncatedSequenceNumber, TruncatedTimestamp},
        ps::{PACK_START_CODE, SYSTEM_HEADER_START_CODE},
    };

    fn frame(
        pool: &mut FramePool,
        seqnum: TruncatedSequenceNumber,
        timestamp: TruncatedTimestamp,
        payload: &[u8],
    ) -> FrameBuffer {
        let mut frame = pool.get().unwrap();
        let packet = Packet::parse(seqnum, timestamp, true, payload);
        frame
            .insert_packet(&packet, &DecodeErrorMode::Strict, FrameData::default())
            .unwrap();
        frame
    }

    fn key_payload() -> Vec<u8> {
        let mut payload = PACK_START_CODE.to_vec();
        payload.extend_from_slice(&[0x44, 0x00, 0x04, 0x00, 0x04, 0x01, 0x01, 0x86, 0xa3, 0xf8]);
        payload.extend_from_slice(&SYSTEM_HEADER_START_CODE);
        payload
    }

    #[test]
    fn ordered_by_timestamp() {
        let mut pool = FramePool::new(0, 10);
        let mut list = FrameList::new();
        list.insert(6000, frame(&mut pool, 3, 6000, &[1]));
        list.insert(3000, frame(&mut pool, 1, 3000, &[1]));
        list.insert(0x1_0000_0000, frame(&mut pool, 5, 0, &[1]));

        assert_eq!(vec![3000, 6000, 0x1_0000_0000], list.timestamps());
        assert_eq!(Some(3000), list.front().map(|(timestamp, _)| timestamp));
        assert_eq!(Some(0x1_0000_0000), list.back().map(|(timestamp, _)| timestamp));

        let popped = list.pop(6000).unwrap();
        assert_eq!(Some(6000), popped.timestamp());
        assert!(list.pop(6000).is_none());
        assert_eq!(2, list.len());
    }

    #[test]
    fn recycle_until_key_frame() {
        let mut pool = FramePool::new(0, 10);
        let mut list = FrameList::new();
        let key = key_payload();
        list.insert(3000, frame(&mut pool, 1, 3000, &[1]));
        list.insert(6000, frame(&mut pool, 2, 6000, &[1]));
        list.insert(9000, frame(&mut pool, 3, 9000, &key));
        list.insert(12000, frame(&mut pool, 4, 12000, &[1]));

        assert_eq!((2, Some(9000)), list.recycle_until_key_frame(&mut pool));
        assert_eq!(vec![9000, 12000], list.timestamps());
        assert_eq!(2, pool.free());

        // The key frame at the front is dropped too; there's no other.
        assert_eq!((2, None), list.recycle_until_key_frame(&mut pool));
        assert!(list.is_empty());
        assert_eq!(4, pool.free());
        assert_eq!(4, pool.allocated());
    }

    #[test]
    fn recycle_older_than() {
        let mut pool = FramePool::new(0, 10);
        let mut list = FrameList::new();
        for (i, timestamp) in [3000u32, 6000, 9000].into_iter().enumerate() {
            list.insert(timestamp as u64, frame(&mut pool, i as u16, timestamp, &[1]));
        }
        assert_eq!(2, list.recycle_older_than(9000, &mut pool));
        assert_eq!(vec![9000], list.timestamps());
        assert_eq!(0, list.recycle_older_than(9000, &mut pool));
    }

    #[test]
    fn cleanup_old_or_empty() {
        let mut pool = FramePool::new(0, 10);
        let mut list = FrameList::new();
        let mut state = DecodingState::new();
        let key = key_payload();
        state.set_state(&frame(&mut pool, 10, 3000, &key));

        list.insert(3000, frame(&mut pool, 10, 3000, &[1]));
        list.insert(6000, frame(&mut pool, 11, 6000, &[]));
        list.insert(9000, frame(&mut pool, 12, 9000, &[1]));
        list.insert(12000, frame(&mut pool, 14, 12000, &[]));

        // The old frame goes, then the continuous empty one.
        assert_eq!(2, list.cleanup_old_or_empty(&mut state, &mut pool));
        assert_eq!(vec![9000, 12000], list.timestamps());
        assert_eq!(11, state.seqnum());
        assert_eq!(6000, state.timestamp());

        // A lone empty frame stays.
        let mut list = FrameList::new();
        list.insert(15000, frame(&mut pool, 12, 15000, &[]));
        assert_eq!(0, list.cleanup_old_or_empty(&mut state, &mut pool));
        assert_eq!(1, list.len());
    }

    #[test]
    fn reset() {
        let mut pool = FramePool::new(0, 10);
        let mut list = FrameList::new();
        list.insert(3000, frame(&mut pool, 1, 3000, &[1]));
        list.insert(6000, frame(&mut pool, 2, 6000, &[1]));
        list.reset(&mut pool);
        assert!(list.is_empty());
        assert_eq!(2, pool.free());
    }
}
