//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Reorders packets of a program stream into frames and hands complete (or good enough) frames
//! to the demuxer in timestamp order.
//!
//! One producer calls [`JitterBuffer::insert_packet`] while one consumer calls
//! [`JitterBuffer::next_complete_timestamp`], [`JitterBuffer::extract`] and
//! [`JitterBuffer::release`]. All state lives behind one lock; the consumer's wait releases it
//! while sleeping and re-checks readiness with it held.

use std::time::{Duration, Instant};

use log::*;
use parking_lot::{Condvar, Mutex};
use ps_common::WrappingCounter;

use crate::{
    config::{DecodeErrorMode, JitterBufferConfig, NackMode},
    decoding_state::DecodingState,
    frame_buffer::{FrameBuffer, FrameData, FrameState, InsertError, InsertStatus},
    frame_list::FrameList,
    frame_pool::FramePool,
    nack::{MissingSequenceNumbers, NackList},
    packet::{
        expand_timestamp, expand_timestamp_near, FrameType, FullTimestamp, Packet,
        TruncatedSequenceNumber, TruncatedTimestamp, VIDEO_CLOCK_RATE_KHZ,
    },
};

const MAX_CONSECUTIVE_OLD_PACKETS: usize = 300;
/// Without NACK, this much of non-decodable frames means a key frame is needed.
const MAX_DISCONTINUOUS_FRAMES_TIME: Duration = Duration::from_millis(1000);
const FAST_CONVERGE_FRAME_COUNT: u32 = 5;
const FAST_CONVERGE_MULTIPLIER: f32 = 0.4;
const NORMAL_CONVERGE_MULTIPLIER: f32 = 0.2;

/// What happened to an inserted packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The packet completed its frame.
    Complete,
    /// The frame may be decoded even though it's not complete.
    Decodable,
    Incomplete,
    DuplicatePacket,
    /// The packet doesn't fit between the first and last packet of its frame.
    OutOfBounds,
    /// The frame grew too large; the frame was dropped.
    SizeError,
    /// The packet belongs to a frame that was already released.
    OldPacket,
    /// A frame with only empty packets was skipped.
    EmptyFrameDropped,
    /// The buffer had to drop frames without finding a key frame. The caller should request a
    /// key frame.
    FlushIndicator,
    Stopped,
}

/// The result of waiting for a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    Ready(TruncatedTimestamp),
    Timeout,
    /// The buffer was stopped.
    Cancelled,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JitterBufferStats {
    pub packets_received: u64,
    /// Old packets that carried media.
    pub discarded_packets: u64,
    pub duplicate_packets: u64,
    pub key_frames: u64,
    pub delta_frames: u64,
    /// Frames dropped to make room or to get back to a key frame.
    pub dropped_frames: u64,
    pub extracted_frames: u64,
    pub allocated_frames: usize,
    pub free_frames: usize,
}

enum FrameOrigin {
    Incomplete,
    Decodable,
    Free,
}

struct State {
    running: bool,
    config: JitterBufferConfig,
    free_frames: FramePool,
    incomplete_frames: FrameList,
    decodable_frames: FrameList,
    last_decoded_state: DecodingState,
    missing_seqnums: MissingSequenceNumbers,
    max_timestamp: Option<FullTimestamp>,
    consecutive_old_packets: usize,
    rtt: Duration,
    average_packets_per_frame: f32,
    frame_counter: u32,
    stats: JitterBufferStats,
}

pub struct JitterBuffer {
    state: Mutex<State>,
    frame_ready: Condvar,
}

impl JitterBuffer {
    pub fn new(config: JitterBufferConfig) -> Self {
        let free_frames = FramePool::new(config.start_frame_count, config.max_frame_count);
        Self {
            state: Mutex::new(State {
                running: true,
                config,
                free_frames,
                incomplete_frames: FrameList::new(),
                decodable_frames: FrameList::new(),
                last_decoded_state: DecodingState::new(),
                missing_seqnums: MissingSequenceNumbers::new(),
                max_timestamp: None,
                consecutive_old_packets: 0,
                rtt: Duration::ZERO,
                average_packets_per_frame: 0.0,
                frame_counter: 0,
                stats: JitterBufferStats::default(),
            }),
            frame_ready: Condvar::new(),
        }
    }

    pub fn start(&self) {
        let mut state = self.state.lock();
        state.running = true;
        state.frame_counter = 0;
        state.average_packets_per_frame = 0.0;
        state.consecutive_old_packets = 0;
        state.missing_seqnums.reset();
        info!("jitter buffer started");
    }

    /// Drops all frames and wakes up a waiting consumer, which sees [`WaitResult::Cancelled`].
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.flush();
        drop(state);
        self.frame_ready.notify_all();
        info!("jitter buffer stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Drops all frames and starts over, waiting for a key frame.
    pub fn flush(&self) {
        self.state.lock().flush();
    }

    pub fn update_rtt(&self, rtt: Duration) {
        self.state.lock().rtt = rtt;
    }

    /// False if NACK is off or the round trip is too long for retransmissions to be useful.
    pub fn wait_for_retransmissions(&self) -> bool {
        self.state.lock().wait_for_retransmissions()
    }

    pub fn insert_packet(&self, packet: &Packet) -> InsertOutcome {
        let mut state = self.state.lock();
        let outcome = state.insert_packet(packet);
        let ready = state.complete_front_timestamp().is_some();
        drop(state);
        if ready {
            self.frame_ready.notify_all();
        }
        outcome
    }

    /// Waits up to `max_wait` for the oldest frame to be complete and continuous.
    pub fn next_complete_timestamp(&self, max_wait: Duration) -> WaitResult {
        // Too far out to represent means no deadline at all.
        let deadline = Instant::now().checked_add(max_wait);
        let mut state = self.state.lock();
        loop {
            if !state.running {
                return WaitResult::Cancelled;
            }
            state.cleanup_old_or_empty_frames();
            if let Some(timestamp) = state.complete_front_timestamp() {
                return WaitResult::Ready(timestamp);
            }
            let timed_out = match deadline {
                Some(deadline) => self.frame_ready.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.frame_ready.wait(&mut state);
                    false
                }
            };
            if timed_out {
                if !state.running {
                    return WaitResult::Cancelled;
                }
                state.cleanup_old_or_empty_frames();
                return match state.complete_front_timestamp() {
                    Some(timestamp) => WaitResult::Ready(timestamp),
                    None => WaitResult::Timeout,
                };
            }
        }
    }

    /// Returns the oldest frame that may be decoded with errors, if decoding with errors is
    /// allowed and the frame isn't worth waiting for any longer.
    pub fn next_maybe_incomplete_timestamp(&self) -> Option<TruncatedTimestamp> {
        self.state.lock().next_maybe_incomplete_timestamp()
    }

    /// Takes the frame out of the buffer and moves the decoding state past it. The frame must be
    /// handed back with [`JitterBuffer::release`] once it has been consumed.
    pub fn extract(&self, timestamp: TruncatedTimestamp) -> Option<FrameBuffer> {
        self.state.lock().extract(timestamp)
    }

    pub fn release(&self, frame: FrameBuffer) {
        self.state.lock().free_frames.recycle(frame);
    }

    /// Returns up to `max_size` sequence numbers to NACK, oldest first, or asks for a key frame
    /// if NACKing can't repair the stream.
    pub fn nack_list(&self, max_size: usize) -> NackList {
        self.state.lock().nack_list(max_size)
    }

    pub fn stats(&self) -> JitterBufferStats {
        let state = self.state.lock();
        JitterBufferStats {
            allocated_frames: state.free_frames.allocated(),
            free_frames: state.free_frames.free(),
            ..state.stats
        }
    }

    /// (incomplete, decodable) frame counts.
    pub fn frame_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.incomplete_frames.len(), state.decodable_frames.len())
    }
}

fn is_continuous_in_state(frame: &FrameBuffer, decoding_state: &DecodingState) -> bool {
    matches!(frame.state(), FrameState::Complete | FrameState::Decodable)
        && decoding_state.continuous_frame(frame)
}

fn timestamp_of(frame: &FrameBuffer) -> TruncatedTimestamp {
    frame.timestamp().unwrap_or_default()
}

impl State {
    fn wait_for_retransmissions(&self) -> bool {
        match self.config.nack_mode {
            NackMode::Off => false,
            NackMode::On { high_rtt_threshold } => {
                high_rtt_threshold.map_or(true, |threshold| self.rtt < threshold)
            }
        }
    }

    fn flush(&mut self) {
        self.decodable_frames.reset(&mut self.free_frames);
        self.incomplete_frames.reset(&mut self.free_frames);
        self.last_decoded_state.reset();
        self.consecutive_old_packets = 0;
        self.missing_seqnums.reset();
        self.max_timestamp = None;
        debug!("jitter buffer flushed");
    }

    fn insert_packet(&mut self, packet: &Packet) -> InsertOutcome {
        if !self.running {
            return InsertOutcome::Stopped;
        }

        if self.last_decoded_state.is_old_packet(packet) {
            if !packet.is_empty() {
                self.stats.discarded_packets += 1;
                self.consecutive_old_packets += 1;
            }
            self.last_decoded_state.update_old_packet(packet);
            self.missing_seqnums
                .drop_up_to(self.last_decoded_state.seqnum());
            // The late packet may have made more incomplete frames continuous.
            self.find_and_insert_continuous_frames_with_state(self.last_decoded_state);
            if self.consecutive_old_packets > MAX_CONSECUTIVE_OLD_PACKETS {
                warn!(
                    "{} consecutive old packets received; flushing the jitter buffer",
                    self.consecutive_old_packets
                );
                self.flush();
                return InsertOutcome::FlushIndicator;
            }
            return InsertOutcome::OldPacket;
        }
        self.consecutive_old_packets = 0;

        let timestamp = expand_timestamp(packet.timestamp, &mut self.max_timestamp);
        let (mut frame, origin) = match self.get_frame(timestamp) {
            Ok(found) => found,
            Err(outcome) => return outcome,
        };

        let previous_state = frame.state();
        let frame_data = FrameData {
            rtt: self.rtt,
            rolling_average_packets_per_frame: self.average_packets_per_frame,
        };
        let result = frame.insert_packet(packet, &self.config.decode_error_mode, frame_data);

        let status = match result {
            Ok(status) => status,
            Err(InsertError::SizeError) => {
                self.free_frames.recycle(frame);
                return InsertOutcome::SizeError;
            }
            Err(error @ (InsertError::DuplicatePacket | InsertError::OutOfBounds)) => {
                // Put it back where it came from.
                match origin {
                    FrameOrigin::Incomplete => self.incomplete_frames.insert(timestamp, frame),
                    FrameOrigin::Decodable => self.decodable_frames.insert(timestamp, frame),
                    FrameOrigin::Free => self.free_frames.recycle(frame),
                }
                if error == InsertError::DuplicatePacket {
                    self.stats.duplicate_packets += 1;
                    return InsertOutcome::DuplicatePacket;
                }
                return InsertOutcome::OutOfBounds;
            }
        };

        self.stats.packets_received += 1;
        // A key frame is what a flush would ask for, so keep it.
        if !self.update_missing_seqnums(packet.seqnum) && packet.frame_type != FrameType::Key {
            self.free_frames.recycle(frame);
            return InsertOutcome::FlushIndicator;
        }

        let continuous = self.is_continuous(&frame);
        match status {
            InsertStatus::Complete | InsertStatus::Decodable => {
                if status == InsertStatus::Complete && previous_state != FrameState::Complete {
                    match frame.frame_type() {
                        FrameType::Key => self.stats.key_frames += 1,
                        _ => self.stats.delta_frames += 1,
                    }
                }
                if continuous {
                    self.decodable_frames.insert(timestamp, frame);
                    self.find_and_insert_continuous_frames(timestamp);
                } else {
                    self.incomplete_frames.insert(timestamp, frame);
                    if self.too_long_without_nack() {
                        return InsertOutcome::FlushIndicator;
                    }
                }
                if status == InsertStatus::Complete {
                    InsertOutcome::Complete
                } else {
                    InsertOutcome::Decodable
                }
            }
            InsertStatus::Incomplete => {
                if frame.state() == FrameState::Empty
                    && self.last_decoded_state.update_empty_frame(&frame)
                {
                    self.free_frames.recycle(frame);
                    return InsertOutcome::EmptyFrameDropped;
                }
                self.incomplete_frames.insert(timestamp, frame);
                if self.too_long_without_nack() {
                    return InsertOutcome::FlushIndicator;
                }
                InsertOutcome::Incomplete
            }
        }
    }

    // Finds the frame for the timestamp, taking it out of whichever list holds it, or takes a
    // free one.
    fn get_frame(
        &mut self,
        timestamp: FullTimestamp,
    ) -> Result<(FrameBuffer, FrameOrigin), InsertOutcome> {
        if let Some(frame) = self.incomplete_frames.pop(timestamp) {
            return Ok((frame, FrameOrigin::Incomplete));
        }
        if let Some(frame) = self.decodable_frames.pop(timestamp) {
            return Ok((frame, FrameOrigin::Decodable));
        }
        if let Some(frame) = self.free_frames.get() {
            return Ok((frame, FrameOrigin::Free));
        }

        warn!("unable to get an empty frame; recycling");
        let found_key_frame = self.recycle_frames_until_key_frame();
        match self.free_frames.get() {
            Some(frame) if found_key_frame => Ok((frame, FrameOrigin::Free)),
            Some(frame) => {
                self.free_frames.recycle(frame);
                Err(InsertOutcome::FlushIndicator)
            }
            None => Err(InsertOutcome::FlushIndicator),
        }
    }

    // Returns false if a key frame is needed.
    fn update_missing_seqnums(&mut self, seqnum: TruncatedSequenceNumber) -> bool {
        if self.missing_seqnums.latest_received().is_none()
            || self.config.nack_mode == NackMode::Off
        {
            self.missing_seqnums.remember_latest(seqnum);
            return true;
        }

        let last_decoded = if self.last_decoded_state.in_initial_state() {
            None
        } else {
            Some(self.last_decoded_state.seqnum())
        };
        if self
            .missing_seqnums
            .remember_received(seqnum, last_decoded)
        {
            if self.too_large_nack_list() && !self.handle_too_large_nack_list() {
                warn!("requesting key frame due to too large NACK list");
                return false;
            }
            if self.missing_too_old_packet(seqnum) && !self.handle_too_old_packets(seqnum) {
                warn!("requesting key frame due to missing too old packets");
                return false;
            }
        }
        true
    }

    fn too_large_nack_list(&self) -> bool {
        self.missing_seqnums.len() > self.config.max_nack_list_size
    }

    // Returns true if a key frame was found.
    fn handle_too_large_nack_list(&mut self) -> bool {
        warn!(
            "NACK list has grown too large: {} > {}",
            self.missing_seqnums.len(),
            self.config.max_nack_list_size
        );
        let mut key_frame_found = false;
        while self.too_large_nack_list() {
            key_frame_found = self.recycle_frames_until_key_frame();
        }
        key_frame_found
    }

    fn missing_too_old_packet(&self, latest_seqnum: TruncatedSequenceNumber) -> bool {
        self.missing_seqnums
            .age_of_oldest(latest_seqnum)
            .is_some_and(|age| age > self.config.max_packet_age_to_nack)
    }

    // Returns true if a key frame was found.
    fn handle_too_old_packets(&mut self, latest_seqnum: TruncatedSequenceNumber) -> bool {
        warn!(
            "NACK list contains too old sequence numbers: {:?} > {}",
            self.missing_seqnums.age_of_oldest(latest_seqnum),
            self.config.max_packet_age_to_nack
        );
        let mut key_frame_found = false;
        while self.missing_too_old_packet(latest_seqnum) {
            key_frame_found = self.recycle_frames_until_key_frame();
        }
        key_frame_found
    }

    // Drops incomplete frames (or decodable ones, if there are no incomplete ones) up to the
    // next key frame. Returns true if a key frame was found.
    fn recycle_frames_until_key_frame(&mut self) -> bool {
        let (mut dropped, mut key_frame) = self
            .incomplete_frames
            .recycle_until_key_frame(&mut self.free_frames);
        let mut key_frame_low_seqnum = key_frame
            .and_then(|timestamp| self.incomplete_frames.get(timestamp)?.estimated_low_seqnum());
        if dropped == 0 {
            (dropped, key_frame) = self
                .decodable_frames
                .recycle_until_key_frame(&mut self.free_frames);
            key_frame_low_seqnum = key_frame
                .and_then(|timestamp| self.decodable_frames.get(timestamp)?.estimated_low_seqnum());
        }
        self.stats.dropped_frames += dropped as u64;

        if key_frame.is_some() {
            info!("found key frame while dropping frames");
            // The next frame decoded must be a key frame; start NACKing from there.
            self.last_decoded_state.reset();
            if let Some(low_seqnum) = key_frame_low_seqnum {
                self.missing_seqnums.drop_up_to(low_seqnum);
            }
        } else if self.decodable_frames.is_empty() {
            // Everything is gone, so start fresh.
            self.last_decoded_state.reset();
            self.missing_seqnums.clear();
        }
        key_frame.is_some()
    }

    fn is_continuous(&self, frame: &FrameBuffer) -> bool {
        if is_continuous_in_state(frame, &self.last_decoded_state) {
            return true;
        }
        // Check as if every decodable frame before it had been released.
        let timestamp = timestamp_of(frame);
        let mut decoding_state = self.last_decoded_state;
        for (_, decodable_frame) in self.decodable_frames.iter() {
            if timestamp_of(decodable_frame).is_newer_than(timestamp) {
                break;
            }
            decoding_state.set_state(decodable_frame);
            if is_continuous_in_state(frame, &decoding_state) {
                return true;
            }
        }
        false
    }

    fn find_and_insert_continuous_frames(&mut self, new_frame_timestamp: FullTimestamp) {
        let mut decoding_state = self.last_decoded_state;
        if let Some(new_frame) = self.decodable_frames.get(new_frame_timestamp) {
            decoding_state.set_state(new_frame);
        }
        self.find_and_insert_continuous_frames_with_state(decoding_state);
    }

    // Moves incomplete frames that became continuous to the decodable list, in timestamp order,
    // stopping at the first that isn't.
    fn find_and_insert_continuous_frames_with_state(&mut self, original_state: DecodingState) {
        let mut decoding_state = original_state;
        for timestamp in self.incomplete_frames.timestamps() {
            let Some(frame) = self.incomplete_frames.get(timestamp) else {
                continue;
            };
            if !original_state.in_initial_state()
                && original_state
                    .timestamp()
                    .is_newer_than(timestamp_of(frame))
            {
                continue;
            }
            if !is_continuous_in_state(frame, &decoding_state) {
                break;
            }
            if let Some(frame) = self.incomplete_frames.pop(timestamp) {
                decoding_state.set_state(&frame);
                self.decodable_frames.insert(timestamp, frame);
            }
        }
    }

    fn cleanup_old_or_empty_frames(&mut self) {
        let dropped = self
            .decodable_frames
            .cleanup_old_or_empty(&mut self.last_decoded_state, &mut self.free_frames)
            + self
                .incomplete_frames
                .cleanup_old_or_empty(&mut self.last_decoded_state, &mut self.free_frames);
        if dropped > 0 {
            debug!("dropped {} old or empty frames", dropped);
        }
        if !self.last_decoded_state.in_initial_state() {
            self.missing_seqnums
                .drop_up_to(self.last_decoded_state.seqnum());
        }
    }

    fn complete_front_timestamp(&self) -> Option<TruncatedTimestamp> {
        let (_, frame) = self.decodable_frames.front()?;
        if frame.state() == FrameState::Complete {
            frame.timestamp()
        } else {
            None
        }
    }

    fn next_maybe_incomplete_timestamp(&mut self) -> Option<TruncatedTimestamp> {
        if !self.running || self.config.decode_error_mode == DecodeErrorMode::Strict {
            return None;
        }
        self.cleanup_old_or_empty_frames();

        if let Some((_, oldest)) = self.decodable_frames.front() {
            // A lone frame is only released once it's complete.
            if self.decodable_frames.len() == 1
                && self.incomplete_frames.is_empty()
                && oldest.state() != FrameState::Complete
            {
                return None;
            }
            return oldest.timestamp();
        }

        let mut frames = self.incomplete_frames.iter();
        let (_, oldest) = frames.next()?;
        if self.last_decoded_state.in_initial_state()
            && !(oldest.frame_type() == FrameType::Key && oldest.have_first_packet())
        {
            return None;
        }
        match frames.next() {
            None => {
                if oldest.state() == FrameState::Complete {
                    oldest.timestamp()
                } else {
                    None
                }
            }
            Some((_, next)) => {
                // Once a later frame started past its end, the oldest frame can't get any more
                // packets.
                let passed = match (oldest.high_seqnum(), next.low_seqnum()) {
                    (Some(high), Some(next_low)) => next_low.is_newer_than(high),
                    _ => false,
                };
                if passed && oldest.state() != FrameState::Empty {
                    oldest.timestamp()
                } else {
                    None
                }
            }
        }
    }

    fn extract(&mut self, timestamp: TruncatedTimestamp) -> Option<FrameBuffer> {
        if !self.running {
            return None;
        }
        let full_timestamp = expand_timestamp_near(timestamp, self.max_timestamp?);
        let (mut frame, continuous) = match self.decodable_frames.pop(full_timestamp) {
            Some(frame) => (frame, true),
            None => {
                let frame = self.incomplete_frames.pop(full_timestamp)?;
                let continuous = self.last_decoded_state.continuous_frame(&frame);
                (frame, continuous)
            }
        };
        frame.prepare_for_decode(continuous);

        self.last_decoded_state.set_state(&frame);
        self.missing_seqnums
            .drop_up_to(self.last_decoded_state.seqnum());
        if frame.is_complete() {
            self.update_average_packets_per_frame(frame.num_packets());
        }
        self.stats.extracted_frames += 1;
        Some(frame)
    }

    fn update_average_packets_per_frame(&mut self, packets: usize) {
        let packets = packets as f32;
        if self.frame_counter > FAST_CONVERGE_FRAME_COUNT {
            self.average_packets_per_frame = self.average_packets_per_frame
                * (1.0 - NORMAL_CONVERGE_MULTIPLIER)
                + packets * NORMAL_CONVERGE_MULTIPLIER;
        } else if self.frame_counter > 0 {
            self.average_packets_per_frame = self.average_packets_per_frame
                * (1.0 - FAST_CONVERGE_MULTIPLIER)
                + packets * FAST_CONVERGE_MULTIPLIER;
            self.frame_counter += 1;
        } else {
            self.average_packets_per_frame = packets;
            self.frame_counter += 1;
        }
    }

    // The timestamp span from the last decodable frame (or the first incomplete one) to the
    // newest incomplete frame.
    fn non_continuous_or_incomplete_duration(&self) -> Duration {
        let Some((newest, _)) = self.incomplete_frames.back() else {
            return Duration::ZERO;
        };
        let start = match self.decodable_frames.back() {
            Some((timestamp, _)) => timestamp,
            None => self
                .incomplete_frames
                .front()
                .map_or(newest, |(timestamp, _)| timestamp),
        };
        Duration::from_millis(newest.saturating_sub(start) / VIDEO_CLOCK_RATE_KHZ)
    }

    fn too_long_without_nack(&self) -> bool {
        self.config.nack_mode == NackMode::Off
            && self.non_continuous_or_incomplete_duration() > MAX_DISCONTINUOUS_FRAMES_TIME
    }

    fn nack_list(&mut self, max_size: usize) -> NackList {
        if self.config.nack_mode == NackMode::Off {
            return NackList::default();
        }

        if self.last_decoded_state.in_initial_state() {
            let next_frame = self
                .decodable_frames
                .front()
                .or_else(|| self.incomplete_frames.front());
            let first_frame_is_key = next_frame.is_some_and(|(_, frame)| {
                frame.frame_type() == FrameType::Key && frame.have_first_packet()
            });
            if !first_frame_is_key {
                let have_non_empty_frame = self
                    .decodable_frames
                    .iter()
                    .chain(self.incomplete_frames.iter())
                    .any(|(_, frame)| frame.state() != FrameState::Empty);
                if !self.recycle_frames_until_key_frame() {
                    return NackList {
                        seqnums: vec![],
                        request_key_frame: have_non_empty_frame,
                    };
                }
            }
        }

        let mut request_key_frame = false;
        if self.too_large_nack_list() {
            request_key_frame = !self.handle_too_large_nack_list();
        }

        if let Some(max_incomplete_time) = self.config.max_incomplete_time {
            let duration = self.non_continuous_or_incomplete_duration();
            if duration > max_incomplete_time {
                warn!(
                    "too long non-decodable duration: {:?} > {:?}",
                    duration, max_incomplete_time
                );
                let last_key_frame = self
                    .incomplete_frames
                    .iter()
                    .rev()
                    .find(|(_, frame)| frame.frame_type() == FrameType::Key)
                    .map(|(timestamp, frame)| (timestamp, frame.estimated_low_seqnum()));
                match last_key_frame {
                    None => {
                        return NackList {
                            seqnums: vec![],
                            request_key_frame: true,
                        };
                    }
                    Some((timestamp, low_seqnum)) => {
                        // Skip ahead to the last key frame; if it's incomplete we'll NACK it.
                        let dropped = self
                            .decodable_frames
                            .recycle_older_than(timestamp, &mut self.free_frames)
                            + self
                                .incomplete_frames
                                .recycle_older_than(timestamp, &mut self.free_frames);
                        self.stats.dropped_frames += dropped as u64;
                        self.last_decoded_state.reset();
                        if let Some(low_seqnum) = low_seqnum {
                            self.missing_seqnums.drop_up_to(low_seqnum);
                        }
                    }
                }
            }
        }

        NackList {
            seqnums: self.missing_seqnums.iter().take(max_size).collect(),
            request_key_frame,
        }
    }
}
