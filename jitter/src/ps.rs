//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Just enough of the MPEG program stream format (ISO/IEC 13818-1) to tell where a frame starts
//! and whether it is a key frame. The full demuxing happens downstream.

use crate::packet::FrameType;

pub const PACK_START_CODE: [u8; 4] = [0x00, 0x00, 0x01, 0xBA];
pub const SYSTEM_HEADER_START_CODE: [u8; 4] = [0x00, 0x00, 0x01, 0xBB];
pub const PROGRAM_STREAM_MAP_START_CODE: [u8; 4] = [0x00, 0x00, 0x01, 0xBC];

const MPEG2_PACK_HEADER_LEN: usize = 14;
const MPEG1_PACK_HEADER_LEN: usize = 12;
const STUFFING_LEN_MASK: u8 = 0b111;

/// Returns true iff the payload begins with a pack header, which is how every frame of the
/// stream starts.
pub fn starts_with_pack_header(payload: &[u8]) -> bool {
    payload.starts_with(&PACK_START_CODE)
}

/// Returns the length of the pack header at the start of the payload, including stuffing, or
/// None if there is no (complete) pack header.
pub fn pack_header_len(payload: &[u8]) -> Option<usize> {
    if !starts_with_pack_header(payload) {
        return None;
    }
    let marker = *payload.get(4)?;
    let len = if marker >> 6 == 0b01 {
        // MPEG-2: the last 3 bits of byte 13 are the stuffing length.
        let stuffing = (*payload.get(MPEG2_PACK_HEADER_LEN - 1)? & STUFFING_LEN_MASK) as usize;
        MPEG2_PACK_HEADER_LEN + stuffing
    } else if marker >> 4 == 0b0010 {
        MPEG1_PACK_HEADER_LEN
    } else {
        return None;
    };
    if len <= payload.len() {
        Some(len)
    } else {
        None
    }
}

/// Key frames repeat the system header (and the stream map) right after the pack header so that
/// a demuxer can start from them.
pub fn is_key_frame_start(payload: &[u8]) -> bool {
    match pack_header_len(payload) {
        Some(len) => {
            let rest = &payload[len..];
            rest.starts_with(&SYSTEM_HEADER_START_CODE)
                || rest.starts_with(&PROGRAM_STREAM_MAP_START_CODE)
        }
        None => false,
    }
}

/// Returns (is_first_packet, frame_type) for an RTP payload.
pub fn classify(payload: &[u8]) -> (bool, FrameType) {
    if payload.is_empty() {
        (false, FrameType::Empty)
    } else if !starts_with_pack_header(payload) {
        (false, FrameType::Delta)
    } else if is_key_frame_start(payload) {
        (true, FrameType::Key)
    } else {
        (true, FrameType::Delta)
    }
}
