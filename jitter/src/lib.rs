//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

pub mod config;
pub mod decoding_state;
pub mod frame_buffer;
pub mod frame_list;
pub mod frame_pool;
pub mod jitter_buffer;
pub mod nack;
pub mod packet;
pub mod ps;
pub mod replay;
