//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Configuration options for the jitter buffer and the replay tool.

use std::time::Duration;

/// How willing the buffer is to hand out frames that are not complete.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum DecodeErrorMode {
    /// Only complete frames are decodable.
    #[default]
    Strict,
    /// Any frame with at least one media packet is decodable.
    Tolerant,
    /// Incomplete frames become decodable when waiting for retransmissions is unlikely to pay off.
    Selective(SelectiveConfig),
}

/// Thresholds for [`DecodeErrorMode::Selective`].
///
/// A frame that is not complete is still decodable once the round trip time is at least
/// `rtt_threshold` and the number of packets received, relative to the rolling average of
/// packets per frame, is outside of the uncertain band `(low_packet_ratio, high_packet_ratio]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SelectiveConfig {
    pub rtt_threshold: Duration,
    pub low_packet_ratio: f32,
    pub high_packet_ratio: f32,
}

impl Default for SelectiveConfig {
    fn default() -> Self {
        Self {
            rtt_threshold: Duration::from_millis(100),
            low_packet_ratio: 0.2,
            high_packet_ratio: 0.8,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NackMode {
    #[default]
    Off,
    On {
        /// Above this round trip time retransmissions are not worth waiting for.
        high_rtt_threshold: Option<Duration>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct JitterBufferConfig {
    pub decode_error_mode: DecodeErrorMode,
    pub nack_mode: NackMode,
    /// Once more sequence numbers than this are missing, frames are dropped up to the next key
    /// frame.
    pub max_nack_list_size: usize,
    /// The oldest missing sequence number may trail the newest received one by at most this.
    pub max_packet_age_to_nack: u16,
    /// Longest span of non-continuous or incomplete frames tolerated before skipping ahead to a
    /// key frame.
    pub max_incomplete_time: Option<Duration>,
    /// Frame buffers allocated up front.
    pub start_frame_count: usize,
    /// Hard cap on frame buffers ever allocated.
    pub max_frame_count: usize,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            decode_error_mode: DecodeErrorMode::Strict,
            nack_mode: NackMode::Off,
            max_nack_list_size: 250,
            max_packet_age_to_nack: 450,
            max_incomplete_time: None,
            start_frame_count: 6,
            max_frame_count: 300,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DecodeErrorModeArg {
    #[default]
    Strict,
    Tolerant,
    Selective,
}

/// Options for the replay tool, set by command line arguments.
#[derive(Default, clap::Parser, Debug, Clone)]
#[clap(name = "ps_jitter")]
pub struct Config {
    /// The packet capture to replay.
    #[clap(long)]
    pub input: String,

    /// Where the reassembled program stream is written.
    #[clap(long)]
    pub output: String,

    /// Which incomplete frames may be handed to the demuxer.
    #[clap(long, value_enum, default_value = "strict")]
    pub decode_error_mode: DecodeErrorModeArg,

    /// Round trip time above which selective decoding gives up on waiting (ms).
    #[clap(long, default_value = "100")]
    pub selective_rtt_threshold_ms: u64,

    /// Lower bound of the uncertain packet ratio band for selective decoding.
    #[clap(long, default_value = "0.2")]
    pub selective_low_packet_ratio: f32,

    /// Upper bound of the uncertain packet ratio band for selective decoding.
    #[clap(long, default_value = "0.8")]
    pub selective_high_packet_ratio: f32,

    /// Track missing sequence numbers and produce NACK lists.
    #[clap(long)]
    pub nack: bool,

    /// Round trip time at which retransmissions are no longer waited for (ms).
    #[clap(long)]
    pub high_rtt_nack_threshold_ms: Option<u64>,

    #[clap(long, default_value = "250")]
    pub max_nack_list_size: usize,

    #[clap(long, default_value = "450")]
    pub max_packet_age_to_nack: u16,

    /// Longest non-decodable span tolerated before resynchronizing on a key frame (ms).
    #[clap(long)]
    pub max_incomplete_time_ms: Option<u64>,

    #[clap(long, default_value = "6")]
    pub start_frame_count: usize,

    #[clap(long, default_value = "300")]
    pub max_frame_count: usize,

    /// The round trip time estimate fed to the buffer (ms).
    #[clap(long, default_value = "0")]
    pub rtt_ms: u64,

    /// How long the consumer waits for a complete frame before trying an incomplete one (ms).
    #[clap(long, default_value = "200")]
    pub max_wait_ms: u64,
}

impl Config {
    pub fn jitter_buffer_config(&self) -> JitterBufferConfig {
        let decode_error_mode = match self.decode_error_mode {
            DecodeErrorModeArg::Strict => DecodeErrorMode::Strict,
            DecodeErrorModeArg::Tolerant => DecodeErrorMode::Tolerant,
            DecodeErrorModeArg::Selective => DecodeErrorMode::Selective(SelectiveConfig {
                rtt_threshold: Duration::from_millis(self.selective_rtt_threshold_ms),
                low_packet_ratio: self.selective_low_packet_ratio,
                high_packet_ratio: self.selective_high_packet_ratio,
            }),
        };
        let nack_mode = if self.nack {
            NackMode::On {
                high_rtt_threshold: self.high_rtt_nack_threshold_ms.map(Duration::from_millis),
            }
        } else {
            NackMode::Off
        };
        JitterBufferConfig {
            decode_error_mode,
            nack_mode,
            max_nack_list_size: self.max_nack_list_size,
            max_packet_age_to_nack: self.max_packet_age_to_nack,
            max_incomplete_time: self.max_incomplete_time_ms.map(Duration::from_millis),
            start_frame_count: self.start_frame_count,
            max_frame_count: self.max_frame_count,
        }
    }
}

#[cfg(test)]
pub(crate) fn default_test_config() -> Config {
    Config {
        input: "in.pscap".to_string(),
        output: "out.ps".to_string(),
        decode_error_mode: DecodeErrorModeArg::Strict,
        selective_rtt_threshold_ms: 100,
        selective_low_packet_ratio: 0.2,
        selective_high_packet_ratio: 0.8,
        nack: true,
        high_rtt_nack_threshold_ms: None,
        max_nack_list_size: 250,
        max_packet_age_to_nack: 450,
        max_incomplete_time_ms: Some(1000),
        start_frame_count: 6,
        max_frame_count: 300,
        rtt_ms: 0,
        max_wait_ms: 200,
    }
}

#[cfg(test)]
mod test {
    use clap::Parser;

    use super::*;

    #[test]
    fn command_line_defaults() {
        let config = Config::parse_from(["ps_jitter", "--input", "a", "--output", "b"]);
        assert_eq!(JitterBufferConfig::default(), config.jitter_buffer_config());
    }

    #[test]
    fn selective_and_nack_options() {
        let mut config = default_test_config();
        config.decode_error_mode = DecodeErrorModeArg::Selective;
        config.high_rtt_nack_threshold_ms = Some(300);
        let jb_config = config.jitter_buffer_config();
        assert_eq!(
            DecodeErrorMode::Selective(SelectiveConfig::default()),
            jb_config.decode_error_mode
        );
        assert_eq!(
            NackMode::On {
                high_rtt_threshold: Some(Duration::from_millis(300))
            },
            jb_config.nack_mode
        );
        assert_eq!(Some(Duration::from_millis(1000)), jb_config.max_incomplete_time);
    }
}
