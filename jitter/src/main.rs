//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

#[macro_use]
extern crate log;

use anyhow::Result;
use clap::Parser;
use env_logger::Env;
use ps_jitter::{config, replay};

#[rustfmt::skip]
fn print_config(config: &config::Config) {
    info!("config:");
    info!("  {:38}{}", "input:", config.input);
    info!("  {:38}{}", "output:", config.output);
    info!("  {:38}{:?}", "decode_error_mode:", config.decode_error_mode);
    if config.decode_error_mode == config::DecodeErrorModeArg::Selective {
        info!("  {:38}{}", "selective_rtt_threshold_ms:", config.selective_rtt_threshold_ms);
        info!("  {:38}{}", "selective_low_packet_ratio:", config.selective_low_packet_ratio);
        info!("  {:38}{}", "selective_high_packet_ratio:", config.selective_high_packet_ratio);
    }
    info!("  {:38}{}", "nack:", config.nack);
    if config.nack {
        info!("  {:38}{:?}", "high_rtt_nack_threshold_ms:", config.high_rtt_nack_threshold_ms);
        info!("  {:38}{}", "max_nack_list_size:", config.max_nack_list_size);
        info!("  {:38}{}", "max_packet_age_to_nack:", config.max_packet_age_to_nack);
        info!("  {:38}{:?}", "max_incomplete_time_ms:", config.max_incomplete_time_ms);
    }
    info!("  {:38}{}", "start_frame_count:", config.start_frame_count);
    info!("  {:38}{}", "max_frame_count:", config.max_frame_count);
    info!("  {:38}{}", "rtt_ms:", config.rtt_ms);
    info!("  {:38}{}", "max_wait_ms:", config.max_wait_ms);
}

fn main() -> Result<()> {
    // Initialize logging.
    env_logger::Builder::from_env(
        Env::default()
            .default_filter_or("ps_jitter=info")
            .default_write_style_or("never"),
    )
    .format(ps_common::format_log_line)
    .init();

    info!(
        "ps_jitter: v{}",
        option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
    );

    // Parse the command line arguments.
    let config = config::Config::parse();
    print_config(&config);

    let stats = replay::replay(&config)?;

    info!("replay finished:");
    info!("  {:38}{}", "packets:", stats.packets);
    info!("  {:38}{}", "frames_written:", stats.frames_written);
    info!("  {:38}{}", "damaged_frames_written:", stats.damaged_frames_written);
    info!("  {:38}{}", "bytes_written:", stats.bytes_written);
    info!("  {:38}{}", "flush_indicators:", stats.flush_indicators);
    info!("  {:38}{}", "key_frame_requests:", stats.key_frame_requests);
    info!("  {:38}{:?}", "jitter_buffer:", stats.jitter_buffer);
    Ok(())
}
