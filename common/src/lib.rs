//
// Copyright 2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common functionality for the program stream jitter buffer.

mod counters;

use std::io::Write;

pub use counters::*;

/// Log line format used by the binaries: `timestamp level target:line message`.
pub fn format_log_line(
    buf: &mut env_logger::fmt::Formatter,
    record: &log::Record,
) -> std::io::Result<()> {
    writeln!(
        buf,
        "{} {:<5} {}:{} {}",
        buf.timestamp_micros(),
        record.level(),
        record.target(),
        record.line().unwrap_or(0),
        record.args()
    )
}
