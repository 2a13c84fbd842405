//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Replays a packet capture through a [`JitterBuffer`] and writes the reassembled program
//! stream, with the receive path on its own thread.
//!
//! A capture is a sequence of records:
//!
//! ```text
//! [seqnum: u16][timestamp: u32][flags: u8][len: u16][payload: len bytes]
//! ```
//!
//! All integers are big endian. Bit 0 of the flags is the RTP marker bit.

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, ErrorKind, Read, Write},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use log::*;
use thiserror::Error;

use crate::{
    config::Config,
    jitter_buffer::{InsertOutcome, JitterBuffer, JitterBufferStats, WaitResult},
    nack::NackList,
    packet::{Packet, TruncatedSequenceNumber, TruncatedTimestamp},
};

const MARKER_FLAG: u8 = 0b1;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture ends in the middle of a record")]
    Truncated,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapturedPacket {
    pub seqnum: TruncatedSequenceNumber,
    pub timestamp: TruncatedTimestamp,
    pub marker: bool,
    pub payload: Vec<u8>,
}

pub struct CaptureReader<R> {
    reader: R,
}

impl<R: Read> CaptureReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Returns None at the end of the capture.
    pub fn read_packet(&mut self) -> Result<Option<CapturedPacket>, CaptureError> {
        let seqnum_high = match self.reader.read_u8() {
            Ok(byte) => byte,
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        self.read_rest_of_packet(seqnum_high)
            .map(Some)
            .map_err(|err| match err.kind() {
                ErrorKind::UnexpectedEof => CaptureError::Truncated,
                _ => CaptureError::Io(err),
            })
    }

    fn read_rest_of_packet(&mut self, seqnum_high: u8) -> io::Result<CapturedPacket> {
        let seqnum = u16::from_be_bytes([seqnum_high, self.reader.read_u8()?]);
        let timestamp = self.reader.read_u32::<BE>()?;
        let flags = self.reader.read_u8()?;
        let len = self.reader.read_u16::<BE>()?;
        let mut payload = vec![0; len as usize];
        self.reader.read_exact(&mut payload)?;
        Ok(CapturedPacket {
            seqnum,
            timestamp,
            marker: flags & MARKER_FLAG != 0,
            payload,
        })
    }
}

impl<R: Read> Iterator for CaptureReader<R> {
    type Item = Result<CapturedPacket, CaptureError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_packet().transpose()
    }
}

pub fn write_packet<W: Write>(writer: &mut W, packet: &CapturedPacket) -> io::Result<()> {
    let len = u16::try_from(packet.payload.len())
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "payload too large"))?;
    writer.write_u16::<BE>(packet.seqnum)?;
    writer.write_u32::<BE>(packet.timestamp)?;
    writer.write_u8(if packet.marker { MARKER_FLAG } else { 0 })?;
    writer.write_u16::<BE>(len)?;
    writer.write_all(&packet.payload)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub packets: u64,
    pub flush_indicators: u64,
    pub key_frame_requests: u64,
    pub frames_written: u64,
    /// Frames written without being complete or continuous.
    pub damaged_frames_written: u64,
    pub bytes_written: u64,
    pub jitter_buffer: JitterBufferStats,
}

#[derive(Default)]
struct ProducerStats {
    packets: u64,
    flush_indicators: u64,
    key_frame_requests: u64,
}

#[derive(Default)]
struct ConsumerStats {
    frames_written: u64,
    damaged_frames_written: u64,
    bytes_written: u64,
}

/// Replays the capture named by the config into the output file.
pub fn replay(config: &Config) -> Result<ReplayStats> {
    let input = File::open(&config.input)
        .with_context(|| format!("failed to open capture {}", config.input))?;
    let output = File::create(&config.output)
        .with_context(|| format!("failed to create output {}", config.output))?;
    let mut output = BufWriter::new(output);
    let stats = replay_frames(BufReader::new(input), &mut output, config)?;
    output.flush()?;
    Ok(stats)
}

/// Inserts every packet of the capture from a separate thread while writing frames out as they
/// become ready. Returns once the capture is exhausted and nothing more can be released.
pub fn replay_frames<R, W>(input: R, output: &mut W, config: &Config) -> Result<ReplayStats>
where
    R: Read + Send,
    W: Write,
{
    let jitter_buffer = JitterBuffer::new(config.jitter_buffer_config());
    jitter_buffer.update_rtt(Duration::from_millis(config.rtt_ms));
    let max_wait = Duration::from_millis(config.max_wait_ms);
    let producer_done = AtomicBool::new(false);

    thread::scope(|scope| {
        let producer = scope.spawn(|| {
            let result = produce(
                CaptureReader::new(input),
                &jitter_buffer,
                config.nack.then_some(config.max_nack_list_size),
            );
            producer_done.store(true, Ordering::Release);
            result
        });

        let consumed = consume(output, &jitter_buffer, &producer_done, max_wait);
        if consumed.is_err() {
            // Let the producer bail out early.
            jitter_buffer.stop();
        }
        let produced = producer
            .join()
            .map_err(|_| anyhow!("packet producer panicked"))??;
        let consumed = consumed?;

        Ok(ReplayStats {
            packets: produced.packets,
            flush_indicators: produced.flush_indicators,
            key_frame_requests: produced.key_frame_requests,
            frames_written: consumed.frames_written,
            damaged_frames_written: consumed.damaged_frames_written,
            bytes_written: consumed.bytes_written,
            jitter_buffer: jitter_buffer.stats(),
        })
    })
}

fn produce<R: Read>(
    capture: CaptureReader<R>,
    jitter_buffer: &JitterBuffer,
    max_nack_list_size: Option<usize>,
) -> Result<ProducerStats, CaptureError> {
    let mut stats = ProducerStats::default();
    let mut last_nack_list = NackList::default();
    for captured in capture {
        let captured = captured?;
        stats.packets += 1;
        let packet = Packet::parse(
            captured.seqnum,
            captured.timestamp,
            captured.marker,
            &captured.payload,
        );
        match jitter_buffer.insert_packet(&packet) {
            InsertOutcome::Stopped => break,
            InsertOutcome::FlushIndicator => {
                warn!(
                    "jitter buffer flushed at packet {} (timestamp {}); key frame needed",
                    packet.seqnum, packet.timestamp
                );
                stats.flush_indicators += 1;
            }
            InsertOutcome::SizeError => {
                warn!("dropped oversized frame {}", packet.timestamp);
            }
            outcome => trace!("packet {}: {:?}", packet.seqnum, outcome),
        }

        if let Some(max_size) = max_nack_list_size {
            let nack_list = jitter_buffer.nack_list(max_size);
            if nack_list != last_nack_list {
                if nack_list.request_key_frame {
                    info!("requesting key frame");
                    stats.key_frame_requests += 1;
                } else if !nack_list.seqnums.is_empty() {
                    info!("NACK {:?}", nack_list.seqnums);
                }
                last_nack_list = nack_list;
            }
        }
    }
    Ok(stats)
}

fn consume<W: Write>(
    output: &mut W,
    jitter_buffer: &JitterBuffer,
    producer_done: &AtomicBool,
    max_wait: Duration,
) -> Result<ConsumerStats> {
    let mut stats = ConsumerStats::default();
    loop {
        // Read before looking for frames so that nothing inserted before the producer finished
        // is missed.
        let finished = producer_done.load(Ordering::Acquire);
        let wait = if finished { Duration::ZERO } else { max_wait };
        let timestamp = match jitter_buffer.next_complete_timestamp(wait) {
            WaitResult::Ready(timestamp) => Some(timestamp),
            WaitResult::Timeout => jitter_buffer.next_maybe_incomplete_timestamp(),
            WaitResult::Cancelled => break,
        };
        let Some(timestamp) = timestamp else {
            if finished {
                break;
            }
            continue;
        };
        let Some(frame) = jitter_buffer.extract(timestamp) else {
            // Only a stopped or flushed buffer loses a frame it just offered.
            warn!("frame {} is gone before extraction; stopping", timestamp);
            break;
        };

        let written = output.write_all(frame.payload());
        stats.frames_written += 1;
        stats.bytes_written += frame.len() as u64;
        if frame.missing_frame() || !frame.is_complete() {
            debug!(
                "wrote damaged frame {} (complete: {}, missing previous: {})",
                timestamp,
                frame.is_complete(),
                frame.missing_frame()
            );
            stats.damaged_frames_written += 1;
        }
        jitter_buffer.release(frame);
        written?;
    }
    Ok(stats)
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use hex_literal::hex;

    use super::*;
    use crate::config::{default_test_config, DecodeErrorModeArg};

    const KEY_FRAME_START: [u8; 18] = hex!("000001ba 44000400 0401 0186a3 f8 000001bb");
    const DELTA_FRAME_START: [u8; 14] = hex!("000001ba 44000400 0401 0186a3 f8");

    fn packet(seqnum: u16, timestamp: u32, marker: bool, payload: &[u8]) -> CapturedPacket {
        CapturedPacket {
            seqnum,
            timestamp,
            marker,
            payload: payload.to_vec(),
        }
    }

    fn capture(packets: &[CapturedPacket]) -> Vec<u8> {
        let mut capture = vec![];
        for packet in packets {
            write_packet(&mut capture, packet).unwrap();
        }
        capture
    }

    #[test]
    fn read_capture() {
        let bytes = hex!("0102 00000bb8 01 0003 aabbcc  0103 00000bb8 00 0000");
        let mut reader = CaptureReader::new(&bytes[..]);
        assert_eq!(
            Some(packet(0x0102, 3000, true, &hex!("aabbcc"))),
            reader.read_packet().unwrap()
        );
        assert_eq!(
            Some(packet(0x0103, 3000, false, &[])),
            reader.read_packet().unwrap()
        );
        assert_eq!(None, reader.read_packet().unwrap());
    }

    #[test]
    fn read_truncated_capture() {
        let bytes = hex!("0102 00000bb8 01 0003 aabb");
        let mut reader = CaptureReader::new(&bytes[..]);
        assert!(matches!(reader.read_packet(), Err(CaptureError::Truncated)));

        let bytes = hex!("01");
        let mut reader = CaptureReader::new(&bytes[..]);
        assert!(matches!(reader.read_packet(), Err(CaptureError::Truncated)));
    }

    #[test]
    fn write_then_read() {
        let packets = vec![
            packet(65535, 3000, false, &KEY_FRAME_START),
            packet(0, 3000, true, &[7; 1000]),
        ];
        let bytes = capture(&packets);
        let read: Vec<CapturedPacket> = CaptureReader::new(&bytes[..])
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(packets, read);
    }

    #[test]
    fn replay_reorders_frames() {
        let key = [&KEY_FRAME_START[..], &[1; 100]].concat();
        let delta = [&DELTA_FRAME_START[..], &[3; 50]].concat();
        let input = capture(&[
            packet(3, 6000, true, &delta),
            packet(2, 3000, true, &[2; 80]),
            packet(1, 3000, false, &key),
        ]);

        // Without NACK, frames that arrive before the key frame are kept.
        let config = Config {
            nack: false,
            ..default_test_config()
        };
        let mut output = vec![];
        let stats = replay_frames(Cursor::new(input), &mut output, &config).unwrap();
        assert_eq!([&key[..], &[2; 80], &delta[..]].concat(), output);
        assert_eq!(3, stats.packets);
        assert_eq!(2, stats.frames_written);
        assert_eq!(0, stats.damaged_frames_written);
        assert_eq!(output.len() as u64, stats.bytes_written);
        assert_eq!(1, stats.jitter_buffer.key_frames);
        assert_eq!(1, stats.jitter_buffer.delta_frames);
    }

    #[test]
    fn replay_with_nack_recovers_reordered_packets() {
        let key = [&KEY_FRAME_START[..], &[1; 100]].concat();
        let delta = [&DELTA_FRAME_START[..], &[3; 50]].concat();
        let input = capture(&[
            packet(1, 3000, true, &key),
            packet(3, 6000, true, &[4; 60]),
            packet(2, 6000, false, &delta),
        ]);

        let mut output = vec![];
        let stats = replay_frames(Cursor::new(input), &mut output, &default_test_config()).unwrap();
        assert_eq!([&key[..], &delta[..], &[4; 60]].concat(), output);
        assert_eq!(2, stats.frames_written);
        assert_eq!(0, stats.flush_indicators);
        assert_eq!(0, stats.key_frame_requests);
    }

    #[test]
    fn replay_tolerant_writes_damaged_frames() {
        let key = [&KEY_FRAME_START[..], &[1; 100]].concat();
        let delta = [&DELTA_FRAME_START[..], &[3; 50]].concat();
        let input = capture(&[
            packet(1, 3000, true, &key),
            // The last packet of this frame is lost.
            packet(2, 6000, false, &delta),
            packet(4, 9000, true, &delta),
        ]);

        let config = Config {
            decode_error_mode: DecodeErrorModeArg::Tolerant,
            nack: false,
            ..default_test_config()
        };
        let mut output = vec![];
        let stats = replay_frames(Cursor::new(input), &mut output, &config).unwrap();
        assert_eq!([&key[..], &delta[..], &delta[..]].concat(), output);
        assert_eq!(3, stats.frames_written);
        assert_eq!(2, stats.damaged_frames_written);
    }

    #[test]
    fn replay_fails_on_truncated_capture() {
        let mut input = capture(&[packet(1, 3000, true, &KEY_FRAME_START)]);
        input.truncate(input.len() - 1);
        let mut output = vec![];
        assert!(replay_frames(Cursor::new(input), &mut output, &default_test_config()).is_err());
    }
}
