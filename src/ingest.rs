//! Per-chunk pipeline: carry buffer → decode → publish, plus the counters
//! exposed for observability.
//!
//! Calibration replies arrive in-band, between two frames. They are cut out
//! of the carry buffer at a frame boundary so they never reach the decoder.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;
use tokio::sync::watch;

use crate::calibration::CALIBRATION_REPLY;
use crate::frame::FrameDecoder;
use crate::stream::SampleStream;

/// Emit one aggregated warning per this many occurrences.
const LOG_EVERY: u64 = 100;

/// Snapshot of a connection's ingest counters. All zero after a (re)connect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub samples_decoded: u64,
    /// Frames dropped because they could not be decoded.
    pub corrupted_frames: u64,
    pub bytes_received: u64,
    /// Device timestamps that went backwards or skipped more than 1.5 periods.
    pub timestamp_gaps: u64,
    /// Bytes waiting in the carry buffer.
    pub pending_bytes: u64,
}

#[derive(Debug, Default)]
pub(crate) struct IngestCounters {
    samples_decoded: AtomicU64,
    corrupted_frames: AtomicU64,
    bytes_received: AtomicU64,
    timestamp_gaps: AtomicU64,
    pending_bytes: AtomicU64,
}

impl IngestCounters {
    pub(crate) fn snapshot(&self) -> IngestStats {
        IngestStats {
            samples_decoded: self.samples_decoded.load(Ordering::Relaxed),
            corrupted_frames: self.corrupted_frames.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            timestamp_gaps: self.timestamp_gaps.load(Ordering::Relaxed),
            pending_bytes: self.pending_bytes.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct Ingest {
    decoder: FrameDecoder,
    stream: Arc<SampleStream>,
    counters: Arc<IngestCounters>,
    /// Number of calibration replies seen; watched by `start_calibration`.
    replies: Arc<watch::Sender<u64>>,
    last_timestamp_ms: Option<u64>,
    max_step_ms: u64,
}

impl Ingest {
    pub(crate) fn new(
        mut decoder: FrameDecoder,
        stream: Arc<SampleStream>,
        counters: Arc<IngestCounters>,
        replies: Arc<watch::Sender<u64>>,
        max_step_ms: u64,
    ) -> Self {
        decoder.reset();
        Self {
            decoder,
            stream,
            counters,
            replies,
            last_timestamp_ms: None,
            max_step_ms,
        }
    }

    /// Runs synchronously for one chunk; never waits on subscribers.
    pub(crate) fn handle_chunk(&mut self, chunk: &[u8]) {
        let Self {
            decoder,
            stream,
            counters,
            replies,
            last_timestamp_ms,
            max_step_ms,
        } = self;

        counters
            .bytes_received
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);

        decoder.append(chunk);
        loop {
            if decoder.strip_prefix(CALIBRATION_REPLY) {
                let mut total = 0;
                replies.send_modify(|n| {
                    *n += 1;
                    total = *n;
                });
                debug!("calibration reply received: total={}", total);
                continue;
            }
            let Some(result) = decoder.next_frame() else {
                break;
            };
            match result {
                Ok(record) => {
                    let ts = record.timestamp_ms();
                    if let Some(prev) = *last_timestamp_ms {
                        if ts < prev || ts - prev > *max_step_ms {
                            let gaps = counters.timestamp_gaps.fetch_add(1, Ordering::Relaxed) + 1;
                            if gaps == 1 || gaps % LOG_EVERY == 0 {
                                warn!(
                                    "timestamp gaps detected: total={} (last {} -> {} ms, suppressing per-frame logs)",
                                    gaps, prev, ts
                                );
                            }
                        }
                    }
                    *last_timestamp_ms = Some(ts);
                    counters.samples_decoded.fetch_add(1, Ordering::Relaxed);
                    stream.publish(record);
                }
                Err(e) => {
                    let corrupted = counters.corrupted_frames.fetch_add(1, Ordering::Relaxed) + 1;
                    if corrupted == 1 || corrupted % LOG_EVERY == 0 {
                        warn!(
                            "corrupted frames dropped: total={} ({}, suppressing per-frame logs)",
                            corrupted, e
                        );
                    }
                }
            }
        }

        counters
            .pending_bytes
            .store(decoder.pending_bytes() as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::UnitConverter;
    use crate::frame::RawFrame;

    fn setup(max_step_ms: u64) -> (Ingest, Arc<SampleStream>, Arc<IngestCounters>, watch::Receiver<u64>) {
        let stream = Arc::new(SampleStream::new());
        let counters = Arc::new(IngestCounters::default());
        let (tx, rx) = watch::channel(0);
        let ingest = Ingest::new(
            FrameDecoder::new(UnitConverter::default(), 1000),
            stream.clone(),
            counters.clone(),
            Arc::new(tx),
            max_step_ms,
        );
        (ingest, stream, counters, rx)
    }

    fn at(ms: u64) -> [u8; 40] {
        RawFrame {
            timestamp_ms: ms,
            ..RawFrame::default()
        }
        .to_bytes()
    }

    #[test]
    fn publishes_and_counts() {
        let (mut ingest, stream, counters, replies) = setup(2);
        let mut sub = stream.subscribe().unwrap();

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&at(10));
        bytes.extend_from_slice(&at(11));
        ingest.handle_chunk(&bytes[..50]);
        ingest.handle_chunk(&bytes[50..]);

        let stats = counters.snapshot();
        assert_eq!(stats.samples_decoded, 2);
        assert_eq!(stats.bytes_received, 80);
        assert_eq!(stats.pending_bytes, 0);
        assert_eq!(stats.corrupted_frames, 0);
        assert_eq!(stats.timestamp_gaps, 0);
        assert_eq!(*replies.borrow(), 0);

        assert_eq!(sub.try_recv().unwrap().map(|r| r.sample_index), Some(0));
        assert_eq!(sub.try_recv().unwrap().map(|r| r.sample_index), Some(1));
        assert_eq!(sub.try_recv(), Ok(None));
    }

    #[test]
    fn counts_timestamp_gaps_without_dropping() {
        let (mut ingest, stream, counters, _replies) = setup(2);
        let mut sub = stream.subscribe().unwrap();
        for ms in [100, 101, 102, 110, 111, 105] {
            ingest.handle_chunk(&at(ms));
        }
        let stats = counters.snapshot();
        assert_eq!(stats.samples_decoded, 6);
        // 102 -> 110 skips ahead, 111 -> 105 goes backwards.
        assert_eq!(stats.timestamp_gaps, 2);
        let mut n = 0;
        while let Ok(Some(_)) = sub.try_recv() {
            n += 1;
        }
        assert_eq!(n, 6);
    }

    #[test]
    fn tracks_pending_bytes() {
        let (mut ingest, _stream, counters, _replies) = setup(2);
        ingest.handle_chunk(&at(1)[..17]);
        assert_eq!(counters.snapshot().pending_bytes, 17);
        assert_eq!(counters.snapshot().samples_decoded, 0);
    }

    #[test]
    fn calibration_reply_is_cut_out_between_frames() {
        let (mut ingest, stream, counters, replies) = setup(2);
        let mut sub = stream.subscribe().unwrap();

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&at(10));
        bytes.extend_from_slice(CALIBRATION_REPLY);
        bytes.extend_from_slice(&at(11));
        // Split inside the reply so it is only complete after the second chunk.
        ingest.handle_chunk(&bytes[..42]);
        assert_eq!(*replies.borrow(), 0);
        ingest.handle_chunk(&bytes[42..]);

        assert_eq!(*replies.borrow(), 1);
        let stats = counters.snapshot();
        assert_eq!(stats.samples_decoded, 2);
        assert_eq!(stats.pending_bytes, 0);
        assert_eq!(sub.try_recv().unwrap().map(|r| r.timestamp_ms()), Some(10));
        assert_eq!(sub.try_recv().unwrap().map(|r| r.timestamp_ms()), Some(11));
    }
}
