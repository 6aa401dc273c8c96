//! Frame extraction and decoding for the dual force-plate wire format.
//!
//! The instrument streams fixed 40-byte little-endian frames back to back:
//!
//! | Bytes     | Content                                         |
//! |-----------|-------------------------------------------------|
//! | `[0, 8)`  | `u64` device timestamp, ms since the Unix epoch |
//! | `[8, 24)` | four `i32` raw ADC codes, left platform         |
//! | `[24, 40)`| four `i32` raw ADC codes, right platform        |
//!
//! The transport delivers this stream in chunks whose boundaries have nothing
//! to do with frame boundaries, so [`FrameDecoder`] keeps the tail of every
//! chunk in a carry buffer until the next chunk completes it.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::convert::UnitConverter;
use crate::errors::DecodeError;

// ============================================================================
// Constants
// ============================================================================

/// Size of one frame on the wire.
pub const FRAME_SIZE: usize = 40;

/// Load cells per platform.
pub const CHANNELS_PER_PLATFORM: usize = 4;

const TIMESTAMP_OFFSET: usize = 0;
const LEFT_OFFSET: usize = 8;
const RIGHT_OFFSET: usize = LEFT_OFFSET + 4 * CHANNELS_PER_PLATFORM;

// ============================================================================
// Data Types
// ============================================================================

/// One frame exactly as transmitted, before unit conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawFrame {
    pub timestamp_ms: u64,
    pub left: [i32; CHANNELS_PER_PLATFORM],
    pub right: [i32; CHANNELS_PER_PLATFORM],
}

impl RawFrame {
    /// Deserialize a frame. Fails only when `data` is not exactly [`FRAME_SIZE`] bytes.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let bytes: &[u8; FRAME_SIZE] = data.try_into().map_err(|_| DecodeError::Corrupt {
            expected: FRAME_SIZE,
            actual: data.len(),
        })?;

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8]);

        Ok(Self {
            timestamp_ms: u64::from_le_bytes(ts),
            left: read_platform(bytes, LEFT_OFFSET),
            right: read_platform(bytes, RIGHT_OFFSET),
        })
    }

    /// Serialize into the wire layout.
    pub fn to_bytes(&self) -> [u8; FRAME_SIZE] {
        let mut out = [0u8; FRAME_SIZE];
        out[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        for (i, code) in self.left.iter().enumerate() {
            let at = LEFT_OFFSET + 4 * i;
            out[at..at + 4].copy_from_slice(&code.to_le_bytes());
        }
        for (i, code) in self.right.iter().enumerate() {
            let at = RIGHT_OFFSET + 4 * i;
            out[at..at + 4].copy_from_slice(&code.to_le_bytes());
        }
        out
    }
}

fn read_platform(bytes: &[u8; FRAME_SIZE], offset: usize) -> [i32; CHANNELS_PER_PLATFORM] {
    std::array::from_fn(|i| {
        let at = offset + 4 * i;
        i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    })
}

/// A decoded, unit-converted sample from both platforms.
///
/// The channel arrays are fixed-size, so a record with anything other than
/// four readings per platform cannot be constructed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleRecord {
    /// Device capture time as an offset from the Unix epoch.
    pub timestamp: Duration,
    pub left_channels: [f64; CHANNELS_PER_PLATFORM],
    pub right_channels: [f64; CHANNELS_PER_PLATFORM],
    /// Nominal acquisition rate (Hz) from configuration.
    pub sampling_rate: u32,
    /// Host-assigned sequence number: 0 for the first frame of a connection, +1 per frame.
    pub sample_index: u64,
}

impl SampleRecord {
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp.as_millis() as u64
    }

    /// Capture time as wall-clock time, if representable on this platform.
    pub fn system_time(&self) -> Option<SystemTime> {
        UNIX_EPOCH.checked_add(self.timestamp)
    }

    pub fn left_total(&self) -> f64 {
        self.left_channels.iter().sum()
    }

    pub fn right_total(&self) -> f64 {
        self.right_channels.iter().sum()
    }

    /// Total vertical force across both platforms.
    pub fn total(&self) -> f64 {
        self.left_total() + self.right_total()
    }
}

// ============================================================================
// Frame Decoder
// ============================================================================

/// Turns arbitrarily chunked bytes into [`SampleRecord`]s.
///
/// Decode order equals arrival order; the decoder is sequential state and
/// must only ever be fed from one place.
#[derive(Debug)]
pub struct FrameDecoder {
    converter: UnitConverter,
    sampling_rate: u32,
    carry: Vec<u8>,
    /// Bytes at the front of `carry` already handed out as frames.
    consumed: usize,
    next_index: u64,
}

impl FrameDecoder {
    pub fn new(converter: UnitConverter, sampling_rate: u32) -> Self {
        Self {
            converter,
            sampling_rate,
            carry: Vec::with_capacity(4 * FRAME_SIZE),
            consumed: 0,
            next_index: 0,
        }
    }

    /// Append `chunk` and lazily yield every complete frame now available.
    ///
    /// Bytes that do not yet form a whole frame stay buffered for the next
    /// call. Frames not pulled from the returned iterator are not lost; they
    /// are yielded by the next `feed`.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.append(chunk);
        Frames { decoder: self }
    }

    /// Buffer `chunk` without decoding anything yet.
    pub(crate) fn append(&mut self, chunk: &[u8]) {
        if self.consumed > 0 {
            self.carry.drain(..self.consumed);
            self.consumed = 0;
        }
        self.carry.extend_from_slice(chunk);
    }

    /// Drop `token` if the buffered bytes at the current frame boundary start with it.
    ///
    /// Used for out-of-band replies the instrument inserts between frames.
    pub(crate) fn strip_prefix(&mut self, token: &[u8]) -> bool {
        if token.is_empty() || !self.carry[self.consumed..].starts_with(token) {
            return false;
        }
        self.consumed += token.len();
        true
    }

    /// Drop buffered bytes and restart numbering at 0.
    pub fn reset(&mut self) {
        self.carry.clear();
        self.consumed = 0;
        self.next_index = 0;
    }

    /// Bytes held back waiting for the rest of their frame.
    pub fn pending_bytes(&self) -> usize {
        self.carry.len() - self.consumed
    }

    /// Index the next decoded record will carry.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Convert a raw frame and assign it the next sample index.
    pub fn decode_frame(&mut self, raw: &RawFrame) -> SampleRecord {
        let record = SampleRecord {
            timestamp: Duration::from_millis(raw.timestamp_ms),
            left_channels: self.converter.convert_all(raw.left),
            right_channels: self.converter.convert_all(raw.right),
            sampling_rate: self.sampling_rate,
            sample_index: self.next_index,
        };
        self.next_index += 1;
        record
    }

    pub(crate) fn next_frame(&mut self) -> Option<Result<SampleRecord, DecodeError>> {
        if self.pending_bytes() < FRAME_SIZE {
            return None;
        }
        let start = self.consumed;
        self.consumed += FRAME_SIZE;
        // A failed decode still consumes its 40 bytes; the next frame starts
        // at the following boundary.
        let raw = RawFrame::decode(&self.carry[start..start + FRAME_SIZE]);
        Some(raw.map(|raw| self.decode_frame(&raw)))
    }
}

/// Iterator returned by [`FrameDecoder::feed`].
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
    type Item = Result<SampleRecord, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_frame()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.decoder.pending_bytes() / FRAME_SIZE;
        (n, Some(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::CalibrationConstants;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn decoder() -> FrameDecoder {
        FrameDecoder::new(UnitConverter::default(), 1000)
    }

    fn frame(i: i32) -> RawFrame {
        RawFrame {
            timestamp_ms: 1_700_000_000_000 + i as u64,
            left: [i, i + 1, i + 2, i + 3],
            right: [-i, -i - 1, -i - 2, -i - 3],
        }
    }

    fn stream_of(n: i32) -> Vec<u8> {
        (0..n).flat_map(|i| frame(i * 1000).to_bytes()).collect()
    }

    fn collect(dec: &mut FrameDecoder, chunk: &[u8]) -> Vec<SampleRecord> {
        dec.feed(chunk).map(|r| r.expect("decode")).collect()
    }

    #[test]
    fn wire_layout_is_little_endian() {
        let raw = RawFrame {
            timestamp_ms: 0x0102_0304_0506_0708,
            left: [1, -1, 0x1122_3344, 0],
            right: [0, 0, 0, i32::MIN],
        };
        let bytes = raw.to_bytes();
        assert_eq!(&bytes[0..8], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[8..12], &[1, 0, 0, 0]);
        assert_eq!(&bytes[12..16], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&bytes[16..20], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&bytes[36..40], &[0x00, 0x00, 0x00, 0x80]);
        assert_eq!(RawFrame::decode(&bytes), Ok(raw));
    }

    #[test]
    fn wrong_length_is_corrupt() {
        assert_eq!(
            RawFrame::decode(&[0u8; 39]),
            Err(DecodeError::Corrupt {
                expected: 40,
                actual: 39
            })
        );
        assert!(RawFrame::decode(&[0u8; 41]).is_err());
    }

    #[test]
    fn reference_frame() {
        let mut dec = FrameDecoder::new(
            UnitConverter::new(CalibrationConstants {
                max_raw_code: 8_388_607,
                max_physical_force: 500.0,
            }),
            1000,
        );
        let raw = RawFrame {
            timestamp_ms: 1000,
            left: [100, 200, 300, 400],
            right: [-100, -200, -300, -400],
        };
        let records = collect(&mut dec, &raw.to_bytes());
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.sample_index, 0);
        assert_eq!(rec.timestamp_ms(), 1000);
        assert_eq!(rec.sampling_rate, 1000);
        assert_relative_eq!(rec.left_channels[0], 0.005_960_464, epsilon = 1e-8);
        assert_relative_eq!(rec.right_channels[0], -0.005_960_464, epsilon = 1e-8);
        assert_relative_eq!(rec.left_channels[3], 4.0 * rec.left_channels[0], epsilon = 1e-12);
        assert_relative_eq!(rec.total(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn partial_frame_is_carried() {
        let bytes = stream_of(2);
        let mut split = decoder();
        let mut first = collect(&mut split, &bytes[..45]);
        assert_eq!(first.len(), 1);
        assert_eq!(split.pending_bytes(), 5);
        first.extend(collect(&mut split, &bytes[45..]));
        assert_eq!(split.pending_bytes(), 0);

        let mut whole = decoder();
        assert_eq!(first, collect(&mut whole, &bytes));
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn split_invariance_random_chunks() {
        let bytes = stream_of(64);
        let expected = collect(&mut decoder(), &bytes);
        assert_eq!(expected.len(), 64);

        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let mut dec = decoder();
            let mut got = Vec::new();
            let mut pos = 0;
            while pos < bytes.len() {
                let len = rng.gen_range(0..=100).min(bytes.len() - pos);
                got.extend(collect(&mut dec, &bytes[pos..pos + len]));
                pos += len;
            }
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn byte_at_a_time() {
        let bytes = stream_of(3);
        let mut dec = decoder();
        let mut got = Vec::new();
        for b in &bytes {
            got.extend(collect(&mut dec, std::slice::from_ref(b)));
        }
        assert_eq!(got, collect(&mut decoder(), &bytes));
    }

    #[test]
    fn indices_are_contiguous_from_zero() {
        let bytes = stream_of(10);
        let mut dec = decoder();
        let mut got = collect(&mut dec, &bytes[..123]);
        got.extend(collect(&mut dec, &bytes[123..]));
        let indices: Vec<u64> = got.iter().map(|r| r.sample_index).collect();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
        assert_eq!(dec.next_index(), 10);
    }

    #[test]
    fn unconsumed_frames_survive_to_next_feed() {
        let bytes = stream_of(3);
        let mut dec = decoder();
        let first = dec.feed(&bytes).next().map(|r| r.expect("decode"));
        assert_eq!(first.map(|r| r.sample_index), Some(0));
        let rest = collect(&mut dec, &[]);
        assert_eq!(
            rest.iter().map(|r| r.sample_index).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn reset_discards_partial_frame() {
        let bytes = stream_of(1);
        let mut dec = decoder();
        assert!(collect(&mut dec, &bytes[..25]).is_empty());
        dec.reset();
        assert_eq!(dec.pending_bytes(), 0);
        assert!(collect(&mut dec, &bytes[25..]).is_empty());
        assert_eq!(dec.pending_bytes(), 15);
        assert_eq!(dec.next_index(), 0);
    }

    #[test]
    fn reset_restarts_numbering() {
        let bytes = stream_of(2);
        let mut dec = decoder();
        assert_eq!(collect(&mut dec, &bytes).len(), 2);
        dec.reset();
        let again = collect(&mut dec, &bytes);
        assert_eq!(again[0].sample_index, 0);
        assert_eq!(again[1].sample_index, 1);
    }

    #[test]
    fn size_hint_counts_complete_frames() {
        let bytes = stream_of(3);
        let mut dec = decoder();
        assert_eq!(dec.feed(&bytes[..100]).size_hint(), (2, Some(2)));
    }

    #[test]
    fn stripped_token_keeps_alignment() {
        let bytes = stream_of(2);
        let mut dec = decoder();
        dec.append(&bytes[..40]);
        dec.append(b"ACK\n");
        dec.append(&bytes[40..]);
        let first = dec.next_frame().map(|r| r.expect("decode"));
        assert_eq!(first.map(|r| r.timestamp_ms()), Some(frame(0).timestamp_ms));
        assert!(!dec.strip_prefix(b"NOPE"));
        assert!(dec.strip_prefix(b"ACK\n"));
        let second = dec.next_frame().map(|r| r.expect("decode"));
        assert_eq!(second.map(|r| r.timestamp_ms()), Some(frame(1000).timestamp_ms));
        assert_eq!(dec.pending_bytes(), 0);
    }
}
