//! In-process stand-in for the instrument.
//!
//! [`SimulatedDriver`] implements the transport traits over a channel so the
//! whole connection stack can be exercised without hardware: bytes are pushed
//! in whatever chunking the caller chooses, faults can be injected, and
//! everything written to the "device" is captured.

use std::f64::consts::PI;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::debug;

use crate::calibration::CALIBRATION_COMMAND;
use crate::errors::TransportError;
use crate::frame::RawFrame;
use crate::lock;
use crate::transport::{ChunkReader, DeviceHandle, LineSettings, TransportDriver, TransportPort};

pub const DEFAULT_SIM_DEVICE: &str = "sim://forceplate-0";

type Chunk = io::Result<Vec<u8>>;

#[derive(Default)]
struct SimState {
    devices: Mutex<Vec<DeviceHandle>>,
    open_failure: Mutex<Option<io::ErrorKind>>,
    open_delay: Mutex<Duration>,
    /// Sender of the currently open port, tagged with that port's id.
    link: Mutex<Option<(u64, mpsc::Sender<Chunk>)>>,
    next_link: AtomicU64,
    writes: Mutex<Vec<Vec<u8>>>,
    line: Mutex<Option<LineSettings>>,
    control_lines: Mutex<Option<(bool, bool)>>,
    calibration_reply: Mutex<Option<Vec<u8>>>,
    /// Reply waiting for the generator to reach a frame boundary.
    queued_reply: Mutex<Option<Vec<u8>>>,
    generating: AtomicBool,
    on_open: Mutex<Vec<u8>>,
    /// Read handles still alive; the device refuses a new open while any exist.
    readers: AtomicUsize,
    fail_writes: AtomicBool,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

/// Simulated device family. Clones share the same device.
#[derive(Clone)]
pub struct SimulatedDriver {
    state: Arc<SimState>,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDriver {
    /// One device at [`DEFAULT_SIM_DEVICE`].
    pub fn new() -> Self {
        let driver = Self {
            state: Arc::new(SimState::default()),
        };
        driver.add_device(DeviceHandle {
            path: DEFAULT_SIM_DEVICE.to_string(),
            description: Some("simulated dual force plate".to_string()),
        });
        driver
    }

    pub fn add_device(&self, device: DeviceHandle) {
        lock(&self.state.devices).push(device);
    }

    pub fn device(&self) -> DeviceHandle {
        lock(&self.state.devices)
            .first()
            .cloned()
            .unwrap_or_else(|| DeviceHandle::new(DEFAULT_SIM_DEVICE))
    }

    /// Make every subsequent `open` fail with `kind` (`None` clears it).
    pub fn fail_open(&self, kind: Option<io::ErrorKind>) {
        *lock(&self.state.open_failure) = kind;
    }

    /// Delay applied inside `open`, to widen connect races.
    pub fn set_open_delay(&self, delay: Duration) {
        *lock(&self.state.open_delay) = delay;
    }

    /// Bytes sent back whenever the calibration command is written.
    ///
    /// While [`SimulatedDriver::spawn_generator`] runs, the reply is inserted
    /// at the next frame boundary, as the instrument does.
    pub fn reply_to_calibration(&self, reply: Option<Vec<u8>>) {
        *lock(&self.state.calibration_reply) = reply;
    }

    /// Bytes delivered as soon as the next port opens, before anyone reads.
    pub fn queue_on_open(&self, bytes: &[u8]) {
        lock(&self.state.on_open).extend_from_slice(bytes);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Deliver one chunk to the open port. Returns false if nothing is connected.
    pub fn push(&self, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return lock(&self.state.link).is_some();
        }
        self.send(Ok(bytes.to_vec()))
    }

    pub fn push_frame(&self, frame: &RawFrame) -> bool {
        self.push(&frame.to_bytes())
    }

    /// Make the next read on the port fail with `kind`.
    pub fn inject_read_error(&self, kind: io::ErrorKind) -> bool {
        self.send(Err(io::Error::new(kind, "injected read failure")))
    }

    /// Drop the link as if the cable was pulled; the reader sees end of stream.
    pub fn unplug(&self) {
        lock(&self.state.link).take();
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state.writes).clone()
    }

    pub fn line_settings(&self) -> Option<LineSettings> {
        *lock(&self.state.line)
    }

    pub fn control_lines(&self) -> Option<(bool, bool)> {
        *lock(&self.state.control_lines)
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state.link).is_some()
    }

    /// Read handles not yet dropped.
    pub fn live_readers(&self) -> usize {
        self.state.readers.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Stream synthetic frames at `rate` Hz until `stop` is set, in uneven chunks.
    pub fn spawn_generator(
        &self,
        rate: u32,
        stop: Arc<AtomicBool>,
    ) -> io::Result<thread::JoinHandle<()>> {
        let driver = self.clone();
        thread::Builder::new()
            .name("forceplate-sim".into())
            .spawn(move || {
                let period = Duration::from_secs(1) / rate.max(1);
                let batch = (rate / 100).max(1) as usize;
                let mut n: u64 = 0;
                let mut carry = Vec::new();
                let start_ms = synthetic_frame(0, rate).timestamp_ms;
                driver.state.generating.store(true, Ordering::SeqCst);
                while !stop.load(Ordering::Relaxed) {
                    for _ in 0..batch {
                        let mut frame = synthetic_frame(n, rate);
                        // Device clock advances at the nominal rate, not with host jitter.
                        frame.timestamp_ms = start_ms + n * 1000 / u64::from(rate.max(1));
                        carry.extend_from_slice(&frame.to_bytes());
                        n += 1;
                    }
                    // `carry` ends on a frame boundary here.
                    if let Some(reply) = lock(&driver.state.queued_reply).take() {
                        carry.extend_from_slice(&reply);
                    }
                    // Cut off an odd-sized tail so frames straddle chunks.
                    let cut = carry.len().saturating_sub(7 + (n % 23) as usize);
                    driver.push(&carry[..cut]);
                    carry.drain(..cut);
                    thread::sleep(period * batch as u32);
                }
                driver.state.generating.store(false, Ordering::SeqCst);
                debug!("simulated generator stopped after {} frames", n);
            })
    }

    fn send(&self, chunk: Chunk) -> bool {
        match lock(&self.state.link).as_ref() {
            Some((_, tx)) => tx.send(chunk).is_ok(),
            None => false,
        }
    }
}

/// Body-weight-like load shifting between platforms at 1 Hz.
pub fn synthetic_frame(n: u64, rate: u32) -> RawFrame {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let phase = 2.0 * PI * n as f64 / rate.max(1) as f64;
    let base = 1_200_000.0;
    let left = base * (1.0 + 0.3 * phase.sin());
    let right = base * (1.0 - 0.3 * phase.sin());
    RawFrame {
        timestamp_ms: now_ms,
        left: [0.9, 1.0, 1.1, 1.0].map(|w| (left * w) as i32),
        right: [1.0, 1.1, 0.9, 1.0].map(|w| (right * w) as i32),
    }
}

impl TransportDriver for SimulatedDriver {
    fn list_devices(&self) -> Result<Vec<DeviceHandle>, TransportError> {
        Ok(lock(&self.state.devices).clone())
    }

    fn open(
        &self,
        device: &DeviceHandle,
        read_timeout: Duration,
    ) -> Result<Box<dyn TransportPort>, TransportError> {
        let delay = *lock(&self.state.open_delay);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if let Some(kind) = *lock(&self.state.open_failure) {
            return Err(TransportError::Io(io::Error::new(kind, "simulated open failure")));
        }
        if !lock(&self.state.devices).iter().any(|d| d.path == device.path) {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no simulated device at {}", device.path),
            )));
        }
        if self.state.readers.load(Ordering::SeqCst) > 0 {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("simulated device busy: {}", device.path),
            )));
        }

        let (tx, rx) = mpsc::channel();
        let link_id = self.state.next_link.fetch_add(1, Ordering::SeqCst);
        let greeting = std::mem::take(&mut *lock(&self.state.on_open));
        if !greeting.is_empty() {
            let _ = tx.send(Ok(greeting));
        }
        *lock(&self.state.link) = Some((link_id, tx));
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        debug!("simulated device opened: path={}", device.path);

        Ok(Box::new(SimPort {
            state: self.state.clone(),
            link_id,
            rx: Some(rx),
            read_timeout,
            open: true,
        }))
    }
}

struct SimPort {
    state: Arc<SimState>,
    link_id: u64,
    rx: Option<mpsc::Receiver<Chunk>>,
    read_timeout: Duration,
    open: bool,
}

impl SimPort {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.open {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

impl TransportPort for SimPort {
    fn configure(&mut self, line: &LineSettings) -> Result<(), TransportError> {
        self.ensure_open()?;
        *lock(&self.state.line) = Some(*line);
        Ok(())
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<(), TransportError> {
        self.ensure_open()?;
        *lock(&self.state.control_lines) = Some((dtr, rts));
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated write failure",
            )));
        }
        lock(&self.state.writes).push(bytes.to_vec());
        if bytes == CALIBRATION_COMMAND {
            if let Some(reply) = lock(&self.state.calibration_reply).clone() {
                if self.state.generating.load(Ordering::SeqCst) {
                    *lock(&self.state.queued_reply) = Some(reply);
                } else if let Some((id, tx)) = lock(&self.state.link).as_ref() {
                    if *id == self.link_id {
                        let _ = tx.send(Ok(reply));
                    }
                }
            }
        }
        Ok(())
    }

    fn reader(&mut self) -> Result<Box<dyn ChunkReader>, TransportError> {
        self.ensure_open()?;
        let rx = self.rx.take().ok_or_else(|| {
            TransportError::Io(io::Error::new(
                io::ErrorKind::Other,
                "simulated port has a single reader",
            ))
        })?;
        self.state.readers.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimReader {
            state: self.state.clone(),
            rx,
            pending: Vec::new(),
            pos: 0,
            timeout: self.read_timeout,
        }))
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let mut link = lock(&self.state.link);
        if matches!(link.as_ref(), Some((id, _)) if *id == self.link_id) {
            link.take();
        }
        drop(link);
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        debug!("simulated device closed");
    }
}

impl Drop for SimPort {
    fn drop(&mut self) {
        self.close();
    }
}

struct SimReader {
    state: Arc<SimState>,
    rx: mpsc::Receiver<Chunk>,
    pending: Vec<u8>,
    pos: usize,
    timeout: Duration,
}

impl Drop for SimReader {
    fn drop(&mut self) {
        self.state.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Read for SimReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.pending.len() {
            match self.rx.recv_timeout(self.timeout) {
                Ok(Ok(chunk)) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => return Err(e),
                Err(RecvTimeoutError::Timeout) => return Err(io::ErrorKind::TimedOut.into()),
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CALIBRATION_REPLY;
    use crate::frame::FRAME_SIZE;
    use crate::transport::PROTOCOL_LINE;

    const POLL: Duration = Duration::from_millis(20);

    #[test]
    fn open_unknown_device_fails() {
        let sim = SimulatedDriver::new();
        let err = sim
            .open(&DeviceHandle::new("sim://nope"), POLL)
            .err()
            .expect("open should fail");
        assert!(err.is_unavailable());
    }

    #[test]
    fn chunks_flow_to_reader_in_order() {
        let sim = SimulatedDriver::new();
        let mut port = sim.open(&sim.device(), POLL).unwrap();
        let mut reader = port.reader().unwrap();
        assert!(sim.push(&[1, 2, 3]));
        assert!(sim.push(&[4]));

        let mut buf = [0u8; 2];
        assert_eq!(reader.read_chunk(&mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(reader.read_chunk(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 3);
        assert_eq!(reader.read_chunk(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 4);

        let idle = reader.read_chunk(&mut buf).unwrap_err();
        assert_eq!(idle.kind(), io::ErrorKind::TimedOut);

        port.close();
        assert_eq!(reader.read_chunk(&mut buf).unwrap(), 0);
        assert_eq!(sim.close_count(), 1);
    }

    #[test]
    fn records_configuration_and_writes() {
        let sim = SimulatedDriver::new();
        let mut port = sim.open(&sim.device(), POLL).unwrap();
        port.configure(&PROTOCOL_LINE).unwrap();
        port.set_control_lines(true, true).unwrap();
        port.write_all(b"hello").unwrap();
        assert_eq!(sim.line_settings(), Some(PROTOCOL_LINE));
        assert_eq!(sim.control_lines(), Some((true, true)));
        assert_eq!(sim.writes(), vec![b"hello".to_vec()]);

        port.close();
        assert!(matches!(port.write_all(b"x"), Err(TransportError::Closed)));
    }

    #[test]
    fn replies_to_calibration() {
        let sim = SimulatedDriver::new();
        sim.reply_to_calibration(Some(b"OK\n".to_vec()));
        let mut port = sim.open(&sim.device(), POLL).unwrap();
        let mut reader = port.reader().unwrap();
        port.write_all(CALIBRATION_COMMAND).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(reader.read_chunk(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"OK\n");
    }

    #[test]
    fn synthetic_frames_are_positive_load() {
        let frame = synthetic_frame(0, 1000);
        assert!(frame.left.iter().chain(frame.right.iter()).all(|&c| c > 0));
    }

    #[test]
    fn closing_a_stale_port_keeps_the_new_link() {
        let sim = SimulatedDriver::new();
        let mut old = sim.open(&sim.device(), POLL).unwrap();
        let mut new = sim.open(&sim.device(), POLL).unwrap();
        let mut reader = new.reader().unwrap();
        old.close();
        assert!(sim.is_open());
        assert!(sim.push(&[9]));
        let mut buf = [0u8; 1];
        assert_eq!(reader.read_chunk(&mut buf).unwrap(), 1);
        new.close();
        assert!(!sim.is_open());
    }

    #[test]
    fn open_is_refused_while_a_reader_lives() {
        let sim = SimulatedDriver::new();
        let mut port = sim.open(&sim.device(), POLL).unwrap();
        let reader = port.reader().unwrap();
        port.close();
        assert_eq!(sim.live_readers(), 1);
        assert!(sim.open(&sim.device(), POLL).is_err());

        drop(reader);
        assert_eq!(sim.live_readers(), 0);
        assert!(sim.open(&sim.device(), POLL).is_ok());
    }

    #[test]
    fn queued_bytes_arrive_first() {
        let sim = SimulatedDriver::new();
        sim.queue_on_open(&[7, 8]);
        let mut port = sim.open(&sim.device(), POLL).unwrap();
        let mut reader = port.reader().unwrap();
        assert!(sim.push(&[9]));
        let mut buf = [0u8; 4];
        assert_eq!(reader.read_chunk(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[7, 8]);
        assert_eq!(reader.read_chunk(&mut buf).unwrap(), 1);
    }

    #[test]
    fn generator_replies_on_a_frame_boundary() {
        const REPLY_LEN: usize = CALIBRATION_REPLY.len();
        let sim = SimulatedDriver::new();
        sim.reply_to_calibration(Some(CALIBRATION_REPLY.to_vec()));
        let mut port = sim.open(&sim.device(), POLL).unwrap();
        let mut reader = port.reader().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let generator = sim.spawn_generator(1000, stop.clone()).unwrap();
        while !sim.state.generating.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        port.write_all(CALIBRATION_COMMAND).unwrap();

        let mut stream = Vec::new();
        let mut buf = [0u8; 256];
        while stream.windows(REPLY_LEN).all(|w| w != CALIBRATION_REPLY) {
            match reader.read_chunk(&mut buf) {
                Ok(n) => stream.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => panic!("{e}"),
            }
        }
        stop.store(true, Ordering::Relaxed);
        generator.join().unwrap();

        let at = stream.windows(REPLY_LEN).position(|w| w == CALIBRATION_REPLY).unwrap();
        assert_eq!(at % FRAME_SIZE, 0);
    }
}
