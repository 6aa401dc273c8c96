//! Connection lifecycle for one physical instrument.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
//!                     |             |
//!                     +-> Faulted <-+        (unrecoverable transport error)
//! ```
//!
//! While `Connected`, a dedicated reader thread owns the read half of the
//! port together with the frame decoder: every chunk is decoded and published
//! before the next read, so samples leave in exactly the order bytes arrived.
//! Writes (the calibration command) go through the port mutex held in the
//! session, so there is never more than one writer.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::calibration::{self, CalibrationLink};
use crate::config::PlateConfig;
use crate::convert::UnitConverter;
use crate::errors::{
    CalibrationError, ConfigError, ConnectError, StreamClosed, TransportError, TransportReadError,
};
use crate::frame::FrameDecoder;
use crate::ingest::{Ingest, IngestCounters, IngestStats};
use crate::lock;
use crate::stream::{SampleStream, StreamEnd, Subscription};
use crate::transport::{
    is_idle_error, ChunkReader, DeviceHandle, SerialDriver, TransportDriver, TransportPort,
    ASSERT_DTR, ASSERT_RTS, PROTOCOL_LINE,
};

/// Size of a single transport read (~100 frames).
const READ_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Faulted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

type SharedPort = Arc<Mutex<Box<dyn TransportPort>>>;

/// Everything that exists only while a connection is up.
struct Session {
    device: DeviceHandle,
    port: SharedPort,
    stream: Arc<SampleStream>,
    replies: Arc<watch::Sender<u64>>,
    calibration_turn: Arc<tokio::sync::Mutex<()>>,
    shutdown: Arc<AtomicBool>,
    reader: thread::JoinHandle<()>,
}

impl Session {
    /// Stop the reader, terminate subscribers and release the port.
    ///
    /// The reader thread still holds its own read handle until it exits; the
    /// returned handle lets the caller wait for that.
    fn teardown(self, end: StreamEnd) -> thread::JoinHandle<()> {
        self.shutdown.store(true, Ordering::Release);
        self.stream.close(end);
        lock(&self.port).close();
        debug!("session torn down: device={}", self.device);
        self.reader
    }
}

/// Wait for a reader thread to exit and drop its read handle.
fn join_reader(reader: thread::JoinHandle<()>) {
    if reader.thread().id() == thread::current().id() {
        return;
    }
    if reader.join().is_err() {
        warn!("reader thread panicked");
    }
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    /// Guards every state transition together with the session it describes.
    session: Mutex<Option<Session>>,
    /// Bumped by every connect and disconnect; stale connects and readers compare against it.
    generation: AtomicU64,
    counters: Mutex<Arc<IngestCounters>>,
    last_fault: Mutex<Option<TransportReadError>>,
    /// Reader of a faulted session; joined by the next connect or disconnect.
    faulted_reader: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Fault the connection started as `generation`, unless it already went away.
    fn fault(&self, generation: u64, err: TransportReadError) {
        let mut session = lock(&self.session);
        if self.generation.load(Ordering::SeqCst) != generation
            || self.state() != ConnectionState::Connected
        {
            return;
        }
        let Some(current) = session.take() else {
            return;
        };
        error!("transport fault on {}: {}", current.device, err);
        *lock(&self.last_fault) = Some(err.clone());
        // Runs on the reader thread itself, so it cannot be joined here.
        let reader = current.teardown(StreamEnd::Faulted(err));
        *lock(&self.faulted_reader) = Some(reader);
        self.state.send_replace(ConnectionState::Faulted);
    }
}

/// Owns the transport, decoder and sample stream of one instrument.
///
/// All methods take `&self`; wrap the manager in an `Arc` to call
/// [`ConnectionManager::disconnect`] while a `connect` or
/// `start_calibration` is in flight elsewhere.
pub struct ConnectionManager {
    driver: Arc<dyn TransportDriver>,
    config: PlateConfig,
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new<D: TransportDriver + 'static>(
        driver: D,
        config: PlateConfig,
    ) -> Result<Self, ConfigError> {
        Self::with_driver(Arc::new(driver), config)
    }

    /// Manager over real serial ports.
    pub fn serial(config: PlateConfig) -> Result<Self, ConfigError> {
        Self::new(SerialDriver, config)
    }

    pub fn with_driver(
        driver: Arc<dyn TransportDriver>,
        config: PlateConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            driver,
            config,
            shared: Arc::new(Shared {
                state,
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                counters: Mutex::new(Arc::new(IngestCounters::default())),
                last_fault: Mutex::new(None),
                faulted_reader: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &PlateConfig {
        &self.config
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceHandle>, TransportError> {
        self.driver.list_devices()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Receiver notified on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// The error that faulted the most recent connection, if any.
    pub fn last_fault(&self) -> Option<TransportReadError> {
        lock(&self.shared.last_fault).clone()
    }

    /// Device of the live connection.
    pub fn device(&self) -> Option<DeviceHandle> {
        lock(&self.shared.session)
            .as_ref()
            .map(|s| s.device.clone())
    }

    /// Counters for the current (or most recent) connection.
    pub fn stats(&self) -> IngestStats {
        lock(&self.shared.counters).snapshot()
    }

    /// Attach to the sample stream of the live connection.
    pub fn subscribe(&self) -> Result<Subscription, StreamClosed> {
        let session = lock(&self.shared.session);
        match session.as_ref() {
            Some(s) if self.shared.state() == ConnectionState::Connected => s.stream.subscribe(),
            _ => Err(StreamClosed),
        }
    }

    /// Open, configure and start streaming from `device`.
    ///
    /// Allowed from `Disconnected` or `Faulted`. Any failure leaves the
    /// manager `Disconnected` with no handle retained.
    pub async fn connect(&self, device: &DeviceHandle) -> Result<(), ConnectError> {
        self.establish(device, false).await.map(|_| ())
    }

    /// Like [`ConnectionManager::connect`], returning a subscription attached
    /// before the first chunk is read, so it sees every sample from index 0.
    pub async fn connect_subscribed(
        &self,
        device: &DeviceHandle,
    ) -> Result<Subscription, ConnectError> {
        self.establish(device, true)
            .await?
            .ok_or_else(|| ConnectError::Cancelled {
                device: device.path.clone(),
            })
    }

    async fn establish(
        &self,
        device: &DeviceHandle,
        subscribe: bool,
    ) -> Result<Option<Subscription>, ConnectError> {
        let (generation, stale_reader) = {
            let _transition = lock(&self.shared.session);
            match self.shared.state() {
                ConnectionState::Disconnected | ConnectionState::Faulted => {}
                state => {
                    return Err(ConnectError::AlreadyConnected {
                        state: state.to_string(),
                    })
                }
            }
            *lock(&self.shared.last_fault) = None;
            let stale_reader = lock(&self.shared.faulted_reader).take();
            self.shared.state.send_replace(ConnectionState::Connecting);
            let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
            (generation, stale_reader)
        };
        info!("connecting: device={}", device);

        let mut state_rx = self.shared.state.subscribe();
        let driver = self.driver.clone();
        let target = device.clone();
        let read_timeout = self.config.read_poll_interval;
        let open = tokio::task::spawn_blocking(move || {
            // The faulted reader must let go of its read handle before the port is reopened.
            if let Some(reader) = stale_reader {
                join_reader(reader);
            }
            open_port(&*driver, &target, read_timeout)
        });

        // An abandoned open finishes in the background and its port is dropped.
        let opened = tokio::select! {
            res = open => res,
            _ = state_rx.wait_for(|s| *s != ConnectionState::Connecting) => {
                info!("connect cancelled: device={}", device);
                return Err(ConnectError::Cancelled { device: device.path.clone() });
            }
        };

        let (mut port, reader) = match opened {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!("connect failed: device={}, error={}", device, e);
                self.abort_connect(generation);
                return Err(e);
            }
            Err(join) => {
                self.abort_connect(generation);
                return Err(ConnectError::TransportFailure {
                    device: device.path.clone(),
                    reason: join.to_string(),
                });
            }
        };

        let mut session = lock(&self.shared.session);
        if self.shared.generation.load(Ordering::SeqCst) != generation
            || self.shared.state() != ConnectionState::Connecting
        {
            port.close();
            return Err(ConnectError::Cancelled {
                device: device.path.clone(),
            });
        }

        let counters = Arc::new(IngestCounters::default());
        *lock(&self.shared.counters) = counters.clone();
        let stream = Arc::new(SampleStream::new());
        let subscription = if subscribe {
            stream.subscribe().ok()
        } else {
            None
        };
        let (replies, _) = watch::channel(0u64);
        let replies = Arc::new(replies);
        let shutdown = Arc::new(AtomicBool::new(false));

        let decoder = FrameDecoder::new(
            UnitConverter::new(self.config.calibration),
            self.config.sampling_rate,
        );
        let ingest = Ingest::new(
            decoder,
            stream.clone(),
            counters,
            replies.clone(),
            self.config.max_timestamp_step_ms(),
        );

        let reader = match spawn_reader(
            reader,
            ingest,
            shutdown.clone(),
            self.shared.clone(),
            generation,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                port.close();
                self.shared.state.send_replace(ConnectionState::Disconnected);
                return Err(ConnectError::TransportFailure {
                    device: device.path.clone(),
                    reason: format!("failed to start reader thread: {e}"),
                });
            }
        };

        *session = Some(Session {
            device: device.clone(),
            port: Arc::new(Mutex::new(port)),
            stream,
            replies,
            calibration_turn: Arc::new(tokio::sync::Mutex::new(())),
            shutdown,
            reader,
        });
        self.shared.state.send_replace(ConnectionState::Connected);
        info!(
            "connected: device={}, rate={}Hz, max_raw_code={}, max_force={}",
            device,
            self.config.sampling_rate,
            self.config.calibration.max_raw_code,
            self.config.calibration.max_physical_force
        );
        Ok(subscription)
    }

    /// Release everything and return to `Disconnected`.
    ///
    /// Idempotent and valid from any state. An in-flight `connect` or
    /// `start_calibration` fails promptly instead of completing. Returns once
    /// the reader thread has exited, so the device can be reopened right away.
    pub fn disconnect(&self) {
        let (session, faulted_reader) = {
            let mut session = lock(&self.shared.session);
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            if self.shared.state() == ConnectionState::Disconnected && session.is_none() {
                return;
            }
            self.shared.state.send_replace(ConnectionState::Disconnecting);
            (session.take(), lock(&self.shared.faulted_reader).take())
        };

        if let Some(session) = session {
            info!("disconnecting: device={}", session.device);
            join_reader(session.teardown(StreamEnd::Closed));
        }
        if let Some(reader) = faulted_reader {
            join_reader(reader);
        }
        self.shared.state.send_replace(ConnectionState::Disconnected);
    }

    /// Send the calibration command and wait for the instrument to answer.
    ///
    /// Sample publication carries on while waiting. Concurrent calls take
    /// turns; each one writes the command once and waits for its own reply.
    pub async fn start_calibration(&self) -> Result<(), CalibrationError> {
        let link = {
            let session = lock(&self.shared.session);
            match session.as_ref() {
                Some(s) if self.shared.state() == ConnectionState::Connected => CalibrationLink {
                    port: s.port.clone(),
                    replies: s.replies.subscribe(),
                    turn: s.calibration_turn.clone(),
                },
                _ => return Err(CalibrationError::NotConnected),
            }
        };
        calibration::calibrate(
            link,
            self.config.calibration_timeout,
            self.shared.state.subscribe(),
        )
        .await
    }

    fn abort_connect(&self, generation: u64) {
        let _session = lock(&self.shared.session);
        if self.shared.generation.load(Ordering::SeqCst) == generation
            && self.shared.state() == ConnectionState::Connecting
        {
            self.shared.state.send_replace(ConnectionState::Disconnected);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn open_port(
    driver: &dyn TransportDriver,
    device: &DeviceHandle,
    read_timeout: std::time::Duration,
) -> Result<(Box<dyn TransportPort>, Box<dyn ChunkReader>), ConnectError> {
    let mut port = driver
        .open(device, read_timeout)
        .map_err(|e| ConnectError::from_transport(&device.path, e))?;
    match start_streaming(port.as_mut()) {
        Ok(reader) => Ok((port, reader)),
        Err(e) => {
            port.close();
            Err(ConnectError::from_transport(&device.path, e))
        }
    }
}

fn start_streaming(port: &mut dyn TransportPort) -> Result<Box<dyn ChunkReader>, TransportError> {
    port.configure(&PROTOCOL_LINE)?;
    port.set_control_lines(ASSERT_DTR, ASSERT_RTS)?;
    port.reader()
}

fn spawn_reader(
    mut reader: Box<dyn ChunkReader>,
    mut ingest: Ingest,
    shutdown: Arc<AtomicBool>,
    shared: Arc<Shared>,
    generation: u64,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("forceplate-reader".into())
        .spawn(move || {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            while !shutdown.load(Ordering::Acquire) {
                match reader.read_chunk(&mut buf) {
                    Ok(0) => {
                        if !shutdown.load(Ordering::Acquire) {
                            let eof = io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "transport closed by device",
                            );
                            shared.fault(generation, eof.into());
                        }
                        break;
                    }
                    Ok(n) => {
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        ingest.handle_chunk(&buf[..n]);
                    }
                    Err(e) if is_idle_error(&e) => continue,
                    Err(e) => {
                        if !shutdown.load(Ordering::Acquire) {
                            shared.fault(generation, e.into());
                        }
                        break;
                    }
                }
            }
            debug!("reader stopped: generation={}", generation);
        })
}
