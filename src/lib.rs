//! Dual force-plate driver with optional Python bindings.
//!
//! The instrument has two platforms with four load cells each and streams one
//! 40-byte binary frame per sample over a serial link (115200 8N1). This crate
//! turns that unframed byte stream into timestamped, unit-converted samples.
//!
//! # Data flow
//!
//! ```text
//! transport chunks -> FrameDecoder (carry buffer) -> UnitConverter -> SampleStream -> subscribers
//! ```
//!
//! [`ConnectionManager`] owns the whole pipeline for one physical device:
//!
//! ```no_run
//! use forceplate::{ConnectionManager, DeviceHandle, PlateConfig};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let manager = ConnectionManager::serial(PlateConfig::default())?;
//! manager.connect(&DeviceHandle::new("/dev/ttyUSB0")).await?;
//! let mut samples = manager.subscribe()?;
//! while let Ok(sample) = samples.recv().await {
//!     println!("#{} total={:.2} N", sample.sample_index, sample.total());
//! }
//! manager.disconnect();
//! # Ok(())
//! # }
//! ```
//!
//! # Timing
//!
//! Each frame carries the device's own millisecond timestamp. `sample_index`
//! is assigned on the host, starts at 0 on every connection and never skips;
//! use [`IngestStats::timestamp_gaps`] to spot frames the device failed to send.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod calibration;
pub mod config;
pub mod connection;
pub mod convert;
mod errors;
pub mod frame;
mod ingest;
pub mod logging;
pub mod simulator;
pub mod stream;
pub mod transport;

#[cfg(feature = "python")]
mod python;

pub use calibration::{CALIBRATION_COMMAND, CALIBRATION_REPLY};
pub use config::PlateConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use convert::{CalibrationConstants, UnitConverter};
pub use errors::*;
pub use frame::{FrameDecoder, RawFrame, SampleRecord, FRAME_SIZE};
pub use ingest::IngestStats;
pub use simulator::SimulatedDriver;
pub use stream::{SampleStream, StreamEnd, Subscription};
pub use transport::{DeviceHandle, SerialDriver, TransportDriver};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
