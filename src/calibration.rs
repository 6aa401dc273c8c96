//! Calibration request/response over the live connection.
//!
//! The command is written through the session's port mutex, the single
//! writer of the transport. The instrument answers with [`CALIBRATION_REPLY`]
//! inserted between two frames; the ingest path cuts it out of the byte
//! stream before decoding and bumps a reply counter, which is what the
//! controller waits on. Live samples never count as an answer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::watch;

use crate::connection::ConnectionState;
use crate::errors::{CalibrationError, TransportError};
use crate::lock;
use crate::transport::TransportPort;

/// Command token understood by the instrument firmware.
pub const CALIBRATION_COMMAND: &[u8] = b"CAL\n";

/// Acknowledgement the instrument sends, at a frame boundary, once calibrated.
pub const CALIBRATION_REPLY: &[u8] = b"CAL OK\n";

pub(crate) struct CalibrationLink {
    pub(crate) port: Arc<Mutex<Box<dyn TransportPort>>>,
    /// Count of calibration replies received on the connection.
    pub(crate) replies: watch::Receiver<u64>,
    /// Held for a whole request/response so replies cannot be attributed to the wrong call.
    pub(crate) turn: Arc<tokio::sync::Mutex<()>>,
}

pub(crate) async fn calibrate(
    link: CalibrationLink,
    timeout: Duration,
    mut state: watch::Receiver<ConnectionState>,
) -> Result<(), CalibrationError> {
    let CalibrationLink {
        port,
        mut replies,
        turn,
    } = link;

    let _turn = tokio::select! {
        guard = turn.lock() => guard,
        _ = state.wait_for(|s| *s != ConnectionState::Connected) => {
            return Err(CalibrationError::NotConnected);
        }
    };
    // Taken before the write: the reply may be ingested before the write call returns.
    let baseline = *replies.borrow_and_update();

    let write = tokio::task::spawn_blocking(move || {
        let mut port = lock(&port);
        port.write_all(CALIBRATION_COMMAND)
    });
    let written = tokio::select! {
        res = write => res,
        _ = state.wait_for(|s| *s != ConnectionState::Connected) => {
            return Err(CalibrationError::NotConnected);
        }
    };
    match written {
        Ok(Ok(())) => {}
        Ok(Err(TransportError::Closed)) => return Err(CalibrationError::NotConnected),
        Ok(Err(e)) => {
            warn!("calibration command write failed: {}", e);
            return Err(CalibrationError::TransportFailure(e.to_string()));
        }
        Err(join) => return Err(CalibrationError::TransportFailure(join.to_string())),
    }
    debug!("calibration command sent, waiting up to {:?}", timeout);

    let response = tokio::time::timeout(timeout, replies.wait_for(|n| *n > baseline));
    tokio::select! {
        res = response => match res {
            Ok(Ok(_)) => {
                info!("calibration acknowledged");
                Ok(())
            }
            Ok(Err(_)) => Err(CalibrationError::NotConnected),
            Err(_) => {
                warn!("calibration timed out after {:?}", timeout);
                Err(CalibrationError::Timeout(timeout))
            }
        },
        _ = state.wait_for(|s| *s != ConnectionState::Connected) => Err(CalibrationError::NotConnected),
    }
}
