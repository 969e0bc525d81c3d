use std::io;

use thiserror::Error;

use crate::config::DeviceAddress;
use crate::proto::gateway::ParseError;

/// Failures talking to the pool over TCP.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Failures on the shared serial bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus i/o on {addr}: {source}")]
    Io {
        addr: DeviceAddress,
        #[source]
        source: io::Error,
    },
    #[error("bus timed out waiting for {0}")]
    Timeout(DeviceAddress),
    #[error("bus data corrupted for {addr}: {reason}")]
    Corrupted {
        addr: DeviceAddress,
        reason: String,
    },
    #[error("malformed gateway reply: {0}")]
    Malformed(#[from] ParseError),
}

/// A complete result frame that must not be submitted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("checksum mismatch: expected {expected} got {received}")]
    ChecksumMismatch { expected: u8, received: String },
    #[error("invalid {field}: {value:?}")]
    Validation { field: &'static str, value: String },
}

impl FrameError {
    pub(crate) fn invalid(field: &'static str, value: &str) -> Self {
        FrameError::Validation {
            field,
            value: value.to_string(),
        }
    }
}

/// Why one attempt at getting a result out of a board failed.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Why a worker left its mining loop and went back to connecting.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("no valid result from board {addr} after {attempts} attempts: {last}")]
    Board {
        addr: DeviceAddress,
        attempts: u32,
        last: DeliveryError,
    },
}
