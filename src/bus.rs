use std::io::{self, Read, Write};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::config::DeviceAddress;
use crate::demux::{AccumState, Demux, Progress};
use crate::error::BusError;
use crate::proto::gateway::{EOL, GatewayCommand, GatewayReply, ParseError, format_command, parse_reply};

/// Byte transport to the gateway; a serial port in production.
pub trait Link: Read + Write + Send {}

impl<T: Read + Write + Send + ?Sized> Link for T {}

const FLUSH_SETTLE: Duration = Duration::from_millis(100);
const SCAN_SETTLE: Duration = Duration::from_secs(1);

/// Result of one routed poll, seen from the polling device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Frame not done yet; `fresh` if this poll added to it.
    Waiting { fresh: bool },
    Complete(String),
    Corrupted(String),
}

struct BusInner {
    link: Box<dyn Link>,
    demux: Demux,
}

/// The single gateway connection shared by every worker.
///
/// Each public call takes the lock for exactly one command (plus its reply),
/// so polls from different devices interleave freely.
pub struct SerialBus {
    inner: Mutex<BusInner>,
    settle: Duration,
}

impl SerialBus {
    pub fn new(link: Box<dyn Link>, demux: Demux) -> Self {
        Self {
            inner: Mutex::new(BusInner { link, demux }),
            settle: FLUSH_SETTLE,
        }
    }

    /// Overrides the pause after a flush.
    #[cfg(test)]
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn write_command(&self, addr: DeviceAddress, cmd: &GatewayCommand) -> Result<(), BusError> {
        let mut inner = self.lock();
        send(&mut *inner.link, cmd).map_err(|source| BusError::Io { addr, source })
    }

    pub fn write_byte(&self, addr: DeviceAddress, data: char) -> Result<(), BusError> {
        self.write_command(addr, &GatewayCommand::Write { addr, data })
    }

    /// One read command and one physical read; files the reply under the
    /// address it is tagged with. `fresh` only when `addr` itself gained data.
    pub fn poll_routed(&self, addr: DeviceAddress) -> Result<PollOutcome, BusError> {
        let mut inner = self.lock();
        let reply = poll_link(&mut *inner.link, addr)?;

        let mut fresh = false;
        if let Some(reply) = reply {
            match inner.demux.route(&reply) {
                Some(progress) => {
                    debug!(polled = %addr, from = %reply.addr, token = ?reply.token, ?progress, "bus token");
                    fresh = reply.addr == addr && progress == Progress::Appended;
                }
                None => debug!(polled = %addr, from = %reply.addr, "token for unknown address dropped"),
            }
        }

        let Some(acc) = inner.demux.get_mut(addr) else {
            return Err(BusError::Corrupted {
                addr,
                reason: "address not registered on bus".into(),
            });
        };
        Ok(match acc.state() {
            AccumState::Complete(_) => acc
                .take_complete()
                .map_or(PollOutcome::Waiting { fresh }, PollOutcome::Complete),
            AccumState::Corrupted(buf) => PollOutcome::Corrupted(buf.clone()),
            _ => PollOutcome::Waiting { fresh },
        })
    }

    /// Tells the gateway to drop pending data for `addr` and clears its buffer.
    pub fn flush(&self, addr: DeviceAddress) -> Result<(), BusError> {
        {
            let mut inner = self.lock();
            if let Some(acc) = inner.demux.get_mut(addr) {
                acc.reset();
            }
            send(&mut *inner.link, &GatewayCommand::Flush { addr })
                .map_err(|source| BusError::Io { addr, source })?;
        }
        if !self.settle.is_zero() {
            std::thread::sleep(self.settle);
        }
        Ok(())
    }

    /// Starts a fresh accumulation for `addr`.
    pub fn reset(&self, addr: DeviceAddress) {
        if let Some(acc) = self.lock().demux.get_mut(addr) {
            acc.reset();
        }
    }

    /// Marks the frame for `addr` as abandoned after the job budget ran out.
    pub fn mark_timed_out(&self, addr: DeviceAddress) {
        if let Some(acc) = self.lock().demux.get_mut(addr) {
            acc.time_out();
        }
    }

    pub fn state(&self, addr: DeviceAddress) -> Option<AccumState> {
        self.lock().demux.get(addr).map(|acc| acc.state().clone())
    }

    /// Asks the gateway for the addresses that answer; returns its raw listing.
    pub fn scan(&self) -> io::Result<String> {
        let mut inner = self.lock();
        send(&mut *inner.link, &GatewayCommand::Scan)?;
        std::thread::sleep(SCAN_SETTLE);
        let raw = read_until(&mut *inner.link, b'\n')?;
        inner.link.flush()?;
        Ok(String::from_utf8_lossy(&raw).trim().to_string())
    }
}

fn send(link: &mut dyn Link, cmd: &GatewayCommand) -> io::Result<()> {
    link.write_all(format_command(cmd).as_bytes())?;
    link.flush()
}

fn poll_link(link: &mut dyn Link, addr: DeviceAddress) -> Result<Option<GatewayReply>, BusError> {
    send(link, &GatewayCommand::Read { addr }).map_err(|source| BusError::Io { addr, source })?;
    let raw = read_until(link, EOL as u8).map_err(|source| BusError::Io { addr, source })?;
    match parse_reply(&String::from_utf8_lossy(&raw)) {
        Ok(reply) => Ok(Some(reply)),
        Err(ParseError::Empty) => Ok(None),
        Err(e) => Err(BusError::Malformed(e)),
    }
}

/// Reads byte by byte until `delim` or the port's read timeout.
fn read_until(link: &mut dyn Link, delim: u8) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match link.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                out.push(byte[0]);
                if byte[0] == delim {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}
