use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::cli::{MineOpts, Pacing, SerialOpts};

/// Highest address a 7-bit bus can carry.
pub const MAX_ADDRESS: u8 = 0x7f;

/// A logical device behind the gateway. Displayed and parsed as bare hex (`8`, `1a`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceAddress(u8);

impl DeviceAddress {
    pub fn new(raw: u8) -> Option<Self> {
        (raw <= MAX_ADDRESS).then_some(Self(raw))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl FromStr for DeviceAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        let raw = u8::from_str_radix(digits, 16)
            .map_err(|_| format!("device address must be hex, got {s:?}"))?;
        DeviceAddress::new(raw)
            .ok_or_else(|| format!("device address {s} is above 0x{MAX_ADDRESS:x}"))
    }
}

/// Everything the mining core reads from configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub serial: SerialOpts,
    pub addresses: Vec<DeviceAddress>,
    pub username: String,
    pub key: String,
    pub rig: String,
    pub checksum: bool,
    pub soc_timeout: Duration,
    pub job_timeout: Duration,
    pub read_timeout: Duration,
    pub delay_start: Duration,
    pub report_interval: Duration,
    pub pacing: Pacing,
    pub pool: Option<String>,
    pub pool_directory: String,
}

impl Settings {
    pub fn from_opts(opts: MineOpts) -> Result<Self> {
        if opts.addresses.is_empty() {
            bail!("at least one --address is required");
        }
        let mut seen = BTreeSet::new();
        for addr in &opts.addresses {
            if !seen.insert(*addr) {
                bail!("device address {addr} is configured twice");
            }
        }
        if opts.username.trim().is_empty() {
            bail!("--username must not be empty");
        }
        if opts.soc_timeout == 0 || opts.job_timeout == 0 || opts.read_timeout == 0 {
            bail!("timeouts must be positive");
        }
        if opts.report_interval == 0 {
            bail!("--report-interval must be positive");
        }

        Ok(Self {
            addresses: opts.addresses,
            username: opts.username,
            key: opts.key,
            rig: opts.rig,
            checksum: !opts.no_checksum,
            soc_timeout: Duration::from_secs(opts.soc_timeout),
            job_timeout: Duration::from_secs(opts.job_timeout),
            read_timeout: Duration::from_millis(opts.read_timeout),
            delay_start: Duration::from_secs(opts.delay_start),
            report_interval: Duration::from_secs(opts.report_interval),
            pacing: Pacing::from_gap_ms(opts.token_gap),
            pool: opts.pool,
            pool_directory: opts.pool_directory,
            serial: opts.ser,
        })
    }

    /// Fields per result frame the devices send back.
    pub fn expected_fields(&self) -> usize {
        if self.checksum { 4 } else { 3 }
    }
}
