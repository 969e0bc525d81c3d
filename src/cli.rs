use clap::{Args, Parser, Subcommand};
use std::time::Duration;

use crate::config::DeviceAddress;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "usbi2c-miner",
    about = "Pool miner for AVR boards behind a USB-I2C gateway"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Mine with every configured board
    Mine(MineOpts),
    /// Ask the gateway which device addresses answer on the bus
    Scan(ScanOpts),
}

#[derive(Args, Debug, Clone)]
pub struct SerialOpts {
    /// Serial device path of the gateway
    #[arg(long, default_value = "/dev/ttyUSB0")]
    pub dev: String,
    /// Baud rate
    #[arg(long, default_value_t = 115_200)]
    pub baud: u32,
    /// Enable RTS/CTS
    #[arg(long, default_value_t = false)]
    pub rtscts: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ScanOpts {
    #[command(flatten)]
    pub ser: SerialOpts,
    /// Serial read timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub read_timeout: u64,
}

#[derive(Args, Debug, Clone)]
pub struct MineOpts {
    #[command(flatten)]
    pub ser: SerialOpts,
    /// Device address in hex; repeat or comma-separate for several boards
    #[arg(short, long = "address", value_delimiter = ',', required = true)]
    pub addresses: Vec<DeviceAddress>,
    /// Pool account name
    #[arg(short, long, env = "MINER_USERNAME")]
    pub username: String,
    /// Mining key
    #[arg(long, env = "MINER_KEY", default_value = "None")]
    pub key: String,
    /// Rig identifier prefixed to each board's device tag
    #[arg(long, default_value = "None")]
    pub rig: String,
    /// Do not append/verify the CRC8 field on frames
    #[arg(long, default_value_t = false)]
    pub no_checksum: bool,
    /// Pool socket timeout in seconds
    #[arg(long, default_value_t = 45)]
    pub soc_timeout: u64,
    /// Budget in seconds for one job's bus round trip
    #[arg(long, default_value_t = 10)]
    pub job_timeout: u64,
    /// Serial read timeout per poll in milliseconds
    #[arg(long, default_value_t = 200)]
    pub read_timeout: u64,
    /// Seconds between starting consecutive workers
    #[arg(long, default_value_t = 10)]
    pub delay_start: u64,
    /// Periodic report interval in seconds
    #[arg(long, default_value_t = 60)]
    pub report_interval: u64,
    /// Milliseconds between job bytes written to the gateway (0 = none)
    #[arg(long, default_value_t = 20)]
    pub token_gap: u64,
    /// Pool node as host:port, skipping the directory lookup
    #[arg(long)]
    pub pool: Option<String>,
    /// Directory service returning the least-loaded pool node
    #[arg(long, default_value = "https://server.duinocoin.com/getPool")]
    pub pool_directory: String,
    /// Verbose diagnostic logging
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

/// Delay between bytes written to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    Max,
    Fixed(Duration),
}

impl Pacing {
    pub fn from_gap_ms(ms: u64) -> Self {
        if ms == 0 {
            Pacing::Max
        } else {
            Pacing::Fixed(Duration::from_millis(ms))
        }
    }

    pub fn sleep_for(self) -> Option<Duration> {
        match self {
            Pacing::Max => None,
            Pacing::Fixed(d) => Some(d),
        }
    }
}
