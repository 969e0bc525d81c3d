use anyhow::Result;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::time::Duration;

use crate::cli::SerialOpts;

/// Opens the gateway port 8N1. `read_timeout` bounds every single read.
pub fn open_port(opts: &SerialOpts, read_timeout: Duration) -> Result<Box<dyn SerialPort>> {
    let builder = serialport::new(&opts.dev, opts.baud)
        .timeout(read_timeout)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(if opts.rtscts {
            FlowControl::Hardware
        } else {
            FlowControl::None
        });

    let port = builder
        .open()
        .map_err(|e| anyhow::anyhow!("open {}: {}", opts.dev, e))?;
    tracing::debug!(dev = %opts.dev, baud = opts.baud, "serial port open");
    Ok(port)
}
