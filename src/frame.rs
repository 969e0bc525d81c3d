use crate::error::FrameError;
use crate::proto::pool::{Job, SEPARATOR};

/// Reflected CRC-8 (Dallas/Maxim 1-Wire), init 0, no final xor.
///
/// Boards compute the same value over the job and result frames, so this must
/// stay bit-exact.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in data {
        let mut byte = byte;
        for _ in 0..8 {
            let feedback = (crc ^ byte) & 0x01;
            if feedback == 0x01 {
                crc ^= 0x18;
            }
            crc = (crc >> 1) & 0x7f;
            if feedback == 0x01 {
                crc |= 0x80;
            }
            byte >>= 1;
        }
    }
    crc
}

/// Serialises a job for a board: `puzzle,target,difficulty,[crc,]\n`.
pub fn build_job_frame(job: &Job, checksum: bool) -> String {
    let mut frame = format!(
        "{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}",
        job.puzzle, job.target, job.difficulty
    );
    if checksum {
        let crc = crc8(frame.as_bytes());
        frame.push_str(&crc.to_string());
    }
    frame.push('\n');
    frame
}

/// A validated answer from one board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceResult {
    pub nonce: u64,
    pub compute_time_micros: u64,
    pub device_id: String,
    pub checksum: Option<u8>,
}

impl DeviceResult {
    pub fn compute_time_secs(&self) -> f64 {
        round_to(self.compute_time_micros as f64 / 1_000_000.0, 5)
    }

    /// Hashes per second the board reported for this job.
    pub fn hashrate(&self) -> f64 {
        let secs = self.compute_time_secs().max(1e-5);
        round_to(self.nonce as f64 / secs, 2)
    }
}

pub(crate) fn round_to(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (value * scale).round() / scale
}

/// Parses an accumulated result buffer (`nonce,micros,id[,crc]`).
///
/// The checksum covers every field before it plus one trailing separator.
pub fn parse_result(raw: &str, checksum: bool) -> Result<DeviceResult, FrameError> {
    let fields: Vec<&str> = raw.split(SEPARATOR).collect();
    let expected = if checksum { 4 } else { 3 };
    if fields.len() != expected {
        return Err(FrameError::invalid("field count", raw));
    }

    let nonce = match fields[0].parse::<u64>() {
        Ok(n) if n > 0 => n,
        _ => return Err(FrameError::invalid("nonce", fields[0])),
    };
    let compute_time_micros = match fields[1].parse::<u64>() {
        Ok(t) if t > 0 => t,
        _ => return Err(FrameError::invalid("compute time", fields[1])),
    };
    let device_id = fields[2];
    if device_id.is_empty() || !device_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(FrameError::invalid("device id", device_id));
    }

    let checksum = if checksum {
        let prefix = match raw.rsplit_once(SEPARATOR) {
            Some((head, _)) => format!("{head}{SEPARATOR}"),
            None => return Err(FrameError::invalid("field count", raw)),
        };
        let expected = crc8(prefix.as_bytes());
        match fields[3].parse::<u8>() {
            Ok(received) if received == expected => Some(received),
            _ => {
                return Err(FrameError::ChecksumMismatch {
                    expected,
                    received: fields[3].to_string(),
                });
            }
        }
    } else {
        None
    };

    Ok(DeviceResult {
        nonce,
        compute_time_micros,
        device_id: device_id.to_string(),
        checksum,
    })
}
