// src/proto/gateway.rs
use thiserror::Error;

use crate::config::DeviceAddress;

/// Terminates every command and reply on the gateway link.
pub const EOL: char = '$';
/// Separates fields inside one gateway command or reply.
pub const FIELD_SEP: char = ':';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty reply")]
    Empty,
    #[error("reply has no address field: {0:?}")]
    MissingAddress(String),
    #[error("invalid address in reply: {0:?}")]
    BadAddress(String),
}

/// Commands understood by the USB-I2C gateway firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCommand {
    /// Push one character to a device.
    Write { addr: DeviceAddress, data: char },
    /// Ask a device for its next pending character.
    Read { addr: DeviceAddress },
    /// Drop whatever the gateway holds for a device.
    Flush { addr: DeviceAddress },
    /// List responding addresses.
    Scan,
}

/// One reply read back from the gateway, tagged with the device it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayReply {
    pub addr: DeviceAddress,
    pub token: String,
}

/// Public API: serialize a command to its `$`-terminated wire form.
pub fn format_command(cmd: &GatewayCommand) -> String {
    use GatewayCommand::*;
    match cmd {
        Write { addr, data } => format!("{addr}{FIELD_SEP}w{FIELD_SEP}{data}{EOL}"),
        Read { addr } => format!("{addr}{FIELD_SEP}r{EOL}"),
        // the firmware addresses flush by name, with the device as payload
        Flush { addr } => format!("fl{FIELD_SEP}w{FIELD_SEP}{addr}{EOL}"),
        Scan => format!("scn{EOL}"),
    }
}

/// Public API: parse `<addrHex>:<token>[$]` as read from the gateway.
///
/// The token is kept verbatim; it may be a newline or an error marker.
pub fn parse_reply(raw: &str) -> Result<GatewayReply, ParseError> {
    let s = raw.strip_suffix(EOL).unwrap_or(raw);
    if s.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    let (addr, token) = s
        .split_once(FIELD_SEP)
        .ok_or_else(|| ParseError::MissingAddress(s.to_string()))?;
    let addr = addr
        .trim()
        .parse::<DeviceAddress>()
        .map_err(|_| ParseError::BadAddress(addr.to_string()))?;
    let token = token.split(FIELD_SEP).next().unwrap_or_default();
    Ok(GatewayReply {
        addr,
        token: token.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(raw: u8) -> DeviceAddress {
        DeviceAddress::new(raw).unwrap()
    }

    #[test]
    fn formats_commands() {
        assert_eq!(
            format_command(&GatewayCommand::Write {
                addr: addr(8),
                data: 'a'
            }),
            "8:w:a$"
        );
        assert_eq!(
            format_command(&GatewayCommand::Read { addr: addr(0x1a) }),
            "1a:r$"
        );
        assert_eq!(
            format_command(&GatewayCommand::Flush { addr: addr(8) }),
            "fl:w:8$"
        );
        assert_eq!(format_command(&GatewayCommand::Scan), "scn$");
    }

    #[test]
    fn parses_tagged_tokens() {
        let r = parse_reply("8:1$").unwrap();
        assert_eq!(r.addr, addr(8));
        assert_eq!(r.token, "1");

        let r = parse_reply("1a:\n$").unwrap();
        assert_eq!(r.addr, addr(0x1a));
        assert_eq!(r.token, "\n");

        let r = parse_reply("9:#").unwrap();
        assert_eq!(r.token, "#");
    }

    #[test]
    fn rejects_malformed_replies() {
        assert_eq!(parse_reply(""), Err(ParseError::Empty));
        assert_eq!(parse_reply("$"), Err(ParseError::Empty));
        assert!(matches!(
            parse_reply("garbage$"),
            Err(ParseError::MissingAddress(_))
        ));
        assert!(matches!(
            parse_reply("zz:1$"),
            Err(ParseError::BadAddress(_))
        ));
    }
}
