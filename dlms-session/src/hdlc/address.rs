//! HDLC address fields
//!
//! The server address is 1, 2 or 4 bytes long depending on link configuration,
//! the client address is always a single byte. Every address byte carries
//! seven payload bits; the lowest bit marks the last byte of the address.

use crate::error::{DlmsError, DlmsResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved HDLC addresses
pub mod reserved {
    /// Guaranteed to be received by no one
    pub const NO_STATION: u16 = 0x00;

    /// Client management process
    pub const CLIENT_MANAGEMENT_PROCESS: u8 = 0x01;

    /// Client public client
    pub const CLIENT_PUBLIC_CLIENT: u8 = 0x10;

    /// Client all station (broadcast)
    pub const CLIENT_ALL_STATION: u8 = 0x7F;

    /// Server upper management logical device
    pub const SERVER_UPPER_MANAGEMENT_LOGICAL_DEVICE: u16 = 0x01;

    /// Server all stations, one byte per address part
    pub const SERVER_ALL_STATIONS_1BYTE: u16 = 0x7F;

    /// Server all stations, two bytes per address part
    pub const SERVER_ALL_STATIONS_2BYTE: u16 = 0x3FFF;
}

const ONE_BYTE_UPPER_BOUND: u16 = 0x7F;
const TWO_BYTE_UPPER_BOUND: u16 = 0x3FFF;

/// Configured byte length of the server address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ServerAddressLength {
    One,
    Two,
    #[default]
    Four,
}

impl ServerAddressLength {
    pub fn bytes(self) -> usize {
        match self {
            ServerAddressLength::One => 1,
            ServerAddressLength::Two => 2,
            ServerAddressLength::Four => 4,
        }
    }

    pub fn from_bytes(n: usize) -> DlmsResult<Self> {
        match n {
            1 => Ok(ServerAddressLength::One),
            2 => Ok(ServerAddressLength::Two),
            4 => Ok(ServerAddressLength::Four),
            _ => Err(DlmsError::InvalidValue(format!(
                "server address length must be 1, 2 or 4, got {}",
                n
            ))),
        }
    }
}

/// Server (meter side) HDLC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    pub logical_device: u16,
    pub physical_device: Option<u16>,
}

impl ServerAddress {
    pub fn new(logical_device: u16, physical_device: Option<u16>) -> Self {
        Self {
            logical_device,
            physical_device,
        }
    }

    /// Check if this is an all-station (broadcast) address
    pub fn is_all_station(&self) -> bool {
        self.logical_device == reserved::SERVER_ALL_STATIONS_1BYTE
            || self.logical_device == reserved::SERVER_ALL_STATIONS_2BYTE
    }

    /// Whether a frame carrying `self` is addressed to a station owning `own`
    pub fn reaches(&self, own: &ServerAddress) -> bool {
        if self.is_all_station() {
            return true;
        }
        self.logical_device == own.logical_device
            && match (self.physical_device, own.physical_device) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }

    /// Encode the address in `len` bytes
    pub fn encode(&self, len: ServerAddressLength, out: &mut Vec<u8>) -> DlmsResult<()> {
        match len {
            ServerAddressLength::One => {
                check_bound(self.logical_device, ONE_BYTE_UPPER_BOUND)?;
                out.push(((self.logical_device as u8) << 1) | 0x01);
            }
            ServerAddressLength::Two => {
                let physical = self.physical_required()?;
                check_bound(self.logical_device, ONE_BYTE_UPPER_BOUND)?;
                check_bound(physical, ONE_BYTE_UPPER_BOUND)?;
                out.push((self.logical_device as u8) << 1);
                out.push(((physical as u8) << 1) | 0x01);
            }
            ServerAddressLength::Four => {
                let physical = self.physical_required()?;
                check_bound(self.logical_device, TWO_BYTE_UPPER_BOUND)?;
                check_bound(physical, TWO_BYTE_UPPER_BOUND)?;
                out.push(((self.logical_device >> 7) as u8) << 1);
                out.push(((self.logical_device & 0x7F) as u8) << 1);
                out.push(((physical >> 7) as u8) << 1);
                out.push((((physical & 0x7F) as u8) << 1) | 0x01);
            }
        }
        Ok(())
    }

    fn physical_required(&self) -> DlmsResult<u16> {
        self.physical_device.ok_or_else(|| {
            DlmsError::InvalidValue("physical device address required for this address length".to_string())
        })
    }

    /// Decode a server address whose configured length is `expected`
    ///
    /// Returns the address and the number of bytes consumed. An address of
    /// another length is accepted only when it is the all-station address.
    pub fn decode(data: &[u8], expected: ServerAddressLength) -> DlmsResult<(Self, usize)> {
        let byte = |i: usize| -> DlmsResult<u8> {
            data.get(i)
                .copied()
                .ok_or_else(|| DlmsError::MalformedSegment("truncated server address".to_string()))
        };
        let b0 = byte(0)?;
        if b0 & 0x01 != 0 {
            if expected == ServerAddressLength::One {
                return Ok((Self::new((b0 >> 1) as u16, None), 1));
            }
            return Err(DlmsError::MalformedSegment("short server address".to_string()));
        }

        let b1 = byte(1)?;
        if b1 & 0x01 != 0 {
            let logical = (b0 >> 1) as u16;
            let physical = (b1 >> 1) as u16;
            return match expected {
                ServerAddressLength::Two | ServerAddressLength::Four => {
                    Ok((Self::new(logical, Some(physical)), 2))
                }
                ServerAddressLength::One if logical == reserved::SERVER_ALL_STATIONS_1BYTE => {
                    Ok((Self::new(logical, None), 2))
                }
                ServerAddressLength::One => {
                    Err(DlmsError::MalformedSegment("long server address".to_string()))
                }
            };
        }

        let b2 = byte(2)?;
        if b2 & 0x01 != 0 {
            return Err(DlmsError::MalformedSegment("three byte server address".to_string()));
        }
        let b3 = byte(3)?;
        if b3 & 0x01 == 0 {
            return Err(DlmsError::MalformedSegment("long server address".to_string()));
        }
        let logical = (((b0 >> 1) as u16) << 7) | (b1 >> 1) as u16;
        let physical = (((b2 >> 1) as u16) << 7) | (b3 >> 1) as u16;
        if expected != ServerAddressLength::Four && logical != reserved::SERVER_ALL_STATIONS_2BYTE {
            return Err(DlmsError::MalformedSegment("long server address".to_string()));
        }
        Ok((Self::new(logical, Some(physical)), 4))
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#X}", self.logical_device)?;
        if let Some(p) = self.physical_device {
            write!(f, "/{:#X}", p)?;
        }
        Ok(())
    }
}

fn check_bound(v: u16, bound: u16) -> DlmsResult<()> {
    if v > bound {
        return Err(DlmsError::InvalidValue(format!(
            "address 0x{:X} exceeds upper bound 0x{:X}",
            v, bound
        )));
    }
    Ok(())
}

/// Encode the one byte client address
pub fn encode_client_address(client: u8, out: &mut Vec<u8>) -> DlmsResult<()> {
    if client as u16 > ONE_BYTE_UPPER_BOUND {
        return Err(DlmsError::InvalidValue(format!(
            "client address 0x{:X} exceeds upper bound 0x7F",
            client
        )));
    }
    out.push((client << 1) | 0x01);
    Ok(())
}

/// Decode the one byte client address
pub fn decode_client_address(data: &[u8]) -> DlmsResult<u8> {
    let b0 = *data
        .first()
        .ok_or_else(|| DlmsError::MalformedSegment("truncated client address".to_string()))?;
    if b0 & 0x01 == 0 {
        return Err(DlmsError::MalformedSegment(
            "client address is longer than 1 byte".to_string(),
        ));
    }
    Ok(b0 >> 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(addr: ServerAddress, len: ServerAddressLength) -> Vec<u8> {
        let mut out = Vec::new();
        addr.encode(len, &mut out).unwrap();
        out
    }

    #[test]
    fn test_encode_lengths() {
        assert_eq!(encoded(ServerAddress::new(1, None), ServerAddressLength::One), vec![0x03]);
        assert_eq!(
            encoded(ServerAddress::new(1, Some(0x11)), ServerAddressLength::Two),
            vec![0x02, 0x23]
        );
        assert_eq!(
            encoded(ServerAddress::new(1, Some(0x3FFF)), ServerAddressLength::Four),
            vec![0x00, 0x02, 0xFE, 0xFF]
        );
    }

    #[test]
    fn test_encode_out_of_range() {
        let mut out = Vec::new();
        assert!(ServerAddress::new(0x80, None).encode(ServerAddressLength::One, &mut out).is_err());
        assert!(ServerAddress::new(1, None).encode(ServerAddressLength::Two, &mut out).is_err());
        assert!(encode_client_address(0x80, &mut out).is_err());
    }

    #[test]
    fn test_decode_expected_length() {
        let (a, n) = ServerAddress::decode(&[0x00, 0x02, 0x00, 0x23], ServerAddressLength::Four).unwrap();
        assert_eq!(a, ServerAddress::new(1, Some(0x11)));
        assert_eq!(n, 4);

        let (a, n) = ServerAddress::decode(&[0x02, 0x23], ServerAddressLength::Four).unwrap();
        assert_eq!(a, ServerAddress::new(1, Some(0x11)));
        assert_eq!(n, 2);
    }

    #[test]
    fn test_decode_malformed() {
        let malformed = |data: &[u8], len| {
            matches!(ServerAddress::decode(data, len), Err(DlmsError::MalformedSegment(_)))
        };
        assert!(malformed(&[0x03], ServerAddressLength::Two));
        assert!(malformed(&[0x02, 0x23], ServerAddressLength::One));
        assert!(malformed(&[0x00, 0x02, 0x01], ServerAddressLength::Four));
        assert!(malformed(&[0x00, 0x02, 0x00, 0x22, 0x01], ServerAddressLength::Four));
        assert!(malformed(&[0x00, 0x02, 0x00, 0x23], ServerAddressLength::Two));
        assert!(malformed(&[0x00], ServerAddressLength::Four));
    }

    #[test]
    fn test_decode_broadcast_of_other_length() {
        let (a, n) = ServerAddress::decode(&[0xFE, 0x01], ServerAddressLength::One).unwrap();
        assert!(a.is_all_station());
        assert_eq!(n, 2);

        let (a, n) = ServerAddress::decode(&[0xFE, 0xFE, 0xFE, 0xFF], ServerAddressLength::Two).unwrap();
        assert!(a.is_all_station());
        assert_eq!(n, 4);
        assert!(a.reaches(&ServerAddress::new(1, Some(17))));
    }

    #[test]
    fn test_client_address() {
        let mut out = Vec::new();
        encode_client_address(0x10, &mut out).unwrap();
        assert_eq!(out, vec![0x21]);
        assert_eq!(decode_client_address(&out).unwrap(), 0x10);
        assert!(decode_client_address(&[0x20]).is_err());
    }
}
