//! Link parameter negotiation carried by SNRM and UA
//!
//! Format: `0x81` format identifier, `0x80` group identifier, group length,
//! then `{id, length, value}` entries.

use crate::error::{DlmsError, DlmsResult};
use serde::{Deserialize, Serialize};

const FORMAT_IDENTIFIER: u8 = 0x81;
const GROUP_IDENTIFIER: u8 = 0x80;

const MAX_INFO_FIELD_LENGTH_TRANSMIT: u8 = 0x05;
const MAX_INFO_FIELD_LENGTH_RECEIVE: u8 = 0x06;
const WINDOW_SIZE_TRANSMIT: u8 = 0x07;
const WINDOW_SIZE_RECEIVE: u8 = 0x08;

/// Negotiable link bounds, seen from the side that sends them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkParameters {
    pub max_info_field_length_transmit: u8,
    pub max_info_field_length_receive: u8,
    pub window_size_transmit: u32,
    pub window_size_receive: u32,
}

impl Default for LinkParameters {
    fn default() -> Self {
        Self {
            max_info_field_length_transmit: 128,
            max_info_field_length_receive: 128,
            window_size_transmit: 7,
            window_size_receive: 7,
        }
    }
}

impl LinkParameters {
    /// The same bounds seen from the peer: its transmit is our receive
    pub fn swapped(&self) -> Self {
        Self {
            max_info_field_length_transmit: self.max_info_field_length_receive,
            max_info_field_length_receive: self.max_info_field_length_transmit,
            window_size_transmit: self.window_size_receive,
            window_size_receive: self.window_size_transmit,
        }
    }

    /// Field-wise minimum of two parameter sets expressed from the same side
    pub fn min(&self, other: &Self) -> Self {
        Self {
            max_info_field_length_transmit: self
                .max_info_field_length_transmit
                .min(other.max_info_field_length_transmit),
            max_info_field_length_receive: self
                .max_info_field_length_receive
                .min(other.max_info_field_length_receive),
            window_size_transmit: self.window_size_transmit.min(other.window_size_transmit),
            window_size_receive: self.window_size_receive.min(other.window_size_receive),
        }
    }

    /// Negotiate our bounds against a proposal received from the peer
    ///
    /// The result is expressed from our side.
    pub fn negotiate(&self, peer_proposal: &Self) -> Self {
        self.min(&peer_proposal.swapped())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut group = Vec::with_capacity(20);
        group.extend_from_slice(&[MAX_INFO_FIELD_LENGTH_TRANSMIT, 1, self.max_info_field_length_transmit]);
        group.extend_from_slice(&[MAX_INFO_FIELD_LENGTH_RECEIVE, 1, self.max_info_field_length_receive]);
        group.extend_from_slice(&[WINDOW_SIZE_TRANSMIT, 4]);
        group.extend_from_slice(&self.window_size_transmit.to_be_bytes());
        group.extend_from_slice(&[WINDOW_SIZE_RECEIVE, 4]);
        group.extend_from_slice(&self.window_size_receive.to_be_bytes());

        let mut out = Vec::with_capacity(group.len() + 3);
        out.push(FORMAT_IDENTIFIER);
        out.push(GROUP_IDENTIFIER);
        out.push(group.len() as u8);
        out.extend_from_slice(&group);
        out
    }

    /// Decode a parameter block; parameters it does not carry keep the
    /// values of `defaults`
    pub fn decode(info: &[u8], defaults: &Self) -> DlmsResult<Self> {
        let mut params = *defaults;
        if info.is_empty() {
            return Ok(params);
        }
        if info.len() < 3 || info[0] != FORMAT_IDENTIFIER || info[1] != GROUP_IDENTIFIER {
            return Err(DlmsError::MalformedSegment(format!(
                "bad link parameter header {:02X?}",
                &info[..info.len().min(3)]
            )));
        }
        let group_len = info[2] as usize;
        let group = info.get(3..3 + group_len).ok_or_else(|| {
            DlmsError::MalformedSegment(format!(
                "link parameter group of {} bytes truncated to {}",
                group_len,
                info.len() - 3
            ))
        })?;

        let mut pos = 0;
        while pos < group.len() {
            if pos + 2 > group.len() {
                return Err(DlmsError::MalformedSegment("truncated link parameter".to_string()));
            }
            let id = group[pos];
            let len = group[pos + 1] as usize;
            let value = group
                .get(pos + 2..pos + 2 + len)
                .ok_or_else(|| DlmsError::MalformedSegment(format!("link parameter 0x{:02X} overruns group", id)))?;
            pos += 2 + len;

            match id {
                MAX_INFO_FIELD_LENGTH_TRANSMIT => params.max_info_field_length_transmit = info_length(id, value)?,
                MAX_INFO_FIELD_LENGTH_RECEIVE => params.max_info_field_length_receive = info_length(id, value)?,
                WINDOW_SIZE_TRANSMIT => params.window_size_transmit = window_size(id, value)?,
                WINDOW_SIZE_RECEIVE => params.window_size_receive = window_size(id, value)?,
                _ => log::debug!("skipping unknown link parameter 0x{:02X}", id),
            }
        }
        Ok(params)
    }
}

fn be_value(id: u8, value: &[u8]) -> DlmsResult<u32> {
    if value.is_empty() || value.len() > 4 {
        return Err(DlmsError::MalformedSegment(format!(
            "link parameter 0x{:02X} has length {}",
            id,
            value.len()
        )));
    }
    Ok(value.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32))
}

// Values wider than one byte saturate at 255
fn info_length(id: u8, value: &[u8]) -> DlmsResult<u8> {
    let v = be_value(id, value)?;
    if v == 0 {
        return Err(DlmsError::MalformedSegment(format!("link parameter 0x{:02X} is zero", id)));
    }
    Ok(v.min(u8::MAX as u32) as u8)
}

fn window_size(id: u8, value: &[u8]) -> DlmsResult<u32> {
    let v = be_value(id, value)?;
    if v == 0 {
        return Err(DlmsError::MalformedSegment(format!("link parameter 0x{:02X} is zero", id)));
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_defaults() {
        let bytes = LinkParameters::default().encode();
        assert_eq!(
            bytes,
            vec![
                0x81, 0x80, 0x12, 0x05, 0x01, 0x80, 0x06, 0x01, 0x80, 0x07, 0x04, 0x00, 0x00, 0x00,
                0x07, 0x08, 0x04, 0x00, 0x00, 0x00, 0x07
            ]
        );
        assert_eq!(LinkParameters::decode(&bytes, &LinkParameters::default()).unwrap(), LinkParameters::default());
    }

    #[test]
    fn test_decode_skips_unknown_and_keeps_defaults() {
        let info = [0x81, 0x80, 0x09, 0x05, 0x01, 0x40, 0x0A, 0x01, 0x99, 0x08, 0x01, 0x03];
        let p = LinkParameters::decode(&info, &LinkParameters::default()).unwrap();
        assert_eq!(p.max_info_field_length_transmit, 0x40);
        assert_eq!(p.max_info_field_length_receive, 128);
        assert_eq!(p.window_size_transmit, 7);
        assert_eq!(p.window_size_receive, 3);
    }

    #[test]
    fn test_empty_group_means_defaults() {
        let p = LinkParameters::decode(&[0x81, 0x80, 0x00], &LinkParameters::default()).unwrap();
        assert_eq!(p, LinkParameters::default());
        let p = LinkParameters::decode(&[], &LinkParameters::default()).unwrap();
        assert_eq!(p, LinkParameters::default());
    }

    #[test]
    fn test_decode_malformed() {
        let d = LinkParameters::default();
        assert!(LinkParameters::decode(&[0x82, 0x80, 0x00], &d).is_err());
        assert!(LinkParameters::decode(&[0x81, 0x80, 0x05, 0x05, 0x01], &d).is_err());
        assert!(LinkParameters::decode(&[0x81, 0x80, 0x03, 0x07, 0x04, 0x00], &d).is_err());
        assert!(LinkParameters::decode(&[0x81, 0x80, 0x03, 0x05, 0x01, 0x00], &d).is_err());
    }

    #[test]
    fn test_negotiate_pairwise_minima() {
        let server = LinkParameters {
            max_info_field_length_transmit: 200,
            max_info_field_length_receive: 64,
            window_size_transmit: 1,
            window_size_receive: 7,
        };
        let client_proposal = LinkParameters {
            max_info_field_length_transmit: 128,
            max_info_field_length_receive: 128,
            window_size_transmit: 7,
            window_size_receive: 7,
        };
        let at_server = server.negotiate(&client_proposal);
        assert_eq!(at_server.max_info_field_length_transmit, 128);
        assert_eq!(at_server.max_info_field_length_receive, 64);
        assert_eq!(at_server.window_size_transmit, 1);
        assert_eq!(at_server.window_size_receive, 7);

        // the client adopts the UA values seen from its own side
        let at_client = client_proposal.negotiate(&at_server);
        assert_eq!(at_client, at_server.swapped());
    }
}
