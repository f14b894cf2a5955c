//! HDLC frame structure and encoding/decoding

use crate::error::{DlmsError, DlmsResult};
use crate::hdlc::address::{decode_client_address, encode_client_address, ServerAddress, ServerAddressLength};
use crate::hdlc::fcs::FcsCalc;
use std::fmt;
use thiserror::Error;

/// HDLC frame flag
pub const FLAG: u8 = 0x7E;

/// Frame format type 3 tag in the upper nibble of the format field
const FORMAT_TYPE: u8 = 0xA0;
const SEGMENTATION_BIT: u8 = 0x08;

/// Largest value of the 11-bit frame length
pub const MAX_FRAME_LENGTH: usize = 0x07FF;

const POLL_BIT: u8 = 0x10;

/// Which way a frame travels, seen from one side of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientInbound,
    ClientOutbound,
    ServerInbound,
    ServerOutbound,
}

impl Direction {
    /// Frames travelling this way carry the server address first
    fn server_address_first(self) -> bool {
        matches!(self, Direction::ClientOutbound | Direction::ServerInbound)
    }
}

/// Control field of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Information { ns: u8, nr: u8, poll: bool },
    ReceiveReady { nr: u8, poll: bool },
    ReceiveNotReady { nr: u8, poll: bool },
    SetNormalResponseMode { poll: bool },
    Disconnect { poll: bool },
    UnnumberedAcknowledge { poll: bool },
    DisconnectMode { poll: bool },
    FrameReject { poll: bool },
    UnnumberedInformation { poll: bool },
}

impl Control {
    pub fn encode(self) -> u8 {
        let p = |poll: bool| if poll { POLL_BIT } else { 0 };
        match self {
            Control::Information { ns, nr, poll } => ((nr & 0x07) << 5) | p(poll) | ((ns & 0x07) << 1),
            Control::ReceiveReady { nr, poll } => ((nr & 0x07) << 5) | p(poll) | 0x01,
            Control::ReceiveNotReady { nr, poll } => ((nr & 0x07) << 5) | p(poll) | 0x05,
            Control::SetNormalResponseMode { poll } => 0x83 | p(poll),
            Control::Disconnect { poll } => 0x43 | p(poll),
            Control::UnnumberedAcknowledge { poll } => 0x63 | p(poll),
            Control::DisconnectMode { poll } => 0x0F | p(poll),
            Control::FrameReject { poll } => 0x87 | p(poll),
            Control::UnnumberedInformation { poll } => 0x03 | p(poll),
        }
    }

    pub fn decode(b: u8) -> DlmsResult<Self> {
        let poll = b & POLL_BIT != 0;
        let nr = b >> 5;
        if b & 0x01 == 0 {
            return Ok(Control::Information {
                ns: (b >> 1) & 0x07,
                nr,
                poll,
            });
        }
        match b & 0x0F {
            0x01 => return Ok(Control::ReceiveReady { nr, poll }),
            0x05 => return Ok(Control::ReceiveNotReady { nr, poll }),
            _ => {}
        }
        match b & !POLL_BIT {
            0x83 => Ok(Control::SetNormalResponseMode { poll }),
            0x43 => Ok(Control::Disconnect { poll }),
            0x63 => Ok(Control::UnnumberedAcknowledge { poll }),
            0x0F => Ok(Control::DisconnectMode { poll }),
            0x87 => Ok(Control::FrameReject { poll }),
            0x03 => Ok(Control::UnnumberedInformation { poll }),
            _ => Err(DlmsError::MalformedSegment(format!(
                "Control field unknown: 0x{:02X}",
                b
            ))),
        }
    }

    /// Poll (command) or final (response) bit
    pub fn poll(self) -> bool {
        match self {
            Control::Information { poll, .. }
            | Control::ReceiveReady { poll, .. }
            | Control::ReceiveNotReady { poll, .. }
            | Control::SetNormalResponseMode { poll }
            | Control::Disconnect { poll }
            | Control::UnnumberedAcknowledge { poll }
            | Control::DisconnectMode { poll }
            | Control::FrameReject { poll }
            | Control::UnnumberedInformation { poll } => poll,
        }
    }

    /// Whether frames of this type may carry an information field
    pub fn carries_info(self) -> bool {
        matches!(
            self,
            Control::Information { .. }
                | Control::SetNormalResponseMode { .. }
                | Control::UnnumberedAcknowledge { .. }
                | Control::FrameReject { .. }
                | Control::UnnumberedInformation { .. }
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Control::Information { .. } => "I",
            Control::ReceiveReady { .. } => "RR",
            Control::ReceiveNotReady { .. } => "RNR",
            Control::SetNormalResponseMode { .. } => "SNRM",
            Control::Disconnect { .. } => "DISC",
            Control::UnnumberedAcknowledge { .. } => "UA",
            Control::DisconnectMode { .. } => "DM",
            Control::FrameReject { .. } => "FRMR",
            Control::UnnumberedInformation { .. } => "UI",
        }
    }
}

/// Part of a received frame that failed the checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFault {
    Format,
    Length,
    Address,
    Control,
    Hcs,
    Fcs,
}

/// A frame body that could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{detail}")]
pub struct MalformedFrame {
    pub fault: FrameFault,
    pub detail: String,
}

impl MalformedFrame {
    fn new(fault: FrameFault, detail: impl Into<String>) -> Self {
        Self {
            fault,
            detail: detail.into(),
        }
    }

    /// Wrap an error raised by one of the field decoders
    fn at(fault: FrameFault) -> impl Fn(DlmsError) -> Self {
        move |e| match e {
            DlmsError::MalformedSegment(detail) | DlmsError::Decode(detail) => Self::new(fault, detail),
            other => Self::new(fault, other.to_string()),
        }
    }
}

impl From<MalformedFrame> for DlmsError {
    fn from(e: MalformedFrame) -> Self {
        DlmsError::MalformedSegment(e.detail)
    }
}

/// HDLC frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HdlcFrame {
    pub direction: Direction,
    pub segmented: bool,
    pub server: ServerAddress,
    pub client: u8,
    pub control: Control,
    pub info: Vec<u8>,
}

impl HdlcFrame {
    /// Encode the frame including both flags
    pub fn encode(&self, server_len: ServerAddressLength) -> DlmsResult<Vec<u8>> {
        if !self.info.is_empty() && !self.control.carries_info() {
            return Err(DlmsError::InvalidValue(format!(
                "{} frame cannot carry an information field",
                self.control.name()
            )));
        }

        let mut addresses = Vec::with_capacity(5);
        if self.direction.server_address_first() {
            self.server.encode(server_len, &mut addresses)?;
            encode_client_address(self.client, &mut addresses)?;
        } else {
            encode_client_address(self.client, &mut addresses)?;
            self.server.encode(server_len, &mut addresses)?;
        }

        // format, addresses, control, HCS, [info, FCS]
        let mut length = 2 + addresses.len() + 1 + 2;
        if !self.info.is_empty() {
            length += self.info.len() + 2;
        }
        if length > MAX_FRAME_LENGTH {
            return Err(DlmsError::InvalidValue(format!(
                "frame length {} exceeds {}",
                length, MAX_FRAME_LENGTH
            )));
        }

        let mut out = Vec::with_capacity(length + 2);
        out.push(FLAG);
        let mut format_h = FORMAT_TYPE | ((length >> 8) as u8 & 0x07);
        if self.segmented {
            format_h |= SEGMENTATION_BIT;
        }
        out.push(format_h);
        out.push(length as u8);
        out.extend_from_slice(&addresses);
        out.push(self.control.encode());

        let mut fcs = FcsCalc::new();
        fcs.update_bytes(&out[1..]);
        let hcs = fcs.fcs_value_bytes();
        out.extend_from_slice(&hcs);

        if !self.info.is_empty() {
            fcs.update_bytes(&hcs);
            fcs.update_bytes(&self.info);
            out.extend_from_slice(&self.info);
            out.extend_from_slice(&fcs.fcs_value_bytes());
        }
        out.push(FLAG);
        Ok(out)
    }

    /// Decode the bytes between the flags (format field through FCS)
    ///
    /// # Arguments
    ///
    /// * `body` - Format field through FCS, without the flags
    /// * `direction` - How the frame travelled, which fixes the address order
    /// * `server_len` - Configured length of the server address
    ///
    /// # Returns
    ///
    /// The frame, or the part of it that failed the checks
    pub fn decode(
        body: &[u8],
        direction: Direction,
        server_len: ServerAddressLength,
    ) -> Result<Self, MalformedFrame> {
        if body.len() < 2 {
            return Err(MalformedFrame::new(FrameFault::Length, "frame too short"));
        }
        let format_h = body[0];
        if format_h & 0xF0 != FORMAT_TYPE {
            return Err(MalformedFrame::new(
                FrameFault::Format,
                format!("illegal frame format 0x{:02X}", format_h),
            ));
        }
        let length = (((format_h & 0x07) as usize) << 8) | body[1] as usize;
        if length != body.len() {
            return Err(MalformedFrame::new(
                FrameFault::Length,
                format!("frame length field {} does not match {} received bytes", length, body.len()),
            ));
        }
        let segmented = format_h & SEGMENTATION_BIT != 0;

        let mut pos = 2;
        let address = MalformedFrame::at(FrameFault::Address);
        let (server, client) = if direction.server_address_first() {
            let (server, n) = ServerAddress::decode(&body[pos..], server_len).map_err(&address)?;
            pos += n;
            let client = decode_client_address(&body[pos..]).map_err(&address)?;
            pos += 1;
            (server, client)
        } else {
            let client = decode_client_address(&body[pos..]).map_err(&address)?;
            pos += 1;
            let (server, n) = ServerAddress::decode(&body[pos..], server_len).map_err(&address)?;
            pos += n;
            (server, client)
        };

        if pos + 3 > body.len() {
            return Err(MalformedFrame::new(FrameFault::Length, "frame too short for control field"));
        }
        let control = Control::decode(body[pos]).map_err(MalformedFrame::at(FrameFault::Control))?;
        pos += 1;

        let mut fcs = FcsCalc::new();
        fcs.update_bytes(&body[..pos + 2]);
        fcs.validate("HCS").map_err(MalformedFrame::at(FrameFault::Hcs))?;
        pos += 2;

        let info = if pos < body.len() {
            if body.len() - pos < 3 {
                return Err(MalformedFrame::new(FrameFault::Length, "truncated information field"));
            }
            fcs.update_bytes(&body[pos..]);
            fcs.validate("FCS").map_err(MalformedFrame::at(FrameFault::Fcs))?;
            body[pos..body.len() - 2].to_vec()
        } else {
            Vec::new()
        };

        if !info.is_empty() && !control.carries_info() {
            return Err(MalformedFrame::new(
                FrameFault::Control,
                format!("{} frame with information field", control.name()),
            ));
        }

        Ok(Self {
            direction,
            segmented,
            server,
            client,
            control,
            info,
        })
    }
}

impl fmt::Display for HdlcFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.control.name())?;
        match self.control {
            Control::Information { ns, nr, .. } => write!(f, " ns={} nr={}", ns, nr)?,
            Control::ReceiveReady { nr, .. } | Control::ReceiveNotReady { nr, .. } => {
                write!(f, " nr={}", nr)?
            }
            _ => {}
        }
        if self.control.poll() {
            write!(f, " P/F")?;
        }
        if self.segmented {
            write!(f, " seg")?;
        }
        write!(f, " server={} client={:#X} info={}B", self.server, self.client, self.info.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(encoded: &[u8]) -> &[u8] {
        &encoded[1..encoded.len() - 1]
    }

    #[test]
    fn test_snrm_without_parameters() {
        let frame = HdlcFrame {
            direction: Direction::ClientOutbound,
            segmented: false,
            server: ServerAddress::new(1, None),
            client: 0x10,
            control: Control::SetNormalResponseMode { poll: true },
            info: Vec::new(),
        };
        let bytes = frame.encode(ServerAddressLength::One).unwrap();
        assert_eq!(bytes, vec![0x7E, 0xA0, 0x07, 0x03, 0x21, 0x93, 0x0F, 0x01, 0x7E]);

        let decoded = HdlcFrame::decode(body(&bytes), Direction::ServerInbound, ServerAddressLength::One).unwrap();
        assert_eq!(decoded.control, frame.control);
        assert_eq!(decoded.server, frame.server);
        assert_eq!(decoded.client, 0x10);
    }

    #[test]
    fn test_information_frame() {
        let frame = HdlcFrame {
            direction: Direction::ServerOutbound,
            segmented: true,
            server: ServerAddress::new(1, Some(0x11)),
            client: 0x10,
            control: Control::Information { ns: 5, nr: 3, poll: false },
            info: vec![0xE6, 0xE7, 0x00, 0xC4, 0x01],
        };
        let bytes = frame.encode(ServerAddressLength::Four).unwrap();
        assert_eq!(bytes[1], 0xA8);
        assert_eq!(bytes[2] as usize, bytes.len() - 2);
        // client address comes first on server outbound frames
        assert_eq!(bytes[3], 0x21);

        let decoded = HdlcFrame::decode(body(&bytes), Direction::ClientInbound, ServerAddressLength::Four).unwrap();
        assert_eq!(decoded.direction, Direction::ClientInbound);
        assert!(decoded.segmented);
        assert_eq!(decoded.control, frame.control);
        assert_eq!(decoded.info, frame.info);
        assert_eq!(decoded.server, frame.server);
    }

    #[test]
    fn test_control_bytes() {
        assert_eq!(Control::Information { ns: 1, nr: 2, poll: true }.encode(), 0x52);
        assert_eq!(Control::ReceiveReady { nr: 7, poll: true }.encode(), 0xF1);
        assert_eq!(Control::ReceiveNotReady { nr: 0, poll: false }.encode(), 0x05);
        assert_eq!(Control::Disconnect { poll: true }.encode(), 0x53);
        assert_eq!(Control::UnnumberedAcknowledge { poll: true }.encode(), 0x73);
        assert_eq!(Control::DisconnectMode { poll: true }.encode(), 0x1F);
        assert_eq!(Control::decode(0x1F).unwrap(), Control::DisconnectMode { poll: true });
        assert_eq!(Control::decode(0x13).unwrap(), Control::UnnumberedInformation { poll: true });
        assert!(matches!(Control::decode(0xFF), Err(DlmsError::MalformedSegment(_))));
    }

    #[test]
    fn test_corrupted_frames_are_malformed() {
        let frame = HdlcFrame {
            direction: Direction::ClientOutbound,
            segmented: false,
            server: ServerAddress::new(1, Some(1)),
            client: 0x10,
            control: Control::Information { ns: 0, nr: 0, poll: true },
            info: vec![1, 2, 3, 4],
        };
        let bytes = frame.encode(ServerAddressLength::Four).unwrap();
        for i in 1..bytes.len() - 1 {
            let mut broken = bytes.clone();
            broken[i] ^= 0x40;
            let res = HdlcFrame::decode(body(&broken), Direction::ServerInbound, ServerAddressLength::Four);
            assert!(res.is_err(), "byte {} flipped", i);
        }
    }

    #[test]
    fn test_malformed_frames_name_the_fault() {
        let frame = HdlcFrame {
            direction: Direction::ServerOutbound,
            segmented: false,
            server: ServerAddress::new(1, None),
            client: 0x10,
            control: Control::Information { ns: 0, nr: 0, poll: true },
            info: vec![1, 2, 3, 4],
        };
        let bytes = frame.encode(ServerAddressLength::One).unwrap();
        // 7E A0 0D 21 03 10 HCS HCS 01 02 03 04 FCS FCS 7E
        let fault = |i: usize, mask: u8| {
            let mut broken = bytes.clone();
            broken[i] ^= mask;
            HdlcFrame::decode(body(&broken), Direction::ClientInbound, ServerAddressLength::One)
                .unwrap_err()
                .fault
        };
        assert_eq!(fault(1, 0x40), FrameFault::Format);
        assert_eq!(fault(2, 0x01), FrameFault::Length);
        assert_eq!(fault(3, 0x01), FrameFault::Address);
        assert_eq!(fault(5, 0xEF), FrameFault::Control);
        assert_eq!(fault(6, 0x01), FrameFault::Hcs);
        assert_eq!(fault(9, 0x01), FrameFault::Fcs);

        let err = DlmsError::from(
            HdlcFrame::decode(&body(&bytes)[..4], Direction::ClientInbound, ServerAddressLength::One).unwrap_err(),
        );
        assert!(matches!(err, DlmsError::MalformedSegment(_)));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let frame = HdlcFrame {
            direction: Direction::ClientOutbound,
            segmented: false,
            server: ServerAddress::new(1, None),
            client: 0x10,
            control: Control::Information { ns: 0, nr: 0, poll: true },
            info: vec![0; MAX_FRAME_LENGTH],
        };
        assert!(matches!(frame.encode(ServerAddressLength::One), Err(DlmsError::InvalidValue(_))));
    }
}
