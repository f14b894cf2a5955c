//! Session layer for the DLMS/COSEM client
//!
//! Two ways of carrying application PDUs over a byte stream:
//!
//! - [`hdlc`]: HDLC link (SNRM/UA setup, windows, segmentation, ARQ) with the
//!   LLC header in front of every PDU ([`llc`])
//! - [`wrapper`]: the TCP wrapper header
//!
//! Both expose the [`PduSender`] / [`PduReceiver`] traits to the application
//! layer.

pub mod channel;
pub mod error;
pub mod hdlc;
pub mod llc;
pub mod wrapper;

pub use channel::{PduReceiver, PduSender};
pub use error::{DlmsError, DlmsResult};
pub use hdlc::*;
pub use llc::{LlcReceiver, LlcSender, LLC_REQUEST, LLC_RESPONSE};
pub use wrapper::{make_wpdu, WrapperHeader, WrapperReceiver, WrapperSender, WRAPPER_HEADER_LENGTH};
