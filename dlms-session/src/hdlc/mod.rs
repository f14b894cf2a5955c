//! HDLC session layer module

pub mod address;
pub mod connection;
pub mod decoder;
pub mod fcs;
pub mod frame;
pub mod params;
pub mod state;
pub mod statistics;
pub mod window;

pub use address::{reserved, ServerAddress, ServerAddressLength};
pub use connection::{HdlcLink, HdlcReader, HdlcSettings, HdlcWriter, MODULUS_8};
pub use decoder::FrameReader;
pub use fcs::FcsCalc;
pub use frame::{Control, Direction, FrameFault, HdlcFrame, MalformedFrame, FLAG};
pub use params::LinkParameters;
pub use state::{LinkState, Mode, Role};
pub use statistics::{HdlcStatistics, HdlcStatisticsSnapshot};
pub use window::{ReceiveWindow, Segment, SendWindow};
