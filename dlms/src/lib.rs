//! DLMS/COSEM client for electricity meters
//!
//! The workspace is organized by protocol layer:
//!
//! - `dlms-core`: error type, OBIS codes, COSEM data values
//! - `dlms-asn1`: A-XDR data codec, AARQ/AARE
//! - `dlms-transport`: TCP and generic byte stream transports
//! - `dlms-session`: HDLC link and TCP wrapper session
//! - `dlms-application`: GET/SET/ACTION PDUs and the request manager
//! - `dlms-client`: dialers, association, mock meter
//!
//! # Usage
//!
//! ```no_run
//! use dlms::client::{AppConn, Connection, DlmsConn};
//! use dlms::ObisCode;
//! use std::time::Duration;
//!
//! # async fn read_clock() -> dlms::DlmsResult<()> {
//! let dconn = DlmsConn::tcp_connect("10.0.0.5:4059".parse().unwrap(), Duration::from_secs(5)).await?;
//! let conn = AppConn::connect_with_password(dconn, 16, 1, b"12345678", Duration::from_secs(5)).await?;
//! let clock = conn.get_attribute(8, ObisCode::new(0, 0, 1, 0, 0, 255), 2).await?;
//! println!("{}", clock);
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;

pub use dlms_core::datatypes::*;
pub use dlms_core::{DlmsError, DlmsResult, ObisCode, WrongState};

pub mod asn1 {
    pub use dlms_asn1::*;
}

pub mod transport {
    pub use dlms_transport::*;
}

pub mod session {
    pub use dlms_session::*;
}

pub mod application {
    pub use dlms_application::*;
}

pub mod client {
    pub use dlms_client::*;
}
