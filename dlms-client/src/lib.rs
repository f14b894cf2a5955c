//! DLMS/COSEM client
//!
//! Dial a meter with [`DlmsConn`] (TCP wrapper or HDLC over TCP), associate
//! with [`AppConn::connect_with_password`], then read, write and invoke
//! COSEM objects through the request manager. [`mock`] provides an
//! in-process meter for tests and demos.

pub mod connection;
pub mod mock;

pub use connection::{AppConn, Connection, DlmsConn, PduChannel, SessionKind};
pub use mock::{MockMeter, MockSettings};
