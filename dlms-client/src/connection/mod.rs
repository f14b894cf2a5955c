//! Connection management module

pub mod app_conn;
pub mod connection;
pub mod dlms_conn;

pub use app_conn::AppConn;
pub use connection::Connection;
pub use dlms_conn::{DlmsConn, PduChannel, SessionKind};
