//! HDLC connection state machine

use std::fmt;

/// HDLC connection state
///
/// ```text
/// Disconnected -> Connecting     SNRM sent (client)
/// Connecting   -> Connected      UA received
/// Disconnected -> Connected      SNRM received (server)
/// Connected    -> Disconnecting  DISC sent (client)
/// Disconnecting-> Disconnected   UA or DM received
/// Connected    -> Disconnected   DISC received (server)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl LinkState {
    /// Check if the connection can carry information frames
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// Side of the link. Only a client originates SNRM and DISC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Who holds the right to transmit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Sending,
    Receiving,
}
