//! HDLC frame reader
//!
//! Pulls bytes from the stream, locates frames between `0x7E` flags using the
//! frame length field and hands decoded frames to the link event loop.
//! Frames that fail to decode are dropped and the reader resynchronises on the
//! next flag.

use crate::error::{DlmsError, DlmsResult};
use crate::hdlc::address::ServerAddressLength;
use crate::hdlc::frame::{Direction, FrameFault, HdlcFrame, MalformedFrame, FLAG};
use crate::hdlc::statistics::HdlcStatistics;
use bytes::{Buf, BytesMut};
use dlms_transport::StreamReader;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const HDLC_LENGTH_MASK: u16 = 0x07FF;
const FORMAT_TYPE_MASK: u8 = 0xF0;
const FORMAT_TYPE: u8 = 0xA0;

/// Format(2) + shortest addresses(2) + control(1) + HCS(2)
const MIN_FRAME_LENGTH: usize = 7;

const READ_CHUNK: usize = 1024;

/// Outcome of scanning the buffer for one frame
enum Scan {
    /// More bytes are needed
    Incomplete,
    /// Bytes were discarded while looking for a frame start
    Skipped,
    /// Body between the flags, format field through FCS
    Frame(Vec<u8>),
}

/// HDLC frame reader
pub struct FrameReader {
    reader: Box<dyn StreamReader>,
    buffer: BytesMut,
    direction: Direction,
    server_len: ServerAddressLength,
    stats: Arc<HdlcStatistics>,
    label: String,
}

impl FrameReader {
    pub fn new(
        reader: Box<dyn StreamReader>,
        direction: Direction,
        server_len: ServerAddressLength,
        stats: Arc<HdlcStatistics>,
        label: String,
    ) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(READ_CHUNK * 2),
            direction,
            server_len,
            stats,
            label,
        }
    }

    /// Read until one well-formed frame is available
    ///
    /// Malformed frames are counted and skipped. Only stream failures are
    /// returned as errors.
    pub async fn next_frame(&mut self) -> DlmsResult<HdlcFrame> {
        loop {
            match self.scan() {
                Scan::Frame(body) => match HdlcFrame::decode(&body, self.direction, self.server_len) {
                    Ok(frame) => return Ok(frame),
                    Err(e) => {
                        self.count_malformed(&e);
                        log::warn!("{} dropping frame: {}", self.label, e);
                        log::trace!("{} dropped frame body {:02X?}", self.label, body);
                    }
                },
                Scan::Skipped => {}
                Scan::Incomplete => self.fill().await?,
            }
        }
    }

    /// Run the reader as a task feeding `frames`
    ///
    /// The task ends on the first stream error, which is forwarded, or once
    /// the receiving side is gone.
    pub fn spawn(mut self, frames: mpsc::UnboundedSender<DlmsResult<HdlcFrame>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let next = self.next_frame().await;
                let failed = next.is_err();
                if frames.send(next).is_err() || failed {
                    break;
                }
            }
            log::debug!("{} frame reader stopped", self.label);
        })
    }

    async fn fill(&mut self) -> DlmsResult<()> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(DlmsError::eof("stream closed by peer"));
        }
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    fn scan(&mut self) -> Scan {
        let Some(start) = self.buffer.iter().position(|&b| b == FLAG) else {
            if !self.buffer.is_empty() {
                log::debug!("{} discarding {} bytes outside frames", self.label, self.buffer.len());
                self.buffer.clear();
            }
            return Scan::Incomplete;
        };
        if start > 0 {
            log::debug!("{} discarding {} bytes before flag", self.label, start);
            self.buffer.advance(start);
        }
        if self.buffer.len() < 3 {
            return Scan::Incomplete;
        }

        // Consecutive flags: the first one closes nothing
        if self.buffer[1] == FLAG || self.buffer[1] & FORMAT_TYPE_MASK != FORMAT_TYPE {
            self.buffer.advance(1);
            return Scan::Skipped;
        }

        let length = (u16::from_be_bytes([self.buffer[1], self.buffer[2]]) & HDLC_LENGTH_MASK) as usize;
        if length < MIN_FRAME_LENGTH {
            self.stats.increment_control_errors();
            log::warn!("{} frame length {} too short", self.label, length);
            self.buffer.advance(1);
            return Scan::Skipped;
        }
        if self.buffer.len() < length + 2 {
            return Scan::Incomplete;
        }
        if self.buffer[length + 1] != FLAG {
            self.stats.increment_fcs_errors();
            log::warn!(
                "{} expected closing flag after {} bytes, got 0x{:02X}",
                self.label,
                length,
                self.buffer[length + 1]
            );
            self.buffer.advance(1);
            return Scan::Skipped;
        }

        let body = self.buffer[1..=length].to_vec();
        // The closing flag may open the next frame
        self.buffer.advance(length + 1);
        Scan::Frame(body)
    }

    fn count_malformed(&self, err: &MalformedFrame) {
        match err.fault {
            FrameFault::Hcs => self.stats.increment_hcs_errors(),
            FrameFault::Fcs | FrameFault::Length => self.stats.increment_fcs_errors(),
            FrameFault::Control | FrameFault::Format => self.stats.increment_control_errors(),
            FrameFault::Address => self.stats.increment_address_errors(),
        }
    }
}
