//! HDLC link event loop
//!
//! One task owns the link: it alternates between a sending turn and a
//! receiving turn, handing the turn over with the poll/final bit. The
//! [`HdlcLink`] handle talks to it over channels; upper layers see an ordered
//! byte stream through [`HdlcWriter`] and [`HdlcReader`].

use crate::error::{DlmsError, DlmsResult, WrongState};
use crate::hdlc::address::{ServerAddress, ServerAddressLength};
use crate::hdlc::decoder::FrameReader;
use crate::hdlc::frame::{Control, Direction, HdlcFrame};
use crate::hdlc::params::LinkParameters;
use crate::hdlc::state::{LinkState, Mode, Role};
use crate::hdlc::statistics::{HdlcStatistics, HdlcStatisticsSnapshot};
use crate::hdlc::window::{ReceiveWindow, Segment, SendWindow};
use bytes::Bytes;
use dlms_transport::{StreamReader, StreamWriter};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};

/// Sequence modulus carried by a one-byte control field
pub const MODULUS_8: u8 = 8;

const WRITE_QUEUE_DEPTH: usize = 32;

/// HDLC link configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HdlcSettings {
    pub modulus: u8,
    pub max_info_field_length_transmit: u8,
    pub max_info_field_length_receive: u8,
    pub window_size_transmit: u32,
    pub window_size_receive: u32,
    pub server_address_length: ServerAddressLength,
    /// Longest wait for a frame after handing over the poll bit (client only)
    pub response_timeout: Duration,
    pub snrm_timeout: Duration,
    pub disc_timeout: Duration,
    /// Grace period before re-polling while the peer application is busy
    pub cosem_wait_time: Duration,
}

impl Default for HdlcSettings {
    fn default() -> Self {
        let params = LinkParameters::default();
        Self {
            modulus: MODULUS_8,
            max_info_field_length_transmit: params.max_info_field_length_transmit,
            max_info_field_length_receive: params.max_info_field_length_receive,
            window_size_transmit: params.window_size_transmit,
            window_size_receive: params.window_size_receive,
            server_address_length: ServerAddressLength::default(),
            response_timeout: Duration::from_secs(5),
            snrm_timeout: Duration::from_secs(10),
            disc_timeout: Duration::from_secs(10),
            cosem_wait_time: Duration::from_millis(500),
        }
    }
}

impl HdlcSettings {
    pub fn validate(&self) -> DlmsResult<()> {
        // Modulus 128 needs the two-byte control field, which is not supported
        if self.modulus != MODULUS_8 {
            return Err(DlmsError::InvalidValue(format!(
                "unsupported HDLC modulus {}",
                self.modulus
            )));
        }
        if self.max_info_field_length_transmit == 0 || self.max_info_field_length_receive == 0 {
            return Err(DlmsError::InvalidValue(
                "maximum information field length must be positive".to_string(),
            ));
        }
        if self.window_size_transmit == 0 || self.window_size_receive == 0 {
            return Err(DlmsError::InvalidValue("window size must be positive".to_string()));
        }
        if self.response_timeout.is_zero() {
            return Err(DlmsError::InvalidValue("response timeout must be positive".to_string()));
        }
        Ok(())
    }

    /// Link parameters proposed by this side
    pub fn link_parameters(&self) -> LinkParameters {
        LinkParameters {
            max_info_field_length_transmit: self.max_info_field_length_transmit,
            max_info_field_length_receive: self.max_info_field_length_receive,
            window_size_transmit: self.window_size_transmit,
            window_size_receive: self.window_size_receive,
        }
    }
}

/// Stream failure that ended the link, kept so every handle can report it
#[derive(Debug, Clone)]
struct LinkFailure {
    kind: io::ErrorKind,
    message: String,
}

impl LinkFailure {
    fn from_error(err: &DlmsError) -> Self {
        match err {
            DlmsError::Connection(e) => Self {
                kind: e.kind(),
                message: e.to_string(),
            },
            other => Self {
                kind: io::ErrorKind::Other,
                message: other.to_string(),
            },
        }
    }

    fn to_error(&self) -> DlmsError {
        DlmsError::Connection(io::Error::new(self.kind, self.message.clone()))
    }
}

fn link_gone(fatal: &watch::Receiver<Option<LinkFailure>>) -> DlmsError {
    match &*fatal.borrow() {
        Some(failure) => failure.to_error(),
        None => DlmsError::ConnectionClosed,
    }
}

enum Command {
    Connect(oneshot::Sender<DlmsResult<()>>),
    Disconnect(oneshot::Sender<DlmsResult<()>>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    Connect,
    Disconnect,
}

struct PendingCommand {
    kind: CommandKind,
    ack: oneshot::Sender<DlmsResult<()>>,
    deadline: Instant,
    sent: bool,
}

/// State owned by the link task
struct LinkTask {
    label: String,
    role: Role,
    settings: HdlcSettings,
    own_params: LinkParameters,
    params: LinkParameters,
    client: u8,
    server: ServerAddress,

    writer: Box<dyn StreamWriter>,
    frames: mpsc::UnboundedReceiver<DlmsResult<HdlcFrame>>,
    reader_task: JoinHandle<()>,
    commands: mpsc::UnboundedReceiver<Command>,
    writes: mpsc::Receiver<Bytes>,
    reads: mpsc::UnboundedSender<Segment>,
    state_tx: watch::Sender<LinkState>,
    params_tx: watch::Sender<LinkParameters>,
    fatal_tx: watch::Sender<Option<LinkFailure>>,
    stats: Arc<HdlcStatistics>,

    state: LinkState,
    mode: Mode,
    send_window: SendWindow,
    receive_window: ReceiveWindow,
    current: Option<Bytes>,
    replies: VecDeque<HdlcFrame>,
    pending: Option<PendingCommand>,
    /// Peer sent a segment with more to come
    peer_segmenting: bool,
    /// Complete payloads the client sent whose replies have not ended yet
    awaiting_replies: usize,
    /// Client response timeout expired; poll again before anything new
    repoll: bool,
}

impl LinkTask {
    async fn run(mut self) {
        log::debug!("{} link task started as {:?}", self.label, self.role);
        match self.drive().await {
            Ok(()) => {
                if let Err(e) = self.writer.shutdown().await {
                    log::debug!("{} stream shutdown: {}", self.label, e);
                }
            }
            Err(err) => {
                log::error!("{} link aborted: {}", self.label, err);
                self.fatal_tx.send_replace(Some(LinkFailure::from_error(&err)));
            }
        }
        if let Some(pending) = self.pending.take() {
            let _ = pending.ack.send(Err(link_gone(&self.fatal_tx.subscribe())));
        }
        self.set_state(LinkState::Disconnected);
        self.reader_task.abort();
        log::debug!("{} link task stopped", self.label);
    }

    async fn drive(&mut self) -> DlmsResult<()> {
        loop {
            let flow = match self.mode {
                Mode::Sending => self.send_turn().await?,
                Mode::Receiving => self.receive_turn().await?,
            };
            if flow.is_break() {
                return Ok(());
            }
        }
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            log::info!("{} {} -> {}", self.label, self.state, state);
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn reset_link(&mut self) {
        self.send_window = SendWindow::new(self.settings.modulus, self.params.window_size_transmit);
        self.receive_window = ReceiveWindow::new(self.settings.modulus);
        if self.current.take().is_some() {
            log::warn!("{} discarding partially sent payload", self.label);
        }
        self.peer_segmenting = false;
        self.awaiting_replies = 0;
        self.repoll = false;
    }

    fn adopt_parameters(&mut self, params: LinkParameters) {
        log::info!(
            "{} negotiated info tx={} rx={} window tx={} rx={}",
            self.label,
            params.max_info_field_length_transmit,
            params.max_info_field_length_receive,
            params.window_size_transmit,
            params.window_size_receive
        );
        self.params = params;
        self.params_tx.send_replace(params);
        self.reset_link();
    }

    /// Validate a command against the current state; accepted commands wait
    /// for the next sending turn
    fn accept_command(&mut self, kind: CommandKind, ack: oneshot::Sender<DlmsResult<()>>) {
        let check = match (self.role, kind) {
            (Role::Server, _) => Err(WrongState::NotAllowed),
            (Role::Client, CommandKind::Connect) => {
                if self.state == LinkState::Disconnected && self.pending.is_none() {
                    Ok(self.settings.snrm_timeout)
                } else {
                    Err(WrongState::NotDisconnected)
                }
            }
            (Role::Client, CommandKind::Disconnect) => {
                if self.state == LinkState::Connected && self.pending.is_none() {
                    Ok(self.settings.disc_timeout)
                } else {
                    Err(WrongState::NotConnected)
                }
            }
        };
        match check {
            Ok(timeout) => {
                self.pending = Some(PendingCommand {
                    kind,
                    ack,
                    deadline: Instant::now() + timeout,
                    sent: false,
                });
            }
            Err(wrong) => {
                log::debug!("{} rejecting {:?}: {}", self.label, kind, wrong);
                let _ = ack.send(Err(DlmsError::WrongState(wrong)));
            }
        }
    }

    fn on_command(&mut self, command: Option<Command>) -> ControlFlow<()> {
        match command {
            Some(Command::Connect(ack)) => self.accept_command(CommandKind::Connect, ack),
            Some(Command::Disconnect(ack)) => self.accept_command(CommandKind::Disconnect, ack),
            Some(Command::Shutdown) | None => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn complete_pending(&mut self, result: DlmsResult<()>) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.ack.send(result);
        }
    }

    fn outbound(&self) -> Direction {
        match self.role {
            Role::Client => Direction::ClientOutbound,
            Role::Server => Direction::ServerOutbound,
        }
    }

    async fn send_frame(&mut self, control: Control, info: Vec<u8>, segmented: bool) -> DlmsResult<()> {
        let frame = HdlcFrame {
            direction: self.outbound(),
            segmented,
            server: self.server,
            client: self.client,
            control,
            info,
        };
        let bytes = frame.encode(self.settings.server_address_length)?;
        log::trace!(target: "dlms_session::hdlc", "{} >> {} {:02X?}", self.label, frame, bytes);
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        self.stats.increment_frames_sent();
        if control.poll() {
            self.mode = Mode::Receiving;
        }
        Ok(())
    }

    async fn send_receive_ready(&mut self) -> DlmsResult<()> {
        let nr = self.receive_window.expected_sequence();
        self.send_frame(Control::ReceiveReady { nr, poll: true }, Vec::new(), false).await
    }

    /// Carve the next segment off the payload being sent, pulling a new
    /// payload from the write queue when needed
    fn next_segment(&mut self) -> Option<Segment> {
        if self.current.is_none() {
            self.current = self.writes.try_recv().ok();
        }
        let payload = self.current.as_mut()?;
        let take = payload.len().min(self.params.max_info_field_length_transmit as usize);
        let data = payload.split_to(take);
        let last = payload.is_empty();
        if last {
            self.current = None;
        }
        Some(Segment {
            data: data.to_vec(),
            last,
        })
    }

    async fn send_information(&mut self, segment: Segment) -> DlmsResult<()> {
        let poll = self.send_window.at_wrap()
            || self.send_window.outstanding() + 1 >= self.send_window.max_outstanding()
            || segment.last;
        let nr = self.receive_window.expected_sequence();
        let segmented = !segment.last;
        let info = segment.data.clone();
        if segment.last && self.role == Role::Client {
            self.awaiting_replies += 1;
        }
        let ns = self.send_window.push(segment);
        self.send_frame(Control::Information { ns, nr, poll }, info, segmented).await
    }

    async fn retransmit(&mut self) -> DlmsResult<()> {
        let nr = self.receive_window.expected_sequence();
        let frames: Vec<_> = self.send_window.pending().cloned().collect();
        let count = frames.len();
        log::debug!("{} retransmitting {} frames", self.label, count);
        for (i, pending) in frames.into_iter().enumerate() {
            let poll = i + 1 == count;
            self.stats.increment_retransmissions();
            self.send_frame(
                Control::Information { ns: pending.ns, nr, poll },
                pending.segment.data,
                !pending.segment.last,
            )
            .await?;
        }
        self.repoll = false;
        Ok(())
    }

    async fn send_turn(&mut self) -> DlmsResult<ControlFlow<()>> {
        if !self.replies.is_empty() {
            while let Some(reply) = self.replies.pop_front() {
                self.send_frame(reply.control, reply.info, false).await?;
            }
            self.mode = Mode::Receiving;
            return Ok(ControlFlow::Continue(()));
        }

        if let Some(pending) = &mut self.pending {
            if !pending.sent {
                pending.sent = true;
                let kind = pending.kind;
                match kind {
                    CommandKind::Connect => {
                        self.set_state(LinkState::Connecting);
                        let info = self.own_params.encode();
                        self.send_frame(Control::SetNormalResponseMode { poll: true }, info, false)
                            .await?;
                    }
                    CommandKind::Disconnect => {
                        self.set_state(LinkState::Disconnecting);
                        self.send_frame(Control::Disconnect { poll: true }, Vec::new(), false).await?;
                    }
                }
            }
            self.mode = Mode::Receiving;
            return Ok(ControlFlow::Continue(()));
        }

        if !self.state.is_connected() {
            return match self.role {
                Role::Client => self.idle().await,
                Role::Server => {
                    self.send_frame(Control::DisconnectMode { poll: true }, Vec::new(), false)
                        .await?;
                    Ok(ControlFlow::Continue(()))
                }
            };
        }

        if self.send_window.has_outstanding() {
            self.retransmit().await?;
            return Ok(ControlFlow::Continue(()));
        }

        while !self.send_window.is_full() {
            let Some(segment) = self.next_segment() else {
                break;
            };
            self.send_information(segment).await?;
            if self.mode == Mode::Receiving {
                return Ok(ControlFlow::Continue(()));
            }
        }

        match self.role {
            Role::Client => {
                if self.repoll || self.peer_segmenting {
                    if self.repoll {
                        self.stats.increment_repolls();
                        self.repoll = false;
                    }
                    self.send_receive_ready().await?;
                    Ok(ControlFlow::Continue(()))
                } else if self.awaiting_replies > 0 {
                    self.wait_for_reply().await
                } else {
                    self.idle().await
                }
            }
            Role::Server => {
                if !self.peer_segmenting {
                    // Give the application a moment to produce a response
                    tokio::select! {
                        write = self.writes.recv() => {
                            if let Some(payload) = write {
                                self.current = Some(payload);
                                return Ok(ControlFlow::Continue(()));
                            }
                        }
                        _ = sleep(self.settings.cosem_wait_time) => {}
                    }
                }
                self.send_receive_ready().await?;
                Ok(ControlFlow::Continue(()))
            }
        }
    }

    /// Client waits for the server to compute a reply, then polls again
    async fn wait_for_reply(&mut self) -> DlmsResult<ControlFlow<()>> {
        tokio::select! {
            command = self.commands.recv() => return Ok(self.on_command(command)),
            write = self.writes.recv() => {
                self.current = write;
                return Ok(ControlFlow::Continue(()));
            }
            _ = sleep(self.settings.cosem_wait_time) => {}
        }
        self.stats.increment_repolls();
        self.send_receive_ready().await?;
        Ok(ControlFlow::Continue(()))
    }

    /// Client with nothing to do: wait for a command or new data
    async fn idle(&mut self) -> DlmsResult<ControlFlow<()>> {
        tokio::select! {
            command = self.commands.recv() => Ok(self.on_command(command)),
            write = self.writes.recv() => {
                match write {
                    Some(payload) if self.state.is_connected() => self.current = Some(payload),
                    Some(payload) => {
                        log::warn!("{} dropping {} byte write, link {}", self.label, payload.len(), self.state);
                    }
                    None => {}
                }
                Ok(ControlFlow::Continue(()))
            }
            frame = self.frames.recv() => {
                self.on_frame(frame)?;
                // Unsolicited frames never hand the turn to us
                self.mode = Mode::Sending;
                Ok(ControlFlow::Continue(()))
            }
        }
    }

    async fn receive_turn(&mut self) -> DlmsResult<ControlFlow<()>> {
        loop {
            let deadline = match self.role {
                Role::Client => {
                    let mut deadline = Instant::now() + self.settings.response_timeout;
                    if let Some(pending) = &self.pending {
                        deadline = deadline.min(pending.deadline);
                    }
                    Some(deadline)
                }
                Role::Server => None,
            };

            tokio::select! {
                frame = self.frames.recv() => {
                    if self.on_frame(frame)? {
                        self.mode = Mode::Sending;
                        return Ok(ControlFlow::Continue(()));
                    }
                }
                command = self.commands.recv() => {
                    if self.on_command(command).is_break() {
                        return Ok(ControlFlow::Break(()));
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_response_timeout();
                    self.mode = Mode::Sending;
                    return Ok(ControlFlow::Continue(()));
                }
            }
        }
    }

    fn on_response_timeout(&mut self) {
        self.stats.increment_timeouts();
        let now = Instant::now();
        match &mut self.pending {
            Some(pending) if now >= pending.deadline => {
                log::warn!("{} {:?} timed out", self.label, pending.kind);
                self.complete_pending(Err(DlmsError::Timeout));
                self.set_state(LinkState::Disconnected);
                self.reset_link();
            }
            Some(pending) => {
                log::debug!("{} no answer to {:?}, repeating", self.label, pending.kind);
                pending.sent = false;
                self.stats.increment_repolls();
            }
            None => {
                log::debug!("{} response timeout", self.label);
                self.repoll = true;
            }
        }
    }

    /// Handle one item from the frame reader; returns whether the frame
    /// carried the poll/final bit
    fn on_frame(&mut self, frame: Option<DlmsResult<HdlcFrame>>) -> DlmsResult<bool> {
        match frame {
            Some(Ok(frame)) => Ok(self.handle_frame(frame)),
            Some(Err(e)) => Err(e),
            None => Err(DlmsError::eof("frame reader stopped")),
        }
    }

    fn handle_frame(&mut self, frame: HdlcFrame) -> bool {
        self.stats.increment_frames_received();
        if frame.client != self.client || !frame.server.reaches(&self.server) {
            self.stats.increment_address_errors();
            log::debug!("{} ignoring frame for another station: {}", self.label, frame);
            return false;
        }
        log::trace!(target: "dlms_session::hdlc", "{} << {}", self.label, frame);

        let poll = frame.control.poll();
        match frame.control {
            Control::Information { ns, nr, .. } => {
                if !self.state.is_connected() {
                    log::debug!("{} I-frame while {}", self.label, self.state);
                    return poll;
                }
                self.send_window.acknowledge(nr);
                if self.receive_window.accept(ns) {
                    self.peer_segmenting = frame.segmented;
                    if !frame.segmented {
                        self.awaiting_replies = self.awaiting_replies.saturating_sub(1);
                    }
                    let _ = self.reads.send(Segment {
                        data: frame.info,
                        last: !frame.segmented,
                    });
                } else {
                    self.stats.increment_sequence_errors();
                    log::debug!(
                        "{} out of sequence I-frame ns={} expected {}",
                        self.label,
                        ns,
                        self.receive_window.expected_sequence()
                    );
                }
            }
            Control::ReceiveReady { nr, .. } | Control::ReceiveNotReady { nr, .. } => {
                if self.state.is_connected() {
                    self.send_window.acknowledge(nr);
                }
            }
            Control::SetNormalResponseMode { .. } => self.on_snrm(&frame.info),
            Control::Disconnect { .. } => {
                if self.state.is_connected() {
                    self.set_state(LinkState::Disconnected);
                    self.reset_link();
                    self.queue_reply(Control::UnnumberedAcknowledge { poll: true }, Vec::new());
                } else {
                    self.queue_reply(Control::DisconnectMode { poll: true }, Vec::new());
                }
            }
            Control::UnnumberedAcknowledge { .. } => self.on_ua(&frame.info),
            Control::DisconnectMode { .. } => match self.state {
                LinkState::Disconnecting => {
                    self.set_state(LinkState::Disconnected);
                    self.reset_link();
                    self.complete_pending(Ok(()));
                }
                LinkState::Connecting => {
                    self.set_state(LinkState::Disconnected);
                    self.complete_pending(Err(DlmsError::Protocol("connection refused by peer".to_string())));
                }
                LinkState::Connected => {
                    log::warn!("{} peer reports disconnected mode", self.label);
                    self.set_state(LinkState::Disconnected);
                    self.reset_link();
                }
                LinkState::Disconnected => {}
            },
            Control::FrameReject { .. } => {
                log::warn!("{} frame rejected by peer: {:02X?}", self.label, frame.info);
            }
            Control::UnnumberedInformation { .. } => {
                log::debug!("{} ignoring UI frame", self.label);
            }
        }
        poll
    }

    fn queue_reply(&mut self, control: Control, info: Vec<u8>) {
        self.replies.push_back(HdlcFrame {
            direction: self.outbound(),
            segmented: false,
            server: self.server,
            client: self.client,
            control,
            info,
        });
    }

    fn on_snrm(&mut self, info: &[u8]) {
        if self.role != Role::Server {
            log::warn!("{} ignoring SNRM on client side", self.label);
            return;
        }
        if self.state != LinkState::Disconnected {
            log::warn!("{} SNRM while {}, refusing", self.label, self.state);
            self.queue_reply(Control::DisconnectMode { poll: true }, Vec::new());
            return;
        }
        let proposal = match LinkParameters::decode(info, &LinkParameters::default()) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("{} bad SNRM parameters: {}", self.label, e);
                self.queue_reply(Control::DisconnectMode { poll: true }, Vec::new());
                return;
            }
        };
        let negotiated = self.own_params.negotiate(&proposal);
        self.adopt_parameters(negotiated);
        self.set_state(LinkState::Connected);
        self.queue_reply(Control::UnnumberedAcknowledge { poll: true }, negotiated.encode());
    }

    fn on_ua(&mut self, info: &[u8]) {
        match self.state {
            LinkState::Connecting => {
                let answer = match LinkParameters::decode(info, &LinkParameters::default()) {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("{} bad UA parameters: {}", self.label, e);
                        return;
                    }
                };
                let negotiated = self.own_params.negotiate(&answer);
                self.adopt_parameters(negotiated);
                self.set_state(LinkState::Connected);
                self.complete_pending(Ok(()));
            }
            LinkState::Disconnecting => {
                self.set_state(LinkState::Disconnected);
                self.reset_link();
                self.complete_pending(Ok(()));
            }
            _ => log::debug!("{} unexpected UA while {}", self.label, self.state),
        }
    }
}

/// Handle to a running HDLC link
pub struct HdlcLink {
    label: String,
    commands: mpsc::UnboundedSender<Command>,
    writer: HdlcWriter,
    reader: Option<HdlcReader>,
    state: watch::Receiver<LinkState>,
    params: watch::Receiver<LinkParameters>,
    fatal: watch::Receiver<Option<LinkFailure>>,
    stats: Arc<HdlcStatistics>,
    task: JoinHandle<()>,
}

impl HdlcLink {
    /// Start a link on the client side; call [`HdlcLink::connect`] to send SNRM
    pub fn client(
        reader: Box<dyn StreamReader>,
        writer: Box<dyn StreamWriter>,
        client: u8,
        server: ServerAddress,
        settings: HdlcSettings,
    ) -> DlmsResult<Self> {
        Self::start(Role::Client, reader, writer, client, server, settings)
    }

    /// Start a link on the server side; it waits for the peer's SNRM
    pub fn server(
        reader: Box<dyn StreamReader>,
        writer: Box<dyn StreamWriter>,
        client: u8,
        server: ServerAddress,
        settings: HdlcSettings,
    ) -> DlmsResult<Self> {
        Self::start(Role::Server, reader, writer, client, server, settings)
    }

    fn start(
        role: Role,
        reader: Box<dyn StreamReader>,
        writer: Box<dyn StreamWriter>,
        client: u8,
        server: ServerAddress,
        settings: HdlcSettings,
    ) -> DlmsResult<Self> {
        settings.validate()?;
        let label = format!("hdlc[c={:#04X} s={}]", client, server);
        let stats = Arc::new(HdlcStatistics::new());

        let direction = match role {
            Role::Client => Direction::ClientInbound,
            Role::Server => Direction::ServerInbound,
        };
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let reader_task = FrameReader::new(
            reader,
            direction,
            settings.server_address_length,
            stats.clone(),
            label.clone(),
        )
        .spawn(frames_tx);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (writes_tx, writes_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let (reads_tx, reads_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let own_params = settings.link_parameters();
        let (params_tx, params_rx) = watch::channel(own_params);
        let (fatal_tx, fatal_rx) = watch::channel(None);

        let task = LinkTask {
            label: label.clone(),
            role,
            own_params,
            params: own_params,
            client,
            server,
            writer,
            frames: frames_rx,
            reader_task,
            commands: commands_rx,
            writes: writes_rx,
            reads: reads_tx,
            state_tx,
            params_tx,
            fatal_tx,
            stats: stats.clone(),
            state: LinkState::Disconnected,
            mode: match role {
                Role::Client => Mode::Sending,
                Role::Server => Mode::Receiving,
            },
            send_window: SendWindow::new(settings.modulus, own_params.window_size_transmit),
            receive_window: ReceiveWindow::new(settings.modulus),
            current: None,
            replies: VecDeque::new(),
            pending: None,
            peer_segmenting: false,
            awaiting_replies: 0,
            repoll: false,
            settings,
        };
        let task = tokio::spawn(task.run());

        Ok(Self {
            label,
            commands: commands_tx,
            writer: HdlcWriter {
                writes: writes_tx,
                state: state_rx.clone(),
                fatal: fatal_rx.clone(),
            },
            reader: Some(HdlcReader {
                reads: reads_rx,
                fatal: fatal_rx.clone(),
            }),
            state: state_rx,
            params: params_rx,
            fatal: fatal_rx,
            stats,
            task,
        })
    }

    async fn command(&self, make: impl FnOnce(oneshot::Sender<DlmsResult<()>>) -> Command) -> DlmsResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| link_gone(&self.fatal))?;
        rx.await.map_err(|_| link_gone(&self.fatal))?
    }

    /// Send SNRM and wait for the UA
    pub async fn connect(&self) -> DlmsResult<()> {
        self.command(Command::Connect).await
    }

    /// Send DISC and wait for UA or DM
    pub async fn disconnect(&self) -> DlmsResult<()> {
        self.command(Command::Disconnect).await
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Parameters in force, seen from this side
    pub fn parameters(&self) -> LinkParameters {
        *self.params.borrow()
    }

    pub fn statistics(&self) -> HdlcStatisticsSnapshot {
        self.stats.snapshot()
    }

    /// Wait until the link reaches `state`
    pub async fn wait_for_state(&self, state: LinkState) -> DlmsResult<()> {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == state)
            .await
            .map(|_| ())
            .map_err(|_| link_gone(&self.fatal))
    }

    /// Error that stopped the link, if it stopped on a stream failure
    pub fn failure(&self) -> Option<DlmsError> {
        self.fatal.borrow().as_ref().map(LinkFailure::to_error)
    }

    pub fn writer(&self) -> HdlcWriter {
        self.writer.clone()
    }

    /// The read side can be taken once
    pub fn take_reader(&mut self) -> Option<HdlcReader> {
        self.reader.take()
    }

    /// Stop the link task and close the stream
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            log::warn!("{} link task ended abnormally: {}", self.label, e);
        }
    }
}

/// Upper-layer write side of a link
#[derive(Clone)]
pub struct HdlcWriter {
    writes: mpsc::Sender<Bytes>,
    state: watch::Receiver<LinkState>,
    fatal: watch::Receiver<Option<LinkFailure>>,
}

impl HdlcWriter {
    /// Queue one payload; it is carved into segments of the negotiated size
    pub async fn write(&self, payload: &[u8]) -> DlmsResult<()> {
        if !self.state.borrow().is_connected() {
            return Err(DlmsError::WrongState(WrongState::NotConnected));
        }
        if payload.is_empty() {
            return Ok(());
        }
        self.writes
            .send(Bytes::copy_from_slice(payload))
            .await
            .map_err(|_| link_gone(&self.fatal))
    }
}

/// Upper-layer read side of a link
pub struct HdlcReader {
    reads: mpsc::UnboundedReceiver<Segment>,
    fatal: watch::Receiver<Option<LinkFailure>>,
}

impl HdlcReader {
    /// Read one payload, joining segments until the last one
    pub async fn read(&mut self) -> DlmsResult<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            match self.reads.recv().await {
                Some(segment) => {
                    payload.extend_from_slice(&segment.data);
                    if segment.last {
                        return Ok(payload);
                    }
                }
                None => return Err(link_gone(&self.fatal)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlms_transport::{IoReader, IoWriter};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    const CLIENT: u8 = 0x10;

    fn server_address() -> ServerAddress {
        ServerAddress::new(1, Some(0x11))
    }

    fn fast_settings() -> HdlcSettings {
        HdlcSettings {
            response_timeout: Duration::from_millis(200),
            snrm_timeout: Duration::from_millis(500),
            disc_timeout: Duration::from_millis(500),
            cosem_wait_time: Duration::from_millis(20),
            ..HdlcSettings::default()
        }
    }

    fn pair(client_settings: HdlcSettings, server_settings: HdlcSettings) -> (HdlcLink, HdlcLink) {
        let (a, b) = duplex(4096);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let client = HdlcLink::client(
            Box::new(IoReader(ar)),
            Box::new(IoWriter(aw)),
            CLIENT,
            server_address(),
            client_settings,
        )
        .unwrap();
        let server = HdlcLink::server(
            Box::new(IoReader(br)),
            Box::new(IoWriter(bw)),
            CLIENT,
            server_address(),
            server_settings,
        )
        .unwrap();
        (client, server)
    }

    #[test]
    fn test_settings_validation() {
        assert!(HdlcSettings::default().validate().is_ok());
        let bad = HdlcSettings {
            modulus: 128,
            ..HdlcSettings::default()
        };
        assert!(matches!(bad.validate(), Err(DlmsError::InvalidValue(_))));
        let bad = HdlcSettings {
            window_size_receive: 0,
            ..HdlcSettings::default()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn test_snrm_ua_negotiates_minima() {
        let server_settings = HdlcSettings {
            max_info_field_length_transmit: 64,
            window_size_receive: 3,
            ..fast_settings()
        };
        let (client, server) = pair(fast_settings(), server_settings);
        assert_eq!(client.state(), LinkState::Disconnected);

        client.connect().await.unwrap();
        assert_eq!(client.state(), LinkState::Connected);
        server.wait_for_state(LinkState::Connected).await.unwrap();

        let at_client = client.parameters();
        assert_eq!(at_client.max_info_field_length_transmit, 128);
        assert_eq!(at_client.max_info_field_length_receive, 64);
        assert_eq!(at_client.window_size_transmit, 3);
        assert_eq!(at_client.window_size_receive, 7);
        assert_eq!(server.parameters(), at_client.swapped());
    }

    #[tokio::test]
    async fn test_commands_in_wrong_state() {
        let (client, server) = pair(fast_settings(), fast_settings());
        assert!(matches!(
            client.disconnect().await,
            Err(DlmsError::WrongState(WrongState::NotConnected))
        ));
        assert!(matches!(
            server.connect().await,
            Err(DlmsError::WrongState(WrongState::NotAllowed))
        ));
        client.connect().await.unwrap();
        assert!(matches!(
            client.connect().await,
            Err(DlmsError::WrongState(WrongState::NotDisconnected))
        ));
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let (client, _server) = pair(fast_settings(), fast_settings());
        assert!(matches!(
            client.writer().write(&[1, 2, 3]).await,
            Err(DlmsError::WrongState(WrongState::NotConnected))
        ));
    }

    #[tokio::test]
    async fn test_segmented_request_and_response() {
        let small = HdlcSettings {
            max_info_field_length_transmit: 16,
            max_info_field_length_receive: 16,
            window_size_transmit: 2,
            window_size_receive: 2,
            ..fast_settings()
        };
        let (mut client, mut server) = pair(small.clone(), small);
        client.connect().await.unwrap();
        server.wait_for_state(LinkState::Connected).await.unwrap();

        let mut server_reader = server.take_reader().unwrap();
        let server_writer = server.writer();
        let mut client_reader = client.take_reader().unwrap();

        let request: Vec<u8> = (0..100u8).collect();
        client.writer().write(&request).await.unwrap();
        let received = timeout(Duration::from_secs(5), server_reader.read()).await.unwrap().unwrap();
        assert_eq!(received, request);

        let response: Vec<u8> = (0..=255u8).rev().collect();
        server_writer.write(&response).await.unwrap();
        let received = timeout(Duration::from_secs(5), client_reader.read()).await.unwrap().unwrap();
        assert_eq!(received, response);

        let stats = client.statistics();
        assert!(stats.frames_sent >= 7);
        assert_eq!(stats.frames_dropped(), 0);
    }

    #[tokio::test]
    async fn test_pipelined_payloads_all_answered() {
        let (mut client, mut server) = pair(fast_settings(), fast_settings());
        client.connect().await.unwrap();
        server.wait_for_state(LinkState::Connected).await.unwrap();

        let mut server_reader = server.take_reader().unwrap();
        let server_writer = server.writer();
        let mut client_reader = client.take_reader().unwrap();

        let writer = client.writer();
        writer.write(&[0xAA; 4]).await.unwrap();
        writer.write(&[0xBB; 4]).await.unwrap();

        let first = timeout(Duration::from_secs(5), server_reader.read()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(5), server_reader.read()).await.unwrap().unwrap();
        assert_eq!((first, second), (vec![0xAA; 4], vec![0xBB; 4]));

        // the client keeps polling while both replies are outstanding
        tokio::time::sleep(Duration::from_millis(100)).await;
        server_writer.write(&[0xA5; 4]).await.unwrap();
        server_writer.write(&[0xB5; 4]).await.unwrap();

        let first = timeout(Duration::from_secs(5), client_reader.read()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(5), client_reader.read()).await.unwrap().unwrap();
        assert_eq!((first, second), (vec![0xA5; 4], vec![0xB5; 4]));
    }

    /// Read one flag-delimited frame body from a raw peer stream
    async fn read_frame(peer: &mut tokio::io::DuplexStream) -> Vec<u8> {
        let mut buf = Vec::new();
        loop {
            if buf.len() >= 3 {
                let length = (u16::from_be_bytes([buf[1], buf[2]]) & 0x07FF) as usize;
                if buf.len() >= length + 2 {
                    return buf[1..=length].to_vec();
                }
            }
            let mut chunk = [0u8; 64];
            let n = timeout(Duration::from_secs(2), peer.read(&mut chunk)).await.unwrap().unwrap();
            assert!(n > 0, "stream closed");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn test_client_answers_disc_in_client_address_order() {
        let (a, mut peer) = duplex(1024);
        let (ar, aw) = tokio::io::split(a);
        let server = ServerAddress::new(1, None);
        let client = HdlcLink::client(
            Box::new(IoReader(ar)),
            Box::new(IoWriter(aw)),
            CLIENT,
            server,
            HdlcSettings {
                server_address_length: ServerAddressLength::One,
                ..fast_settings()
            },
        )
        .unwrap();
        let to_client = |control: Control| {
            HdlcFrame {
                direction: Direction::ServerOutbound,
                segmented: false,
                server,
                client: CLIENT,
                control,
                info: Vec::new(),
            }
            .encode(ServerAddressLength::One)
            .unwrap()
        };

        let ua = to_client(Control::UnnumberedAcknowledge { poll: true });
        let meter = tokio::spawn(async move {
            let snrm = read_frame(&mut peer).await;
            let snrm = HdlcFrame::decode(&snrm, Direction::ServerInbound, ServerAddressLength::One).unwrap();
            assert_eq!(snrm.control, Control::SetNormalResponseMode { poll: true });
            peer.write_all(&ua).await.unwrap();
            peer
        });
        client.connect().await.unwrap();
        let mut peer = meter.await.unwrap();

        peer.write_all(&to_client(Control::Disconnect { poll: true })).await.unwrap();
        let ua = read_frame(&mut peer).await;
        let ua = HdlcFrame::decode(&ua, Direction::ServerInbound, ServerAddressLength::One).unwrap();
        assert_eq!(ua.control, Control::UnnumberedAcknowledge { poll: true });
        assert_eq!(ua.client, CLIENT);
        assert_eq!(ua.server, server);
        client.wait_for_state(LinkState::Disconnected).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect() {
        let (client, server) = pair(fast_settings(), fast_settings());
        client.connect().await.unwrap();
        client.disconnect().await.unwrap();
        assert_eq!(client.state(), LinkState::Disconnected);
        server.wait_for_state(LinkState::Disconnected).await.unwrap();
        // the link can be brought up again
        client.connect().await.unwrap();
        server.wait_for_state(LinkState::Connected).await.unwrap();
    }

    #[tokio::test]
    async fn test_dm_refuses_connection() {
        let (a, mut peer) = duplex(1024);
        let (ar, aw) = tokio::io::split(a);
        let client = HdlcLink::client(
            Box::new(IoReader(ar)),
            Box::new(IoWriter(aw)),
            CLIENT,
            ServerAddress::new(1, None),
            HdlcSettings {
                server_address_length: ServerAddressLength::One,
                ..fast_settings()
            },
        )
        .unwrap();

        let meter = tokio::spawn(async move {
            let mut snrm = [0u8; 32];
            let n = peer.read(&mut snrm).await.unwrap();
            assert_eq!(&snrm[..5], &[0x7E, 0xA0, 0x1E, 0x03, 0x21]);
            assert_eq!(snrm[5], 0x93);
            assert_eq!(snrm[n - 1], 0x7E);
            let dm = HdlcFrame {
                direction: Direction::ServerOutbound,
                segmented: false,
                server: ServerAddress::new(1, None),
                client: CLIENT,
                control: Control::DisconnectMode { poll: true },
                info: Vec::new(),
            }
            .encode(ServerAddressLength::One)
            .unwrap();
            peer.write_all(&dm).await.unwrap();
            peer
        });

        assert!(matches!(client.connect().await, Err(DlmsError::Protocol(_))));
        assert_eq!(client.state(), LinkState::Disconnected);
        let _peer = meter.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_times_out_without_answer() {
        let (a, _peer) = duplex(1024);
        let (ar, aw) = tokio::io::split(a);
        let client = HdlcLink::client(
            Box::new(IoReader(ar)),
            Box::new(IoWriter(aw)),
            CLIENT,
            server_address(),
            HdlcSettings {
                response_timeout: Duration::from_millis(50),
                snrm_timeout: Duration::from_millis(180),
                ..fast_settings()
            },
        )
        .unwrap();
        assert!(matches!(client.connect().await, Err(DlmsError::Timeout)));
        assert_eq!(client.state(), LinkState::Disconnected);
        assert!(client.statistics().repolls >= 2);
    }

    #[tokio::test]
    async fn test_stream_failure_is_fatal() {
        let (mut client, server) = pair(fast_settings(), fast_settings());
        client.connect().await.unwrap();
        let mut reader = client.take_reader().unwrap();
        server.shutdown().await;
        let err = timeout(Duration::from_secs(5), reader.read()).await.unwrap().unwrap_err();
        assert!(err.is_fatal());
        assert!(client.failure().is_some());
    }
}
