//! Request manager
//!
//! Multiplexes GET/SET/ACTION requests over one PDU channel. Each submission
//! takes an invoke id from the pool and becomes a request in progress (RIP)
//! owned by the manager task, which is the only place the RIP map is touched.
//!
//! The manager task serves:
//! - new submissions: the RIP is entered into the map before its PDU is queued
//! - PDUs forwarded by the receive loop, dispatched by invoke id and tag
//! - a watchdog tick checking the overall and block deadlines of every RIP
//! - close, which ends every RIP with "app connection closed"
//! - send failures reported back by the writer task
//!
//! PDUs go out through a separate writer task, so a stalled transport never
//! holds up the watchdog.
//!
//! Ending a RIP removes it from the map, returns its invoke id and delivers
//! the results through the submitter's oneshot channel. A RIP is owned by
//! exactly one place at a time, so it can only end once.

use crate::error::{DlmsError, DlmsResult};
use crate::invocation::{InvocationPool, InvokeId};
use crate::pdu::{tag, GetDataResult, InvokeIdAndPriority, PduHeader};
use crate::request::{
    AttributeResults, DlmsMethodRequest, DlmsMethodResponse, DlmsRequest, DlmsResponse, MethodResults,
    RequestOptions, RequestResponse, ResultResponse, TerminationReason,
};
use crate::service::action::{ActionOutcome, ActionRequest, ActionResponse};
use crate::service::get::{self, BlockResult, GetRequest, GetResponse};
use crate::service::set::{encode_value_list, DataBlockSA, SetRequest, SetResponse};
use dlms_asn1::{encode_data, AxdrEncoder};
use dlms_core::datatypes::data_access_result;
use dlms_session::{PduReceiver, PduSender};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Application connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Cadence of the deadline checks
    pub watchdog_period: Duration,
    /// Options used by the request methods that do not take their own
    pub request: RequestOptions,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            watchdog_period: Duration::from_millis(100),
            request: RequestOptions::default(),
        }
    }
}

struct GetRip {
    items: Vec<RequestResponse<DlmsRequest, DlmsResponse>>,
    /// Raw blocks received so far
    raw: Vec<u8>,
    last_block: u32,
    reply: oneshot::Sender<AttributeResults>,
}

struct SetRip {
    items: Vec<RequestResponse<DlmsRequest, DlmsResponse>>,
    /// Raw bytes not sent yet
    pending: Vec<u8>,
    block_size: usize,
    block_number: u32,
    reply: oneshot::Sender<AttributeResults>,
}

struct ActionRip {
    items: Vec<RequestResponse<DlmsMethodRequest, DlmsMethodResponse>>,
    reply: oneshot::Sender<MethodResults>,
}

enum RipKind {
    Get(GetRip),
    Set(SetRip),
    Action(ActionRip),
}

/// Request in progress
struct Rip {
    invoke_id: InvokeId,
    invoke: InvokeIdAndPriority,
    deadline: Option<Instant>,
    block_timeout: Option<Duration>,
    block_deadline: Option<Instant>,
    /// Tells a send failure of this RIP from one of an earlier RIP with the same id
    serial: u64,
    kind: RipKind,
}

fn non_zero(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

impl Rip {
    fn new(invoke_id: InvokeId, invoke: InvokeIdAndPriority, options: &RequestOptions, now: Instant, kind: RipKind) -> Self {
        Self {
            invoke_id,
            invoke,
            deadline: non_zero(options.timeout).map(|t| now + t),
            block_timeout: non_zero(options.block_timeout),
            block_deadline: None,
            serial: 0,
            kind,
        }
    }

    fn id(&self) -> u8 {
        self.invoke_id.value()
    }

    fn touch_block_deadline(&mut self) {
        self.block_deadline = self.block_timeout.map(|t| Instant::now() + t);
    }

    /// The deadline that ran out first, if any
    fn expired(&self, now: Instant) -> Option<TerminationReason> {
        let overall = self.deadline.filter(|d| *d <= now);
        let block = self.block_deadline.filter(|d| *d <= now);
        match (overall, block) {
            (Some(o), Some(b)) if b < o => Some(TerminationReason::BlockTimeout),
            (Some(_), _) => Some(TerminationReason::RequestTimeout),
            (None, Some(_)) => Some(TerminationReason::BlockTimeout),
            (None, None) => None,
        }
    }

    /// Hand whatever a timed out transfer received to the block assembly
    fn salvage_partial(&mut self) {
        if let RipKind::Get(get) = &mut self.kind {
            if get.raw.is_empty() {
                return;
            }
            if get.items.len() == 1 {
                if let Some(data) = get::decode_partial_value(&get.raw) {
                    get.items[0].response = Some(DlmsResponse {
                        data_access_result: data_access_result::SUCCESS,
                        data: Some(data),
                    });
                }
            } else {
                fill_get_results(&mut get.items, get::decode_partial_results(&get.raw));
            }
        }
    }

    fn terminate(self, reason: TerminationReason) {
        let Rip { invoke_id, kind, .. } = self;
        drop(invoke_id);
        let now = Instant::now();
        match kind {
            RipKind::Get(get) => deliver(get.items, get.reply, reason, now),
            RipKind::Set(set) => deliver(set.items, set.reply, reason, now),
            RipKind::Action(action) => deliver(action.items, action.reply, reason, now),
        }
    }
}

fn deliver<Q, R>(
    mut items: Vec<RequestResponse<Q, R>>,
    reply: oneshot::Sender<ResultResponse<Q, R>>,
    reason: TerminationReason,
    now: Instant,
) {
    for item in &mut items {
        item.delivered_at = Some(now);
    }
    if reply.send(ResultResponse { items, reason }).is_err() {
        log::debug!("requester went away before delivery");
    }
}

fn get_response(result: GetDataResult) -> DlmsResponse {
    match result {
        GetDataResult::Data(data) => DlmsResponse {
            data_access_result: data_access_result::SUCCESS,
            data: Some(data),
        },
        GetDataResult::DataAccessResult(dar) => DlmsResponse {
            data_access_result: dar,
            data: None,
        },
    }
}

fn method_response(outcome: ActionOutcome) -> DlmsMethodResponse {
    let (data_access_result, data) = match outcome.return_parameters {
        None => (None, None),
        Some(GetDataResult::Data(data)) => (Some(data_access_result::SUCCESS), Some(data)),
        Some(GetDataResult::DataAccessResult(dar)) => (Some(dar), None),
    };
    DlmsMethodResponse {
        action_result: outcome.result,
        data_access_result,
        data,
    }
}

fn count_mismatch() -> DlmsError {
    DlmsError::Protocol("unexpected count of received list entries".to_string())
}

/// Fill responses pairwise; extra results are ignored
fn fill_get_results(items: &mut [RequestResponse<DlmsRequest, DlmsResponse>], results: Vec<GetDataResult>) {
    for (item, result) in items.iter_mut().zip(results) {
        item.response = Some(get_response(result));
    }
}

fn fill_set_results(items: &mut [RequestResponse<DlmsRequest, DlmsResponse>], results: &[u8]) {
    for (item, dar) in items.iter_mut().zip(results) {
        item.response = Some(DlmsResponse {
            data_access_result: *dar,
            data: None,
        });
    }
}

/// Cut the next raw block off `pending`; the flag tells whether it is the last
fn next_chunk(pending: &mut Vec<u8>, block_size: usize) -> (Vec<u8>, bool) {
    let n = block_size.min(pending.len());
    let chunk = pending.drain(..n).collect();
    (chunk, pending.is_empty())
}

enum Step {
    Continue(Rip),
    Done(Rip, TerminationReason),
}

enum Command {
    Submit { rip: Rip, pdu: Vec<u8> },
    Close(oneshot::Sender<()>),
}

/// A PDU queued for the writer task
struct Outbound {
    id: u8,
    serial: u64,
    pdu: Vec<u8>,
}

struct SendFailure {
    id: u8,
    serial: u64,
    error: DlmsError,
}

struct ManagerTask {
    label: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    send_failures: mpsc::UnboundedReceiver<SendFailure>,
    writer: JoinHandle<()>,
    rips: HashMap<u8, Rip>,
    next_serial: u64,
    commands: mpsc::UnboundedReceiver<Command>,
    pdus: mpsc::UnboundedReceiver<DlmsResult<Vec<u8>>>,
    watchdog_period: Duration,
    broken: bool,
}

impl ManagerTask {
    async fn run(mut self) {
        let mut watchdog = tokio::time::interval(self.watchdog_period);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Submit { rip, pdu }) => self.submit(rip, pdu),
                    Some(Command::Close(ack)) => {
                        self.terminate_all(|| TerminationReason::ConnectionClosed);
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.terminate_all(|| TerminationReason::ConnectionClosed);
                        break;
                    }
                },
                pdu = self.pdus.recv(), if !self.broken => match pdu {
                    Some(Ok(pdu)) => self.on_pdu(pdu),
                    Some(Err(e)) => {
                        log::error!("{}: transport failed: {}", self.label, e);
                        self.on_transport_gone();
                    }
                    None => self.on_transport_gone(),
                },
                failure = self.send_failures.recv(), if !self.broken => match failure {
                    Some(failure) => self.on_send_failure(failure),
                    None => self.on_transport_gone(),
                },
                _ = watchdog.tick() => self.on_watchdog(),
            }
        }
        self.writer.abort();
        log::debug!("{}: request manager stopped", self.label);
    }

    /// Queue a PDU of `rip` for the writer task
    fn send(&self, rip: &Rip, pdu: Vec<u8>) -> DlmsResult<()> {
        self.outbound
            .send(Outbound {
                id: rip.id(),
                serial: rip.serial,
                pdu,
            })
            .map_err(|_| DlmsError::ConnectionClosed)
    }

    fn on_send_failure(&mut self, failure: SendFailure) {
        let SendFailure { id, serial, error } = failure;
        match self.rips.remove(&id) {
            Some(rip) if rip.serial == serial => {
                log::error!("{}: sending request {} failed: {}", self.label, id, error);
                rip.terminate(TerminationReason::Failed(error));
            }
            Some(rip) => {
                self.rips.insert(id, rip);
            }
            None => log::debug!("{}: send failure of ended request {}: {}", self.label, id, error),
        }
    }

    fn on_transport_gone(&mut self) {
        self.broken = true;
        self.terminate_all(|| TerminationReason::Failed(DlmsError::ConnectionClosed));
    }

    fn terminate_all(&mut self, reason: impl Fn() -> TerminationReason) {
        for (_, rip) in self.rips.drain() {
            rip.terminate(reason());
        }
    }

    fn submit(&mut self, mut rip: Rip, pdu: Vec<u8>) {
        let id = rip.id();
        if self.broken {
            rip.terminate(TerminationReason::Failed(DlmsError::ConnectionClosed));
            return;
        }
        if self.rips.contains_key(&id) {
            log::error!("{}: invoke id {} already in progress", self.label, id);
            rip.terminate(TerminationReason::Failed(DlmsError::Protocol(format!(
                "invoke id {} already in progress",
                id
            ))));
            return;
        }
        log::debug!("{}: request {} submitted", self.label, id);
        rip.serial = self.next_serial;
        self.next_serial += 1;
        if let Err(e) = self.send(&rip, pdu) {
            rip.terminate(TerminationReason::Failed(e));
            return;
        }
        self.rips.insert(id, rip);
    }

    fn on_pdu(&mut self, pdu: Vec<u8>) {
        let header = match PduHeader::peek(&pdu) {
            Ok(header) => header,
            Err(e) => {
                log::warn!("{}: PDU dropped: {}", self.label, e);
                return;
            }
        };
        let id = header.invoke.invoke_id();
        let Some(rip) = self.rips.remove(&id) else {
            log::debug!("{}: no request in progress for invoke id {}, reply dropped", self.label, id);
            return;
        };
        let expected = match &rip.kind {
            RipKind::Get(_) => tag::GET_RESPONSE,
            RipKind::Set(_) => tag::SET_RESPONSE,
            RipKind::Action(_) => tag::ACTION_RESPONSE,
        };
        let step = if header.tag != expected {
            log::error!(
                "{}: unexpected PDU {:02X} {:02X} for request {}, dropped",
                self.label,
                header.tag,
                header.choice,
                id
            );
            Step::Continue(rip)
        } else {
            match expected {
                tag::GET_RESPONSE => self.on_get_response(rip, &pdu),
                tag::SET_RESPONSE => self.on_set_response(rip, &pdu),
                _ => on_action_response(rip, &pdu),
            }
        };
        match step {
            Step::Continue(rip) => {
                self.rips.insert(id, rip);
            }
            Step::Done(rip, reason) => {
                if !reason.is_completed() {
                    log::warn!("{}: request {} failed: {}", self.label, id, reason);
                }
                rip.terminate(reason);
            }
        }
    }

    fn on_get_response(&self, mut rip: Rip, pdu: &[u8]) -> Step {
        let response = match GetResponse::decode(pdu) {
            Ok(response) => response,
            Err(e) => {
                log::error!("{}: bad get response dropped: {}", self.label, e);
                return Step::Continue(rip);
            }
        };
        let invoke = rip.invoke;
        let id = rip.id();
        let RipKind::Get(get) = &mut rip.kind else {
            return Step::Continue(rip);
        };
        match response {
            GetResponse::Normal { result, .. } => {
                get.items[0].response = Some(get_response(result));
                if get.items.len() == 1 {
                    Step::Done(rip, TerminationReason::Completed)
                } else {
                    Step::Done(rip, TerminationReason::Failed(count_mismatch()))
                }
            }
            GetResponse::WithList { results, .. } => {
                let received = results.len();
                fill_get_results(&mut get.items, results);
                if received == get.items.len() {
                    Step::Done(rip, TerminationReason::Completed)
                } else {
                    Step::Done(rip, TerminationReason::Failed(count_mismatch()))
                }
            }
            GetResponse::WithDataBlock { block, .. } => {
                if block.block_number != get.last_block.wrapping_add(1) {
                    let e = DlmsError::Protocol(format!(
                        "data block {} received, expected {}",
                        block.block_number,
                        get.last_block.wrapping_add(1)
                    ));
                    return Step::Done(rip, TerminationReason::Failed(e));
                }
                let raw = match block.result {
                    BlockResult::RawData(raw) => raw,
                    BlockResult::DataAccessResult(dar) => {
                        for item in &mut get.items {
                            item.response = Some(DlmsResponse {
                                data_access_result: dar,
                                data: None,
                            });
                        }
                        let e = DlmsError::Protocol(format!("data block transfer aborted, data access result {}", dar));
                        return Step::Done(rip, TerminationReason::Failed(e));
                    }
                };
                get.raw.extend_from_slice(&raw);
                get.last_block = block.block_number;

                if block.last_block {
                    log::debug!(
                        "{}: request {} reassembled {} bytes from {} blocks",
                        self.label,
                        id,
                        get.raw.len(),
                        block.block_number
                    );
                    let reason = assemble_blocks(get);
                    return Step::Done(rip, reason);
                }

                let next = GetRequest::Next {
                    invoke,
                    block_number: block.block_number,
                };
                let sent = next.encode().and_then(|bytes| self.send(&rip, bytes));
                match sent {
                    Ok(()) => {
                        rip.touch_block_deadline();
                        Step::Continue(rip)
                    }
                    Err(e) => Step::Done(rip, TerminationReason::Failed(e)),
                }
            }
        }
    }

    fn on_set_response(&self, mut rip: Rip, pdu: &[u8]) -> Step {
        let response = match SetResponse::decode(pdu) {
            Ok(response) => response,
            Err(e) => {
                log::error!("{}: bad set response dropped: {}", self.label, e);
                return Step::Continue(rip);
            }
        };
        let invoke = rip.invoke;
        let RipKind::Set(set) = &mut rip.kind else {
            return Step::Continue(rip);
        };
        let expected = set.block_number;
        match response {
            SetResponse::Normal { result, .. } => {
                fill_set_results(&mut set.items, &[result]);
                if set.items.len() == 1 {
                    Step::Done(rip, TerminationReason::Completed)
                } else {
                    Step::Done(rip, TerminationReason::Failed(count_mismatch()))
                }
            }
            SetResponse::WithList { results, .. } => {
                fill_set_results(&mut set.items, &results);
                if results.len() == set.items.len() {
                    Step::Done(rip, TerminationReason::Completed)
                } else {
                    Step::Done(rip, TerminationReason::Failed(count_mismatch()))
                }
            }
            SetResponse::DataBlock { block_number, .. } => {
                if block_number != expected {
                    return Step::Done(rip, TerminationReason::Failed(block_mismatch(block_number, expected)));
                }
                if set.pending.is_empty() {
                    let e = DlmsError::Protocol(format!("block {} acknowledged after the last block", block_number));
                    return Step::Done(rip, TerminationReason::Failed(e));
                }
                let (raw, last_block) = next_chunk(&mut set.pending, set.block_size);
                set.block_number += 1;
                let request = SetRequest::WithDataBlock {
                    invoke,
                    block: DataBlockSA {
                        last_block,
                        block_number: set.block_number,
                        raw,
                    },
                };
                let sent = request.encode().and_then(|bytes| self.send(&rip, bytes));
                match sent {
                    Ok(()) => {
                        rip.touch_block_deadline();
                        Step::Continue(rip)
                    }
                    Err(e) => Step::Done(rip, TerminationReason::Failed(e)),
                }
            }
            SetResponse::LastDataBlock { result, block_number, .. } => {
                fill_set_results(&mut set.items, &[result]);
                if block_number != expected {
                    Step::Done(rip, TerminationReason::Failed(block_mismatch(block_number, expected)))
                } else if set.items.len() != 1 {
                    Step::Done(rip, TerminationReason::Failed(count_mismatch()))
                } else {
                    Step::Done(rip, TerminationReason::Completed)
                }
            }
            SetResponse::LastDataBlockWithList { results, block_number, .. } => {
                fill_set_results(&mut set.items, &results);
                if block_number != expected {
                    Step::Done(rip, TerminationReason::Failed(block_mismatch(block_number, expected)))
                } else if results.len() != set.items.len() {
                    Step::Done(rip, TerminationReason::Failed(count_mismatch()))
                } else {
                    Step::Done(rip, TerminationReason::Completed)
                }
            }
        }
    }

    fn on_watchdog(&mut self) {
        let now = Instant::now();
        let expired: Vec<(u8, TerminationReason)> = self
            .rips
            .iter()
            .filter_map(|(id, rip)| rip.expired(now).map(|reason| (*id, reason)))
            .collect();
        for (id, reason) in expired {
            if let Some(mut rip) = self.rips.remove(&id) {
                log::warn!("{}: request {} ended: {}", self.label, id, reason);
                rip.salvage_partial();
                rip.terminate(reason);
            }
        }
    }
}

fn block_mismatch(received: u32, expected: u32) -> DlmsError {
    DlmsError::Protocol(format!("block number {} acknowledged, expected {}", received, expected))
}

/// Decode a complete block transfer as the response it stands for
fn assemble_blocks(get: &mut GetRip) -> TerminationReason {
    if get.items.len() == 1 {
        match get::decode_block_value(&get.raw) {
            Ok(data) => {
                get.items[0].response = Some(DlmsResponse {
                    data_access_result: data_access_result::SUCCESS,
                    data: Some(data),
                });
                TerminationReason::Completed
            }
            Err(e) => TerminationReason::Failed(e),
        }
    } else {
        match get::decode_block_results(&get.raw) {
            Ok(results) => {
                let received = results.len();
                fill_get_results(&mut get.items, results);
                if received == get.items.len() {
                    TerminationReason::Completed
                } else {
                    TerminationReason::Failed(count_mismatch())
                }
            }
            Err(e) => TerminationReason::Failed(e),
        }
    }
}

fn on_action_response(mut rip: Rip, pdu: &[u8]) -> Step {
    let response = match ActionResponse::decode(pdu) {
        Ok(response) => response,
        Err(e) => {
            log::error!("bad action response dropped: {}", e);
            return Step::Continue(rip);
        }
    };
    let RipKind::Action(action) = &mut rip.kind else {
        return Step::Continue(rip);
    };
    let outcomes = match response {
        ActionResponse::Normal { outcome, .. } => vec![outcome],
        ActionResponse::WithList { outcomes, .. } => outcomes,
    };
    let received = outcomes.len();
    for (item, outcome) in action.items.iter_mut().zip(outcomes) {
        item.response = Some(method_response(outcome));
    }
    if received == action.items.len() {
        Step::Done(rip, TerminationReason::Completed)
    } else {
        Step::Done(rip, TerminationReason::Failed(count_mismatch()))
    }
}

async fn write_loop<S: PduSender>(
    label: String,
    sender: S,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    failures: mpsc::UnboundedSender<SendFailure>,
) {
    while let Some(Outbound { id, serial, pdu }) = outbound.recv().await {
        log::trace!("{}: >> {:02X?}", label, pdu);
        if let Err(error) = sender.send_pdu(&pdu).await {
            if failures.send(SendFailure { id, serial, error }).is_err() {
                break;
            }
        }
    }
}

async fn receive_loop<R: PduReceiver>(label: String, mut receiver: R, pdus: mpsc::UnboundedSender<DlmsResult<Vec<u8>>>) {
    loop {
        match receiver.receive_pdu().await {
            Ok(pdu) => {
                log::trace!("{}: << {:02X?}", label, pdu);
                if pdus.send(Ok(pdu)).is_err() {
                    break;
                }
            }
            Err(e) if e.is_fatal() => {
                let _ = pdus.send(Err(e));
                break;
            }
            Err(e) => log::warn!("{}: PDU dropped: {}", label, e),
        }
    }
}

/// Handle to the request manager of one application connection
pub struct RequestManager {
    label: String,
    pool: Arc<InvocationPool>,
    commands: mpsc::UnboundedSender<Command>,
    receive_task: JoinHandle<()>,
    settings: AppSettings,
    closed: AtomicBool,
}

impl RequestManager {
    /// Start the manager and receive tasks over an established PDU channel
    pub fn start<S, R>(label: impl Into<String>, sender: S, receiver: R, settings: AppSettings) -> Self
    where
        S: PduSender + 'static,
        R: PduReceiver + 'static,
    {
        let label = label.into();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (pdu_tx, pdu_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let receive_task = tokio::spawn(receive_loop(label.clone(), receiver, pdu_tx));
        let writer = tokio::spawn(write_loop(label.clone(), sender, outbound_rx, failure_tx));
        let task = ManagerTask {
            label: label.clone(),
            outbound: outbound_tx,
            send_failures: failure_rx,
            writer,
            rips: HashMap::new(),
            next_serial: 0,
            commands: command_rx,
            pdus: pdu_rx,
            watchdog_period: settings.watchdog_period,
            broken: false,
        };
        tokio::spawn(task.run());
        Self {
            label,
            pool: InvocationPool::new(),
            commands: command_tx,
            receive_task,
            settings,
            closed: AtomicBool::new(false),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn invocation_pool(&self) -> &Arc<InvocationPool> {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.commands.is_closed()
    }

    /// Read attributes: GetRequestNormal for one, GetRequestWithList for more
    pub async fn get(&self, requests: Vec<DlmsRequest>, options: &RequestOptions) -> DlmsResult<AttributeResults> {
        check_not_empty(requests.len())?;
        let invoke_id = self.pool.acquire(options.allocation_timeout).await?;
        let invoke = InvokeIdAndPriority::new(invoke_id.value(), options.high_priority)?;
        let request = if requests.len() == 1 {
            GetRequest::Normal {
                invoke,
                item: requests[0].attribute_access(),
            }
        } else {
            GetRequest::WithList {
                invoke,
                items: requests.iter().map(DlmsRequest::attribute_access).collect(),
            }
        };
        let pdu = request.encode()?;

        let (reply, delivery) = oneshot::channel();
        let now = Instant::now();
        let kind = RipKind::Get(GetRip {
            items: requests.into_iter().map(|r| RequestResponse::new(r, now)).collect(),
            raw: Vec::new(),
            last_block: 0,
            reply,
        });
        self.submit(Rip::new(invoke_id, invoke, options, now, kind), pdu, delivery)
            .await
    }

    /// Write attributes, in raw blocks when `options.set_block_size` is set
    pub async fn set(&self, requests: Vec<DlmsRequest>, options: &RequestOptions) -> DlmsResult<AttributeResults> {
        check_not_empty(requests.len())?;
        let values = requests
            .iter()
            .map(|r| {
                r.data.clone().ok_or_else(|| {
                    DlmsError::InvalidValue(format!(
                        "no value to set for class {} {} attribute {}",
                        r.class_id, r.instance_id, r.attribute_id
                    ))
                })
            })
            .collect::<DlmsResult<Vec<_>>>()?;

        let invoke_id = self.pool.acquire(options.allocation_timeout).await?;
        let invoke = InvokeIdAndPriority::new(invoke_id.value(), options.high_priority)?;
        let items: Vec<_> = requests.iter().map(DlmsRequest::attribute_access).collect();
        let block_size = options.set_block_size;

        let mut pending = Vec::new();
        let mut block_number = 0;
        let request = match (items.len(), block_size) {
            (1, 0) => SetRequest::Normal {
                invoke,
                item: items[0].clone(),
                value: values[0].clone(),
            },
            (_, 0) => SetRequest::WithList { invoke, items, values },
            (n, _) => {
                pending = if n == 1 {
                    encode_data(&values[0])?
                } else {
                    let mut enc = AxdrEncoder::new();
                    encode_value_list(&mut enc, &values)?;
                    enc.into_bytes()
                };
                let (raw, last_block) = next_chunk(&mut pending, block_size);
                block_number = 1;
                let block = DataBlockSA {
                    last_block,
                    block_number,
                    raw,
                };
                if n == 1 {
                    SetRequest::WithFirstDataBlock {
                        invoke,
                        item: items[0].clone(),
                        block,
                    }
                } else {
                    SetRequest::WithListAndFirstDataBlock { invoke, items, block }
                }
            }
        };
        let pdu = request.encode()?;

        let (reply, delivery) = oneshot::channel();
        let now = Instant::now();
        let kind = RipKind::Set(SetRip {
            items: requests.into_iter().map(|r| RequestResponse::new(r, now)).collect(),
            pending,
            block_size,
            block_number,
            reply,
        });
        let mut rip = Rip::new(invoke_id, invoke, options, now, kind);
        if block_number > 0 {
            rip.touch_block_deadline();
        }
        self.submit(rip, pdu, delivery).await
    }

    /// Invoke methods: ActionRequestNormal for one, ActionRequestWithList for more
    pub async fn action(&self, requests: Vec<DlmsMethodRequest>, options: &RequestOptions) -> DlmsResult<MethodResults> {
        check_not_empty(requests.len())?;
        let invoke_id = self.pool.acquire(options.allocation_timeout).await?;
        let invoke = InvokeIdAndPriority::new(invoke_id.value(), options.high_priority)?;
        let request = if requests.len() == 1 {
            ActionRequest::Normal {
                invoke,
                method: requests[0].descriptor(),
                parameters: requests[0].parameters.clone(),
            }
        } else {
            ActionRequest::WithList {
                invoke,
                methods: requests.iter().map(DlmsMethodRequest::descriptor).collect(),
                parameters: requests
                    .iter()
                    .map(|r| r.parameters.clone().unwrap_or(dlms_core::DataObject::Null))
                    .collect(),
            }
        };
        let pdu = request.encode()?;

        let (reply, delivery) = oneshot::channel();
        let now = Instant::now();
        let kind = RipKind::Action(ActionRip {
            items: requests.into_iter().map(|r| RequestResponse::new(r, now)).collect(),
            reply,
        });
        self.submit(Rip::new(invoke_id, invoke, options, now, kind), pdu, delivery)
            .await
    }

    async fn submit<T>(&self, rip: Rip, pdu: Vec<u8>, delivery: oneshot::Receiver<T>) -> DlmsResult<T> {
        self.commands
            .send(Command::Submit { rip, pdu })
            .map_err(|_| DlmsError::ConnectionClosed)?;
        delivery.await.map_err(|_| DlmsError::ConnectionClosed)
    }

    /// End every request in progress with "app connection closed" and stop
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Close(ack)).is_ok() {
            let _ = done.await;
        }
        self.receive_task.abort();
    }
}

impl Drop for RequestManager {
    fn drop(&mut self) {
        self.receive_task.abort();
    }
}

fn check_not_empty(len: usize) -> DlmsResult<()> {
    if len == 0 {
        return Err(DlmsError::InvalidValue("empty request list".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::INVOKE_ID_COUNT;
    use async_trait::async_trait;
    use dlms_core::{DataObject, ObisCode};
    use mockall::mock;

    /// Requests go to the test, which plays the meter
    struct Wire(mpsc::UnboundedSender<Vec<u8>>);

    #[async_trait]
    impl PduSender for Wire {
        async fn send_pdu(&self, pdu: &[u8]) -> DlmsResult<()> {
            self.0.send(pdu.to_vec()).map_err(|_| DlmsError::ConnectionClosed)
        }
    }

    struct Feed(mpsc::UnboundedReceiver<DlmsResult<Vec<u8>>>);

    #[async_trait]
    impl PduReceiver for Feed {
        async fn receive_pdu(&mut self) -> DlmsResult<Vec<u8>> {
            self.0.recv().await.unwrap_or(Err(DlmsError::ConnectionClosed))
        }
    }

    mock! {
        Sender {}

        #[async_trait]
        impl PduSender for Sender {
            async fn send_pdu(&self, pdu: &[u8]) -> DlmsResult<()>;
        }
    }

    struct Meter {
        requests: mpsc::UnboundedReceiver<Vec<u8>>,
        replies: mpsc::UnboundedSender<DlmsResult<Vec<u8>>>,
    }

    impl Meter {
        async fn expect(&mut self) -> Vec<u8> {
            tokio::time::timeout(Duration::from_secs(2), self.requests.recv())
                .await
                .expect("request expected")
                .expect("wire open")
        }

        fn reply(&self, pdu: Vec<u8>) {
            self.replies.send(Ok(pdu)).unwrap();
        }
    }

    fn settings() -> AppSettings {
        AppSettings {
            watchdog_period: Duration::from_millis(10),
            ..AppSettings::default()
        }
    }

    fn start() -> (RequestManager, Meter) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let manager = RequestManager::start("app[test]", Wire(request_tx), Feed(reply_rx), settings());
        (
            manager,
            Meter {
                requests: request_rx,
                replies: reply_tx,
            },
        )
    }

    /// Hold invoke ids 0..7 so that the next request uses id 8 (byte 0x81)
    async fn hold_eight(manager: &RequestManager) -> Vec<InvokeId> {
        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(manager.invocation_pool().acquire(Duration::ZERO).await.unwrap());
        }
        held
    }

    fn attribute(c: u8) -> DlmsRequest {
        DlmsRequest::new(1, ObisCode::new(0, 0, 128, c, 0, 255), 2)
    }

    #[tokio::test]
    async fn test_get_normal() {
        let (manager, mut meter) = start();
        let _held = hold_eight(&manager).await;

        let meter_task = tokio::spawn(async move {
            let request = meter.expect().await;
            assert_eq!(
                request,
                vec![0xC0, 0x01, 0x81, 0x00, 0x01, 0x00, 0x00, 0x80, 0x00, 0x00, 0xFF, 0x02, 0x00]
            );
            meter.reply(vec![0xC4, 0x01, 0x81, 0x00, 0x09, 0x06, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
            meter
        });

        let results = manager.get(vec![attribute(0)], &RequestOptions::default()).await.unwrap();
        meter_task.await.unwrap();
        assert!(results.reason.is_completed());
        assert_eq!(results.data_access_result_at(0), Some(0));
        assert_eq!(
            results.data_at(0),
            Some(&DataObject::OctetString(vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66]))
        );
        assert!(results.delivered_in().is_some());
        assert_eq!(manager.invocation_pool().available(), INVOKE_ID_COUNT - 8);
    }

    #[tokio::test]
    async fn test_get_with_list() {
        let (manager, mut meter) = start();
        let _held = hold_eight(&manager).await;

        let meter_task = tokio::spawn(async move {
            let request = meter.expect().await;
            assert_eq!(
                request,
                vec![
                    0xC0, 0x03, 0x81, 0x02, 0x00, 0x01, 0x00, 0x00, 0x80, 0x00, 0x00, 0xFF, 0x02, 0x00,
                    0x00, 0x01, 0x00, 0x00, 0x80, 0x01, 0x00, 0xFF, 0x02, 0x00
                ]
            );
            meter.reply(vec![0xC4, 0x03, 0x81, 0x02, 0x00, 0x11, 0x2A, 0x01, 0x04]);
        });

        let results = manager
            .get(vec![attribute(0), attribute(1)], &RequestOptions::default())
            .await
            .unwrap();
        meter_task.await.unwrap();
        assert!(results.reason.is_completed());
        assert_eq!(results.data_at(0), Some(&DataObject::Unsigned(0x2A)));
        assert_eq!(results.data_access_result_at(1), Some(data_access_result::OBJECT_UNDEFINED));
        assert_eq!(results.data_at(1), None);
    }

    #[tokio::test]
    async fn test_get_with_block_transfer() {
        let (manager, mut meter) = start();
        let _held = hold_eight(&manager).await;
        let value: Vec<u8> = (0..40).collect();
        let encoded = encode_data(&DataObject::OctetString(value.clone())).unwrap();

        let meter_task = tokio::spawn(async move {
            meter.expect().await;
            let mut first = vec![0xC4, 0x02, 0x81, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x1E];
            first.extend_from_slice(&encoded[..30]);
            meter.reply(first);

            assert_eq!(meter.expect().await, vec![0xC0, 0x02, 0x81, 0x00, 0x00, 0x00, 0x01]);
            let mut second = vec![0xC4, 0x02, 0x81, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x0C];
            second.extend_from_slice(&encoded[30..]);
            meter.reply(second);
        });

        let results = manager.get(vec![attribute(0)], &RequestOptions::default()).await.unwrap();
        meter_task.await.unwrap();
        assert!(results.reason.is_completed());
        assert_eq!(results.data_at(0), Some(&DataObject::OctetString(value)));
    }

    #[tokio::test]
    async fn test_block_timeout_salvages_partial_value() {
        let (manager, mut meter) = start();
        let value = DataObject::Array(vec![
            DataObject::OctetString(vec![0, 1, 2, 3]),
            DataObject::Long(10),
            DataObject::OctetString(vec![1; 39]),
        ]);
        let encoded = encode_data(&value).unwrap();

        let meter_task = tokio::spawn(async move {
            let request = meter.expect().await;
            let mut first = vec![0xC4, 0x02, request[2], 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x14];
            first.extend_from_slice(&encoded[..20]);
            meter.reply(first);
            // stall
            meter.expect().await;
            meter
        });

        let options = RequestOptions::default()
            .with_timeout(Duration::from_millis(200))
            .with_block_timeout(Duration::from_millis(100));
        let started = Instant::now();
        let results = manager.get(vec![attribute(0)], &options).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(300));
        assert!(matches!(results.reason, TerminationReason::BlockTimeout));
        assert_eq!(results.data_access_result_at(0), Some(0));
        assert_eq!(
            results.data_at(0),
            Some(&DataObject::Array(vec![
                DataObject::OctetString(vec![0, 1, 2, 3]),
                DataObject::Long(10),
            ]))
        );
        assert_eq!(manager.invocation_pool().available(), INVOKE_ID_COUNT);
        let _meter = meter_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_set_with_block_transfer() {
        let (manager, mut meter) = start();
        let value = DataObject::OctetString((0..20).collect());
        let encoded = encode_data(&value).unwrap();

        let meter_task = tokio::spawn(async move {
            let first = meter.expect().await;
            let invoke = first[2];
            match SetRequest::decode(&first).unwrap() {
                SetRequest::WithFirstDataBlock { block, .. } => {
                    assert!(!block.last_block);
                    assert_eq!(block.block_number, 1);
                    assert_eq!(block.raw, encoded[..10].to_vec());
                }
                other => panic!("unexpected {:?}", other),
            }
            meter.reply(vec![0xC5, 0x02, invoke, 0x00, 0x00, 0x00, 0x01]);

            let mut raw = encoded[..10].to_vec();
            for number in 2..=3u32 {
                match SetRequest::decode(&meter.expect().await).unwrap() {
                    SetRequest::WithDataBlock { block, .. } => {
                        assert_eq!(block.block_number, number);
                        assert_eq!(block.last_block, number == 3);
                        raw.extend_from_slice(&block.raw);
                    }
                    other => panic!("unexpected {:?}", other),
                }
                if number < 3 {
                    let mut ack = vec![0xC5, 0x02, invoke];
                    ack.extend_from_slice(&number.to_be_bytes());
                    meter.reply(ack);
                }
            }
            assert_eq!(raw, encoded);
            meter.reply(vec![0xC5, 0x03, invoke, 0x00, 0x00, 0x00, 0x00, 0x03]);
        });

        let options = RequestOptions::default().with_set_block_size(10);
        let request = DlmsRequest::new(1, ObisCode::new(0, 0, 42, 0, 0, 255), 2).with_data(value);
        let results = manager.set(vec![request], &options).await.unwrap();
        meter_task.await.unwrap();
        assert!(results.reason.is_completed());
        assert_eq!(results.data_access_result_at(0), Some(0));
    }

    #[tokio::test]
    async fn test_set_requires_values() {
        let (manager, _meter) = start();
        let err = manager.set(vec![attribute(0)], &RequestOptions::default()).await.unwrap_err();
        assert!(matches!(err, DlmsError::InvalidValue(_)));
        assert_eq!(manager.invocation_pool().available(), INVOKE_ID_COUNT);
    }

    #[tokio::test]
    async fn test_action_normal() {
        let (manager, mut meter) = start();
        let meter_task = tokio::spawn(async move {
            let request = meter.expect().await;
            assert!(matches!(ActionRequest::decode(&request).unwrap(), ActionRequest::Normal { .. }));
            meter.reply(vec![0xC7, 0x01, request[2], 0x00, 0x01, 0x00, 0x11, 0x05]);
        });

        let request = DlmsMethodRequest::new(70, ObisCode::new(0, 0, 96, 3, 10, 255), 1, Some(DataObject::Integer(0)));
        let results = manager.action(vec![request], &RequestOptions::default()).await.unwrap();
        meter_task.await.unwrap();
        assert!(results.reason.is_completed());
        assert_eq!(results.action_result_at(0), Some(0));
        assert_eq!(results.data_at(0), Some(&DataObject::Unsigned(5)));
    }

    #[tokio::test]
    async fn test_stray_replies_dropped_until_timeout() {
        let (manager, mut meter) = start();
        let meter_task = tokio::spawn(async move {
            let request = meter.expect().await;
            let other = request[2] ^ 0x10;
            // no request in progress for this invoke id
            meter.reply(vec![0xC4, 0x01, other, 0x00, 0x11, 0x01]);
            // unknown tag
            meter.reply(vec![0xC9, 0x01, request[2], 0x00]);
            // set response for a get
            meter.reply(vec![0xC5, 0x01, request[2], 0x00]);
            meter
        });

        let options = RequestOptions::default().with_timeout(Duration::from_millis(100));
        let results = manager.get(vec![attribute(0)], &options).await.unwrap();
        let _meter = meter_task.await.unwrap();
        assert!(matches!(results.reason, TerminationReason::RequestTimeout));
        assert!(results.response_at(0).is_none());
        assert_eq!(manager.invocation_pool().available(), INVOKE_ID_COUNT);
    }

    #[tokio::test]
    async fn test_close_ends_requests_in_progress() {
        let (manager, mut meter) = start();
        let manager = Arc::new(manager);
        let pending = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get(vec![attribute(0)], &RequestOptions::default()).await })
        };
        meter.expect().await;
        manager.close().await;

        let results = pending.await.unwrap().unwrap();
        assert!(matches!(results.reason, TerminationReason::ConnectionClosed));
        assert!(matches!(
            manager.get(vec![attribute(0)], &RequestOptions::default()).await,
            Err(DlmsError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_ends_requests() {
        let (manager, mut meter) = start();
        let manager = Arc::new(manager);
        let pending = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get(vec![attribute(0)], &RequestOptions::default()).await })
        };
        meter.expect().await;
        meter.replies.send(Err(DlmsError::eof("stream closed"))).unwrap();

        let results = pending.await.unwrap().unwrap();
        assert!(matches!(results.reason, TerminationReason::Failed(DlmsError::ConnectionClosed)));
        let results = manager.get(vec![attribute(0)], &RequestOptions::default()).await.unwrap();
        assert!(!results.reason.is_completed());
    }

    #[tokio::test]
    async fn test_set_block_number_mismatch_fails() {
        let (manager, mut meter) = start();
        let value = DataObject::OctetString((0..20).collect());

        let meter_task = tokio::spawn(async move {
            let first = meter.expect().await;
            meter.reply(vec![0xC5, 0x02, first[2], 0x00, 0x00, 0x00, 0x07]);
            meter
        });

        let options = RequestOptions::default().with_set_block_size(10);
        let request = DlmsRequest::new(1, ObisCode::new(0, 0, 42, 0, 0, 255), 2).with_data(value);
        let results = manager.set(vec![request], &options).await.unwrap();
        let _meter = meter_task.await.unwrap();
        match results.reason {
            TerminationReason::Failed(DlmsError::Protocol(message)) => {
                assert_eq!(message, "block number 7 acknowledged, expected 1");
            }
            other => panic!("unexpected {}", other),
        }
        assert_eq!(manager.invocation_pool().available(), INVOKE_ID_COUNT);
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_the_pool() {
        let (manager, mut meter) = start();
        let manager = Arc::new(manager);
        let pending: Vec<_> = (0..20u8)
            .map(|c| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { (c, manager.get(vec![attribute(c)], &RequestOptions::default()).await) })
            })
            .collect();

        let meter_task = tokio::spawn(async move {
            // all sixteen ids are in flight before the first reply
            let mut first = Vec::new();
            for _ in 0..INVOKE_ID_COUNT {
                first.push(meter.expect().await);
            }
            let ids: std::collections::HashSet<u8> = first.iter().map(|r| r[2] >> 4).collect();
            assert_eq!(ids.len(), INVOKE_ID_COUNT);
            assert!(ids.iter().all(|id| (*id as usize) < INVOKE_ID_COUNT));
            assert!(
                tokio::time::timeout(Duration::from_millis(50), meter.requests.recv())
                    .await
                    .is_err()
            );

            let answer = |meter: &Meter, request: &[u8]| {
                // echo the D group of the requested logical name
                meter.reply(vec![0xC4, 0x01, request[2], 0x00, 0x11, request[8]]);
            };
            for request in &first {
                answer(&meter, request);
            }
            for _ in INVOKE_ID_COUNT..20 {
                let request = meter.expect().await;
                answer(&meter, &request);
            }
            meter
        });

        for handle in pending {
            let (c, results) = handle.await.unwrap();
            let results = results.unwrap();
            assert!(results.reason.is_completed());
            assert_eq!(results.data_at(0), Some(&DataObject::Unsigned(c)));
        }
        let _meter = meter_task.await.unwrap();
        assert_eq!(manager.invocation_pool().available(), INVOKE_ID_COUNT);
    }

    /// A transport that accepts a PDU and never finishes writing it
    struct Stalled;

    #[async_trait]
    impl PduSender for Stalled {
        async fn send_pdu(&self, _pdu: &[u8]) -> DlmsResult<()> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stalled_send_still_times_out() {
        let (_reply_tx, reply_rx) = mpsc::unbounded_channel();
        let manager = RequestManager::start("app[test]", Stalled, Feed(reply_rx), settings());
        let options = RequestOptions::default().with_timeout(Duration::from_millis(100));

        let started = Instant::now();
        let (first, second) = tokio::join!(
            manager.get(vec![attribute(0)], &options),
            manager.get(vec![attribute(1)], &options)
        );
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(first.unwrap().reason, TerminationReason::RequestTimeout));
        assert!(matches!(second.unwrap().reason, TerminationReason::RequestTimeout));
        assert_eq!(manager.invocation_pool().available(), INVOKE_ID_COUNT);
    }

    #[tokio::test]
    async fn test_send_failure_releases_invoke_id() {
        let mut sender = MockSender::new();
        sender
            .expect_send_pdu()
            .times(1)
            .returning(|_| Err(DlmsError::eof("link down")));
        let (_reply_tx, reply_rx) = mpsc::unbounded_channel();
        let manager = RequestManager::start("app[test]", sender, Feed(reply_rx), settings());

        let results = manager.get(vec![attribute(0)], &RequestOptions::default()).await.unwrap();
        assert!(matches!(results.reason, TerminationReason::Failed(DlmsError::Connection(_))));
        assert_eq!(manager.invocation_pool().available(), INVOKE_ID_COUNT);
    }
}
