//! In-process mock meter
//!
//! Answers the association and GET/SET/ACTION requests of one client per
//! served stream, over the wrapper session or an HDLC link. Values larger
//! than the configured block length are sent as a GET block transfer; the
//! meter can be told to stop answering after a number of blocks.

use dlms_application::pdu::{CosemItemDescriptor, GetDataResult, InvokeIdAndPriority};
use dlms_application::service::get::{decode_block_value, encode_result_list};
use dlms_application::service::set::decode_value_list;
use dlms_application::service::{
    ActionOutcome, ActionRequest, ActionResponse, AttributeAccess, BlockResult, DataBlockG, DataBlockSA, GetRequest,
    GetResponse, SetRequest, SetResponse,
};
use dlms_asn1::ber::BerDecoder;
use dlms_asn1::{encode_aare, encode_data, AxdrDecoder, AxdrEncoder};
use dlms_core::datatypes::{action_result, data_access_result};
use dlms_core::{DataObject, DlmsError, DlmsResult, ObisCode};
use dlms_session::{
    HdlcLink, HdlcSettings, LlcReceiver, LlcSender, PduReceiver, PduSender, ServerAddress, WrapperReceiver,
    WrapperSender,
};
use dlms_transport::{StreamAccessor, StreamReader, StreamWriter, TcpTransport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

const AARQ_TAG: u8 = 0x60;
const GET_REQUEST: u8 = 0xC0;
const SET_REQUEST: u8 = 0xC1;
const ACTION_REQUEST: u8 = 0xC3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockSettings {
    /// Low level security password accepted by the meter
    pub password: Vec<u8>,
    pub application_client: u16,
    pub logical_device: u16,
    /// Largest raw block of a GET response; 0 never splits
    pub block_length: usize,
    /// Stop answering once this many GET blocks went out
    pub stall_after_blocks: Option<u64>,
}

impl Default for MockSettings {
    fn default() -> Self {
        Self {
            password: b"12345678".to_vec(),
            application_client: 16,
            logical_device: 1,
            block_length: 0,
            stall_after_blocks: None,
        }
    }
}

/// Mock meter; clones share objects and counters
#[derive(Clone)]
pub struct MockMeter {
    attributes: Arc<RwLock<HashMap<CosemItemDescriptor, DataObject>>>,
    methods: Arc<RwLock<HashMap<CosemItemDescriptor, Option<DataObject>>>>,
    blocks_sent: Arc<AtomicU64>,
    settings: MockSettings,
}

impl MockMeter {
    pub fn new(settings: MockSettings) -> Self {
        Self {
            attributes: Arc::new(RwLock::new(HashMap::new())),
            methods: Arc::new(RwLock::new(HashMap::new())),
            blocks_sent: Arc::new(AtomicU64::new(0)),
            settings,
        }
    }

    pub fn settings(&self) -> &MockSettings {
        &self.settings
    }

    pub async fn insert(&self, class_id: u16, instance_id: ObisCode, attribute_id: u8, value: DataObject) {
        let key = CosemItemDescriptor::new(class_id, instance_id, attribute_id);
        self.attributes.write().await.insert(key, value);
    }

    /// Register a method and the return parameters it answers with
    pub async fn insert_method(&self, class_id: u16, instance_id: ObisCode, method_id: u8, returns: Option<DataObject>) {
        let key = CosemItemDescriptor::new(class_id, instance_id, method_id);
        self.methods.write().await.insert(key, returns);
    }

    pub async fn value(&self, class_id: u16, instance_id: ObisCode, attribute_id: u8) -> Option<DataObject> {
        let key = CosemItemDescriptor::new(class_id, instance_id, attribute_id);
        self.attributes.read().await.get(&key).cloned()
    }

    /// GET blocks sent over all sessions
    pub fn blocks_sent(&self) -> u64 {
        self.blocks_sent.load(Ordering::Relaxed)
    }

    /// Serve one client over the wrapper session
    pub fn serve_wrapper(&self, reader: Box<dyn StreamReader>, writer: Box<dyn StreamWriter>) -> JoinHandle<()> {
        let local = self.settings.logical_device;
        let remote = self.settings.application_client;
        let sender = WrapperSender::new(writer, local, remote);
        let receiver = WrapperReceiver::new(reader, local, remote);
        let session = MockSession::new(self.clone(), "mock[wrapper]".to_string());
        tokio::spawn(session.run(sender, receiver))
    }

    /// Serve one client over an HDLC link; the link waits for the client's SNRM
    pub fn serve_hdlc(
        &self,
        reader: Box<dyn StreamReader>,
        writer: Box<dyn StreamWriter>,
        client: u8,
        server: ServerAddress,
        settings: HdlcSettings,
    ) -> DlmsResult<JoinHandle<()>> {
        let mut link = HdlcLink::server(reader, writer, client, server, settings)?;
        let link_reader = link
            .take_reader()
            .ok_or_else(|| DlmsError::InvalidData("HDLC reader already taken".to_string()))?;
        let sender = LlcSender::server(link.writer());
        let receiver = LlcReceiver::server(link_reader);
        let session = MockSession::new(self.clone(), format!("mock[{}]", link.label()));
        Ok(tokio::spawn(async move {
            session.run(sender, receiver).await;
            link.shutdown().await;
        }))
    }

    /// Accept TCP clients and serve each over the wrapper session
    pub async fn listen_wrapper(&self, listener: TcpListener) -> DlmsResult<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            log::debug!("mock: client {} connected", peer);
            let (reader, writer) = Box::new(TcpTransport::from_connected_stream(stream)?).split()?;
            self.serve_wrapper(reader, writer);
        }
    }
}

struct PendingGet {
    raw: Vec<u8>,
    block_number: u32,
}

struct PendingSet {
    items: Vec<AttributeAccess>,
    raw: Vec<u8>,
    block_number: u32,
}

/// State of one served client
struct MockSession {
    meter: MockMeter,
    label: String,
    associated: bool,
    gets: HashMap<u8, PendingGet>,
    sets: HashMap<u8, PendingSet>,
}

fn aarq_password(pdu: &[u8]) -> DlmsResult<Vec<u8>> {
    let body = BerDecoder::new(pdu).decode_expected(AARQ_TAG)?;
    let mut dec = BerDecoder::new(body);
    while dec.has_remaining() {
        let (tag, value) = dec.decode_tlv()?;
        // [12] calling-authentication-value, graphic string choice [0]
        if tag == 0xAC {
            return Ok(BerDecoder::new(value).decode_expected(0x80)?.to_vec());
        }
    }
    Ok(Vec::new())
}

impl MockSession {
    fn new(meter: MockMeter, label: String) -> Self {
        Self {
            meter,
            label,
            associated: false,
            gets: HashMap::new(),
            sets: HashMap::new(),
        }
    }

    async fn run<S: PduSender, R: PduReceiver>(mut self, sender: S, mut receiver: R) {
        loop {
            let pdu = match receiver.receive_pdu().await {
                Ok(pdu) => pdu,
                Err(e) if e.is_fatal() => {
                    log::debug!("{}: client gone: {}", self.label, e);
                    break;
                }
                Err(e) => {
                    log::warn!("{}: PDU dropped: {}", self.label, e);
                    continue;
                }
            };
            let reply = match self.handle(&pdu).await {
                Ok(reply) => reply,
                Err(e) => {
                    log::warn!("{}: request not answered: {}", self.label, e);
                    None
                }
            };
            if let Some(reply) = reply {
                if let Err(e) = sender.send_pdu(&reply).await {
                    log::debug!("{}: reply not sent: {}", self.label, e);
                    break;
                }
            }
        }
    }

    async fn handle(&mut self, pdu: &[u8]) -> DlmsResult<Option<Vec<u8>>> {
        let tag = *pdu.first().ok_or_else(|| DlmsError::Decode("empty PDU".to_string()))?;
        if tag == AARQ_TAG {
            return self.associate(pdu).map(Some);
        }
        if !self.associated {
            return Err(DlmsError::Protocol(format!("PDU {:02X} before association", tag)));
        }
        match tag {
            GET_REQUEST => self.on_get(GetRequest::decode(pdu)?).await,
            SET_REQUEST => self.on_set(SetRequest::decode(pdu)?).await.map(Some),
            ACTION_REQUEST => self.on_action(ActionRequest::decode(pdu)?).await.map(Some),
            other => Err(DlmsError::Decode(format!("unsupported PDU {:02X}", other))),
        }
    }

    fn associate(&mut self, pdu: &[u8]) -> DlmsResult<Vec<u8>> {
        let password = aarq_password(pdu)?;
        self.associated = password == self.meter.settings.password;
        if self.associated {
            log::debug!("{}: associated", self.label);
            encode_aare(0, 0)
        } else {
            log::debug!("{}: wrong password", self.label);
            // rejected permanent, authentication failure
            encode_aare(1, 13)
        }
    }

    async fn read(&self, item: &AttributeAccess) -> GetDataResult {
        match self.meter.attributes.read().await.get(&item.descriptor) {
            Some(value) => GetDataResult::Data(value.clone()),
            None => GetDataResult::DataAccessResult(data_access_result::OBJECT_UNDEFINED),
        }
    }

    async fn write(&self, item: &AttributeAccess, value: DataObject) -> u8 {
        self.meter.attributes.write().await.insert(item.descriptor, value);
        data_access_result::SUCCESS
    }

    fn should_split(&self, len: usize) -> bool {
        self.meter.settings.block_length > 0 && len > self.meter.settings.block_length
    }

    async fn on_get(&mut self, request: GetRequest) -> DlmsResult<Option<Vec<u8>>> {
        let invoke = request.invoke();
        match request {
            GetRequest::Normal { item, .. } => {
                let result = self.read(&item).await;
                if let GetDataResult::Data(value) = &result {
                    let raw = encode_data(value)?;
                    if self.should_split(raw.len()) {
                        return self.start_get_blocks(invoke, raw);
                    }
                }
                GetResponse::Normal { invoke, result }.encode().map(Some)
            }
            GetRequest::WithList { items, .. } => {
                let mut results = Vec::with_capacity(items.len());
                for item in &items {
                    results.push(self.read(item).await);
                }
                let mut enc = AxdrEncoder::new();
                encode_result_list(&mut enc, &results)?;
                if self.should_split(enc.len()) {
                    return self.start_get_blocks(invoke, enc.into_bytes());
                }
                GetResponse::WithList { invoke, results }.encode().map(Some)
            }
            GetRequest::Next { block_number, .. } => {
                let id = invoke.invoke_id();
                let expected = self.gets.get(&id).map(|p| p.block_number);
                if expected != Some(block_number) {
                    self.gets.remove(&id);
                    let block = DataBlockG {
                        last_block: true,
                        block_number: block_number.wrapping_add(1),
                        result: BlockResult::DataAccessResult(data_access_result::NO_LONG_GET_IN_PROGRESS),
                    };
                    return GetResponse::WithDataBlock { invoke, block }.encode().map(Some);
                }
                self.next_get_block(invoke)
            }
        }
    }

    fn start_get_blocks(&mut self, invoke: InvokeIdAndPriority, raw: Vec<u8>) -> DlmsResult<Option<Vec<u8>>> {
        self.gets.insert(invoke.invoke_id(), PendingGet { raw, block_number: 0 });
        self.next_get_block(invoke)
    }

    fn next_get_block(&mut self, invoke: InvokeIdAndPriority) -> DlmsResult<Option<Vec<u8>>> {
        if let Some(limit) = self.meter.settings.stall_after_blocks {
            if self.meter.blocks_sent() >= limit {
                log::debug!("{}: stalling", self.label);
                return Ok(None);
            }
        }
        let id = invoke.invoke_id();
        let Some(pending) = self.gets.get_mut(&id) else {
            return Ok(None);
        };
        let n = self.meter.settings.block_length.min(pending.raw.len());
        let chunk: Vec<u8> = pending.raw.drain(..n).collect();
        pending.block_number += 1;
        let block = DataBlockG {
            last_block: pending.raw.is_empty(),
            block_number: pending.block_number,
            result: BlockResult::RawData(chunk),
        };
        if block.last_block {
            self.gets.remove(&id);
        }
        self.meter.blocks_sent.fetch_add(1, Ordering::Relaxed);
        GetResponse::WithDataBlock { invoke, block }.encode().map(Some)
    }

    async fn on_set(&mut self, request: SetRequest) -> DlmsResult<Vec<u8>> {
        match request {
            SetRequest::Normal { invoke, item, value } => {
                let result = self.write(&item, value).await;
                SetResponse::Normal { invoke, result }.encode()
            }
            SetRequest::WithList { invoke, items, values } => {
                let mut results = Vec::with_capacity(items.len());
                for (item, value) in items.iter().zip(values) {
                    results.push(self.write(item, value).await);
                }
                SetResponse::WithList { invoke, results }.encode()
            }
            SetRequest::WithFirstDataBlock { invoke, item, block } => {
                self.on_set_block(invoke, Some(vec![item]), block).await
            }
            SetRequest::WithListAndFirstDataBlock { invoke, items, block } => {
                self.on_set_block(invoke, Some(items), block).await
            }
            SetRequest::WithDataBlock { invoke, block } => self.on_set_block(invoke, None, block).await,
        }
    }

    /// `items` is set on the first block only
    async fn on_set_block(
        &mut self,
        invoke: InvokeIdAndPriority,
        items: Option<Vec<AttributeAccess>>,
        block: DataBlockSA,
    ) -> DlmsResult<Vec<u8>> {
        let id = invoke.invoke_id();
        if let Some(items) = items {
            self.sets.insert(
                id,
                PendingSet {
                    items,
                    raw: Vec::new(),
                    block_number: 0,
                },
            );
        }
        let Some(mut pending) = self.sets.remove(&id) else {
            return SetResponse::LastDataBlock {
                invoke,
                result: data_access_result::NO_LONG_SET_IN_PROGRESS,
                block_number: block.block_number,
            }
            .encode();
        };
        if block.block_number != pending.block_number + 1 {
            log::warn!(
                "{}: set block {} out of order after {}",
                self.label,
                block.block_number,
                pending.block_number
            );
            return SetResponse::LastDataBlock {
                invoke,
                result: data_access_result::DATA_BLOCK_NUMBER_INVALID,
                block_number: block.block_number,
            }
            .encode();
        }
        pending.raw.extend_from_slice(&block.raw);
        pending.block_number = block.block_number;
        if !block.last_block {
            self.sets.insert(id, pending);
            return SetResponse::DataBlock {
                invoke,
                block_number: block.block_number,
            }
            .encode();
        }

        if let [item] = pending.items.as_slice() {
            let result = match decode_block_value(&pending.raw) {
                Ok(value) => self.write(item, value).await,
                Err(_) => data_access_result::TYPE_UNMATCHED,
            };
            SetResponse::LastDataBlock {
                invoke,
                result,
                block_number: pending.block_number,
            }
            .encode()
        } else {
            let values = decode_value_list(&mut AxdrDecoder::new(&pending.raw))?;
            let mut results = Vec::with_capacity(pending.items.len());
            for (item, value) in pending.items.iter().zip(values) {
                results.push(self.write(item, value).await);
            }
            SetResponse::LastDataBlockWithList {
                invoke,
                results,
                block_number: pending.block_number,
            }
            .encode()
        }
    }

    async fn invoke(&self, method: &CosemItemDescriptor) -> ActionOutcome {
        match self.meter.methods.read().await.get(method) {
            Some(returns) => ActionOutcome {
                result: action_result::SUCCESS,
                return_parameters: returns.clone().map(GetDataResult::Data),
            },
            None => ActionOutcome {
                result: action_result::OBJECT_UNDEFINED,
                return_parameters: None,
            },
        }
    }

    async fn on_action(&self, request: ActionRequest) -> DlmsResult<Vec<u8>> {
        match request {
            ActionRequest::Normal { invoke, method, .. } => {
                let outcome = self.invoke(&method).await;
                ActionResponse::Normal { invoke, outcome }.encode()
            }
            ActionRequest::WithList { invoke, methods, .. } => {
                let mut outcomes = Vec::with_capacity(methods.len());
                for method in &methods {
                    outcomes.push(self.invoke(method).await);
                }
                ActionResponse::WithList { invoke, outcomes }.encode()
            }
        }
    }
}
