//! Request and response values exchanged with the request manager

use crate::error::{DlmsError, DlmsResult};
use crate::pdu::{CosemItemDescriptor, SelectiveAccess};
use crate::service::get::AttributeAccess;
use dlms_core::{DataObject, ObisCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Reads or writes one attribute
///
/// `data` is the value to write; requests without it are GETs.
#[derive(Debug, Clone, PartialEq)]
pub struct DlmsRequest {
    pub class_id: u16,
    pub instance_id: ObisCode,
    pub attribute_id: u8,
    pub access: Option<SelectiveAccess>,
    pub data: Option<DataObject>,
}

impl DlmsRequest {
    pub fn new(class_id: u16, instance_id: ObisCode, attribute_id: u8) -> Self {
        Self {
            class_id,
            instance_id,
            attribute_id,
            access: None,
            data: None,
        }
    }

    pub fn with_access(mut self, selector: u8, parameters: DataObject) -> Self {
        self.access = Some(SelectiveAccess { selector, parameters });
        self
    }

    pub fn with_data(mut self, data: DataObject) -> Self {
        self.data = Some(data);
        self
    }

    pub fn attribute_access(&self) -> AttributeAccess {
        AttributeAccess::new(
            CosemItemDescriptor::new(self.class_id, self.instance_id, self.attribute_id),
            self.access.clone(),
        )
    }
}

/// Invokes one method
#[derive(Debug, Clone, PartialEq)]
pub struct DlmsMethodRequest {
    pub class_id: u16,
    pub instance_id: ObisCode,
    pub method_id: u8,
    pub parameters: Option<DataObject>,
}

impl DlmsMethodRequest {
    pub fn new(class_id: u16, instance_id: ObisCode, method_id: u8, parameters: Option<DataObject>) -> Self {
        Self {
            class_id,
            instance_id,
            method_id,
            parameters,
        }
    }

    pub fn descriptor(&self) -> CosemItemDescriptor {
        CosemItemDescriptor::new(self.class_id, self.instance_id, self.method_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DlmsResponse {
    pub data_access_result: u8,
    pub data: Option<DataObject>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DlmsMethodResponse {
    pub action_result: u8,
    pub data_access_result: Option<u8>,
    pub data: Option<DataObject>,
}

/// One submitted request and what came back for it
#[derive(Debug, Clone)]
pub struct RequestResponse<Q, R> {
    pub request: Q,
    pub response: Option<R>,
    pub submitted_at: Instant,
    pub delivered_at: Option<Instant>,
}

impl<Q, R> RequestResponse<Q, R> {
    pub fn new(request: Q, submitted_at: Instant) -> Self {
        Self {
            request,
            response: None,
            submitted_at,
            delivered_at: None,
        }
    }
}

/// Why a request in progress ended
#[derive(Debug)]
pub enum TerminationReason {
    Completed,
    RequestTimeout,
    BlockTimeout,
    /// The application connection was closed underneath the request
    ConnectionClosed,
    Failed(DlmsError),
}

impl TerminationReason {
    pub fn is_completed(&self) -> bool {
        matches!(self, TerminationReason::Completed)
    }

    pub fn into_result(self) -> DlmsResult<()> {
        match self {
            TerminationReason::Completed => Ok(()),
            TerminationReason::RequestTimeout => Err(DlmsError::RequestTimeout),
            TerminationReason::BlockTimeout => Err(DlmsError::BlockTimeout),
            TerminationReason::ConnectionClosed => Err(DlmsError::ConnectionClosed),
            TerminationReason::Failed(e) => Err(e),
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Completed => f.write_str("completed"),
            TerminationReason::RequestTimeout => f.write_str("request timeout"),
            TerminationReason::BlockTimeout => f.write_str("block receive timeout"),
            TerminationReason::ConnectionClosed => f.write_str("app connection closed"),
            TerminationReason::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// Everything delivered for one submission, aligned with the submitted list
#[derive(Debug)]
pub struct ResultResponse<Q, R> {
    pub items: Vec<RequestResponse<Q, R>>,
    pub reason: TerminationReason,
}

pub type AttributeResults = ResultResponse<DlmsRequest, DlmsResponse>;
pub type MethodResults = ResultResponse<DlmsMethodRequest, DlmsMethodResponse>;

impl<Q, R> ResultResponse<Q, R> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn request_at(&self, i: usize) -> Option<&Q> {
        self.items.get(i).map(|item| &item.request)
    }

    pub fn response_at(&self, i: usize) -> Option<&R> {
        self.items.get(i).and_then(|item| item.response.as_ref())
    }

    /// Time from submission to delivery of the first entry
    pub fn delivered_in(&self) -> Option<Duration> {
        let first = self.items.first()?;
        first
            .delivered_at
            .map(|at| at.saturating_duration_since(first.submitted_at))
    }

    /// Keep the results only when the request completed
    pub fn completed(mut self) -> DlmsResult<Self> {
        let reason = std::mem::replace(&mut self.reason, TerminationReason::Completed);
        reason.into_result()?;
        Ok(self)
    }
}

impl<Q> ResultResponse<Q, DlmsResponse> {
    pub fn data_at(&self, i: usize) -> Option<&DataObject> {
        self.response_at(i).and_then(|r| r.data.as_ref())
    }

    pub fn data_access_result_at(&self, i: usize) -> Option<u8> {
        self.response_at(i).map(|r| r.data_access_result)
    }
}

impl<Q> ResultResponse<Q, DlmsMethodResponse> {
    pub fn action_result_at(&self, i: usize) -> Option<u8> {
        self.response_at(i).map(|r| r.action_result)
    }

    pub fn data_at(&self, i: usize) -> Option<&DataObject> {
        self.response_at(i).and_then(|r| r.data.as_ref())
    }
}

/// Per request knobs
///
/// A zero duration means "no deadline".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    pub timeout: Duration,
    /// Longest wait between two blocks of a block transfer
    pub block_timeout: Duration,
    /// Longest wait for a free invoke id
    pub allocation_timeout: Duration,
    pub high_priority: bool,
    /// Split SET values into raw blocks of this size; 0 sends them whole
    pub set_block_size: usize,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            block_timeout: Duration::ZERO,
            allocation_timeout: Duration::ZERO,
            high_priority: true,
            set_block_size: 0,
        }
    }
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_block_timeout(mut self, block_timeout: Duration) -> Self {
        self.block_timeout = block_timeout;
        self
    }

    pub fn with_set_block_size(mut self, set_block_size: usize) -> Self {
        self.set_block_size = set_block_size;
        self
    }
}
