//! Application layer of the DLMS/COSEM client
//!
//! - [`pdu`] and [`service`]: GET, SET and ACTION PDU codecs
//! - [`invocation`]: the pool of sixteen invoke ids
//! - [`manager`]: the request manager multiplexing requests in progress over
//!   one PDU channel, with block transfer and deadline handling
//! - [`request`]: the values submitted to and delivered by the manager

pub mod error;
pub mod invocation;
pub mod manager;
pub mod pdu;
pub mod request;
pub mod service;

pub use error::{DlmsError, DlmsResult};
pub use invocation::{InvocationPool, InvokeId, INVOKE_ID_COUNT};
pub use manager::{AppSettings, RequestManager};
pub use pdu::{CosemItemDescriptor, GetDataResult, InvokeIdAndPriority, SelectiveAccess};
pub use request::{
    AttributeResults, DlmsMethodRequest, DlmsMethodResponse, DlmsRequest, DlmsResponse, MethodResults,
    RequestOptions, RequestResponse, ResultResponse, TerminationReason,
};
