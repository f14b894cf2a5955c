//! GET, SET and ACTION service PDU codecs
//!
//! Requests are encoded by the client and decoded by the mock meter, responses
//! the other way round, so every PDU type has both directions.

pub mod action;
pub mod get;
pub mod set;

pub use action::{ActionOutcome, ActionRequest, ActionResponse};
pub use get::{AttributeAccess, BlockResult, DataBlockG, GetRequest, GetResponse};
pub use set::{DataBlockSA, SetRequest, SetResponse};
