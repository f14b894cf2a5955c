//! Data types used in DLMS/COSEM protocol

pub mod data_object;
pub mod date_time;

pub use data_object::{action_result, data_access_result, tag, BitString, DataObject};
pub use date_time::{clock_status, CosemDate, CosemDateTime, CosemTime};
