//! Core types and utilities for the DLMS/COSEM client
//!
//! Error handling, OBIS instance ids and the COSEM data values shared by
//! every other crate of the workspace.

pub mod datatypes;
pub mod error;
pub mod obis_code;

pub use datatypes::{BitString, CosemDate, CosemDateTime, CosemTime, DataObject};
pub use error::{DlmsError, DlmsResult, WrongState};
pub use obis_code::ObisCode;
