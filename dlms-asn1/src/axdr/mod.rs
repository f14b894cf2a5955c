//! A-XDR encoding/decoding module

pub mod decoder;
pub mod encoder;

pub use decoder::{decode_data, AxdrDecoder, MAX_DEPTH};
pub use encoder::{encode_data, AxdrEncoder};
