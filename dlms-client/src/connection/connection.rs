//! Connection trait for DLMS/COSEM client operations
//!
//! Single-object convenience over an associated connection. A result other
//! than success, or a request that did not complete, is an error.

use async_trait::async_trait;
use dlms_core::{DataObject, DlmsResult, ObisCode};

/// Unified interface of an associated connection
///
/// Lets callers such as the command line client work against a mock.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Read one attribute
    async fn get_attribute(&self, class_id: u16, instance_id: ObisCode, attribute_id: u8) -> DlmsResult<DataObject>;

    /// Write one attribute
    async fn set_attribute(
        &self,
        class_id: u16,
        instance_id: ObisCode,
        attribute_id: u8,
        value: DataObject,
    ) -> DlmsResult<()>;

    /// Invoke one method, returning its return parameters if any
    async fn invoke_method(
        &self,
        class_id: u16,
        instance_id: ObisCode,
        method_id: u8,
        parameters: Option<DataObject>,
    ) -> DlmsResult<Option<DataObject>>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> DlmsResult<()>;
}
