//! Application association: AARQ/AARE, then GET/SET/ACTION through the
//! request manager

use super::connection::Connection;
use super::dlms_conn::DlmsConn;
use async_trait::async_trait;
use dlms_application::{
    AppSettings, AttributeResults, DlmsMethodRequest, DlmsRequest, MethodResults, RequestManager, RequestOptions,
};
use dlms_asn1::{decode_aare, encode_aarq};
use dlms_core::datatypes::{action_result, data_access_result};
use dlms_core::{DataObject, DlmsError, DlmsResult, ObisCode};
use std::time::Duration;
use tokio::sync::Mutex;

/// An associated application connection
///
/// Requests may be submitted concurrently from several tasks; up to sixteen
/// are in progress at once.
pub struct AppConn {
    label: String,
    manager: RequestManager,
    dconn: Mutex<Option<DlmsConn>>,
}

impl AppConn {
    /// Associate with low level security
    ///
    /// The AARE must arrive within `timeout` (zero waits forever). On any
    /// failure the DLMS connection is closed.
    pub async fn connect_with_password(
        dconn: DlmsConn,
        application_client: u16,
        logical_device: u16,
        password: &[u8],
        timeout: Duration,
    ) -> DlmsResult<Self> {
        Self::connect_with_settings(
            dconn,
            application_client,
            logical_device,
            password,
            timeout,
            AppSettings::default(),
        )
        .await
    }

    pub async fn connect_with_settings(
        mut dconn: DlmsConn,
        application_client: u16,
        logical_device: u16,
        password: &[u8],
        timeout: Duration,
        settings: AppSettings,
    ) -> DlmsResult<Self> {
        let label = format!("app[c={} ld={}]", application_client, logical_device);
        let associated = async {
            let mut channel = dconn.open_channel(application_client, logical_device)?;
            let aarq = encode_aarq(password)?;
            channel.sender.send_pdu(&aarq).await?;
            let aare = if timeout.is_zero() {
                channel.receiver.receive_pdu().await?
            } else {
                tokio::time::timeout(timeout, channel.receiver.receive_pdu())
                    .await
                    .map_err(|_| DlmsError::Timeout)??
            };
            decode_aare(&aare)?.into_result()?;
            Ok::<_, DlmsError>(channel)
        }
        .await;

        let channel = match associated {
            Ok(channel) => channel,
            Err(e) => {
                log::error!("{}: association failed: {}", label, e);
                if let Err(close_err) = dconn.close().await {
                    log::debug!("{}: closing after failed association: {}", label, close_err);
                }
                return Err(e);
            }
        };
        log::info!("{}: associated", label);

        let manager = RequestManager::start(label.clone(), channel.sender, channel.receiver, settings);
        Ok(Self {
            label,
            manager,
            dconn: Mutex::new(Some(dconn)),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn request_manager(&self) -> &RequestManager {
        &self.manager
    }

    fn options(&self) -> &RequestOptions {
        &self.manager.settings().request
    }

    pub async fn get(&self, requests: Vec<DlmsRequest>) -> DlmsResult<AttributeResults> {
        self.manager.get(requests, self.options()).await
    }

    pub async fn get_with(&self, requests: Vec<DlmsRequest>, options: &RequestOptions) -> DlmsResult<AttributeResults> {
        self.manager.get(requests, options).await
    }

    pub async fn set(&self, requests: Vec<DlmsRequest>) -> DlmsResult<AttributeResults> {
        self.manager.set(requests, self.options()).await
    }

    pub async fn set_with(&self, requests: Vec<DlmsRequest>, options: &RequestOptions) -> DlmsResult<AttributeResults> {
        self.manager.set(requests, options).await
    }

    pub async fn action(&self, requests: Vec<DlmsMethodRequest>) -> DlmsResult<MethodResults> {
        self.manager.action(requests, self.options()).await
    }

    pub async fn action_with(
        &self,
        requests: Vec<DlmsMethodRequest>,
        options: &RequestOptions,
    ) -> DlmsResult<MethodResults> {
        self.manager.action(requests, options).await
    }

    /// End every request in progress and close the DLMS connection
    pub async fn close(&self) -> DlmsResult<()> {
        self.manager.close().await;
        match self.dconn.lock().await.take() {
            Some(dconn) => dconn.close().await,
            None => Ok(()),
        }
    }
}

fn check_access(result: u8) -> DlmsResult<()> {
    if result == data_access_result::SUCCESS {
        Ok(())
    } else {
        Err(DlmsError::Protocol(format!("data access result {}", result)))
    }
}

#[async_trait]
impl Connection for AppConn {
    async fn get_attribute(&self, class_id: u16, instance_id: ObisCode, attribute_id: u8) -> DlmsResult<DataObject> {
        let results = self
            .get(vec![DlmsRequest::new(class_id, instance_id, attribute_id)])
            .await?
            .completed()?;
        check_access(results.data_access_result_at(0).unwrap_or(data_access_result::OTHER_REASON))?;
        results
            .data_at(0)
            .cloned()
            .ok_or_else(|| DlmsError::Decode("response without data".to_string()))
    }

    async fn set_attribute(
        &self,
        class_id: u16,
        instance_id: ObisCode,
        attribute_id: u8,
        value: DataObject,
    ) -> DlmsResult<()> {
        let request = DlmsRequest::new(class_id, instance_id, attribute_id).with_data(value);
        let results = self.set(vec![request]).await?.completed()?;
        check_access(results.data_access_result_at(0).unwrap_or(data_access_result::OTHER_REASON))
    }

    async fn invoke_method(
        &self,
        class_id: u16,
        instance_id: ObisCode,
        method_id: u8,
        parameters: Option<DataObject>,
    ) -> DlmsResult<Option<DataObject>> {
        let request = DlmsMethodRequest::new(class_id, instance_id, method_id, parameters);
        let results = self.action(vec![request]).await?.completed()?;
        match results.action_result_at(0) {
            Some(action_result::SUCCESS) => Ok(results.data_at(0).cloned()),
            Some(other) => Err(DlmsError::Protocol(format!("action result {}", other))),
            None => Err(DlmsError::Decode("action response missing".to_string())),
        }
    }

    fn is_open(&self) -> bool {
        !self.manager.is_closed()
    }

    async fn close(&self) -> DlmsResult<()> {
        AppConn::close(self).await
    }
}
