use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use rtcplane_channel::{Channel, Event, Method};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::data_structures::{AppData, DataProducerId, TransportId};
use crate::error::{Error, Result};
use crate::event::{BagOnce, HandlerId};
use crate::request::{request_in_background, request_raw};
use crate::sctp_parameters::SctpStreamParameters;

/// Options for [`Transport::produce_data`](crate::router::transport::Transport::produce_data).
#[derive(Debug, Clone, Default)]
pub struct DataProducerOptions {
    pub id: Option<DataProducerId>,
    /// Required on SCTP-capable transports, ignored on direct ones.
    pub sctp_stream_parameters: Option<SctpStreamParameters>,
    pub label: String,
    pub protocol: String,
    pub paused: bool,
    pub app_data: AppData,
}

impl DataProducerOptions {
    pub fn new_sctp(sctp_stream_parameters: SctpStreamParameters) -> Self {
        Self {
            sctp_stream_parameters: Some(sctp_stream_parameters),
            ..Self::default()
        }
    }

    pub fn new_direct() -> Self {
        Self::default()
    }
}

/// How data reaches a data producer or leaves a data consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Sctp,
    Direct,
}

/// A message injected through a direct data producer. The variant
/// selects the SCTP payload protocol identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebRtcMessage {
    String(String),
    Binary(Vec<u8>),
    EmptyString,
    EmptyBinary,
}

impl WebRtcMessage {
    fn ppid(&self) -> u32 {
        match self {
            Self::String(_) => 51,
            Self::Binary(_) => 53,
            Self::EmptyString => 56,
            Self::EmptyBinary => 57,
        }
    }

    fn payload(&self) -> Value {
        match self {
            Self::String(text) => json!(text),
            Self::Binary(bytes) => json!(bytes),
            // The worker ignores the payload of empty messages.
            Self::EmptyString | Self::EmptyBinary => json!(" "),
        }
    }
}

#[derive(Default)]
struct Handlers {
    transport_close: BagOnce<dyn FnOnce() + Send>,
    close: BagOnce<dyn FnOnce() + Send>,
}

struct Inner {
    id: DataProducerId,
    data_type: DataType,
    sctp_stream_parameters: Option<SctpStreamParameters>,
    label: String,
    protocol: String,
    transport_id: TransportId,
    channel: Channel,
    closed: AtomicBool,
    app_data: AppData,
    handlers: Handlers,
    internal_close: BagOnce<dyn FnOnce() + Send>,
}

pub(crate) struct DataProducerParams {
    pub(crate) id: DataProducerId,
    pub(crate) data_type: DataType,
    pub(crate) sctp_stream_parameters: Option<SctpStreamParameters>,
    pub(crate) label: String,
    pub(crate) protocol: String,
    pub(crate) transport_id: TransportId,
    pub(crate) channel: Channel,
    pub(crate) app_data: AppData,
}

/// Source of data messages, over SCTP or injected directly.
#[derive(Clone)]
pub struct DataProducer {
    inner: Arc<Inner>,
}

impl DataProducer {
    pub(crate) fn new(params: DataProducerParams) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: params.id,
                data_type: params.data_type,
                sctp_stream_parameters: params.sctp_stream_parameters,
                label: params.label,
                protocol: params.protocol,
                transport_id: params.transport_id,
                channel: params.channel,
                closed: AtomicBool::new(false),
                app_data: params.app_data,
                handlers: Handlers::default(),
                internal_close: BagOnce::default(),
            }),
        }
    }

    pub fn id(&self) -> DataProducerId {
        self.inner.id
    }

    pub fn data_type(&self) -> DataType {
        self.inner.data_type
    }

    pub fn sctp_stream_parameters(&self) -> Option<SctpStreamParameters> {
        self.inner.sctp_stream_parameters
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    pub fn transport_id(&self) -> TransportId {
        self.inner.transport_id
    }

    pub fn app_data(&self) -> &AppData {
        &self.inner.app_data
    }

    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub async fn dump(&self) -> Result<Value> {
        debug!("dump()");
        self.ensure_open()?;
        request_raw(
            &self.inner.channel,
            Method::DataProducerDump,
            self.inner.id.to_string(),
            None,
        )
        .await
    }

    pub async fn get_stats(&self) -> Result<Value> {
        debug!("get_stats()");
        self.ensure_open()?;
        request_raw(
            &self.inner.channel,
            Method::DataProducerGetStats,
            self.inner.id.to_string(),
            None,
        )
        .await
    }

    /// Inject a message into the router. Only direct data producers can
    /// send; delivery is not acknowledged.
    pub fn send(&self, message: WebRtcMessage) -> Result<()> {
        self.ensure_open()?;
        if self.inner.data_type != DataType::Direct {
            return Err(Error::InvalidState(
                "only direct data producers can send".to_owned(),
            ));
        }

        self.inner.channel.notify(
            Event::DataProducerSend,
            self.inner.id.to_string(),
            Some(json!({ "ppid": message.ppid(), "data": message.payload() })),
        )?;
        Ok(())
    }

    /// Close the data producer. Its data consumers are closed by the
    /// worker.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(data_producer_id = %self.inner.id, "close()");

        request_in_background(
            &self.inner.channel,
            Method::TransportCloseDataProducer,
            self.inner.transport_id.to_string(),
            Some(json!({ "dataProducerId": self.inner.id })),
        );
        self.inner.finish_close(false);
    }

    pub fn on_transport_close<F>(&self, callback: F) -> HandlerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.handlers.transport_close.add(Box::new(callback))
    }

    pub fn on_close<F>(&self, callback: F) -> HandlerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.handlers.close.add(Box::new(callback))
    }

    pub(crate) fn on_internal_close<F>(&self, callback: F) -> HandlerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.internal_close.add(Box::new(callback))
    }

    pub(crate) fn transport_closed(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(data_producer_id = %self.inner.id, "transport_closed()");
        self.inner.finish_close(true);
    }

    pub(crate) fn downgrade(&self) -> WeakDataProducer {
        WeakDataProducer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed() {
            Err(Error::closed("data producer"))
        } else {
            Ok(())
        }
    }
}

impl Inner {
    fn finish_close(&self, transport_closed: bool) {
        self.internal_close.call_simple();
        if transport_closed {
            self.handlers.transport_close.call_simple();
        }
        self.handlers.close.call_simple();
    }
}

impl fmt::Debug for DataProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataProducer")
            .field("id", &self.inner.id)
            .field("data_type", &self.inner.data_type)
            .field("label", &self.inner.label)
            .field("closed", &self.closed())
            .finish()
    }
}

#[derive(Clone)]
pub(crate) struct WeakDataProducer {
    inner: Weak<Inner>,
}

impl WeakDataProducer {
    pub(crate) fn upgrade(&self) -> Option<DataProducer> {
        self.inner.upgrade().map(|inner| DataProducer { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ppids() {
        assert_eq!(WebRtcMessage::String("hi".into()).ppid(), 51);
        assert_eq!(WebRtcMessage::Binary(vec![1, 2]).ppid(), 53);
        assert_eq!(WebRtcMessage::EmptyString.ppid(), 56);
        assert_eq!(WebRtcMessage::EmptyBinary.ppid(), 57);
    }

    #[test]
    fn binary_payload_is_a_byte_array() {
        assert_eq!(WebRtcMessage::Binary(vec![1, 2]).payload(), json!([1, 2]));
    }
}
