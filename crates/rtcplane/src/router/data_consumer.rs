use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rtcplane_channel::{Channel, Event, Method, Notification, SubscriptionHandler};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::data_structures::{AppData, DataConsumerId, DataProducerId, TransportId};
use crate::error::{Error, Result};
use crate::event::{Bag, BagOnce, HandlerId};
use crate::request::{
    notification_data, request, request_ignore, request_in_background, request_raw,
};
use crate::router::data_producer::DataType;
use crate::sctp_parameters::SctpStreamParameters;

/// Options for [`Transport::consume_data`](crate::router::transport::Transport::consume_data).
///
/// The reliability overrides apply to SCTP consumers only; when none is
/// set the data producer's stream parameters are used as they are.
#[derive(Debug, Clone)]
pub struct DataConsumerOptions {
    pub data_producer_id: DataProducerId,
    pub ordered: Option<bool>,
    pub max_packet_life_time: Option<u16>,
    pub max_retransmits: Option<u16>,
    pub paused: bool,
    /// Subchannels to subscribe to, for direct consumers.
    pub subchannels: Option<Vec<u16>>,
    pub app_data: AppData,
}

impl DataConsumerOptions {
    pub fn new(data_producer_id: DataProducerId) -> Self {
        Self {
            data_producer_id,
            ordered: None,
            max_packet_life_time: None,
            max_retransmits: None,
            paused: false,
            subchannels: None,
            app_data: AppData::new(),
        }
    }
}

#[derive(Default)]
struct Handlers {
    buffered_amount_low: Bag<dyn Fn(u32) + Send + Sync>,
    sctp_send_buffer_full: Bag<dyn Fn() + Send + Sync>,
    data_producer_close: BagOnce<dyn FnOnce() + Send>,
    transport_close: BagOnce<dyn FnOnce() + Send>,
    close: BagOnce<dyn FnOnce() + Send>,
}

enum CloseReason {
    Explicit,
    DataProducerClosed,
    TransportClosed,
}

struct Inner {
    id: DataConsumerId,
    data_producer_id: DataProducerId,
    data_type: DataType,
    sctp_stream_parameters: Option<SctpStreamParameters>,
    label: String,
    protocol: String,
    transport_id: TransportId,
    channel: Channel,
    buffered_amount_low_threshold: AtomicU32,
    closed: AtomicBool,
    app_data: AppData,
    handlers: Handlers,
    internal_close: BagOnce<dyn FnOnce() + Send>,
    subscription: Mutex<Option<SubscriptionHandler>>,
}

pub(crate) struct DataConsumerParams {
    pub(crate) id: DataConsumerId,
    pub(crate) data_producer_id: DataProducerId,
    pub(crate) data_type: DataType,
    pub(crate) sctp_stream_parameters: Option<SctpStreamParameters>,
    pub(crate) label: String,
    pub(crate) protocol: String,
    pub(crate) transport_id: TransportId,
    pub(crate) channel: Channel,
    pub(crate) app_data: AppData,
}

/// Sink delivering one data producer's messages to an endpoint.
#[derive(Clone)]
pub struct DataConsumer {
    inner: Arc<Inner>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BufferedAmount {
    #[serde(default)]
    buffered_amount: u32,
}

impl DataConsumer {
    pub(crate) fn new(params: DataConsumerParams) -> Self {
        let inner = Arc::new(Inner {
            id: params.id,
            data_producer_id: params.data_producer_id,
            data_type: params.data_type,
            sctp_stream_parameters: params.sctp_stream_parameters,
            label: params.label,
            protocol: params.protocol,
            transport_id: params.transport_id,
            channel: params.channel,
            buffered_amount_low_threshold: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            app_data: params.app_data,
            handlers: Handlers::default(),
            internal_close: BagOnce::default(),
            subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let subscription = inner
            .channel
            .subscribe(inner.id.to_string(), move |notification| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_notification(notification);
                }
            });
        *inner.subscription.lock() = Some(subscription);

        Self { inner }
    }

    pub fn id(&self) -> DataConsumerId {
        self.inner.id
    }

    pub fn data_producer_id(&self) -> DataProducerId {
        self.inner.data_producer_id
    }

    pub fn data_type(&self) -> DataType {
        self.inner.data_type
    }

    /// Stream parameters with the stream id allocated by the transport.
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

    pub fn buffered_amount_low_threshold(&self) -> u32 {
        self.inner
            .buffered_amount_low_threshold
            .load(Ordering::SeqCst)
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
            Method::DataConsumerDump,
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
            Method::DataConsumerGetStats,
            self.inner.id.to_string(),
            None,
        )
        .await
    }

    /// Bytes queued in the SCTP send buffer.
    pub async fn get_buffered_amount(&self) -> Result<u32> {
        debug!("get_buffered_amount()");
        self.ensure_open()?;
        let response: BufferedAmount = request(
            &self.inner.channel,
            Method::DataConsumerGetBufferedAmount,
            self.inner.id.to_string(),
            None,
        )
        .await?;
        Ok(response.buffered_amount)
    }

    /// Threshold under which `buffered_amount_low` fires.
    pub async fn set_buffered_amount_low_threshold(&self, threshold: u32) -> Result<()> {
        debug!("set_buffered_amount_low_threshold() [threshold:{threshold}]");
        self.ensure_open()?;
        request_ignore(
            &self.inner.channel,
            Method::DataConsumerSetBufferedAmountLowThreshold,
            self.inner.id.to_string(),
            Some(json!({ "threshold": threshold })),
        )
        .await?;
        self.inner
            .buffered_amount_low_threshold
            .store(threshold, Ordering::SeqCst);
        Ok(())
    }

    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(data_consumer_id = %self.inner.id, "close()");

        request_in_background(
            &self.inner.channel,
            Method::TransportCloseDataConsumer,
            self.inner.transport_id.to_string(),
            Some(json!({ "dataConsumerId": self.inner.id })),
        );
        self.inner.finish_close(CloseReason::Explicit);
    }

    pub fn on_buffered_amount_low<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.inner.handlers.buffered_amount_low.add(Arc::new(callback))
    }

    pub fn on_sctp_send_buffer_full<F>(&self, callback: F) -> HandlerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .sctp_send_buffer_full
            .add(Arc::new(callback))
    }

    pub fn on_data_producer_close<F>(&self, callback: F) -> HandlerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.handlers.data_producer_close.add(Box::new(callback))
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
        debug!(data_consumer_id = %self.inner.id, "transport_closed()");
        self.inner.finish_close(CloseReason::TransportClosed);
    }

    pub(crate) fn downgrade(&self) -> WeakDataConsumer {
        WeakDataConsumer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed() {
            Err(Error::closed("data consumer"))
        } else {
            Ok(())
        }
    }
}

impl Inner {
    fn handle_notification(&self, notification: &Notification) {
        match notification.event {
            Event::DataConsumerDataProducerClose => {
                if self.closed.swap(true, Ordering::SeqCst) {
                    return;
                }
                debug!(data_consumer_id = %self.id, "data producer closed");
                self.finish_close(CloseReason::DataProducerClosed);
            }
            Event::DataConsumerBufferedAmountLow => {
                if let Some(BufferedAmount { buffered_amount }) = notification_data(notification) {
                    self.handlers
                        .buffered_amount_low
                        .call(|handler| handler(buffered_amount));
                }
            }
            Event::DataConsumerSctpSendBufferFull => {
                self.handlers.sctp_send_buffer_full.call(|handler| handler());
            }
            other => debug!(event = ?other, "ignoring unexpected data consumer notification"),
        }
    }

    fn finish_close(&self, reason: CloseReason) {
        self.subscription.lock().take();
        self.internal_close.call_simple();
        match reason {
            CloseReason::Explicit => {}
            CloseReason::DataProducerClosed => self.handlers.data_producer_close.call_simple(),
            CloseReason::TransportClosed => self.handlers.transport_close.call_simple(),
        }
        self.handlers.close.call_simple();
        self.handlers.buffered_amount_low.clear();
        self.handlers.sctp_send_buffer_full.clear();
    }
}

impl fmt::Debug for DataConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataConsumer")
            .field("id", &self.inner.id)
            .field("data_producer_id", &self.inner.data_producer_id)
            .field("data_type", &self.inner.data_type)
            .field("sctp_stream_parameters", &self.inner.sctp_stream_parameters)
            .field("closed", &self.closed())
            .finish()
    }
}

#[derive(Clone)]
pub(crate) struct WeakDataConsumer {
    inner: Weak<Inner>,
}

impl WeakDataConsumer {
    pub(crate) fn upgrade(&self) -> Option<DataConsumer> {
        self.inner.upgrade().map(|inner| DataConsumer { inner })
    }
}
