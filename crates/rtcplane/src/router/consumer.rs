use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rtcplane_channel::{Channel, Event, Method, Notification, SubscriptionHandler};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::data_structures::{
    AppData, ConsumerId, ConsumerLayers, ConsumerScore, MediaTraceEventType, ProducerId,
    RtpStreamType, TransportId,
};
use crate::error::{Error, Result};
use crate::event::{Bag, BagOnce, HandlerId};
use crate::request::{
    notification_data, request, request_ignore, request_in_background, request_raw,
};
use crate::rtp_parameters::{MediaKind, RtpCapabilities, RtpParameters};

/// Options for [`Transport::consume`](crate::router::transport::Transport::consume).
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub producer_id: ProducerId,
    /// What the receiving endpoint can decode. Ignored on pipe transports.
    pub rtp_capabilities: RtpCapabilities,
    /// Start paused; resume once the remote side is ready to receive.
    pub paused: bool,
    /// MID for the consumer. Assigned by the transport when absent.
    pub mid: Option<String>,
    pub preferred_layers: Option<ConsumerLayers>,
    /// Forward DTX packets untouched instead of dropping them.
    pub ignore_dtx: bool,
    /// Keep every producer encoding, as a pipe consumer does.
    pub pipe: bool,
    pub app_data: AppData,
}

impl ConsumerOptions {
    pub fn new(producer_id: ProducerId, rtp_capabilities: RtpCapabilities) -> Self {
        Self {
            producer_id,
            rtp_capabilities,
            paused: false,
            mid: None,
            preferred_layers: None,
            ignore_dtx: false,
            pipe: false,
            app_data: AppData::new(),
        }
    }
}

#[derive(Default)]
struct Handlers {
    pause: Bag<dyn Fn() + Send + Sync>,
    resume: Bag<dyn Fn() + Send + Sync>,
    producer_pause: Bag<dyn Fn() + Send + Sync>,
    producer_resume: Bag<dyn Fn() + Send + Sync>,
    score: Bag<dyn Fn(&ConsumerScore) + Send + Sync>,
    layers_change: Bag<dyn Fn(Option<ConsumerLayers>) + Send + Sync>,
    trace: Bag<dyn Fn(&Value) + Send + Sync>,
    producer_close: BagOnce<dyn FnOnce() + Send>,
    transport_close: BagOnce<dyn FnOnce() + Send>,
    close: BagOnce<dyn FnOnce() + Send>,
}

impl Handlers {
    fn clear(&self) {
        self.pause.clear();
        self.resume.clear();
        self.producer_pause.clear();
        self.producer_resume.clear();
        self.score.clear();
        self.layers_change.clear();
        self.trace.clear();
    }
}

#[derive(Debug, Clone)]
struct State {
    paused: bool,
    producer_paused: bool,
    priority: u8,
    score: ConsumerScore,
    preferred_layers: Option<ConsumerLayers>,
    current_layers: Option<ConsumerLayers>,
}

enum CloseReason {
    Explicit,
    ProducerClosed,
    TransportClosed,
}

struct Inner {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    stream_type: RtpStreamType,
    rtp_parameters: RtpParameters,
    transport_id: TransportId,
    channel: Channel,
    state: Mutex<State>,
    closed: AtomicBool,
    app_data: AppData,
    handlers: Handlers,
    internal_close: BagOnce<dyn FnOnce() + Send>,
    subscription: Mutex<Option<SubscriptionHandler>>,
}

pub(crate) struct ConsumerParams {
    pub(crate) id: ConsumerId,
    pub(crate) producer_id: ProducerId,
    pub(crate) kind: MediaKind,
    pub(crate) stream_type: RtpStreamType,
    pub(crate) rtp_parameters: RtpParameters,
    pub(crate) transport_id: TransportId,
    pub(crate) channel: Channel,
    pub(crate) paused: bool,
    pub(crate) producer_paused: bool,
    pub(crate) score: ConsumerScore,
    pub(crate) preferred_layers: Option<ConsumerLayers>,
    pub(crate) app_data: AppData,
}

/// Media sink forwarding one producer to an endpoint through a transport.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<Inner>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriorityResponse {
    priority: u8,
}

#[derive(Deserialize)]
struct LayersChange(Option<ConsumerLayers>);

impl Consumer {
    pub(crate) fn new(params: ConsumerParams) -> Self {
        let inner = Arc::new(Inner {
            id: params.id,
            producer_id: params.producer_id,
            kind: params.kind,
            stream_type: params.stream_type,
            rtp_parameters: params.rtp_parameters,
            transport_id: params.transport_id,
            channel: params.channel,
            state: Mutex::new(State {
                paused: params.paused,
                producer_paused: params.producer_paused,
                priority: 1,
                score: params.score,
                preferred_layers: params.preferred_layers,
                current_layers: None,
            }),
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

    pub fn id(&self) -> ConsumerId {
        self.inner.id
    }

    pub fn producer_id(&self) -> ProducerId {
        self.inner.producer_id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn stream_type(&self) -> RtpStreamType {
        self.inner.stream_type
    }

    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.inner.rtp_parameters
    }

    pub fn mid(&self) -> Option<&str> {
        self.inner.rtp_parameters.mid.as_deref()
    }

    pub fn transport_id(&self) -> TransportId {
        self.inner.transport_id
    }

    pub fn paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    pub fn producer_paused(&self) -> bool {
        self.inner.state.lock().producer_paused
    }

    pub fn priority(&self) -> u8 {
        self.inner.state.lock().priority
    }

    pub fn score(&self) -> ConsumerScore {
        self.inner.state.lock().score.clone()
    }

    pub fn preferred_layers(&self) -> Option<ConsumerLayers> {
        self.inner.state.lock().preferred_layers
    }

    pub fn current_layers(&self) -> Option<ConsumerLayers> {
        self.inner.state.lock().current_layers
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
        request_raw(&self.inner.channel, Method::ConsumerDump, self.handler_id(), None).await
    }

    pub async fn get_stats(&self) -> Result<Value> {
        debug!("get_stats()");
        self.ensure_open()?;
        request_raw(&self.inner.channel, Method::ConsumerGetStats, self.handler_id(), None).await
    }

    pub async fn pause(&self) -> Result<()> {
        debug!("pause()");
        self.ensure_open()?;
        request_ignore(&self.inner.channel, Method::ConsumerPause, self.handler_id(), None).await?;

        let emit = {
            let mut state = self.inner.state.lock();
            let was_paused = state.paused;
            state.paused = true;
            !was_paused && !state.producer_paused
        };
        if emit {
            self.inner.handlers.pause.call(|handler| handler());
        }
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        debug!("resume()");
        self.ensure_open()?;
        request_ignore(&self.inner.channel, Method::ConsumerResume, self.handler_id(), None).await?;

        let emit = {
            let mut state = self.inner.state.lock();
            let was_paused = state.paused;
            state.paused = false;
            was_paused && !state.producer_paused
        };
        if emit {
            self.inner.handlers.resume.call(|handler| handler());
        }
        Ok(())
    }

    /// Select the simulcast or SVC layers to forward. The worker answers
    /// with the layers it actually accepted.
    pub async fn set_preferred_layers(&self, layers: ConsumerLayers) -> Result<()> {
        debug!("set_preferred_layers()");
        self.ensure_open()?;
        let value = request_raw(
            &self.inner.channel,
            Method::ConsumerSetPreferredLayers,
            self.handler_id(),
            Some(json!(layers)),
        )
        .await?;

        let accepted = match value {
            Value::Null => None,
            value => Some(
                serde_json::from_value::<ConsumerLayers>(value)
                    .map_err(|err| Error::InvalidResponse(err.to_string()))?,
            ),
        };
        self.inner.state.lock().preferred_layers = accepted;
        Ok(())
    }

    /// Priority used when distributing the available outgoing bitrate,
    /// from 1 (default) upwards.
    pub async fn set_priority(&self, priority: u8) -> Result<()> {
        debug!("set_priority()");
        self.ensure_open()?;
        let response: PriorityResponse = request(
            &self.inner.channel,
            Method::ConsumerSetPriority,
            self.handler_id(),
            Some(json!({ "priority": priority })),
        )
        .await?;
        self.inner.state.lock().priority = response.priority;
        Ok(())
    }

    pub async fn unset_priority(&self) -> Result<()> {
        self.set_priority(1).await
    }

    pub async fn request_key_frame(&self) -> Result<()> {
        debug!("request_key_frame()");
        self.ensure_open()?;
        request_ignore(
            &self.inner.channel,
            Method::ConsumerRequestKeyFrame,
            self.handler_id(),
            None,
        )
        .await
    }

    pub async fn enable_trace_event(&self, types: Vec<MediaTraceEventType>) -> Result<()> {
        debug!("enable_trace_event()");
        self.ensure_open()?;
        request_ignore(
            &self.inner.channel,
            Method::ConsumerEnableTraceEvent,
            self.handler_id(),
            Some(json!({ "types": types })),
        )
        .await
    }

    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(consumer_id = %self.inner.id, "close()");

        request_in_background(
            &self.inner.channel,
            Method::TransportCloseConsumer,
            self.inner.transport_id.to_string(),
            Some(json!({ "consumerId": self.inner.id })),
        );
        self.inner.finish_close(CloseReason::Explicit);
    }

    /// Observer pause: fires when the consumer or its producer pauses
    /// while the other side was still flowing.
    pub fn on_pause<F>(&self, callback: F) -> HandlerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.handlers.pause.add(Arc::new(callback))
    }

    pub fn on_resume<F>(&self, callback: F) -> HandlerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.handlers.resume.add(Arc::new(callback))
    }

    pub fn on_producer_pause<F>(&self, callback: F) -> HandlerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.handlers.producer_pause.add(Arc::new(callback))
    }

    pub fn on_producer_resume<F>(&self, callback: F) -> HandlerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.handlers.producer_resume.add(Arc::new(callback))
    }

    pub fn on_score<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&ConsumerScore) + Send + Sync + 'static,
    {
        self.inner.handlers.score.add(Arc::new(callback))
    }

    pub fn on_layers_change<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(Option<ConsumerLayers>) + Send + Sync + 'static,
    {
        self.inner.handlers.layers_change.add(Arc::new(callback))
    }

    pub fn on_trace<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.handlers.trace.add(Arc::new(callback))
    }

    pub fn on_producer_close<F>(&self, callback: F) -> HandlerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.handlers.producer_close.add(Box::new(callback))
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
        debug!(consumer_id = %self.inner.id, "transport_closed()");
        self.inner.finish_close(CloseReason::TransportClosed);
    }

    pub(crate) fn downgrade(&self) -> WeakConsumer {
        WeakConsumer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed() {
            Err(Error::closed("consumer"))
        } else {
            Ok(())
        }
    }

    fn handler_id(&self) -> String {
        self.inner.id.to_string()
    }
}

impl Inner {
    fn handle_notification(&self, notification: &Notification) {
        match notification.event {
            Event::ConsumerProducerClose => {
                if self.closed.swap(true, Ordering::SeqCst) {
                    return;
                }
                debug!(consumer_id = %self.id, "producer closed");
                self.finish_close(CloseReason::ProducerClosed);
            }
            Event::ConsumerProducerPause => {
                let emit_pause = {
                    let mut state = self.state.lock();
                    if state.producer_paused {
                        return;
                    }
                    state.producer_paused = true;
                    !state.paused
                };
                self.handlers.producer_pause.call(|handler| handler());
                if emit_pause {
                    self.handlers.pause.call(|handler| handler());
                }
            }
            Event::ConsumerProducerResume => {
                let emit_resume = {
                    let mut state = self.state.lock();
                    if !state.producer_paused {
                        return;
                    }
                    state.producer_paused = false;
                    !state.paused
                };
                self.handlers.producer_resume.call(|handler| handler());
                if emit_resume {
                    self.handlers.resume.call(|handler| handler());
                }
            }
            Event::ConsumerScore => {
                if let Some(score) = notification_data::<ConsumerScore>(notification) {
                    self.state.lock().score = score.clone();
                    self.handlers.score.call(|handler| handler(&score));
                }
            }
            Event::ConsumerLayersChange => {
                if let Some(LayersChange(layers)) = notification_data(notification) {
                    self.state.lock().current_layers = layers;
                    self.handlers.layers_change.call(|handler| handler(layers));
                }
            }
            Event::ConsumerTrace => {
                let trace = notification.data.clone().unwrap_or(Value::Null);
                self.handlers.trace.call(|handler| handler(&trace));
            }
            other => debug!(event = ?other, "ignoring unexpected consumer notification"),
        }
    }

    fn finish_close(&self, reason: CloseReason) {
        self.subscription.lock().take();
        self.internal_close.call_simple();
        match reason {
            CloseReason::Explicit => {}
            CloseReason::ProducerClosed => self.handlers.producer_close.call_simple(),
            CloseReason::TransportClosed => self.handlers.transport_close.call_simple(),
        }
        self.handlers.close.call_simple();
        self.handlers.clear();
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.inner.id)
            .field("producer_id", &self.inner.producer_id)
            .field("kind", &self.inner.kind)
            .field("stream_type", &self.inner.stream_type)
            .field("state", &*self.inner.state.lock())
            .field("closed", &self.closed())
            .finish()
    }
}

#[derive(Clone)]
pub(crate) struct WeakConsumer {
    inner: Weak<Inner>,
}

impl WeakConsumer {
    pub(crate) fn upgrade(&self) -> Option<Consumer> {
        self.inner.upgrade().map(|inner| Consumer { inner })
    }
}
