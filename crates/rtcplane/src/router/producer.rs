use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rtcplane_channel::{Channel, Event, Method, Notification, SubscriptionHandler};
use serde_json::{json, Value};
use tracing::debug;

use crate::data_structures::{
    AppData, MediaTraceEventType, ProducerId, ProducerScore, RtpStreamType, TransportId,
    VideoOrientation,
};
use crate::error::{Error, Result};
use crate::event::{Bag, BagOnce, HandlerId};
use crate::request::{notification_data, request_ignore, request_in_background, request_raw};
use crate::rtp_parameters::{MediaKind, RtpParameters};

/// Options for [`Transport::produce`](crate::router::transport::Transport::produce).
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    /// Forced producer id. Only useful when mirroring a producer of
    /// another router.
    pub id: Option<ProducerId>,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
    /// Delay in milliseconds before forwarding a key frame request to the
    /// endpoint. Zero disables the delay.
    pub key_frame_request_delay: u32,
    pub app_data: AppData,
}

impl ProducerOptions {
    pub fn new(kind: MediaKind, rtp_parameters: RtpParameters) -> Self {
        Self {
            id: None,
            kind,
            rtp_parameters,
            paused: false,
            key_frame_request_delay: 0,
            app_data: AppData::new(),
        }
    }
}

#[derive(Default)]
struct Handlers {
    score: Bag<dyn Fn(&[ProducerScore]) + Send + Sync>,
    video_orientation_change: Bag<dyn Fn(VideoOrientation) + Send + Sync>,
    pause: Bag<dyn Fn() + Send + Sync>,
    resume: Bag<dyn Fn() + Send + Sync>,
    trace: Bag<dyn Fn(&Value) + Send + Sync>,
    transport_close: BagOnce<dyn FnOnce() + Send>,
    close: BagOnce<dyn FnOnce() + Send>,
}

impl Handlers {
    fn clear(&self) {
        self.score.clear();
        self.video_orientation_change.clear();
        self.pause.clear();
        self.resume.clear();
        self.trace.clear();
    }
}

struct Inner {
    id: ProducerId,
    kind: MediaKind,
    stream_type: RtpStreamType,
    rtp_parameters: RtpParameters,
    consumable_rtp_parameters: RtpParameters,
    transport_id: TransportId,
    channel: Channel,
    paused: AtomicBool,
    score: Mutex<Vec<ProducerScore>>,
    closed: AtomicBool,
    app_data: AppData,
    handlers: Handlers,
    internal_close: BagOnce<dyn FnOnce() + Send>,
    subscription: Mutex<Option<SubscriptionHandler>>,
}

pub(crate) struct ProducerParams {
    pub(crate) id: ProducerId,
    pub(crate) kind: MediaKind,
    pub(crate) stream_type: RtpStreamType,
    pub(crate) rtp_parameters: RtpParameters,
    pub(crate) consumable_rtp_parameters: RtpParameters,
    pub(crate) paused: bool,
    pub(crate) transport_id: TransportId,
    pub(crate) channel: Channel,
    pub(crate) app_data: AppData,
}

/// Media source injected into a router through a transport.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<Inner>,
}

impl Producer {
    pub(crate) fn new(params: ProducerParams) -> Self {
        let inner = Arc::new(Inner {
            id: params.id,
            kind: params.kind,
            stream_type: params.stream_type,
            rtp_parameters: params.rtp_parameters,
            consumable_rtp_parameters: params.consumable_rtp_parameters,
            transport_id: params.transport_id,
            channel: params.channel,
            paused: AtomicBool::new(params.paused),
            score: Mutex::new(Vec::new()),
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

    pub fn id(&self) -> ProducerId {
        self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn stream_type(&self) -> RtpStreamType {
        self.inner.stream_type
    }

    /// Parameters as given by the endpoint, after CNAME normalization.
    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.inner.rtp_parameters
    }

    /// Parameters every consumer of this producer is derived from.
    pub fn consumable_rtp_parameters(&self) -> &RtpParameters {
        &self.inner.consumable_rtp_parameters
    }

    pub fn transport_id(&self) -> TransportId {
        self.inner.transport_id
    }

    pub fn paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Latest score per encoding, as last reported by the worker.
    pub fn score(&self) -> Vec<ProducerScore> {
        self.inner.score.lock().clone()
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
        request_raw(&self.inner.channel, Method::ProducerDump, self.handler_id(), None).await
    }

    pub async fn get_stats(&self) -> Result<Value> {
        debug!("get_stats()");
        self.ensure_open()?;
        request_raw(&self.inner.channel, Method::ProducerGetStats, self.handler_id(), None).await
    }

    pub async fn pause(&self) -> Result<()> {
        debug!("pause()");
        self.ensure_open()?;
        request_ignore(&self.inner.channel, Method::ProducerPause, self.handler_id(), None).await?;

        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            self.inner.handlers.pause.call(|handler| handler());
        }
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        debug!("resume()");
        self.ensure_open()?;
        request_ignore(&self.inner.channel, Method::ProducerResume, self.handler_id(), None).await?;

        if self.inner.paused.swap(false, Ordering::SeqCst) {
            self.inner.handlers.resume.call(|handler| handler());
        }
        Ok(())
    }

    /// Ask the worker to emit `trace` events of the given types. An empty
    /// list disables tracing.
    pub async fn enable_trace_event(&self, types: Vec<MediaTraceEventType>) -> Result<()> {
        debug!("enable_trace_event()");
        self.ensure_open()?;
        request_ignore(
            &self.inner.channel,
            Method::ProducerEnableTraceEvent,
            self.handler_id(),
            Some(json!({ "types": types })),
        )
        .await
    }

    /// Close the producer. Consumers of it are closed by the worker.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(producer_id = %self.inner.id, "close()");

        request_in_background(
            &self.inner.channel,
            Method::TransportCloseProducer,
            self.inner.transport_id.to_string(),
            Some(json!({ "producerId": self.inner.id })),
        );
        self.inner.finish_close(false);
    }

    pub fn on_score<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&[ProducerScore]) + Send + Sync + 'static,
    {
        self.inner.handlers.score.add(Arc::new(callback))
    }

    pub fn on_video_orientation_change<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(VideoOrientation) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .video_orientation_change
            .add(Arc::new(callback))
    }

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

    pub fn on_trace<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.handlers.trace.add(Arc::new(callback))
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

    /// The owning transport closed; no request is sent.
    pub(crate) fn transport_closed(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(producer_id = %self.inner.id, "transport_closed()");
        self.inner.finish_close(true);
    }

    pub(crate) fn downgrade(&self) -> WeakProducer {
        WeakProducer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed() {
            Err(Error::closed("producer"))
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
            Event::ProducerScore => {
                if let Some(score) = notification_data::<Vec<ProducerScore>>(notification) {
                    *self.score.lock() = score.clone();
                    self.handlers.score.call(|handler| handler(&score));
                }
            }
            Event::ProducerVideoOrientationChange => {
                if let Some(orientation) = notification_data::<VideoOrientation>(notification) {
                    self.handlers
                        .video_orientation_change
                        .call(|handler| handler(orientation));
                }
            }
            Event::ProducerTrace => {
                let trace = notification.data.clone().unwrap_or(Value::Null);
                self.handlers.trace.call(|handler| handler(&trace));
            }
            other => debug!(event = ?other, "ignoring unexpected producer notification"),
        }
    }

    fn finish_close(&self, transport_closed: bool) {
        self.subscription.lock().take();
        self.internal_close.call_simple();
        if transport_closed {
            self.handlers.transport_close.call_simple();
        }
        self.handlers.close.call_simple();
        self.handlers.clear();
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("stream_type", &self.inner.stream_type)
            .field("paused", &self.paused())
            .field("closed", &self.closed())
            .finish()
    }
}

/// Non-owning handle, used where a strong one would form a cycle.
#[derive(Clone)]
pub(crate) struct WeakProducer {
    inner: Weak<Inner>,
}

impl WeakProducer {
    pub(crate) fn upgrade(&self) -> Option<Producer> {
        self.inner.upgrade().map(|inner| Producer { inner })
    }
}
