use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rtcplane_channel::{Channel, Event, Method, Notification, SubscriptionHandler};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::data_structures::{AppData, ProducerId, RouterId, RtpObserverId};
use crate::error::{Error, Result};
use crate::event::{Bag, BagOnce, HandlerId};
use crate::request::{notification_data, request_ignore, request_in_background};
use crate::router::producer::Producer;
use crate::router::ProducerLookup;

/// Options for [`Router::create_active_speaker_observer`](crate::router::Router::create_active_speaker_observer).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSpeakerObserverOptions {
    /// Interval in ms between dominant speaker checks.
    pub interval: u16,
    #[serde(skip)]
    pub app_data: AppData,
}

impl Default for ActiveSpeakerObserverOptions {
    fn default() -> Self {
        Self {
            interval: 300,
            app_data: AppData::new(),
        }
    }
}

/// Options for [`Router::create_audio_level_observer`](crate::router::Router::create_audio_level_observer).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioLevelObserverOptions {
    /// Maximum number of entries in a `volumes` event.
    pub max_entries: u16,
    /// Minimum average volume in dBvo, from -127 to 0.
    pub threshold: i8,
    /// Interval in ms between volume checks.
    pub interval: u16,
    #[serde(skip)]
    pub app_data: AppData,
}

impl Default for AudioLevelObserverOptions {
    fn default() -> Self {
        Self {
            max_entries: 1,
            threshold: -80,
            interval: 1000,
            app_data: AppData::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpObserverKind {
    ActiveSpeaker,
    AudioLevel,
}

/// Audio level of one producer in a `volumes` event.
#[derive(Debug, Clone)]
pub struct AudioLevelVolume {
    pub producer: Producer,
    /// Average volume in dBvo.
    pub volume: i8,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DominantSpeaker {
    producer_id: ProducerId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Volume {
    producer_id: ProducerId,
    volume: i8,
}

#[derive(Default)]
struct Handlers {
    pause: Bag<dyn Fn() + Send + Sync>,
    resume: Bag<dyn Fn() + Send + Sync>,
    add_producer: Bag<dyn Fn(&Producer) + Send + Sync>,
    remove_producer: Bag<dyn Fn(&Producer) + Send + Sync>,
    dominant_speaker: Bag<dyn Fn(&Producer) + Send + Sync>,
    volumes: Bag<dyn Fn(&[AudioLevelVolume]) + Send + Sync>,
    silence: Bag<dyn Fn() + Send + Sync>,
    router_close: BagOnce<dyn FnOnce() + Send>,
    close: BagOnce<dyn FnOnce() + Send>,
}

struct Inner {
    id: RtpObserverId,
    kind: RtpObserverKind,
    router_id: RouterId,
    channel: Channel,
    get_producer: ProducerLookup,
    paused: AtomicBool,
    closed: AtomicBool,
    app_data: AppData,
    handlers: Handlers,
    internal_close: BagOnce<dyn FnOnce() + Send>,
    subscription: Mutex<Option<SubscriptionHandler>>,
}

pub(crate) struct RtpObserverParams {
    pub(crate) id: RtpObserverId,
    pub(crate) kind: RtpObserverKind,
    pub(crate) router_id: RouterId,
    pub(crate) channel: Channel,
    pub(crate) get_producer: ProducerLookup,
    pub(crate) app_data: AppData,
}

/// Watches audio producers of a router: dominant speaker or audio levels.
#[derive(Clone)]
pub struct RtpObserver {
    inner: Arc<Inner>,
}

impl RtpObserver {
    pub(crate) fn new(params: RtpObserverParams) -> Self {
        let inner = Arc::new(Inner {
            id: params.id,
            kind: params.kind,
            router_id: params.router_id,
            channel: params.channel,
            get_producer: params.get_producer,
            paused: AtomicBool::new(false),
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

    pub fn id(&self) -> RtpObserverId {
        self.inner.id
    }

    pub fn kind(&self) -> RtpObserverKind {
        self.inner.kind
    }

    pub fn router_id(&self) -> RouterId {
        self.inner.router_id
    }

    pub fn paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn app_data(&self) -> &AppData {
        &self.inner.app_data
    }

    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub async fn pause(&self) -> Result<()> {
        debug!("pause()");
        self.ensure_open()?;
        request_ignore(
            &self.inner.channel,
            Method::RtpObserverPause,
            self.inner.id.to_string(),
            None,
        )
        .await?;

        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            self.inner.handlers.pause.call(|handler| handler());
        }
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        debug!("resume()");
        self.ensure_open()?;
        request_ignore(
            &self.inner.channel,
            Method::RtpObserverResume,
            self.inner.id.to_string(),
            None,
        )
        .await?;

        if self.inner.paused.swap(false, Ordering::SeqCst) {
            self.inner.handlers.resume.call(|handler| handler());
        }
        Ok(())
    }

    /// Start observing a producer of the same router.
    pub async fn add_producer(&self, producer_id: ProducerId) -> Result<()> {
        debug!("add_producer()");
        self.ensure_open()?;
        let producer = self.lookup(producer_id)?;
        request_ignore(
            &self.inner.channel,
            Method::RtpObserverAddProducer,
            self.inner.id.to_string(),
            Some(json!({ "producerId": producer_id })),
        )
        .await?;

        self.inner
            .handlers
            .add_producer
            .call(|handler| handler(&producer));
        Ok(())
    }

    pub async fn remove_producer(&self, producer_id: ProducerId) -> Result<()> {
        debug!("remove_producer()");
        self.ensure_open()?;
        let producer = self.lookup(producer_id)?;
        request_ignore(
            &self.inner.channel,
            Method::RtpObserverRemoveProducer,
            self.inner.id.to_string(),
            Some(json!({ "producerId": producer_id })),
        )
        .await?;

        self.inner
            .handlers
            .remove_producer
            .call(|handler| handler(&producer));
        Ok(())
    }

    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(rtp_observer_id = %self.inner.id, "close()");

        request_in_background(
            &self.inner.channel,
            Method::RouterCloseRtpObserver,
            self.inner.router_id.to_string(),
            Some(json!({ "rtpObserverId": self.inner.id })),
        );
        self.inner.finish_close(false);
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

    pub fn on_add_producer<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&Producer) + Send + Sync + 'static,
    {
        self.inner.handlers.add_producer.add(Arc::new(callback))
    }

    pub fn on_remove_producer<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&Producer) + Send + Sync + 'static,
    {
        self.inner.handlers.remove_producer.add(Arc::new(callback))
    }

    /// Active speaker observers only.
    pub fn on_dominant_speaker<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&Producer) + Send + Sync + 'static,
    {
        self.inner.handlers.dominant_speaker.add(Arc::new(callback))
    }

    /// Audio level observers only. Entries are ordered loudest first.
    pub fn on_volumes<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&[AudioLevelVolume]) + Send + Sync + 'static,
    {
        self.inner.handlers.volumes.add(Arc::new(callback))
    }

    /// Audio level observers only.
    pub fn on_silence<F>(&self, callback: F) -> HandlerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.handlers.silence.add(Arc::new(callback))
    }

    pub fn on_router_close<F>(&self, callback: F) -> HandlerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.handlers.router_close.add(Box::new(callback))
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

    pub(crate) fn router_closed(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(rtp_observer_id = %self.inner.id, "router_closed()");
        self.inner.finish_close(true);
    }

    fn lookup(&self, producer_id: ProducerId) -> Result<Producer> {
        (self.inner.get_producer)(&producer_id).ok_or_else(|| Error::NotFound {
            kind: "producer",
            id: producer_id.to_string(),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed() {
            Err(Error::closed("rtp observer"))
        } else {
            Ok(())
        }
    }
}

impl Inner {
    fn handle_notification(&self, notification: &Notification) {
        match notification.event {
            Event::ActiveSpeakerObserverDominantSpeaker => {
                let Some(DominantSpeaker { producer_id }) = notification_data(notification) else {
                    return;
                };
                match (self.get_producer)(&producer_id) {
                    Some(producer) => self
                        .handlers
                        .dominant_speaker
                        .call(|handler| handler(&producer)),
                    None => debug!(%producer_id, "dominant speaker is not a known producer"),
                }
            }
            Event::AudioLevelObserverVolumes => {
                let Some(volumes) = notification_data::<Vec<Volume>>(notification) else {
                    return;
                };
                let volumes: Vec<AudioLevelVolume> = volumes
                    .into_iter()
                    .filter_map(|Volume { producer_id, volume }| {
                        (self.get_producer)(&producer_id)
                            .map(|producer| AudioLevelVolume { producer, volume })
                    })
                    .collect();
                if !volumes.is_empty() {
                    self.handlers.volumes.call(|handler| handler(&volumes));
                }
            }
            Event::AudioLevelObserverSilence => {
                self.handlers.silence.call(|handler| handler());
            }
            other => debug!(event = ?other, "ignoring unexpected rtp observer notification"),
        }
    }

    fn finish_close(&self, router_closed: bool) {
        self.subscription.lock().take();
        self.internal_close.call_simple();
        if router_closed {
            self.handlers.router_close.call_simple();
        }
        self.handlers.close.call_simple();
        self.handlers.pause.clear();
        self.handlers.resume.clear();
        self.handlers.add_producer.clear();
        self.handlers.remove_producer.clear();
        self.handlers.dominant_speaker.clear();
        self.handlers.volumes.clear();
        self.handlers.silence.clear();
    }
}

impl fmt::Debug for RtpObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpObserver")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("paused", &self.paused())
            .field("closed", &self.closed())
            .finish()
    }
}
