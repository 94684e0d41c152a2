//! Routers and everything that hangs off them.
//!
//! A [`Router`] owns its transports and RTP observers. Producers and data
//! producers are owned by their transport; the router only indexes them
//! (weakly) so that consumers on any of its transports can find them.

pub(crate) mod allocators;
pub mod consumer;
pub mod data_consumer;
pub mod data_producer;
mod pipe;
pub mod producer;
pub mod rtp_observer;
pub mod transport;

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rtcplane_channel::{Channel, Method};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::data_structures::{
    AppData, DataProducerId, ListenInfo, ProducerId, RouterId, RtpObserverId, TransportId,
};
use crate::error::{Error, Result};
use crate::event::{Bag, BagOnce, HandlerId};
use crate::ortc::RtpNegotiation;
use crate::request::{body, request, request_ignore, request_in_background, request_raw};
use crate::rtp_parameters::{RtpCapabilities, RtpCodecCapability};
use crate::sctp_parameters::NumSctpStreams;

use self::consumer::Consumer;
use self::data_consumer::DataConsumer;
use self::data_producer::{DataProducer, WeakDataProducer};
use self::pipe::PipeCacheEntry;
use self::producer::{Producer, WeakProducer};
use self::rtp_observer::{
    ActiveSpeakerObserverOptions, AudioLevelObserverOptions, RtpObserver, RtpObserverKind,
    RtpObserverParams,
};
use self::transport::{
    DirectTransportOptions, PipeTransportOptions, PlainTransportOptions, RouterLink, Transport,
    TransportData, TransportKind, WebRtcTransportOptions,
};

pub(crate) type ProducerLookup = Arc<dyn Fn(&ProducerId) -> Option<Producer> + Send + Sync>;
pub(crate) type DataProducerLookup =
    Arc<dyn Fn(&DataProducerId) -> Option<DataProducer> + Send + Sync>;

/// Options for [`Worker::create_router`](crate::Worker::create_router).
#[derive(Debug, Clone, Default)]
pub struct RouterOptions {
    pub media_codecs: Vec<RtpCodecCapability>,
    pub app_data: AppData,
}

impl RouterOptions {
    pub fn new(media_codecs: Vec<RtpCodecCapability>) -> Self {
        Self {
            media_codecs,
            app_data: AppData::new(),
        }
    }
}

/// Options for [`Router::pipe_producer_to_router`] and
/// [`Router::pipe_data_producer_to_router`].
#[derive(Debug, Clone)]
pub struct PipeToRouterOptions {
    /// Destination router. Must differ from the source router.
    pub router: Router,
    /// Address both pipe transports listen on.
    pub listen_info: ListenInfo,
    pub enable_sctp: bool,
    pub num_sctp_streams: NumSctpStreams,
    pub enable_rtx: bool,
    pub enable_srtp: bool,
}

impl PipeToRouterOptions {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            listen_info: ListenInfo::udp(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            enable_sctp: true,
            num_sctp_streams: NumSctpStreams::default(),
            enable_rtx: false,
            enable_srtp: false,
        }
    }
}

/// Result of [`Router::pipe_producer_to_router`].
#[derive(Debug, Clone)]
pub struct PipeProducerToRouterPair {
    /// Consumer of the source producer on the local pipe transport.
    pub pipe_consumer: Consumer,
    /// Producer with the source producer's id on the destination router.
    pub pipe_producer: Producer,
}

/// Result of [`Router::pipe_data_producer_to_router`].
#[derive(Debug, Clone)]
pub struct PipeDataProducerToRouterPair {
    pub pipe_data_consumer: DataConsumer,
    pub pipe_data_producer: DataProducer,
}

#[derive(Default)]
struct Handlers {
    new_transport: Bag<dyn Fn(&Transport) + Send + Sync>,
    new_rtp_observer: Bag<dyn Fn(&RtpObserver) + Send + Sync>,
    worker_close: BagOnce<dyn FnOnce() + Send>,
    close: BagOnce<dyn FnOnce() + Send>,
}

struct Inner {
    id: RouterId,
    rtp_capabilities: Arc<RtpCapabilities>,
    negotiation: Arc<dyn RtpNegotiation>,
    channel: Channel,
    transports: Mutex<HashMap<TransportId, Transport>>,
    rtp_observers: Mutex<HashMap<RtpObserverId, RtpObserver>>,
    producers: Arc<Mutex<HashMap<ProducerId, WeakProducer>>>,
    data_producers: Arc<Mutex<HashMap<DataProducerId, WeakDataProducer>>>,
    /// In-flight or established pipe transport pairs, keyed by peer router.
    pipe_pairs: Mutex<HashMap<RouterId, PipeCacheEntry>>,
    closed: AtomicBool,
    app_data: AppData,
    handlers: Handlers,
    internal_close: BagOnce<dyn FnOnce() + Send>,
}

pub(crate) struct RouterParams {
    pub(crate) id: RouterId,
    pub(crate) rtp_capabilities: RtpCapabilities,
    pub(crate) negotiation: Arc<dyn RtpNegotiation>,
    pub(crate) channel: Channel,
    pub(crate) app_data: AppData,
}

/// A media routing context inside the worker.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

impl Router {
    pub(crate) fn new(params: RouterParams) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: params.id,
                rtp_capabilities: Arc::new(params.rtp_capabilities),
                negotiation: params.negotiation,
                channel: params.channel,
                transports: Mutex::new(HashMap::new()),
                rtp_observers: Mutex::new(HashMap::new()),
                producers: Arc::default(),
                data_producers: Arc::default(),
                pipe_pairs: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                app_data: params.app_data,
                handlers: Handlers::default(),
                internal_close: BagOnce::default(),
            }),
        }
    }

    pub fn id(&self) -> RouterId {
        self.inner.id
    }

    /// Codecs and header extensions endpoints may use with this router.
    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.inner.rtp_capabilities
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
            Method::RouterDump,
            self.inner.id.to_string(),
            None,
        )
        .await
    }

    pub async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Transport> {
        debug!("create_webrtc_transport()");
        if options.listen_infos.is_empty() {
            return Err(Error::TypeValidation("empty listen_infos".to_owned()));
        }
        let app_data = options.app_data.clone();
        self.create_transport(TransportKind::WebRtc, &options, app_data)
            .await
    }

    pub async fn create_plain_transport(&self, options: PlainTransportOptions) -> Result<Transport> {
        debug!("create_plain_transport()");
        let app_data = options.app_data.clone();
        self.create_transport(TransportKind::Plain, &options, app_data)
            .await
    }

    pub async fn create_pipe_transport(&self, options: PipeTransportOptions) -> Result<Transport> {
        debug!("create_pipe_transport()");
        let app_data = options.app_data.clone();
        self.create_transport(TransportKind::Pipe, &options, app_data)
            .await
    }

    pub async fn create_direct_transport(
        &self,
        options: DirectTransportOptions,
    ) -> Result<Transport> {
        debug!("create_direct_transport()");
        let app_data = options.app_data.clone();
        self.create_transport(TransportKind::Direct, &options, app_data)
            .await
    }

    pub async fn create_active_speaker_observer(
        &self,
        options: ActiveSpeakerObserverOptions,
    ) -> Result<RtpObserver> {
        debug!("create_active_speaker_observer()");
        let app_data = options.app_data.clone();
        self.create_rtp_observer(
            RtpObserverKind::ActiveSpeaker,
            Method::RouterCreateActiveSpeakerObserver,
            &options,
            app_data,
        )
        .await
    }

    pub async fn create_audio_level_observer(
        &self,
        options: AudioLevelObserverOptions,
    ) -> Result<RtpObserver> {
        debug!("create_audio_level_observer()");
        if !(-127..=0).contains(&options.threshold) {
            return Err(Error::TypeValidation(format!(
                "threshold {} outside -127..=0",
                options.threshold
            )));
        }
        if options.max_entries == 0 {
            return Err(Error::TypeValidation("max_entries must be at least 1".to_owned()));
        }
        let app_data = options.app_data.clone();
        self.create_rtp_observer(
            RtpObserverKind::AudioLevel,
            Method::RouterCreateAudioLevelObserver,
            &options,
            app_data,
        )
        .await
    }

    /// Whether an endpoint with `rtp_capabilities` can consume the given
    /// producer of this router.
    pub fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let Some(producer) = self.get_producer(producer_id) else {
            warn!(%producer_id, "can_consume() | producer not found");
            return false;
        };
        if let Err(err) = self.inner.negotiation.validate_rtp_capabilities(rtp_capabilities) {
            warn!(error = %err, "can_consume() | invalid rtp capabilities");
            return false;
        }
        self.inner
            .negotiation
            .can_consume(producer.consumable_rtp_parameters(), rtp_capabilities)
    }

    /// Close the router and, locally, every transport and observer in it.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(router_id = %self.inner.id, "close()");

        request_in_background(
            &self.inner.channel,
            Method::WorkerCloseRouter,
            "",
            Some(json!({ "routerId": self.inner.id })),
        );
        self.inner.finish_close(false);
    }

    pub fn on_new_transport<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&Transport) + Send + Sync + 'static,
    {
        self.inner.handlers.new_transport.add(Arc::new(callback))
    }

    pub fn on_new_rtp_observer<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&RtpObserver) + Send + Sync + 'static,
    {
        self.inner.handlers.new_rtp_observer.add(Arc::new(callback))
    }

    pub fn on_worker_close<F>(&self, callback: F) -> HandlerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.handlers.worker_close.add(Box::new(callback))
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

    /// The worker closed; it already dropped this router.
    pub(crate) fn worker_closed(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(router_id = %self.inner.id, "worker_closed()");
        self.inner.finish_close(true);
    }

    pub(crate) fn get_producer(&self, producer_id: &ProducerId) -> Option<Producer> {
        self.inner
            .producers
            .lock()
            .get(producer_id)
            .and_then(WeakProducer::upgrade)
    }

    pub(crate) fn get_data_producer(&self, data_producer_id: &DataProducerId) -> Option<DataProducer> {
        self.inner
            .data_producers
            .lock()
            .get(data_producer_id)
            .and_then(WeakDataProducer::upgrade)
    }

    pub(crate) fn downgrade(&self) -> WeakRouter {
        WeakRouter {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed() {
            Err(Error::closed("router"))
        } else {
            Ok(())
        }
    }

    /// A failure that arrives after the router closed reports the close.
    fn closed_or(&self, err: Error) -> Error {
        if self.closed() {
            Error::closed("router")
        } else {
            err
        }
    }

    async fn create_transport<O: Serialize>(
        &self,
        kind: TransportKind,
        options: &O,
        app_data: AppData,
    ) -> Result<Transport> {
        self.ensure_open()?;

        let transport_id = TransportId::new();
        let data = with_field(body(options)?, "transportId", json!(transport_id));
        let response: TransportData = request(
            &self.inner.channel,
            kind.create_method(),
            self.inner.id.to_string(),
            Some(data),
        )
        .await
        .map_err(|err| self.closed_or(err))?;
        self.ensure_open()?;

        let transport = Transport::new(
            transport_id,
            kind,
            response,
            self.link(),
            self.inner.channel.clone(),
            app_data,
        );

        let weak = Arc::downgrade(&self.inner);
        transport
            .on_internal_close(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.transports.lock().remove(&transport_id);
                }
            })
            .detach();
        if !adopt(&self.inner.closed, &self.inner.transports, transport_id, &transport) {
            transport.router_closed();
            return Err(Error::closed("router"));
        }

        self.inner
            .handlers
            .new_transport
            .call(|handler| handler(&transport));
        Ok(transport)
    }

    async fn create_rtp_observer<O: Serialize>(
        &self,
        kind: RtpObserverKind,
        method: Method,
        options: &O,
        app_data: AppData,
    ) -> Result<RtpObserver> {
        self.ensure_open()?;

        let rtp_observer_id = RtpObserverId::new();
        let data = with_field(body(options)?, "rtpObserverId", json!(rtp_observer_id));
        request_ignore(
            &self.inner.channel,
            method,
            self.inner.id.to_string(),
            Some(data),
        )
        .await
        .map_err(|err| self.closed_or(err))?;
        self.ensure_open()?;

        let rtp_observer = RtpObserver::new(RtpObserverParams {
            id: rtp_observer_id,
            kind,
            router_id: self.inner.id,
            channel: self.inner.channel.clone(),
            get_producer: self.producer_lookup(),
            app_data,
        });

        let weak = Arc::downgrade(&self.inner);
        rtp_observer
            .on_internal_close(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.rtp_observers.lock().remove(&rtp_observer_id);
                }
            })
            .detach();
        if !adopt(
            &self.inner.closed,
            &self.inner.rtp_observers,
            rtp_observer_id,
            &rtp_observer,
        ) {
            rtp_observer.router_closed();
            return Err(Error::closed("router"));
        }

        self.inner
            .handlers
            .new_rtp_observer
            .call(|handler| handler(&rtp_observer));
        Ok(rtp_observer)
    }

    fn producer_lookup(&self) -> ProducerLookup {
        let producers = Arc::clone(&self.inner.producers);
        Arc::new(move |producer_id: &ProducerId| {
            producers
                .lock()
                .get(producer_id)
                .and_then(WeakProducer::upgrade)
        })
    }

    fn link(&self) -> RouterLink {
        let data_producers = Arc::clone(&self.inner.data_producers);
        let get_data_producer: DataProducerLookup = Arc::new(move |data_producer_id: &DataProducerId| {
            data_producers
                .lock()
                .get(data_producer_id)
                .and_then(WeakDataProducer::upgrade)
        });

        let producers = Arc::downgrade(&self.inner.producers);
        let register_producer = Arc::new(move |producer: &Producer| {
            let Some(map) = producers.upgrade() else {
                return;
            };
            let producer_id = producer.id();
            let weak_map = Arc::downgrade(&map);
            producer
                .on_internal_close(move || {
                    if let Some(map) = weak_map.upgrade() {
                        map.lock().remove(&producer_id);
                    }
                })
                .detach();
            let mut map = map.lock();
            if !producer.closed() {
                map.insert(producer_id, producer.downgrade());
            }
        });

        let data_producers = Arc::downgrade(&self.inner.data_producers);
        let register_data_producer = Arc::new(move |data_producer: &DataProducer| {
            let Some(map) = data_producers.upgrade() else {
                return;
            };
            let data_producer_id = data_producer.id();
            let weak_map = Arc::downgrade(&map);
            data_producer
                .on_internal_close(move || {
                    if let Some(map) = weak_map.upgrade() {
                        map.lock().remove(&data_producer_id);
                    }
                })
                .detach();
            let mut map = map.lock();
            if !data_producer.closed() {
                map.insert(data_producer_id, data_producer.downgrade());
            }
        });

        RouterLink {
            router_id: self.inner.id,
            rtp_capabilities: Arc::clone(&self.inner.rtp_capabilities),
            negotiation: Arc::clone(&self.inner.negotiation),
            get_producer: self.producer_lookup(),
            get_data_producer,
            register_producer,
            register_data_producer,
        }
    }
}

impl Inner {
    fn finish_close(&self, worker_closed: bool) {
        let transports = std::mem::take(&mut *self.transports.lock());
        for transport in transports.into_values() {
            transport.router_closed();
        }
        let rtp_observers = std::mem::take(&mut *self.rtp_observers.lock());
        for rtp_observer in rtp_observers.into_values() {
            rtp_observer.router_closed();
        }
        self.producers.lock().clear();
        self.data_producers.lock().clear();
        let pipe_pairs = std::mem::take(&mut *self.pipe_pairs.lock());
        drop(pipe_pairs);

        self.internal_close.call_simple();
        if worker_closed {
            self.handlers.worker_close.call_simple();
        }
        self.handlers.close.call_simple();
        self.handlers.new_transport.clear();
        self.handlers.new_rtp_observer.clear();
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("id", &self.inner.id)
            .field("closed", &self.closed())
            .finish()
    }
}

/// Non-owning handle that still knows the router id once the router is
/// gone.
#[derive(Clone)]
pub(crate) struct WeakRouter {
    id: RouterId,
    inner: Weak<Inner>,
}

impl WeakRouter {
    pub(crate) fn id(&self) -> RouterId {
        self.id
    }

    pub(crate) fn upgrade(&self) -> Option<Router> {
        self.inner.upgrade().map(|inner| Router { inner })
    }
}

/// Insert a freshly created child into its parent's registry unless the
/// parent closed. Parents set their `closed` flag before draining the
/// registry under the same lock, so a child is either drained with the
/// rest or refused here.
pub(crate) fn adopt<K, V>(
    closed: &AtomicBool,
    registry: &Mutex<HashMap<K, V>>,
    id: K,
    child: &V,
) -> bool
where
    K: Eq + Hash,
    V: Clone,
{
    let mut children = registry.lock();
    if closed.load(Ordering::SeqCst) {
        return false;
    }
    children.insert(id, child.clone());
    true
}

fn with_field(mut data: Value, key: &str, value: Value) -> Value {
    if let Value::Object(map) = &mut data {
        map.insert(key.to_owned(), value);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adopt_inserts_while_open() {
        let closed = AtomicBool::new(false);
        let registry = Mutex::new(HashMap::new());
        assert!(adopt(&closed, &registry, 1u32, &"child"));
        assert_eq!(registry.lock().get(&1), Some(&"child"));
    }

    #[test]
    fn adopt_refuses_once_closed() {
        let closed = AtomicBool::new(false);
        let registry: Mutex<HashMap<u32, &str>> = Mutex::new(HashMap::new());
        closed.store(true, Ordering::SeqCst);
        assert!(!adopt(&closed, &registry, 1, &"child"));
        assert!(registry.lock().is_empty());
    }

    #[test]
    fn close_racing_adopt_never_strands_a_child() {
        // A parent closing on another thread either drains the child or
        // the child is refused; it never stays behind in the registry.
        for _ in 0..200 {
            let closed = Arc::new(AtomicBool::new(false));
            let registry: Arc<Mutex<HashMap<u32, u32>>> = Arc::new(Mutex::new(HashMap::new()));

            let closer = {
                let closed = Arc::clone(&closed);
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    closed.store(true, Ordering::SeqCst);
                    std::mem::take(&mut *registry.lock()).len()
                })
            };
            let adopted = adopt(&closed, &registry, 7, &7);
            let drained = closer.join().expect("closer thread should not panic");

            let stranded = registry.lock().len();
            assert_eq!(stranded, 0);
            assert_eq!(usize::from(adopted), drained);
        }
    }
}
