//! One transport of a router and the media and data endpoints under it.
//!
//! A single [`Transport`] type covers the WebRTC, plain, pipe and direct
//! kinds; kind-specific state (ICE, DTLS, tuples, SRTP) is simply absent
//! on kinds that do not have it. The transport owns its producers,
//! consumers, data producers and data consumers, and closing it closes
//! all of them locally with a single request to the worker.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rtcplane_channel::{Channel, Event, Method, Notification, SubscriptionHandler};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::data_structures::{
    AppData, ConsumerId, ConsumerLayers, ConsumerScore, DataConsumerId, DataProducerId,
    DtlsParameters, DtlsRole, DtlsState, IceCandidate, IceParameters, IceRole, IceState,
    ListenInfo, ProducerId, RouterId, RtpStreamType, SctpState, SrtpCryptoSuite, SrtpParameters,
    TransportId, TransportTraceEventType, TransportTuple,
};
use crate::error::{Error, Result};
use crate::event::{Bag, BagOnce, HandlerId};
use crate::ortc::RtpNegotiation;
use crate::request::{body, notification_data, request, request_ignore, request_in_background, request_raw};
use crate::router::allocators::{MidAllocator, SctpStreamIds};
use crate::router::consumer::{Consumer, ConsumerOptions, ConsumerParams};
use crate::router::data_consumer::{DataConsumer, DataConsumerOptions, DataConsumerParams};
use crate::router::data_producer::{
    DataProducer, DataProducerOptions, DataProducerParams, DataType,
};
use crate::router::producer::{Producer, ProducerOptions, ProducerParams};
use crate::router::{adopt, DataProducerLookup, ProducerLookup};
use crate::rtp_parameters::{RtpCapabilities, RtpEncodingParameters};
use crate::sctp_parameters::{NumSctpStreams, SctpParameters, SctpStreamParameters};

const DEFAULT_MAX_SCTP_MESSAGE_SIZE: u32 = 262_144;
const DEFAULT_SCTP_SEND_BUFFER_SIZE: u32 = 262_144;

/// Options for [`Router::create_webrtc_transport`](crate::router::Router::create_webrtc_transport).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportOptions {
    pub listen_infos: Vec<ListenInfo>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub prefer_tcp: bool,
    /// Initial outgoing bitrate estimate in bps.
    pub initial_available_outgoing_bitrate: u32,
    pub enable_sctp: bool,
    pub num_sctp_streams: NumSctpStreams,
    pub max_sctp_message_size: u32,
    pub sctp_send_buffer_size: u32,
    #[serde(skip)]
    pub app_data: AppData,
}

impl WebRtcTransportOptions {
    pub fn new(listen_infos: Vec<ListenInfo>) -> Self {
        Self {
            listen_infos,
            enable_udp: true,
            enable_tcp: false,
            prefer_udp: false,
            prefer_tcp: false,
            initial_available_outgoing_bitrate: 600_000,
            enable_sctp: false,
            num_sctp_streams: NumSctpStreams::default(),
            max_sctp_message_size: DEFAULT_MAX_SCTP_MESSAGE_SIZE,
            sctp_send_buffer_size: DEFAULT_SCTP_SEND_BUFFER_SIZE,
            app_data: AppData::new(),
        }
    }
}

/// Options for [`Router::create_plain_transport`](crate::router::Router::create_plain_transport).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainTransportOptions {
    pub listen_info: ListenInfo,
    /// Separate RTCP address. Ignored with `rtcp_mux`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtcp_listen_info: Option<ListenInfo>,
    pub rtcp_mux: bool,
    /// Learn the remote address from the first received packet.
    pub comedia: bool,
    pub enable_sctp: bool,
    pub num_sctp_streams: NumSctpStreams,
    pub max_sctp_message_size: u32,
    pub sctp_send_buffer_size: u32,
    pub enable_srtp: bool,
    pub srtp_crypto_suite: SrtpCryptoSuite,
    #[serde(skip)]
    pub app_data: AppData,
}

impl PlainTransportOptions {
    pub fn new(listen_info: ListenInfo) -> Self {
        Self {
            listen_info,
            rtcp_listen_info: None,
            rtcp_mux: true,
            comedia: false,
            enable_sctp: false,
            num_sctp_streams: NumSctpStreams::default(),
            max_sctp_message_size: DEFAULT_MAX_SCTP_MESSAGE_SIZE,
            sctp_send_buffer_size: DEFAULT_SCTP_SEND_BUFFER_SIZE,
            enable_srtp: false,
            srtp_crypto_suite: SrtpCryptoSuite::default(),
            app_data: AppData::new(),
        }
    }
}

/// Options for [`Router::create_pipe_transport`](crate::router::Router::create_pipe_transport).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipeTransportOptions {
    pub listen_info: ListenInfo,
    pub enable_sctp: bool,
    pub num_sctp_streams: NumSctpStreams,
    pub max_sctp_message_size: u32,
    pub sctp_send_buffer_size: u32,
    /// Negotiate RTX and NACK between the two pipe ends.
    pub enable_rtx: bool,
    pub enable_srtp: bool,
    #[serde(skip)]
    pub app_data: AppData,
}

impl PipeTransportOptions {
    pub fn new(listen_info: ListenInfo) -> Self {
        Self {
            listen_info,
            enable_sctp: false,
            num_sctp_streams: NumSctpStreams::default(),
            max_sctp_message_size: DEFAULT_MAX_SCTP_MESSAGE_SIZE,
            sctp_send_buffer_size: DEFAULT_SCTP_SEND_BUFFER_SIZE,
            enable_rtx: false,
            enable_srtp: false,
            app_data: AppData::new(),
        }
    }
}

/// Options for [`Router::create_direct_transport`](crate::router::Router::create_direct_transport).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectTransportOptions {
    pub max_message_size: u32,
    #[serde(skip)]
    pub app_data: AppData,
}

impl Default for DirectTransportOptions {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_SCTP_MESSAGE_SIZE,
            app_data: AppData::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebRtc,
    Plain,
    Pipe,
    Direct,
}

impl TransportKind {
    pub(crate) fn create_method(self) -> Method {
        match self {
            Self::WebRtc => Method::RouterCreateWebRtcTransport,
            Self::Plain => Method::RouterCreatePlainTransport,
            Self::Pipe => Method::RouterCreatePipeTransport,
            Self::Direct => Method::RouterCreateDirectTransport,
        }
    }
}

/// Remote endpoint information passed to [`Transport::connect`].
#[derive(Debug, Clone)]
pub enum TransportConnectParams {
    WebRtc {
        dtls_parameters: DtlsParameters,
    },
    /// Every field may be omitted when the transport runs in comedia mode.
    Plain {
        ip: Option<IpAddr>,
        port: Option<u16>,
        rtcp_port: Option<u16>,
        srtp_parameters: Option<SrtpParameters>,
    },
    Pipe {
        ip: IpAddr,
        port: u16,
        srtp_parameters: Option<SrtpParameters>,
    },
}

impl TransportConnectParams {
    fn kind(&self) -> TransportKind {
        match self {
            Self::WebRtc { .. } => TransportKind::WebRtc,
            Self::Plain { .. } => TransportKind::Plain,
            Self::Pipe { .. } => TransportKind::Pipe,
        }
    }

    fn to_body(&self) -> Value {
        match self {
            Self::WebRtc { dtls_parameters } => json!({ "dtlsParameters": dtls_parameters }),
            Self::Plain {
                ip,
                port,
                rtcp_port,
                srtp_parameters,
            } => json!({
                "ip": ip,
                "port": port,
                "rtcpPort": rtcp_port,
                "srtpParameters": srtp_parameters,
            }),
            Self::Pipe {
                ip,
                port,
                srtp_parameters,
            } => json!({
                "ip": ip,
                "port": port,
                "srtpParameters": srtp_parameters,
            }),
        }
    }
}

/// Transport state as reported by the worker on creation and kept up to
/// date from connect responses and notifications.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct TransportData {
    ice_role: Option<IceRole>,
    ice_parameters: Option<IceParameters>,
    ice_candidates: Vec<IceCandidate>,
    ice_state: Option<IceState>,
    ice_selected_tuple: Option<TransportTuple>,
    dtls_parameters: Option<DtlsParameters>,
    dtls_state: Option<DtlsState>,
    dtls_remote_cert: Option<String>,
    tuple: Option<TransportTuple>,
    rtcp_tuple: Option<TransportTuple>,
    srtp_parameters: Option<SrtpParameters>,
    rtx: bool,
    sctp_parameters: Option<SctpParameters>,
    sctp_state: Option<SctpState>,
}

#[derive(Debug)]
struct State {
    data: TransportData,
    sctp_stream_ids: Option<SctpStreamIds>,
    cname_for_producers: Option<String>,
    mids: MidAllocator,
}

/// The router as seen from one of its transports.
pub(crate) struct RouterLink {
    pub(crate) router_id: RouterId,
    pub(crate) rtp_capabilities: Arc<RtpCapabilities>,
    pub(crate) negotiation: Arc<dyn RtpNegotiation>,
    pub(crate) get_producer: ProducerLookup,
    pub(crate) get_data_producer: DataProducerLookup,
    pub(crate) register_producer: Arc<dyn Fn(&Producer) + Send + Sync>,
    pub(crate) register_data_producer: Arc<dyn Fn(&DataProducer) + Send + Sync>,
}

#[derive(Default)]
struct Handlers {
    new_producer: Bag<dyn Fn(&Producer) + Send + Sync>,
    new_consumer: Bag<dyn Fn(&Consumer) + Send + Sync>,
    new_data_producer: Bag<dyn Fn(&DataProducer) + Send + Sync>,
    new_data_consumer: Bag<dyn Fn(&DataConsumer) + Send + Sync>,
    trace: Bag<dyn Fn(&Value) + Send + Sync>,
    sctp_state_change: Bag<dyn Fn(SctpState) + Send + Sync>,
    ice_state_change: Bag<dyn Fn(IceState) + Send + Sync>,
    ice_selected_tuple_change: Bag<dyn Fn(&TransportTuple) + Send + Sync>,
    dtls_state_change: Bag<dyn Fn(DtlsState) + Send + Sync>,
    tuple: Bag<dyn Fn(&TransportTuple) + Send + Sync>,
    rtcp_tuple: Bag<dyn Fn(&TransportTuple) + Send + Sync>,
    router_close: BagOnce<dyn FnOnce() + Send>,
    close: BagOnce<dyn FnOnce() + Send>,
}

impl Handlers {
    fn clear(&self) {
        self.new_producer.clear();
        self.new_consumer.clear();
        self.new_data_producer.clear();
        self.new_data_consumer.clear();
        self.trace.clear();
        self.sctp_state_change.clear();
        self.ice_state_change.clear();
        self.ice_selected_tuple_change.clear();
        self.dtls_state_change.clear();
        self.tuple.clear();
        self.rtcp_tuple.clear();
    }
}

struct Inner {
    id: TransportId,
    kind: TransportKind,
    channel: Channel,
    router: RouterLink,
    state: Mutex<State>,
    producers: Mutex<HashMap<ProducerId, Producer>>,
    consumers: Mutex<HashMap<ConsumerId, Consumer>>,
    data_producers: Mutex<HashMap<DataProducerId, DataProducer>>,
    data_consumers: Mutex<HashMap<DataConsumerId, DataConsumer>>,
    closed: AtomicBool,
    app_data: AppData,
    handlers: Handlers,
    internal_close: BagOnce<dyn FnOnce() + Send>,
    subscription: Mutex<Option<SubscriptionHandler>>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ProduceResponse {
    #[serde(rename = "type")]
    stream_type: Option<RtpStreamType>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ConsumeResponse {
    paused: bool,
    producer_paused: bool,
    score: Option<ConsumerScore>,
    preferred_layers: Option<ConsumerLayers>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ConnectResponse {
    dtls_local_role: Option<DtlsRole>,
    tuple: Option<TransportTuple>,
    rtcp_tuple: Option<TransportTuple>,
    srtp_parameters: Option<SrtpParameters>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestartIceResponse {
    ice_parameters: IceParameters,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProduceRequest<'a> {
    producer_id: ProducerId,
    kind: crate::rtp_parameters::MediaKind,
    rtp_parameters: &'a crate::rtp_parameters::RtpParameters,
    rtp_mapping: &'a crate::ortc::RtpMapping,
    key_frame_request_delay: u32,
    paused: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConsumeRequest<'a> {
    consumer_id: ConsumerId,
    producer_id: ProducerId,
    kind: crate::rtp_parameters::MediaKind,
    rtp_parameters: &'a crate::rtp_parameters::RtpParameters,
    #[serde(rename = "type")]
    stream_type: RtpStreamType,
    consumable_rtp_encodings: &'a [RtpEncodingParameters],
    paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    preferred_layers: Option<ConsumerLayers>,
    ignore_dtx: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProduceDataRequest<'a> {
    data_producer_id: DataProducerId,
    #[serde(rename = "type")]
    data_type: DataType,
    #[serde(skip_serializing_if = "Option::is_none")]
    sctp_stream_parameters: Option<SctpStreamParameters>,
    label: &'a str,
    protocol: &'a str,
    paused: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConsumeDataRequest<'a> {
    data_consumer_id: DataConsumerId,
    data_producer_id: DataProducerId,
    #[serde(rename = "type")]
    data_type: DataType,
    #[serde(skip_serializing_if = "Option::is_none")]
    sctp_stream_parameters: Option<SctpStreamParameters>,
    label: &'a str,
    protocol: &'a str,
    paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    subchannels: Option<&'a [u16]>,
}

/// A network or direct transport of a router.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub(crate) fn new(
        id: TransportId,
        kind: TransportKind,
        data: TransportData,
        router: RouterLink,
        channel: Channel,
        app_data: AppData,
    ) -> Self {
        let sctp_stream_ids = data
            .sctp_parameters
            .map(|params| SctpStreamIds::new(params.mis));

        let inner = Arc::new(Inner {
            id,
            kind,
            channel,
            router,
            state: Mutex::new(State {
                data,
                sctp_stream_ids,
                cname_for_producers: None,
                mids: MidAllocator::default(),
            }),
            producers: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            data_producers: Mutex::new(HashMap::new()),
            data_consumers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            app_data,
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

    pub fn id(&self) -> TransportId {
        self.inner.id
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.kind
    }

    pub fn router_id(&self) -> RouterId {
        self.inner.router.router_id
    }

    pub fn app_data(&self) -> &AppData {
        &self.inner.app_data
    }

    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn ice_role(&self) -> Option<IceRole> {
        self.inner.state.lock().data.ice_role
    }

    pub fn ice_parameters(&self) -> Option<IceParameters> {
        self.inner.state.lock().data.ice_parameters.clone()
    }

    pub fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.inner.state.lock().data.ice_candidates.clone()
    }

    pub fn ice_state(&self) -> Option<IceState> {
        self.inner.state.lock().data.ice_state
    }

    pub fn ice_selected_tuple(&self) -> Option<TransportTuple> {
        self.inner.state.lock().data.ice_selected_tuple.clone()
    }

    pub fn dtls_parameters(&self) -> Option<DtlsParameters> {
        self.inner.state.lock().data.dtls_parameters.clone()
    }

    pub fn dtls_state(&self) -> Option<DtlsState> {
        self.inner.state.lock().data.dtls_state
    }

    pub fn dtls_remote_cert(&self) -> Option<String> {
        self.inner.state.lock().data.dtls_remote_cert.clone()
    }

    /// Local and remote address of a plain or pipe transport.
    pub fn tuple(&self) -> Option<TransportTuple> {
        self.inner.state.lock().data.tuple.clone()
    }

    pub fn rtcp_tuple(&self) -> Option<TransportTuple> {
        self.inner.state.lock().data.rtcp_tuple.clone()
    }

    /// Local SRTP parameters of a plain or pipe transport with SRTP.
    pub fn srtp_parameters(&self) -> Option<SrtpParameters> {
        self.inner.state.lock().data.srtp_parameters.clone()
    }

    pub fn sctp_parameters(&self) -> Option<SctpParameters> {
        self.inner.state.lock().data.sctp_parameters
    }

    pub fn sctp_state(&self) -> Option<SctpState> {
        self.inner.state.lock().data.sctp_state
    }

    pub async fn dump(&self) -> Result<Value> {
        debug!("dump()");
        self.ensure_open()?;
        request_raw(&self.inner.channel, Method::TransportDump, self.handler_id(), None).await
    }

    pub async fn get_stats(&self) -> Result<Value> {
        debug!("get_stats()");
        self.ensure_open()?;
        request_raw(&self.inner.channel, Method::TransportGetStats, self.handler_id(), None).await
    }

    /// Provide the remote endpoint parameters. The variant must match the
    /// transport kind.
    pub async fn connect(&self, params: TransportConnectParams) -> Result<()> {
        debug!("connect()");
        self.ensure_open()?;
        if params.kind() != self.inner.kind {
            return Err(Error::TypeValidation(format!(
                "{:?} connect parameters given to a {:?} transport",
                params.kind(),
                self.inner.kind
            )));
        }

        let response: ConnectResponse = request(
            &self.inner.channel,
            Method::TransportConnect,
            self.handler_id(),
            Some(params.to_body()),
        )
        .await?;

        let mut state = self.inner.state.lock();
        if let (Some(role), Some(dtls)) = (response.dtls_local_role, &mut state.data.dtls_parameters)
        {
            dtls.role = role;
        }
        if let Some(tuple) = response.tuple {
            state.data.tuple = Some(tuple);
        }
        if let Some(tuple) = response.rtcp_tuple {
            state.data.rtcp_tuple = Some(tuple);
        }
        if let Some(srtp) = response.srtp_parameters {
            state.data.srtp_parameters = Some(srtp);
        }
        Ok(())
    }

    /// Generate new local ICE credentials. WebRTC transports only.
    pub async fn restart_ice(&self) -> Result<IceParameters> {
        debug!("restart_ice()");
        self.ensure_open()?;
        if self.inner.kind != TransportKind::WebRtc {
            return Err(Error::Unsupported(
                "ICE restart needs a WebRTC transport".to_owned(),
            ));
        }

        let response: RestartIceResponse = request(
            &self.inner.channel,
            Method::TransportRestartIce,
            self.handler_id(),
            None,
        )
        .await?;
        self.inner.state.lock().data.ice_parameters = Some(response.ice_parameters.clone());
        Ok(response.ice_parameters)
    }

    pub async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<()> {
        debug!("set_max_incoming_bitrate() [bitrate:{bitrate}]");
        self.set_bitrate(Method::TransportSetMaxIncomingBitrate, bitrate)
            .await
    }

    pub async fn set_max_outgoing_bitrate(&self, bitrate: u32) -> Result<()> {
        debug!("set_max_outgoing_bitrate() [bitrate:{bitrate}]");
        self.set_bitrate(Method::TransportSetMaxOutgoingBitrate, bitrate)
            .await
    }

    pub async fn set_min_outgoing_bitrate(&self, bitrate: u32) -> Result<()> {
        debug!("set_min_outgoing_bitrate() [bitrate:{bitrate}]");
        self.set_bitrate(Method::TransportSetMinOutgoingBitrate, bitrate)
            .await
    }

    pub async fn enable_trace_event(&self, types: Vec<TransportTraceEventType>) -> Result<()> {
        debug!("enable_trace_event()");
        self.ensure_open()?;
        request_ignore(
            &self.inner.channel,
            Method::TransportEnableTraceEvent,
            self.handler_id(),
            Some(json!({ "types": types })),
        )
        .await
    }

    /// Create a producer for media sent by the endpoint.
    pub async fn produce(&self, options: ProducerOptions) -> Result<Producer> {
        debug!("produce()");
        self.ensure_open()?;

        let ProducerOptions {
            id,
            kind,
            mut rtp_parameters,
            paused,
            key_frame_request_delay,
            app_data,
        } = options;

        if let Some(id) = id {
            if self.inner.producers.lock().contains_key(&id)
                || (self.inner.router.get_producer)(&id).is_some()
            {
                return Err(Error::TypeValidation(format!(
                    "a producer with id \"{id}\" already exists"
                )));
            }
        }

        let negotiation = &self.inner.router.negotiation;
        negotiation.validate_rtp_parameters(&rtp_parameters)?;

        if rtp_parameters.encodings.is_empty() {
            rtp_parameters
                .encodings
                .push(RtpEncodingParameters::default());
        }

        // Every producer of a non-pipe transport shares one CNAME.
        if self.inner.kind != TransportKind::Pipe {
            let mut state = self.inner.state.lock();
            let cname = state
                .cname_for_producers
                .get_or_insert_with(|| {
                    rtp_parameters.rtcp.cname.clone().unwrap_or_else(|| {
                        let mut cname = Uuid::new_v4().to_string();
                        cname.truncate(8);
                        cname
                    })
                })
                .clone();
            rtp_parameters.rtcp.cname = Some(cname);
        }

        let router_caps = &self.inner.router.rtp_capabilities;
        let rtp_mapping = negotiation.producer_rtp_parameters_mapping(&rtp_parameters, router_caps)?;
        let consumable_rtp_parameters =
            negotiation.consumable_rtp_parameters(kind, &rtp_parameters, router_caps, &rtp_mapping);

        let producer_id = id.unwrap_or_else(ProducerId::new);
        let response: ProduceResponse = request(
            &self.inner.channel,
            Method::TransportProduce,
            self.handler_id(),
            Some(body(ProduceRequest {
                producer_id,
                kind,
                rtp_parameters: &rtp_parameters,
                rtp_mapping: &rtp_mapping,
                key_frame_request_delay,
                paused,
            })?),
        )
        .await
        .map_err(|err| self.closed_or(err))?;
        self.ensure_open()?;

        let stream_type = response.stream_type.unwrap_or(
            if rtp_parameters.encodings.len() > 1 {
                RtpStreamType::Simulcast
            } else {
                RtpStreamType::Simple
            },
        );
        let producer = Producer::new(ProducerParams {
            id: producer_id,
            kind,
            stream_type,
            rtp_parameters,
            consumable_rtp_parameters,
            paused,
            transport_id: self.inner.id,
            channel: self.inner.channel.clone(),
            app_data,
        });

        let weak = Arc::downgrade(&self.inner);
        producer
            .on_internal_close(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.producers.lock().remove(&producer_id);
                }
            })
            .detach();
        if !adopt(&self.inner.closed, &self.inner.producers, producer_id, &producer) {
            producer.transport_closed();
            return Err(Error::closed("transport"));
        }
        (self.inner.router.register_producer)(&producer);

        self.inner
            .handlers
            .new_producer
            .call(|handler| handler(&producer));
        Ok(producer)
    }

    /// Create a consumer forwarding a producer of the same router to the
    /// endpoint.
    pub async fn consume(&self, options: ConsumerOptions) -> Result<Consumer> {
        debug!("consume()");
        self.ensure_open()?;

        let ConsumerOptions {
            producer_id,
            rtp_capabilities,
            paused,
            mid,
            preferred_layers,
            ignore_dtx,
            pipe,
            app_data,
        } = options;

        if mid.as_deref() == Some("") {
            return Err(Error::TypeValidation("empty mid".to_owned()));
        }

        let negotiation = &self.inner.router.negotiation;
        let pipe_transport = self.inner.kind == TransportKind::Pipe;
        if !pipe_transport {
            negotiation.validate_rtp_capabilities(&rtp_capabilities)?;
        }

        let producer = (self.inner.router.get_producer)(&producer_id).ok_or_else(|| {
            Error::NotFound {
                kind: "producer",
                id: producer_id.to_string(),
            }
        })?;

        let consumable = producer.consumable_rtp_parameters();
        let (rtp_parameters, stream_type) = if pipe_transport {
            let enable_rtx = self.inner.state.lock().data.rtx;
            (
                negotiation.pipe_consumer_rtp_parameters(consumable, enable_rtx),
                RtpStreamType::Pipe,
            )
        } else {
            if !negotiation.can_consume(consumable, &rtp_capabilities) {
                return Err(Error::Unsupported(format!(
                    "cannot consume producer \"{producer_id}\" with the given capabilities"
                )));
            }
            let mut params = negotiation.consumer_rtp_parameters(consumable, &rtp_capabilities, pipe)?;
            if !pipe {
                params.mid = Some(match mid {
                    Some(mid) => mid,
                    None => self.next_mid(),
                });
            }
            let stream_type = if pipe {
                RtpStreamType::Pipe
            } else {
                producer.stream_type()
            };
            (params, stream_type)
        };

        let consumer_id = ConsumerId::new();
        let response: ConsumeResponse = request(
            &self.inner.channel,
            Method::TransportConsume,
            self.handler_id(),
            Some(body(ConsumeRequest {
                consumer_id,
                producer_id,
                kind: producer.kind(),
                rtp_parameters: &rtp_parameters,
                stream_type,
                consumable_rtp_encodings: &consumable.encodings,
                paused,
                preferred_layers,
                ignore_dtx,
            })?),
        )
        .await
        .map_err(|err| self.closed_or(err))?;
        self.ensure_open()?;

        let consumer = Consumer::new(ConsumerParams {
            id: consumer_id,
            producer_id,
            kind: producer.kind(),
            stream_type,
            rtp_parameters,
            transport_id: self.inner.id,
            channel: self.inner.channel.clone(),
            paused: response.paused,
            producer_paused: response.producer_paused,
            score: response.score.unwrap_or_default(),
            preferred_layers: response.preferred_layers,
            app_data,
        });

        let weak = Arc::downgrade(&self.inner);
        consumer
            .on_internal_close(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.consumers.lock().remove(&consumer_id);
                }
            })
            .detach();
        if !adopt(&self.inner.closed, &self.inner.consumers, consumer_id, &consumer) {
            consumer.transport_closed();
            return Err(Error::closed("transport"));
        }

        self.inner
            .handlers
            .new_consumer
            .call(|handler| handler(&consumer));
        Ok(consumer)
    }

    /// Create a data producer. SCTP transports need stream parameters;
    /// direct transports ignore them.
    pub async fn produce_data(&self, options: DataProducerOptions) -> Result<DataProducer> {
        debug!("produce_data()");
        self.ensure_open()?;

        let DataProducerOptions {
            id,
            sctp_stream_parameters,
            label,
            protocol,
            paused,
            app_data,
        } = options;

        if let Some(id) = id {
            if self.inner.data_producers.lock().contains_key(&id)
                || (self.inner.router.get_data_producer)(&id).is_some()
            {
                return Err(Error::TypeValidation(format!(
                    "a data producer with id \"{id}\" already exists"
                )));
            }
        }

        let (data_type, sctp_stream_parameters) = if self.inner.kind == TransportKind::Direct {
            if sctp_stream_parameters.is_some() {
                warn!("sctp_stream_parameters are ignored when producing data on a direct transport");
            }
            (DataType::Direct, None)
        } else {
            let params = sctp_stream_parameters.ok_or_else(|| {
                Error::TypeValidation("missing sctp_stream_parameters".to_owned())
            })?;
            self.inner
                .router
                .negotiation
                .validate_sctp_stream_parameters(&params)?;
            (DataType::Sctp, Some(params))
        };

        let data_producer_id = id.unwrap_or_else(DataProducerId::new);
        request_ignore(
            &self.inner.channel,
            Method::TransportProduceData,
            self.handler_id(),
            Some(body(ProduceDataRequest {
                data_producer_id,
                data_type,
                sctp_stream_parameters,
                label: &label,
                protocol: &protocol,
                paused,
            })?),
        )
        .await
        .map_err(|err| self.closed_or(err))?;
        self.ensure_open()?;

        let data_producer = DataProducer::new(DataProducerParams {
            id: data_producer_id,
            data_type,
            sctp_stream_parameters,
            label,
            protocol,
            transport_id: self.inner.id,
            channel: self.inner.channel.clone(),
            app_data,
        });

        let weak = Arc::downgrade(&self.inner);
        data_producer
            .on_internal_close(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.data_producers.lock().remove(&data_producer_id);
                }
            })
            .detach();
        if !adopt(
            &self.inner.closed,
            &self.inner.data_producers,
            data_producer_id,
            &data_producer,
        ) {
            data_producer.transport_closed();
            return Err(Error::closed("transport"));
        }
        (self.inner.router.register_data_producer)(&data_producer);

        self.inner
            .handlers
            .new_data_producer
            .call(|handler| handler(&data_producer));
        Ok(data_producer)
    }

    /// Create a data consumer for a data producer of the same router. On
    /// SCTP transports a stream id is allocated for it and released when
    /// it closes.
    pub async fn consume_data(&self, options: DataConsumerOptions) -> Result<DataConsumer> {
        debug!("consume_data()");
        self.ensure_open()?;

        let DataConsumerOptions {
            data_producer_id,
            ordered,
            max_packet_life_time,
            max_retransmits,
            paused,
            subchannels,
            app_data,
        } = options;

        let data_producer = (self.inner.router.get_data_producer)(&data_producer_id)
            .ok_or_else(|| Error::NotFound {
                kind: "data producer",
                id: data_producer_id.to_string(),
            })?;

        let (data_type, sctp_stream_parameters) = if self.inner.kind == TransportKind::Direct {
            if ordered.is_some() || max_packet_life_time.is_some() || max_retransmits.is_some() {
                warn!("reliability options are ignored when consuming data on a direct transport");
            }
            (DataType::Direct, None)
        } else {
            let mut params = data_producer
                .sctp_stream_parameters()
                .unwrap_or_else(|| SctpStreamParameters::new_ordered(0));
            if let Some(ordered) = ordered {
                params.ordered = Some(ordered);
                if ordered {
                    params.max_packet_life_time = None;
                    params.max_retransmits = None;
                }
            }
            if let Some(life_time) = max_packet_life_time {
                params.max_packet_life_time = Some(life_time);
            }
            if let Some(retransmits) = max_retransmits {
                params.max_retransmits = Some(retransmits);
            }
            params.stream_id = self.allocate_sctp_stream_id()?;
            (DataType::Sctp, Some(params))
        };
        let stream_id = sctp_stream_parameters.map(|params| params.stream_id);

        let data_consumer_id = DataConsumerId::new();
        let result = match body(ConsumeDataRequest {
            data_consumer_id,
            data_producer_id,
            data_type,
            sctp_stream_parameters,
            label: data_producer.label(),
            protocol: data_producer.protocol(),
            paused,
            subchannels: subchannels.as_deref(),
        }) {
            Ok(data) => {
                request_ignore(
                    &self.inner.channel,
                    Method::TransportConsumeData,
                    self.handler_id(),
                    Some(data),
                )
                .await
            }
            Err(err) => Err(err),
        }
        .map_err(|err| self.closed_or(err))
        .and_then(|()| self.ensure_open());

        if let Err(err) = result {
            if let Some(stream_id) = stream_id {
                self.inner.release_sctp_stream_id(stream_id);
            }
            return Err(err);
        }

        let data_consumer = DataConsumer::new(DataConsumerParams {
            id: data_consumer_id,
            data_producer_id,
            data_type,
            sctp_stream_parameters,
            label: data_producer.label().to_owned(),
            protocol: data_producer.protocol().to_owned(),
            transport_id: self.inner.id,
            channel: self.inner.channel.clone(),
            app_data,
        });

        let weak = Arc::downgrade(&self.inner);
        data_consumer
            .on_internal_close(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.data_consumers.lock().remove(&data_consumer_id);
                    if let Some(stream_id) = stream_id {
                        inner.release_sctp_stream_id(stream_id);
                    }
                }
            })
            .detach();
        // Closing a refused data consumer releases its stream id.
        if !adopt(
            &self.inner.closed,
            &self.inner.data_consumers,
            data_consumer_id,
            &data_consumer,
        ) {
            data_consumer.transport_closed();
            return Err(Error::closed("transport"));
        }

        self.inner
            .handlers
            .new_data_consumer
            .call(|handler| handler(&data_consumer));
        Ok(data_consumer)
    }

    /// Close the transport and, locally, everything under it.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(transport_id = %self.inner.id, "close()");

        request_in_background(
            &self.inner.channel,
            Method::RouterCloseTransport,
            self.inner.router.router_id.to_string(),
            Some(json!({ "transportId": self.inner.id })),
        );
        self.inner.finish_close(false);
    }

    pub fn on_new_producer<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&Producer) + Send + Sync + 'static,
    {
        self.inner.handlers.new_producer.add(Arc::new(callback))
    }

    pub fn on_new_consumer<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&Consumer) + Send + Sync + 'static,
    {
        self.inner.handlers.new_consumer.add(Arc::new(callback))
    }

    pub fn on_new_data_producer<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&DataProducer) + Send + Sync + 'static,
    {
        self.inner.handlers.new_data_producer.add(Arc::new(callback))
    }

    pub fn on_new_data_consumer<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&DataConsumer) + Send + Sync + 'static,
    {
        self.inner.handlers.new_data_consumer.add(Arc::new(callback))
    }

    pub fn on_trace<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.handlers.trace.add(Arc::new(callback))
    }

    pub fn on_sctp_state_change<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(SctpState) + Send + Sync + 'static,
    {
        self.inner.handlers.sctp_state_change.add(Arc::new(callback))
    }

    pub fn on_ice_state_change<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(IceState) + Send + Sync + 'static,
    {
        self.inner.handlers.ice_state_change.add(Arc::new(callback))
    }

    pub fn on_ice_selected_tuple_change<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&TransportTuple) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .ice_selected_tuple_change
            .add(Arc::new(callback))
    }

    pub fn on_dtls_state_change<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(DtlsState) + Send + Sync + 'static,
    {
        self.inner.handlers.dtls_state_change.add(Arc::new(callback))
    }

    /// Plain transports in comedia mode: the remote tuple was learned.
    pub fn on_tuple<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&TransportTuple) + Send + Sync + 'static,
    {
        self.inner.handlers.tuple.add(Arc::new(callback))
    }

    pub fn on_rtcp_tuple<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&TransportTuple) + Send + Sync + 'static,
    {
        self.inner.handlers.rtcp_tuple.add(Arc::new(callback))
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

    /// The router closed; the worker already dropped this transport.
    pub(crate) fn router_closed(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(transport_id = %self.inner.id, "router_closed()");
        self.inner.finish_close(true);
    }

    pub(crate) fn downgrade(&self) -> WeakTransport {
        WeakTransport {
            inner: Arc::downgrade(&self.inner),
        }
    }

    async fn set_bitrate(&self, method: Method, bitrate: u32) -> Result<()> {
        self.ensure_open()?;
        if self.inner.kind == TransportKind::Direct {
            return Err(Error::Unsupported(
                "direct transports have no bitrate settings".to_owned(),
            ));
        }
        request_ignore(
            &self.inner.channel,
            method,
            self.handler_id(),
            Some(json!({ "bitrate": bitrate })),
        )
        .await
    }

    fn next_mid(&self) -> String {
        let live: HashSet<String> = self
            .inner
            .consumers
            .lock()
            .values()
            .filter_map(|consumer| consumer.mid().map(str::to_owned))
            .collect();
        self.inner
            .state
            .lock()
            .mids
            .next(|mid| live.contains(mid))
    }

    fn allocate_sctp_stream_id(&self) -> Result<u16> {
        let mut state = self.inner.state.lock();
        let ids = state.sctp_stream_ids.as_mut().ok_or_else(|| {
            Error::TypeValidation("transport has no SCTP association".to_owned())
        })?;
        ids.allocate().ok_or(Error::NoSctpStreamId)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed() {
            Err(Error::closed("transport"))
        } else {
            Ok(())
        }
    }

    /// A failure that arrives after the transport closed reports the
    /// close.
    fn closed_or(&self, err: Error) -> Error {
        if self.closed() {
            Error::closed("transport")
        } else {
            err
        }
    }

    fn handler_id(&self) -> String {
        self.inner.id.to_string()
    }
}

impl Inner {
    fn handle_notification(&self, notification: &Notification) {
        match notification.event {
            Event::TransportSctpStateChange => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct Body {
                    sctp_state: SctpState,
                }
                if let Some(Body { sctp_state }) = notification_data(notification) {
                    self.state.lock().data.sctp_state = Some(sctp_state);
                    self.handlers
                        .sctp_state_change
                        .call(|handler| handler(sctp_state));
                }
            }
            Event::TransportTrace => {
                let trace = notification.data.clone().unwrap_or(Value::Null);
                self.handlers.trace.call(|handler| handler(&trace));
            }
            Event::WebRtcTransportIceStateChange => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct Body {
                    ice_state: IceState,
                }
                if let Some(Body { ice_state }) = notification_data(notification) {
                    self.state.lock().data.ice_state = Some(ice_state);
                    self.handlers
                        .ice_state_change
                        .call(|handler| handler(ice_state));
                }
            }
            Event::WebRtcTransportIceSelectedTupleChange => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct Body {
                    ice_selected_tuple: TransportTuple,
                }
                if let Some(Body { ice_selected_tuple }) = notification_data(notification) {
                    self.state.lock().data.ice_selected_tuple = Some(ice_selected_tuple.clone());
                    self.handlers
                        .ice_selected_tuple_change
                        .call(|handler| handler(&ice_selected_tuple));
                }
            }
            Event::WebRtcTransportDtlsStateChange => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct Body {
                    dtls_state: DtlsState,
                    #[serde(default)]
                    dtls_remote_cert: Option<String>,
                }
                if let Some(Body {
                    dtls_state,
                    dtls_remote_cert,
                }) = notification_data(notification)
                {
                    {
                        let mut state = self.state.lock();
                        state.data.dtls_state = Some(dtls_state);
                        if dtls_remote_cert.is_some() {
                            state.data.dtls_remote_cert = dtls_remote_cert;
                        }
                    }
                    self.handlers
                        .dtls_state_change
                        .call(|handler| handler(dtls_state));
                }
            }
            Event::PlainTransportTuple => {
                #[derive(Deserialize)]
                struct Body {
                    tuple: TransportTuple,
                }
                if let Some(Body { tuple }) = notification_data(notification) {
                    self.state.lock().data.tuple = Some(tuple.clone());
                    self.handlers.tuple.call(|handler| handler(&tuple));
                }
            }
            Event::PlainTransportRtcpTuple => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct Body {
                    rtcp_tuple: TransportTuple,
                }
                if let Some(Body { rtcp_tuple }) = notification_data(notification) {
                    self.state.lock().data.rtcp_tuple = Some(rtcp_tuple.clone());
                    self.handlers.rtcp_tuple.call(|handler| handler(&rtcp_tuple));
                }
            }
            other => debug!(event = ?other, "ignoring unexpected transport notification"),
        }
    }

    fn release_sctp_stream_id(&self, stream_id: u16) {
        if let Some(ids) = self.state.lock().sctp_stream_ids.as_mut() {
            ids.release(stream_id);
        }
    }

    fn finish_close(&self, router_closed: bool) {
        self.subscription.lock().take();

        // Children are closed without requests of their own; the worker
        // drops them together with the transport.
        let producers = std::mem::take(&mut *self.producers.lock());
        for producer in producers.into_values() {
            producer.transport_closed();
        }
        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers.into_values() {
            consumer.transport_closed();
        }
        let data_producers = std::mem::take(&mut *self.data_producers.lock());
        for data_producer in data_producers.into_values() {
            data_producer.transport_closed();
        }
        let data_consumers = std::mem::take(&mut *self.data_consumers.lock());
        for data_consumer in data_consumers.into_values() {
            data_consumer.transport_closed();
        }

        self.internal_close.call_simple();
        if router_closed {
            self.handlers.router_close.call_simple();
        }
        self.handlers.close.call_simple();
        self.handlers.clear();
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("router_id", &self.inner.router.router_id)
            .field("closed", &self.closed())
            .finish()
    }
}

#[derive(Clone)]
pub(crate) struct WeakTransport {
    inner: Weak<Inner>,
}

impl WeakTransport {
    pub(crate) fn upgrade(&self) -> Option<Transport> {
        self.inner.upgrade().map(|inner| Transport { inner })
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn webrtc_options_serialize_without_app_data() {
        let mut options = WebRtcTransportOptions::new(vec![ListenInfo::udp(IpAddr::V4(
            Ipv4Addr::LOCALHOST,
        ))]);
        options.app_data.insert("room".into(), json!("a"));
        let value = serde_json::to_value(&options).unwrap();

        assert_eq!(value["listenInfos"][0]["ip"], "127.0.0.1");
        assert_eq!(value["enableUdp"], true);
        assert_eq!(value["numSctpStreams"]["MIS"], 1024);
        assert!(value.get("appData").is_none());
    }

    #[test]
    fn connect_body_matches_kind() {
        let params = TransportConnectParams::Pipe {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 40000,
            srtp_parameters: None,
        };
        assert_eq!(params.kind(), TransportKind::Pipe);
        assert_eq!(
            params.to_body(),
            json!({ "ip": "127.0.0.1", "port": 40000, "srtpParameters": null })
        );
    }

    #[test]
    fn transport_data_reads_partial_bodies() {
        let data: TransportData = serde_json::from_value(json!({
            "tuple": { "localAddress": "127.0.0.1", "localPort": 40000, "protocol": "udp" },
            "sctpParameters": { "port": 5000, "OS": 4, "MIS": 4, "maxMessageSize": 262144 },
            "rtx": true
        }))
        .unwrap();

        assert_eq!(data.tuple.map(|tuple| tuple.local_port), Some(40000));
        assert_eq!(data.sctp_parameters.map(|params| params.mis), Some(4));
        assert!(data.rtx);
        assert!(data.ice_parameters.is_none());
    }
}
