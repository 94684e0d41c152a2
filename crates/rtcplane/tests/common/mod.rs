//! In-process fake worker for integration tests.
//!
//! Answers every request with a canned body, records what it received and
//! can push notifications at the client.

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rtcplane::channel::{
    Channel, ChannelConfig, Event, JsonCodec, Message, MessageCodec, Method, Notification,
    Request, Response,
};
use rtcplane::data_structures::ListenInfo;
use rtcplane::frame::FrameCodec;
use rtcplane::rtp_parameters::{
    CodecParameters, MediaKind, RtcpFeedback, RtpCapabilities, RtpCodecCapability, RtpParameters,
};
use rtcplane::{Router, RouterOptions, Worker, WorkerSettings};
use serde_json::{json, Value};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

type Writer = FramedWrite<DuplexStream, FrameCodec>;

#[derive(Default)]
struct State {
    requests: Mutex<Vec<Request>>,
    rejected: Mutex<HashSet<Method>>,
    held: Mutex<HashSet<Method>>,
    parked: Mutex<Vec<Request>>,
    next_port: AtomicU16,
}

/// Worker end of the control channel.
pub struct FakeWorker {
    state: Arc<State>,
    writer: Arc<tokio::sync::Mutex<Option<Writer>>>,
    task: JoinHandle<()>,
}

/// Start a fake worker and a [`Worker`] connected to it.
pub fn start() -> (Worker, FakeWorker) {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let (client_write, worker_read) = tokio::io::duplex(256 * 1024);
    let (worker_write, client_read) = tokio::io::duplex(256 * 1024);

    let state = Arc::new(State {
        next_port: AtomicU16::new(40000),
        ..State::default()
    });
    let writer = Arc::new(tokio::sync::Mutex::new(Some(FramedWrite::new(
        worker_write,
        FrameCodec::default(),
    ))));
    let task = tokio::spawn(serve(
        FramedRead::new(worker_read, FrameCodec::default()),
        Arc::clone(&writer),
        Arc::clone(&state),
    ));

    let channel = Channel::new(client_read, client_write, ChannelConfig::default());
    let worker = Worker::new(channel, WorkerSettings::default());
    (
        worker,
        FakeWorker {
            state,
            writer,
            task,
        },
    )
}

async fn serve(
    mut reader: FramedRead<DuplexStream, FrameCodec>,
    writer: Arc<tokio::sync::Mutex<Option<Writer>>>,
    state: Arc<State>,
) {
    while let Some(Ok(frame)) = reader.next().await {
        let Ok(Message::Request(request)) = JsonCodec.decode(&frame) else {
            continue;
        };
        state.requests.lock().push(request.clone());

        if state.held.lock().contains(&request.method) {
            state.parked.lock().push(request);
            continue;
        }
        if !write(&writer, &Message::Response(reply(&state, &request))).await {
            break;
        }
    }
}

fn reply(state: &State, request: &Request) -> Response {
    if state.rejected.lock().contains(&request.method) {
        Response {
            id: request.id,
            accepted: false,
            error: Some("Error".into()),
            reason: Some(format!("{} rejected", request.method.as_str())),
            data: None,
        }
    } else {
        Response {
            id: request.id,
            accepted: true,
            error: None,
            reason: None,
            data: answer(state, request),
        }
    }
}

async fn write(writer: &tokio::sync::Mutex<Option<Writer>>, message: &Message) -> bool {
    let mut payload = Vec::new();
    JsonCodec
        .encode(message, &mut payload)
        .expect("message should encode");
    let mut writer = writer.lock().await;
    match writer.as_mut() {
        Some(writer) => writer.send(Bytes::from(payload)).await.is_ok(),
        None => false,
    }
}

/// Canned body per method.
fn answer(state: &State, request: &Request) -> Option<Value> {
    let data = request.data.clone().unwrap_or(Value::Null);
    let sctp_parameters = || {
        data["enableSctp"].as_bool().unwrap_or(false).then(|| {
            let mis = data["numSctpStreams"]["MIS"].as_u64().unwrap_or(1024);
            json!({ "port": 5000, "OS": mis, "MIS": mis, "maxMessageSize": 262144 })
        })
    };
    let tuple = || {
        json!({
            "localAddress": "127.0.0.1",
            "localPort": state.next_port.fetch_add(1, Ordering::Relaxed),
            "protocol": "udp"
        })
    };

    match request.method {
        Method::RouterCreateWebRtcTransport => Some(json!({
            "iceRole": "controlled",
            "iceParameters": { "usernameFragment": "frag", "password": "pass", "iceLite": true },
            "iceCandidates": [],
            "iceState": "new",
            "sctpParameters": sctp_parameters(),
        })),
        Method::RouterCreatePlainTransport => Some(json!({
            "tuple": tuple(),
            "sctpParameters": sctp_parameters(),
        })),
        Method::RouterCreatePipeTransport => Some(json!({
            "tuple": tuple(),
            "rtx": data["enableRtx"].as_bool().unwrap_or(false),
            "sctpParameters": sctp_parameters(),
        })),
        Method::TransportConsume => Some(json!({
            "paused": data["paused"].as_bool().unwrap_or(false),
            "producerPaused": false,
            "score": { "score": 10, "producerScore": 10, "producerScores": [10] }
        })),
        _ => None,
    }
}

impl FakeWorker {
    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<Request> {
        self.state.requests.lock().clone()
    }

    pub fn methods(&self) -> Vec<Method> {
        self.requests()
            .iter()
            .map(|request| request.method)
            .collect()
    }

    /// Methods received, without the dumps issued by [`FakeWorker::sync`].
    pub fn traffic(&self) -> Vec<Method> {
        self.methods()
            .into_iter()
            .filter(|method| *method != Method::WorkerDump)
            .collect()
    }

    pub fn count(&self, method: Method) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.method == method)
            .count()
    }

    pub fn clear(&self) {
        self.state.requests.lock().clear();
    }

    /// Answer `method` with an error until [`FakeWorker::accept`] is called.
    pub fn reject(&self, method: Method) {
        self.state.rejected.lock().insert(method);
    }

    pub fn accept(&self, method: Method) {
        self.state.rejected.lock().remove(&method);
    }

    /// Record `method` requests but hold back their responses until
    /// [`FakeWorker::release`] is called.
    pub fn hold(&self, method: Method) {
        self.state.held.lock().insert(method);
    }

    /// Answer every held `method` request and stop holding it.
    pub async fn release(&self, method: Method) {
        self.state.held.lock().remove(&method);
        let parked: Vec<Request> = {
            let mut parked = self.state.parked.lock();
            let (released, kept) = parked
                .drain(..)
                .partition(|request| request.method == method);
            *parked = kept;
            released
        };
        for request in parked {
            let response = Message::Response(reply(&self.state, &request));
            assert!(
                write(&self.writer, &response).await,
                "held response should be written"
            );
        }
    }

    /// Wait until at least one `method` request has arrived.
    pub async fn wait_for(&self, method: Method) {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while self.count(method) == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("request should arrive");
    }

    /// Send a notification. It is on the wire when this returns.
    pub async fn notify(&self, handler_id: impl ToString, event: Event, data: Option<Value>) {
        let notification = Message::Notification(Notification {
            handler_id: handler_id.to_string(),
            event,
            data,
        });
        assert!(
            write(&self.writer, &notification).await,
            "notification should be written"
        );
    }

    /// Wait until the client has processed everything sent before this
    /// call, in both directions.
    ///
    /// Notifications read in the same batch as a response are dispatched
    /// after that response resolves, so one round-trip is not enough: the
    /// second response can only be read once the first batch's
    /// notifications have run.
    pub async fn sync(&self, worker: &Worker) {
        for _ in 0..2 {
            worker.dump().await.expect("dump should round-trip");
        }
    }

    /// Stop answering and hang up on the client.
    pub async fn hang_up(self) {
        self.task.abort();
        let _ = self.task.await;
        self.writer.lock().await.take();
    }
}

/// Audio and video codecs used by test routers.
pub fn media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".into(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: CodecParameters::new(),
            rtcp_feedback: vec![RtcpFeedback::new("transport-cc", "")],
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".into(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: CodecParameters::new(),
            rtcp_feedback: vec![RtcpFeedback::new("nack", ""), RtcpFeedback::new("nack", "pli")],
        },
    ]
}

pub async fn create_router(worker: &Worker) -> Router {
    worker
        .create_router(RouterOptions::new(media_codecs()))
        .await
        .expect("router should be created")
}

pub fn listen_info() -> ListenInfo {
    ListenInfo::udp(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

pub fn audio_parameters(cname: Option<&str>) -> RtpParameters {
    serde_json::from_value(json!({
        "codecs": [
            { "mimeType": "audio/opus", "payloadType": 111, "clockRate": 48000, "channels": 2 }
        ],
        "encodings": [{ "ssrc": 11111111 }],
        "rtcp": { "cname": cname }
    }))
    .expect("audio parameters should parse")
}

/// Receive capabilities that match the test router.
pub fn client_capabilities(router: &Router) -> RtpCapabilities {
    router.rtp_capabilities().clone()
}
