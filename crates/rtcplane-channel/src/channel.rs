use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rtcplane_frame::{encode_frame, FrameError, FrameReader, FrameWriter};

use crate::config::ChannelConfig;
use crate::error::RequestError;
use crate::message::{
    Event, JsonCodec, Log, LogSeverity, Message, MessageCodec, Method, Notification, Request,
    Response,
};
use crate::pending::PendingRequests;
use crate::subscriptions::{SubscriptionHandler, Subscriptions};

const WORKER_LOG_TARGET: &str = "rtcplane::worker";

/// A frame queued for the writer task.
struct Outgoing {
    /// Request whose promise fails if the write fails.
    request_id: Option<u32>,
    frame: Bytes,
}

/// Serialization scratch space, cleared after each message.
#[derive(Default)]
struct EncodeBuffers {
    body: Vec<u8>,
    frame: BytesMut,
}

type CloseHandler = Box<dyn FnOnce() + Send>;

struct Inner {
    closed: AtomicBool,
    closed_signal: CancellationToken,
    shutdown: CancellationToken,
    config: ChannelConfig,
    codec: Arc<dyn MessageCodec>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    pending: Mutex<PendingRequests>,
    encode: Mutex<EncodeBuffers>,
    subscriptions: Subscriptions,
    close_handlers: Mutex<Vec<CloseHandler>>,
}

/// Control channel to one worker process.
///
/// Cheap to clone; all clones share the same sockets. Requests are
/// serialized and queued synchronously, so the order of `request` and
/// `notify` calls is the order of frames on the wire.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    /// Start a channel over a reader (worker to us) and a writer (us to
    /// worker). Must be called within a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W, config: ChannelConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_codec(reader, writer, config, Arc::new(JsonCodec))
    }

    /// Like [`Channel::new`] with a custom body codec.
    pub fn with_codec<R, W>(
        reader: R,
        writer: W,
        config: ChannelConfig,
        codec: Arc<dyn MessageCodec>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let frame_config = config.frame.clone();

        let inner = Arc::new(Inner {
            closed: AtomicBool::new(false),
            closed_signal: CancellationToken::new(),
            shutdown: shutdown.clone(),
            config,
            codec,
            outgoing,
            pending: Mutex::new(PendingRequests::default()),
            encode: Mutex::new(EncodeBuffers::default()),
            subscriptions: Subscriptions::default(),
            close_handlers: Mutex::new(Vec::new()),
        });

        let reader = FrameReader::with_config(reader, frame_config.clone());
        let writer = FrameWriter::with_config(writer, frame_config);
        tokio::spawn(run_reader(
            reader,
            Arc::downgrade(&inner),
            shutdown.clone(),
        ));
        tokio::spawn(run_writer(
            writer,
            outgoing_rx,
            Arc::downgrade(&inner),
            shutdown,
        ));

        Self { inner }
    }

    /// Start a channel over the sockets connected to a worker process.
    #[cfg(unix)]
    pub fn from_sockets(
        sockets: rtcplane_transport::WorkerSockets,
        mut config: ChannelConfig,
    ) -> crate::Result<Self> {
        if config.worker_pid.is_none() {
            config.worker_pid = sockets.worker_pid();
        }
        let (writer, reader) = sockets.into_tokio()?;
        Ok(Self::new(reader, writer, config))
    }

    /// Send a request addressed to `handler_id`.
    ///
    /// Serialization and queueing happen before this returns; the returned
    /// future only waits for the worker's answer.
    pub fn request(
        &self,
        method: Method,
        handler_id: impl Into<String>,
        data: Option<Value>,
    ) -> PendingResponse {
        match self.inner.send_request(method, handler_id.into(), data) {
            Ok((id, receiver)) => PendingResponse {
                state: ResponseState::Waiting { id, receiver },
            },
            Err(err) => PendingResponse {
                state: ResponseState::Failed(Some(err)),
            },
        }
    }

    /// Send a fire-and-forget notification to the worker.
    ///
    /// Fails only if the channel is closed or the message cannot be
    /// encoded; write failures are logged.
    pub fn notify(
        &self,
        event: Event,
        handler_id: impl Into<String>,
        data: Option<Value>,
    ) -> Result<(), RequestError> {
        if self.is_closed() {
            return Err(RequestError::ChannelClosed);
        }

        let frame = self.inner.encode(&Message::Notification(Notification {
            handler_id: handler_id.into(),
            event,
            data,
        }))?;
        self.inner
            .outgoing
            .send(Outgoing {
                request_id: None,
                frame,
            })
            .map_err(|_| RequestError::ChannelClosed)
    }

    /// Listen for notifications addressed to `target`.
    pub fn subscribe<F>(&self, target: impl Into<String>, callback: F) -> SubscriptionHandler
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.inner
            .subscriptions
            .subscribe(target.into(), Arc::new(callback))
    }

    /// Run `handler` once when the channel closes, for any reason. Runs
    /// immediately if it is already closed.
    pub fn on_close<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut handlers = self.inner.close_handlers.lock();
        if self.is_closed() {
            drop(handlers);
            handler();
        } else {
            handlers.push(Box::new(handler));
        }
    }

    /// Close the channel. Idempotent.
    ///
    /// Pending requests fail with [`RequestError::ChannelClosed`]. Frames
    /// already queued keep flowing for the configured grace period.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        self.inner.closed_signal.cancelled().await;
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Number of live notification subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("closed", &self.is_closed())
            .field("worker_pid", &self.inner.config.worker_pid)
            .finish()
    }
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn send_request(
        &self,
        method: Method,
        handler_id: String,
        data: Option<Value>,
    ) -> Result<(u32, oneshot::Receiver<Result<Value, RequestError>>), RequestError> {
        // The closed check and the insert share the lock `close` drains under,
        // so no request can slip in after the drain.
        let mut pending = self.pending.lock();
        if self.is_closed() {
            return Err(RequestError::ChannelClosed);
        }

        let id = pending.allocate_id();
        let frame = self.encode(&Message::Request(Request {
            id,
            method,
            handler_id,
            data,
        }))?;

        let (sender, receiver) = oneshot::channel();
        pending.insert(id, method, sender);
        if self
            .outgoing
            .send(Outgoing {
                request_id: Some(id),
                frame,
            })
            .is_err()
        {
            pending.remove(id);
            return Err(RequestError::ChannelClosed);
        }

        debug!(%method, id, "request()");
        Ok((id, receiver))
    }

    fn encode(&self, message: &Message) -> Result<Bytes, RequestError> {
        let mut buffers = self.encode.lock();
        let EncodeBuffers { body, frame } = &mut *buffers;

        body.clear();
        frame.clear();
        let result = self
            .codec
            .encode(message, body)
            .map_err(|err| RequestError::Codec(err.0))
            .and_then(|()| {
                encode_frame(body, self.config.frame.max_payload_size, frame).map_err(
                    |err| match err {
                        FrameError::PayloadTooLarge { size, max } => {
                            RequestError::PayloadTooLarge { size, max }
                        }
                        other => RequestError::Codec(other.to_string()),
                    },
                )?;
                Ok(frame.split().freeze())
            });
        body.clear();
        frame.clear();

        result
    }

    fn close(&self) {
        let drained = {
            let mut pending = self.pending.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            pending.drain()
        };

        debug!(pending = drained.len(), "close()");
        for request in drained {
            let _ = request.sender.send(Err(RequestError::ChannelClosed));
        }

        self.closed_signal.cancel();
        let handlers = mem::take(&mut *self.close_handlers.lock());
        for handler in handlers {
            handler();
        }

        self.schedule_shutdown();
    }

    fn schedule_shutdown(&self) {
        let shutdown = self.shutdown.clone();
        let grace = self.config.close_grace;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    shutdown.cancel();
                });
            }
            Err(_) => shutdown.cancel(),
        }
    }

    fn process_payload(&self, payload: &[u8], notifications: &mut Vec<Notification>) {
        match self.codec.decode(payload) {
            Ok(Message::Response(response)) => self.process_response(response),
            Ok(Message::Notification(notification)) => notifications.push(notification),
            Ok(Message::Log(log)) => self.process_log(&log),
            Ok(Message::Request(request)) => {
                warn!(method = %request.method, id = request.id, "unexpected request from the worker");
            }
            Err(err) => {
                error!(error = %err, "received invalid message from the worker");
            }
        }
    }

    fn process_response(&self, response: Response) {
        let Some(request) = self.pending.lock().remove(response.id) else {
            error!(
                id = response.id,
                "received response does not match any sent request"
            );
            return;
        };

        let method = request.method;
        let outcome = if response.accepted {
            debug!(%method, id = response.id, "request succeeded");
            Ok(response.data.unwrap_or(Value::Null))
        } else if let Some(kind) = response.error {
            let reason = response.reason.unwrap_or_default();
            warn!(%method, id = response.id, error = %kind, %reason, "request failed");
            if kind == "TypeError" {
                Err(RequestError::TypeError(reason))
            } else {
                Err(RequestError::Response { reason })
            }
        } else {
            error!(
                %method,
                id = response.id,
                "received response is not accepted nor rejected"
            );
            Err(RequestError::Protocol(
                "response is neither accepted nor rejected".into(),
            ))
        };

        let _ = request.sender.send(outcome);
    }

    fn process_log(&self, log: &Log) {
        let pid = self.config.worker_pid.unwrap_or_default();
        match log.parse() {
            Some((LogSeverity::Debug, text)) => debug!(target: WORKER_LOG_TARGET, pid, "{}", text),
            Some((LogSeverity::Warn, text)) => warn!(target: WORKER_LOG_TARGET, pid, "{}", text),
            Some((LogSeverity::Error, text)) => error!(target: WORKER_LOG_TARGET, pid, "{}", text),
            Some((LogSeverity::Dump, text)) => info!(target: WORKER_LOG_TARGET, pid, "{}", text),
            None => warn!(pid, line = %log.data, "unexpected log line from the worker"),
        }
    }

    fn write_failed(&self, request_id: Option<u32>, err: &FrameError) {
        let closed = self.is_closed();
        let Some(id) = request_id else {
            if closed {
                debug!(error = %err, "failed to send notification after close");
            } else {
                warn!(error = %err, "failed to send notification");
            }
            return;
        };

        let Some(request) = self.pending.lock().remove(id) else {
            return;
        };
        if closed {
            debug!(method = %request.method, id, error = %err, "failed to send request after close");
        } else {
            warn!(method = %request.method, id, error = %err, "failed to send request");
        }
        let _ = request.sender.send(Err(RequestError::Io(err.to_string())));
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_reader<R>(
    mut reader: FrameReader<R>,
    inner: Weak<Inner>,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut notifications = Vec::new();

    loop {
        let batch = tokio::select! {
            batch = reader.read_batch() => batch,
            () = shutdown.cancelled() => break,
        };
        let Some(channel) = inner.upgrade() else {
            break;
        };

        match batch {
            Ok(batch) => {
                if let Some(err) = batch.overflow {
                    debug!(error = %err, "unread worker data dropped");
                }
                for payload in &batch.frames {
                    channel.process_payload(payload, &mut notifications);
                }
            }
            Err(FrameError::ConnectionClosed) => {
                if !channel.is_closed() {
                    debug!("channel ended by the worker");
                }
                channel.close();
                break;
            }
            Err(err) => {
                if channel.is_closed() {
                    debug!(error = %err, "channel read failed after close");
                } else {
                    error!(error = %err, "channel read failed");
                }
                channel.close();
                break;
            }
        }
        drop(channel);

        if notifications.is_empty() {
            continue;
        }

        // Responses from this batch resolve before its notifications run.
        tokio::task::yield_now().await;
        let Some(channel) = inner.upgrade() else {
            break;
        };
        for notification in notifications.drain(..) {
            channel.subscriptions.dispatch(&notification);
        }
    }

    debug!("channel reader stopped");
}

async fn run_writer<W>(
    mut writer: FrameWriter<W>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    inner: Weak<Inner>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            next = outgoing.recv() => next,
            () = shutdown.cancelled() => break,
        };
        let Some(Outgoing { request_id, frame }) = next else {
            break;
        };

        if let Err(err) = writer.send_encoded(&frame).await {
            match inner.upgrade() {
                Some(channel) => channel.write_failed(request_id, &err),
                None => break,
            }
        }
    }

    let _ = writer.shutdown().await;
    debug!("channel writer stopped");
}

enum ResponseState {
    Failed(Option<RequestError>),
    Waiting {
        id: u32,
        receiver: oneshot::Receiver<Result<Value, RequestError>>,
    },
}

/// The worker's answer to one request.
///
/// Resolves to the response body (`Value::Null` when there is none).
#[must_use = "a request's outcome is only observable by awaiting it"]
pub struct PendingResponse {
    state: ResponseState,
}

impl PendingResponse {
    /// Id assigned to the request, unless it failed before being sent.
    pub fn id(&self) -> Option<u32> {
        match &self.state {
            ResponseState::Waiting { id, .. } => Some(*id),
            ResponseState::Failed(_) => None,
        }
    }
}

impl Future for PendingResponse {
    type Output = Result<Value, RequestError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            ResponseState::Failed(err) => {
                Poll::Ready(Err(err.take().unwrap_or(RequestError::ChannelClosed)))
            }
            ResponseState::Waiting { receiver, .. } => Pin::new(receiver)
                .poll(cx)
                .map(|outcome| outcome.unwrap_or(Err(RequestError::ChannelClosed))),
        }
    }
}

impl fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponse")
            .field("id", &self.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::DuplexStream;

    use super::*;
    use rtcplane_frame::FrameConfig;

    struct FakeWorker {
        reader: FrameReader<DuplexStream>,
        writer: FrameWriter<DuplexStream>,
        received: VecDeque<Message>,
    }

    impl FakeWorker {
        async fn recv(&mut self) -> Message {
            loop {
                if let Some(message) = self.received.pop_front() {
                    return message;
                }
                let batch = self.reader.read_batch().await.unwrap();
                for frame in batch.frames {
                    self.received.push_back(JsonCodec.decode(&frame).unwrap());
                }
            }
        }

        async fn recv_request(&mut self) -> Request {
            match self.recv().await {
                Message::Request(request) => request,
                other => panic!("expected request, got {other:?}"),
            }
        }

        /// Write all messages with a single socket write.
        async fn send(&mut self, messages: &[Message]) {
            let mut wire = BytesMut::new();
            for message in messages {
                let mut body = Vec::new();
                JsonCodec.encode(message, &mut body).unwrap();
                encode_frame(&body, usize::MAX, &mut wire).unwrap();
            }
            self.writer.send_encoded(&wire).await.unwrap();
        }

        async fn send_raw(&mut self, payload: &[u8]) {
            self.writer.send(payload).await.unwrap();
        }
    }

    fn connect(config: ChannelConfig) -> (Channel, FakeWorker) {
        let (client_write, worker_read) = tokio::io::duplex(64 * 1024);
        let (worker_write, client_read) = tokio::io::duplex(64 * 1024);
        let channel = Channel::new(client_read, client_write, config);
        let worker = FakeWorker {
            reader: FrameReader::new(worker_read),
            writer: FrameWriter::new(worker_write),
            received: VecDeque::new(),
        };
        (channel, worker)
    }

    fn accepted(id: u32, data: Value) -> Message {
        Message::Response(Response {
            id,
            accepted: true,
            error: None,
            reason: None,
            data: Some(data),
        })
    }

    fn rejected(id: u32, error: &str, reason: &str) -> Message {
        Message::Response(Response {
            id,
            accepted: false,
            error: Some(error.into()),
            reason: Some(reason.into()),
            data: None,
        })
    }

    fn notification(target: &str, event: Event) -> Message {
        Message::Notification(Notification {
            handler_id: target.into(),
            event,
            data: None,
        })
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_requests() {
        let (channel, mut worker) = connect(ChannelConfig::default());

        let responses: Vec<PendingResponse> = (0..8)
            .map(|i| channel.request(Method::RouterDump, format!("router-{i}"), None))
            .collect();

        let mut requests = Vec::new();
        for _ in 0..8 {
            requests.push(worker.recv_request().await);
        }
        let answers: Vec<Message> = requests
            .iter()
            .rev()
            .map(|request| accepted(request.id, json!({ "handler": request.handler_id })))
            .collect();
        worker.send(&answers).await;

        for (i, response) in responses.into_iter().enumerate() {
            let body = response.await.unwrap();
            assert_eq!(body, json!({ "handler": format!("router-{i}") }));
        }
        assert_eq!(channel.pending_requests(), 0);
    }

    #[tokio::test]
    async fn request_ids_are_sequential_from_one() {
        let (channel, mut worker) = connect(ChannelConfig::default());

        let first = channel.request(Method::WorkerDump, "", None);
        let second = channel.request(Method::WorkerDump, "", None);
        assert_eq!(first.id(), Some(1));
        assert_eq!(second.id(), Some(2));

        assert_eq!(worker.recv_request().await.id, 1);
        assert_eq!(worker.recv_request().await.id, 2);
    }

    #[tokio::test]
    async fn notification_never_overtakes_earlier_response() {
        let (channel, mut worker) = connect(ChannelConfig::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        let _subscription = channel.subscribe("producer-y", {
            let order = Arc::clone(&order);
            move |_: &Notification| order.lock().push("notification")
        });

        let response = channel.request(Method::ProducerDump, "producer-x", None);
        let awaiting = tokio::spawn({
            let order = Arc::clone(&order);
            async move {
                response.await.unwrap();
                order.lock().push("response");
            }
        });

        let request = worker.recv_request().await;
        worker
            .send(&[
                accepted(request.id, Value::Null),
                notification("producer-y", Event::ProducerScore),
            ])
            .await;

        awaiting.await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while order.lock().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(*order.lock(), vec!["response", "notification"]);
    }

    #[tokio::test]
    async fn rejections_map_to_error_kinds() {
        let (channel, mut worker) = connect(ChannelConfig::default());

        let type_error = channel.request(Method::TransportConsume, "t", None);
        let plain_error = channel.request(Method::TransportConsume, "t", None);
        let neither = channel.request(Method::TransportConsume, "t", None);

        let a = worker.recv_request().await.id;
        let b = worker.recv_request().await.id;
        let c = worker.recv_request().await.id;
        worker
            .send(&[
                rejected(a, "TypeError", "missing rtpCapabilities"),
                rejected(b, "Error", "Producer not found"),
                Message::Response(Response {
                    id: c,
                    accepted: false,
                    error: None,
                    reason: None,
                    data: None,
                }),
            ])
            .await;

        assert_eq!(
            type_error.await,
            Err(RequestError::TypeError("missing rtpCapabilities".into()))
        );
        assert_eq!(
            plain_error.await,
            Err(RequestError::Response {
                reason: "Producer not found".into()
            })
        );
        assert!(matches!(neither.await, Err(RequestError::Protocol(_))));
    }

    #[tokio::test]
    async fn garbage_and_unknown_ids_do_not_disturb_the_channel() {
        let (channel, mut worker) = connect(ChannelConfig::default());

        let response = channel.request(Method::WorkerDump, "", None);
        let request = worker.recv_request().await;

        worker.send(&[accepted(9_999, Value::Null)]).await;
        worker.send_raw(b"{definitely not json").await;
        worker
            .send(&[Message::Log(Log {
                data: "Dworker says hi".into(),
            })])
            .await;
        worker.send(&[accepted(request.id, json!(42))]).await;

        assert_eq!(response.await, Ok(json!(42)));
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn oversized_request_fails_without_sending() {
        let config = ChannelConfig {
            frame: FrameConfig {
                max_payload_size: 256,
                ..FrameConfig::default()
            },
            ..ChannelConfig::default()
        };
        let (channel, mut worker) = connect(config);

        let big = json!({ "blob": "x".repeat(1_000) });
        let result = channel
            .request(Method::TransportProduce, "t", Some(big))
            .await;
        assert!(matches!(result, Err(RequestError::PayloadTooLarge { .. })));
        assert_eq!(channel.pending_requests(), 0);

        let _small = channel.request(Method::TransportDump, "t", None);
        let request = worker.recv_request().await;
        assert_eq!(request.method, Method::TransportDump);
    }

    #[tokio::test]
    async fn close_fails_pending_and_later_requests() {
        let (channel, mut worker) = connect(ChannelConfig::default());

        let response = channel.request(Method::RouterDump, "r", None);
        worker.recv_request().await;

        channel.close();
        channel.close();

        assert_eq!(response.await, Err(RequestError::ChannelClosed));
        assert_eq!(
            channel.request(Method::RouterDump, "r", None).await,
            Err(RequestError::ChannelClosed)
        );
        assert_eq!(
            channel.notify(Event::DataProducerSend, "dp", None),
            Err(RequestError::ChannelClosed)
        );
    }

    #[tokio::test]
    async fn frames_queued_before_close_still_reach_the_worker() {
        let (channel, mut worker) = connect(ChannelConfig::default());

        let _response = channel.request(Method::WorkerCloseRouter, "", None);
        channel.close();

        let request = worker.recv_request().await;
        assert_eq!(request.method, Method::WorkerCloseRouter);
    }

    #[tokio::test]
    async fn worker_eof_closes_the_channel() {
        let (channel, mut worker) = connect(ChannelConfig::default());
        let fired = Arc::new(AtomicUsize::new(0));
        channel.on_close({
            let fired = Arc::clone(&fired);
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });

        let response = channel.request(Method::WorkerDump, "", None);
        worker.recv_request().await;
        drop(worker);

        tokio::time::timeout(Duration::from_secs(1), channel.closed())
            .await
            .unwrap();
        assert_eq!(response.await, Err(RequestError::ChannelClosed));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Registered after close: runs right away.
        channel.on_close({
            let fired = Arc::clone(&fired);
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn notify_reaches_worker_in_call_order() {
        let (channel, mut worker) = connect(ChannelConfig::default());

        let _response = channel.request(Method::DataProducerDump, "dp", None);
        channel
            .notify(Event::DataProducerSend, "dp", Some(json!({ "ppid": 51 })))
            .unwrap();

        assert!(matches!(worker.recv().await, Message::Request(_)));
        match worker.recv().await {
            Message::Notification(notification) => {
                assert_eq!(notification.event, Event::DataProducerSend);
                assert_eq!(notification.data, Some(json!({ "ppid": 51 })));
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_subscription_stops_delivery() {
        let (channel, mut worker) = connect(ChannelConfig::default());
        let count = Arc::new(AtomicUsize::new(0));

        let subscription = channel.subscribe("consumer-1", {
            let count = Arc::clone(&count);
            move |_: &Notification| {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(channel.subscription_count(), 1);

        worker
            .send(&[notification("consumer-1", Event::ConsumerScore)])
            .await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while count.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        drop(subscription);
        assert_eq!(channel.subscription_count(), 0);

        // Round-trip a request so the second notification is surely processed.
        worker
            .send(&[notification("consumer-1", Event::ConsumerScore)])
            .await;
        let response = channel.request(Method::ConsumerDump, "consumer-1", None);
        let request = worker.recv_request().await;
        worker.send(&[accepted(request.id, Value::Null)]).await;
        response.await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
