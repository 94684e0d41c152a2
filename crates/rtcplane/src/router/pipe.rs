//! Piping producers between routers.
//!
//! Each pair of routers shares at most one pair of connected pipe
//! transports. The pair is created on first use and cached in both
//! routers as a shared future, so concurrent callers wait on the same
//! creation instead of racing to build two pairs.

use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::data_structures::{DataProducerId, ProducerId, RouterId};
use crate::error::{Error, Result};
use crate::request::spawn_detached;
use crate::router::consumer::ConsumerOptions;
use crate::router::data_consumer::DataConsumerOptions;
use crate::router::data_producer::DataProducerOptions;
use crate::router::producer::{Producer, ProducerOptions};
use crate::router::transport::{PipeTransportOptions, Transport, TransportConnectParams};
use crate::router::{
    PipeDataProducerToRouterPair, PipeProducerToRouterPair, PipeToRouterOptions, Router,
    WeakRouter,
};
use crate::rtp_parameters::RtpCapabilities;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Two connected pipe transports, one per router.
#[derive(Debug, Clone)]
pub(crate) struct PipeTransportPair {
    first_router: RouterId,
    first: Transport,
    second: Transport,
}

impl PipeTransportPair {
    /// `(local, remote)` as seen from `router_id`.
    fn for_router(&self, router_id: RouterId) -> (Transport, Transport) {
        if router_id == self.first_router {
            (self.first.clone(), self.second.clone())
        } else {
            (self.second.clone(), self.first.clone())
        }
    }
}

type SharedPipePair = Shared<BoxFuture<'static, Result<PipeTransportPair>>>;

/// Cache slot. The generation identifies one creation attempt so that a
/// late eviction never removes a newer pair.
pub(crate) struct PipeCacheEntry {
    generation: u64,
    pair: SharedPipePair,
}

impl Router {
    /// Pipe `producer_id` into `options.router`: a pipe consumer on this
    /// router feeds a producer with the same id on the other one.
    pub async fn pipe_producer_to_router(
        &self,
        producer_id: ProducerId,
        options: PipeToRouterOptions,
    ) -> Result<PipeProducerToRouterPair> {
        debug!("pipe_producer_to_router()");
        self.ensure_open()?;
        self.check_pipe_target(&options)?;

        let producer = self.get_producer(&producer_id).ok_or_else(|| Error::NotFound {
            kind: "producer",
            id: producer_id.to_string(),
        })?;

        let pair = self.pipe_pair(&options).await?;
        let (local, remote) = pair.for_router(self.id());

        let pipe_consumer = local
            .consume(ConsumerOptions::new(producer_id, RtpCapabilities::default()))
            .await?;

        let mut producer_options = ProducerOptions::new(
            pipe_consumer.kind(),
            pipe_consumer.rtp_parameters().clone(),
        );
        producer_options.id = Some(producer_id);
        producer_options.paused = pipe_consumer.producer_paused();
        producer_options.app_data = producer.app_data().clone();

        let pipe_producer = match remote.produce(producer_options).await {
            Ok(pipe_producer) => pipe_producer,
            Err(err) => {
                pipe_consumer.close();
                return Err(err);
            }
        };

        if let Err(err) = sync_with_source(&producer, &pipe_producer).await {
            pipe_consumer.close();
            pipe_producer.close();
            return Err(err);
        }

        let weak_producer = pipe_producer.downgrade();
        pipe_consumer
            .on_close(move || {
                if let Some(pipe_producer) = weak_producer.upgrade() {
                    pipe_producer.close();
                }
            })
            .detach();

        let weak_producer = pipe_producer.downgrade();
        pipe_consumer
            .on_pause(move || {
                if let Some(pipe_producer) = weak_producer.upgrade() {
                    spawn_detached(async move {
                        if let Err(err) = pipe_producer.pause().await {
                            debug!(error = %err, "failed to pause pipe producer");
                        }
                    });
                }
            })
            .detach();

        let weak_producer = pipe_producer.downgrade();
        pipe_consumer
            .on_resume(move || {
                if let Some(pipe_producer) = weak_producer.upgrade() {
                    spawn_detached(async move {
                        if let Err(err) = pipe_producer.resume().await {
                            debug!(error = %err, "failed to resume pipe producer");
                        }
                    });
                }
            })
            .detach();

        let weak_consumer = pipe_consumer.downgrade();
        pipe_producer
            .on_close(move || {
                if let Some(pipe_consumer) = weak_consumer.upgrade() {
                    pipe_consumer.close();
                }
            })
            .detach();

        Ok(PipeProducerToRouterPair {
            pipe_consumer,
            pipe_producer,
        })
    }

    /// Data counterpart of [`Router::pipe_producer_to_router`]. Only close
    /// is forwarded between the two ends.
    pub async fn pipe_data_producer_to_router(
        &self,
        data_producer_id: DataProducerId,
        options: PipeToRouterOptions,
    ) -> Result<PipeDataProducerToRouterPair> {
        debug!("pipe_data_producer_to_router()");
        self.ensure_open()?;
        self.check_pipe_target(&options)?;

        let data_producer =
            self.get_data_producer(&data_producer_id)
                .ok_or_else(|| Error::NotFound {
                    kind: "data producer",
                    id: data_producer_id.to_string(),
                })?;

        let pair = self.pipe_pair(&options).await?;
        let (local, remote) = pair.for_router(self.id());

        let pipe_data_consumer = local
            .consume_data(DataConsumerOptions::new(data_producer_id))
            .await?;

        let producer_options = DataProducerOptions {
            id: Some(data_producer_id),
            sctp_stream_parameters: pipe_data_consumer.sctp_stream_parameters(),
            label: pipe_data_consumer.label().to_owned(),
            protocol: pipe_data_consumer.protocol().to_owned(),
            paused: false,
            app_data: data_producer.app_data().clone(),
        };
        let pipe_data_producer = match remote.produce_data(producer_options).await {
            Ok(pipe_data_producer) => pipe_data_producer,
            Err(err) => {
                pipe_data_consumer.close();
                return Err(err);
            }
        };

        if data_producer.closed() {
            pipe_data_consumer.close();
            pipe_data_producer.close();
            return Err(Error::InvalidState("original data producer closed".to_owned()));
        }

        let weak_producer = pipe_data_producer.downgrade();
        pipe_data_consumer
            .on_close(move || {
                if let Some(pipe_data_producer) = weak_producer.upgrade() {
                    pipe_data_producer.close();
                }
            })
            .detach();

        let weak_consumer = pipe_data_consumer.downgrade();
        pipe_data_producer
            .on_close(move || {
                if let Some(pipe_data_consumer) = weak_consumer.upgrade() {
                    pipe_data_consumer.close();
                }
            })
            .detach();

        Ok(PipeDataProducerToRouterPair {
            pipe_data_consumer,
            pipe_data_producer,
        })
    }

    fn check_pipe_target(&self, options: &PipeToRouterOptions) -> Result<()> {
        if options.router.id() == self.id() {
            return Err(Error::TypeValidation(
                "cannot pipe a producer into its own router".to_owned(),
            ));
        }
        options.router.ensure_open()
    }

    /// Get the cached pipe pair towards `options.router` or install a new
    /// one. Both routers' caches are updated under both locks, taken in
    /// router id order.
    fn pipe_pair(&self, options: &PipeToRouterOptions) -> SharedPipePair {
        let target = &options.router;
        let self_first = self.id() < target.id();
        let (first, second) = if self_first {
            (&self.inner, &target.inner)
        } else {
            (&target.inner, &self.inner)
        };
        let mut first_pairs = first.pipe_pairs.lock();
        let mut second_pairs = second.pipe_pairs.lock();
        let (own, peer) = if self_first {
            (&mut *first_pairs, &mut *second_pairs)
        } else {
            (&mut *second_pairs, &mut *first_pairs)
        };

        if let Some(entry) = own.get(&target.id()) {
            debug!(peer_router_id = %target.id(), "reusing pipe transport pair");
            return entry.pair.clone();
        }

        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        let mut transport_options = PipeTransportOptions::new(options.listen_info.clone());
        transport_options.enable_sctp = options.enable_sctp;
        transport_options.num_sctp_streams = options.num_sctp_streams;
        transport_options.enable_rtx = options.enable_rtx;
        transport_options.enable_srtp = options.enable_srtp;

        let pair = create_pipe_pair(
            self.downgrade(),
            target.downgrade(),
            transport_options,
            generation,
        )
        .boxed()
        .shared();

        own.insert(
            target.id(),
            PipeCacheEntry {
                generation,
                pair: pair.clone(),
            },
        );
        peer.insert(
            self.id(),
            PipeCacheEntry {
                generation,
                pair: pair.clone(),
            },
        );
        pair
    }
}

async fn create_pipe_pair(
    local: WeakRouter,
    remote: WeakRouter,
    options: PipeTransportOptions,
    generation: u64,
) -> Result<PipeTransportPair> {
    let result = match (local.upgrade(), remote.upgrade()) {
        (Some(local_router), Some(remote_router)) => {
            connect_pipe_pair(&local_router, &remote_router, options, &local, &remote, generation)
                .await
        }
        _ => Err(Error::closed("router")),
    };
    if result.is_err() {
        evict_pipe_pair(&local, &remote, generation);
    }
    result
}

async fn connect_pipe_pair(
    local_router: &Router,
    remote_router: &Router,
    options: PipeTransportOptions,
    local: &WeakRouter,
    remote: &WeakRouter,
    generation: u64,
) -> Result<PipeTransportPair> {
    let (local_result, remote_result) = future::join(
        local_router.create_pipe_transport(options.clone()),
        remote_router.create_pipe_transport(options),
    )
    .await;
    let (local_transport, remote_transport) = match (local_result, remote_result) {
        (Ok(local_transport), Ok(remote_transport)) => (local_transport, remote_transport),
        (Ok(created), Err(err)) | (Err(err), Ok(created)) => {
            created.close();
            return Err(err);
        }
        (Err(err), Err(_)) => return Err(err),
    };

    let connected = match (connect_params(&remote_transport), connect_params(&local_transport)) {
        (Ok(to_remote), Ok(to_local)) => {
            let (local_connect, remote_connect) = future::join(
                local_transport.connect(to_remote),
                remote_transport.connect(to_local),
            )
            .await;
            local_connect.and(remote_connect)
        }
        (Err(err), _) | (_, Err(err)) => Err(err),
    };
    if let Err(err) = connected {
        local_transport.close();
        remote_transport.close();
        return Err(err);
    }

    // Either side closing takes the other one down and forgets the pair.
    for (transport, other) in [
        (&local_transport, &remote_transport),
        (&remote_transport, &local_transport),
    ] {
        let other = other.downgrade();
        let (local, remote) = (local.clone(), remote.clone());
        transport
            .on_internal_close(move || {
                if let Some(other) = other.upgrade() {
                    other.close();
                }
                evict_pipe_pair(&local, &remote, generation);
            })
            .detach();
    }

    debug!(
        local_transport_id = %local_transport.id(),
        remote_transport_id = %remote_transport.id(),
        "pipe transport pair connected"
    );

    Ok(PipeTransportPair {
        first_router: local.id(),
        first: local_transport,
        second: remote_transport,
    })
}

/// Parameters for connecting to `transport` from its peer.
fn connect_params(transport: &Transport) -> Result<TransportConnectParams> {
    let tuple = transport.tuple().ok_or_else(|| {
        Error::InvalidResponse("pipe transport reported no local tuple".to_owned())
    })?;
    Ok(TransportConnectParams::Pipe {
        ip: tuple.local_address,
        port: tuple.local_port,
        srtp_parameters: transport.srtp_parameters(),
    })
}

fn evict_pipe_pair(a: &WeakRouter, b: &WeakRouter, generation: u64) {
    for (router, peer_id) in [(a, b.id()), (b, a.id())] {
        let Some(router) = router.upgrade() else {
            continue;
        };
        let mut pairs = router.inner.pipe_pairs.lock();
        if pairs
            .get(&peer_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            pairs.remove(&peer_id);
        }
    }
}

/// Bring the pipe producer in line with a source that may have changed
/// while the pipe was being set up.
async fn sync_with_source(source: &Producer, pipe_producer: &Producer) -> Result<()> {
    if source.closed() {
        return Err(Error::InvalidState("original producer closed".to_owned()));
    }
    match (source.paused(), pipe_producer.paused()) {
        (true, false) => pipe_producer.pause().await,
        (false, true) => pipe_producer.resume().await,
        _ => Ok(()),
    }
}
