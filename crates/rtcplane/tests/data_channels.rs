mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{create_router, listen_info, start};
use rtcplane::channel::{Event, Method};
use rtcplane::sctp_parameters::{NumSctpStreams, SctpStreamParameters};
use rtcplane::{
    DataConsumerOptions, DataProducer, DataProducerOptions, DataType, DirectTransportOptions,
    Error, Router, Transport, WebRtcMessage, WebRtcTransportOptions,
};
use serde_json::json;

async fn sctp_transport(router: &Router, mis: u16) -> Transport {
    let mut options = WebRtcTransportOptions::new(vec![listen_info()]);
    options.enable_sctp = true;
    options.num_sctp_streams = NumSctpStreams { os: mis, mis };
    router
        .create_webrtc_transport(options)
        .await
        .expect("sctp transport should be created")
}

async fn sctp_data_producer(transport: &Transport) -> DataProducer {
    transport
        .produce_data(DataProducerOptions::new_sctp(SctpStreamParameters::new_ordered(0)))
        .await
        .expect("data producer should be created")
}

#[tokio::test]
async fn stream_ids_are_bounded_by_mis() {
    let (worker, fake) = start();
    let router = create_router(&worker).await;
    let send = sctp_transport(&router, 4).await;
    let recv = sctp_transport(&router, 4).await;
    let data_producer = sctp_data_producer(&send).await;

    let mut consumers = Vec::new();
    for _ in 0..4 {
        consumers.push(
            recv.consume_data(DataConsumerOptions::new(data_producer.id()))
                .await
                .expect("data consumer should fit in the stream pool"),
        );
    }
    let mut stream_ids: Vec<u16> = consumers
        .iter()
        .map(|consumer| {
            consumer
                .sctp_stream_parameters()
                .expect("sctp consumer should have stream parameters")
                .stream_id
        })
        .collect();
    stream_ids.sort_unstable();
    assert_eq!(stream_ids, vec![0, 1, 2, 3]);

    fake.clear();
    let err = recv
        .consume_data(DataConsumerOptions::new(data_producer.id()))
        .await
        .expect_err("fifth data consumer should not get a stream id");
    assert_eq!(err, Error::NoSctpStreamId);
    assert_eq!(fake.count(Method::TransportConsumeData), 0);
}

#[tokio::test]
async fn data_producer_close_notification_frees_the_stream_id() {
    let (worker, fake) = start();
    let router = create_router(&worker).await;
    let send = sctp_transport(&router, 4).await;
    let recv = sctp_transport(&router, 4).await;
    let data_producer = sctp_data_producer(&send).await;

    let mut consumers = Vec::new();
    for _ in 0..4 {
        consumers.push(
            recv.consume_data(DataConsumerOptions::new(data_producer.id()))
                .await
                .expect("data consumer should be created"),
        );
    }

    let producer_closes = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&producer_closes);
    consumers[2]
        .on_data_producer_close(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        })
        .detach();
    let freed = consumers[2]
        .sctp_stream_parameters()
        .expect("sctp consumer should have stream parameters")
        .stream_id;

    fake.notify(consumers[2].id(), Event::DataConsumerDataProducerClose, None)
        .await;
    fake.sync(&worker).await;
    assert!(consumers[2].closed());
    assert_eq!(producer_closes.load(Ordering::SeqCst), 1);

    let replacement = recv
        .consume_data(DataConsumerOptions::new(data_producer.id()))
        .await
        .expect("freed stream id should be reusable");
    assert_eq!(
        replacement
            .sctp_stream_parameters()
            .map(|params| params.stream_id),
        Some(freed)
    );
}

#[tokio::test]
async fn failed_consume_data_releases_the_stream_id() {
    let (worker, fake) = start();
    let router = create_router(&worker).await;
    let send = sctp_transport(&router, 1).await;
    let recv = sctp_transport(&router, 1).await;
    let data_producer = sctp_data_producer(&send).await;

    fake.reject(Method::TransportConsumeData);
    let err = recv
        .consume_data(DataConsumerOptions::new(data_producer.id()))
        .await
        .expect_err("rejected consume_data should fail");
    assert!(matches!(err, Error::Request(_)), "got {err:?}");

    fake.accept(Method::TransportConsumeData);
    let data_consumer = recv
        .consume_data(DataConsumerOptions::new(data_producer.id()))
        .await
        .expect("the only stream id should be free again");
    assert_eq!(
        data_consumer
            .sctp_stream_parameters()
            .map(|params| params.stream_id),
        Some(0)
    );

    data_consumer.close();
    let data_consumer = recv
        .consume_data(DataConsumerOptions::new(data_producer.id()))
        .await
        .expect("closing a data consumer should free its stream id");
    assert!(!data_consumer.closed());
}

#[tokio::test]
async fn reliability_overrides_apply_to_the_consumer_stream() {
    let (worker, _fake) = start();
    let router = create_router(&worker).await;
    let send = sctp_transport(&router, 8).await;
    let recv = sctp_transport(&router, 8).await;
    let data_producer = sctp_data_producer(&send).await;

    let mut options = DataConsumerOptions::new(data_producer.id());
    options.ordered = Some(false);
    options.max_retransmits = Some(3);
    let data_consumer = recv
        .consume_data(options)
        .await
        .expect("data consumer should be created");

    let params = data_consumer
        .sctp_stream_parameters()
        .expect("sctp consumer should have stream parameters");
    assert_eq!(params.ordered, Some(false));
    assert_eq!(params.max_retransmits, Some(3));
    assert_eq!(data_consumer.data_type(), DataType::Sctp);
}

#[tokio::test]
async fn consume_data_without_sctp_is_rejected() {
    let (worker, fake) = start();
    let router = create_router(&worker).await;
    let send = sctp_transport(&router, 4).await;
    let data_producer = sctp_data_producer(&send).await;
    let plain = router
        .create_webrtc_transport(WebRtcTransportOptions::new(vec![listen_info()]))
        .await
        .expect("transport should be created");

    fake.clear();
    let err = plain
        .consume_data(DataConsumerOptions::new(data_producer.id()))
        .await
        .expect_err("transport without sctp should refuse data consumers");
    assert!(matches!(err, Error::TypeValidation(_)), "got {err:?}");
    assert!(fake.requests().is_empty());
}

#[tokio::test]
async fn direct_data_producer_sends_notifications() {
    let (worker, fake) = start();
    let router = create_router(&worker).await;
    let direct = router
        .create_direct_transport(DirectTransportOptions::default())
        .await
        .expect("direct transport should be created");
    let data_producer = direct
        .produce_data(DataProducerOptions::new_direct())
        .await
        .expect("direct data producer should be created");
    assert_eq!(data_producer.data_type(), DataType::Direct);
    assert!(data_producer.sctp_stream_parameters().is_none());

    data_producer
        .send(WebRtcMessage::String("hello".into()))
        .expect("send should be queued");

    let consumer = direct
        .consume_data(DataConsumerOptions::new(data_producer.id()))
        .await
        .expect("direct data consumer should be created");
    assert_eq!(consumer.data_type(), DataType::Direct);

    let request = fake
        .requests()
        .into_iter()
        .find(|request| request.method == Method::TransportConsumeData)
        .expect("consume_data should reach the worker");
    assert_eq!(request.data.as_ref().map(|data| &data["type"]), Some(&json!("direct")));
}

#[tokio::test]
async fn sctp_transport_requires_stream_parameters() {
    let (worker, _fake) = start();
    let router = create_router(&worker).await;
    let transport = sctp_transport(&router, 4).await;

    let err = transport
        .produce_data(DataProducerOptions::default())
        .await
        .expect_err("sctp data producer needs stream parameters");
    assert!(matches!(err, Error::TypeValidation(_)), "got {err:?}");
}
