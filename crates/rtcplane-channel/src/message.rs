//! Envelope exchanged with the worker and the codec that serializes it.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodecError;

macro_rules! methods {
    ($($variant:ident => $name:literal,)+) => {
        /// Request method understood by the worker.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum Method {
            $(
                #[serde(rename = $name)]
                $variant,
            )+
        }

        impl Method {
            /// Wire name, as used in logs.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }
        }
    };
}

methods! {
    WorkerClose => "worker.close",
    WorkerDump => "worker.dump",
    WorkerGetResourceUsage => "worker.getResourceUsage",
    WorkerUpdateSettings => "worker.updateSettings",
    WorkerCreateRouter => "worker.createRouter",
    WorkerCloseRouter => "worker.closeRouter",

    RouterDump => "router.dump",
    RouterCreateWebRtcTransport => "router.createWebRtcTransport",
    RouterCreatePlainTransport => "router.createPlainTransport",
    RouterCreatePipeTransport => "router.createPipeTransport",
    RouterCreateDirectTransport => "router.createDirectTransport",
    RouterCloseTransport => "router.closeTransport",
    RouterCreateActiveSpeakerObserver => "router.createActiveSpeakerObserver",
    RouterCreateAudioLevelObserver => "router.createAudioLevelObserver",
    RouterCloseRtpObserver => "router.closeRtpObserver",

    TransportDump => "transport.dump",
    TransportGetStats => "transport.getStats",
    TransportConnect => "transport.connect",
    TransportSetMaxIncomingBitrate => "transport.setMaxIncomingBitrate",
    TransportSetMaxOutgoingBitrate => "transport.setMaxOutgoingBitrate",
    TransportSetMinOutgoingBitrate => "transport.setMinOutgoingBitrate",
    TransportRestartIce => "transport.restartIce",
    TransportEnableTraceEvent => "transport.enableTraceEvent",
    TransportProduce => "transport.produce",
    TransportConsume => "transport.consume",
    TransportProduceData => "transport.produceData",
    TransportConsumeData => "transport.consumeData",
    TransportCloseProducer => "transport.closeProducer",
    TransportCloseConsumer => "transport.closeConsumer",
    TransportCloseDataProducer => "transport.closeDataProducer",
    TransportCloseDataConsumer => "transport.closeDataConsumer",

    ProducerDump => "producer.dump",
    ProducerGetStats => "producer.getStats",
    ProducerPause => "producer.pause",
    ProducerResume => "producer.resume",
    ProducerEnableTraceEvent => "producer.enableTraceEvent",

    ConsumerDump => "consumer.dump",
    ConsumerGetStats => "consumer.getStats",
    ConsumerPause => "consumer.pause",
    ConsumerResume => "consumer.resume",
    ConsumerSetPreferredLayers => "consumer.setPreferredLayers",
    ConsumerSetPriority => "consumer.setPriority",
    ConsumerRequestKeyFrame => "consumer.requestKeyFrame",
    ConsumerEnableTraceEvent => "consumer.enableTraceEvent",

    DataProducerDump => "dataProducer.dump",
    DataProducerGetStats => "dataProducer.getStats",

    DataConsumerDump => "dataConsumer.dump",
    DataConsumerGetStats => "dataConsumer.getStats",
    DataConsumerGetBufferedAmount => "dataConsumer.getBufferedAmount",
    DataConsumerSetBufferedAmountLowThreshold => "dataConsumer.setBufferedAmountLowThreshold",

    RtpObserverPause => "rtpObserver.pause",
    RtpObserverResume => "rtpObserver.resume",
    RtpObserverAddProducer => "rtpObserver.addProducer",
    RtpObserverRemoveProducer => "rtpObserver.removeProducer",
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification event name, in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    #[serde(rename = "transport.sctpStateChange")]
    TransportSctpStateChange,
    #[serde(rename = "transport.trace")]
    TransportTrace,
    #[serde(rename = "webRtcTransport.iceStateChange")]
    WebRtcTransportIceStateChange,
    #[serde(rename = "webRtcTransport.iceSelectedTupleChange")]
    WebRtcTransportIceSelectedTupleChange,
    #[serde(rename = "webRtcTransport.dtlsStateChange")]
    WebRtcTransportDtlsStateChange,
    #[serde(rename = "plainTransport.tuple")]
    PlainTransportTuple,
    #[serde(rename = "plainTransport.rtcpTuple")]
    PlainTransportRtcpTuple,

    #[serde(rename = "producer.score")]
    ProducerScore,
    #[serde(rename = "producer.videoOrientationChange")]
    ProducerVideoOrientationChange,
    #[serde(rename = "producer.trace")]
    ProducerTrace,

    #[serde(rename = "consumer.producerClose")]
    ConsumerProducerClose,
    #[serde(rename = "consumer.producerPause")]
    ConsumerProducerPause,
    #[serde(rename = "consumer.producerResume")]
    ConsumerProducerResume,
    #[serde(rename = "consumer.score")]
    ConsumerScore,
    #[serde(rename = "consumer.layersChange")]
    ConsumerLayersChange,
    #[serde(rename = "consumer.trace")]
    ConsumerTrace,

    #[serde(rename = "dataConsumer.dataProducerClose")]
    DataConsumerDataProducerClose,
    #[serde(rename = "dataConsumer.bufferedAmountLow")]
    DataConsumerBufferedAmountLow,
    #[serde(rename = "dataConsumer.sctpSendBufferFull")]
    DataConsumerSctpSendBufferFull,

    #[serde(rename = "activeSpeakerObserver.dominantSpeaker")]
    ActiveSpeakerObserverDominantSpeaker,
    #[serde(rename = "audioLevelObserver.volumes")]
    AudioLevelObserverVolumes,
    #[serde(rename = "audioLevelObserver.silence")]
    AudioLevelObserverSilence,

    /// Outbound: payload for a direct-transport data producer.
    #[serde(rename = "dataProducer.send")]
    DataProducerSend,

    /// Any event this client does not know about.
    #[serde(other)]
    Unknown,
}

/// Outgoing request. `id` is unique among in-flight requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: u32,
    pub method: Method,
    pub handler_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Worker answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub id: u32,
    #[serde(default)]
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Event addressed to one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub handler_id: String,
    pub event: Event,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Worker log line. The first character carries the severity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    Debug,
    Warn,
    Error,
    /// Dump output, printed as-is.
    Dump,
}

impl Log {
    /// Split the line into its severity and text.
    ///
    /// Returns `None` for an empty line or an unknown severity marker.
    pub fn parse(&self) -> Option<(LogSeverity, &str)> {
        let mut chars = self.data.chars();
        let severity = match chars.next()? {
            'D' => LogSeverity::Debug,
            'W' => LogSeverity::Warn,
            'E' => LogSeverity::Error,
            'X' => LogSeverity::Dump,
            _ => return None,
        };
        Some((severity, chars.as_str()))
    }
}

/// Every message that travels over the channel, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
    Log(Log),
}

/// Turns [`Message`]s into frame payloads and back.
pub trait MessageCodec: Send + Sync + 'static {
    /// Append the encoded message to `dst`.
    fn encode(&self, message: &Message, dst: &mut Vec<u8>) -> Result<(), CodecError>;

    fn decode(&self, payload: &[u8]) -> Result<Message, CodecError>;
}

/// JSON body codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode(&self, message: &Message, dst: &mut Vec<u8>) -> Result<(), CodecError> {
        serde_json::to_writer(dst, message)?;
        Ok(())
    }

    fn decode(&self, payload: &[u8]) -> Result<Message, CodecError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_uses_wire_field_names() {
        let message = Message::Request(Request {
            id: 7,
            method: Method::TransportConsume,
            handler_id: "t-1".into(),
            data: Some(json!({ "paused": true })),
        });

        let mut out = Vec::new();
        JsonCodec.encode(&message, &mut out).unwrap();
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "request",
                "id": 7,
                "method": "transport.consume",
                "handlerId": "t-1",
                "data": { "paused": true },
            })
        );
    }

    #[test]
    fn request_without_body_omits_data() {
        let message = Message::Request(Request {
            id: 1,
            method: Method::WorkerClose,
            handler_id: String::new(),
            data: None,
        });

        let mut out = Vec::new();
        JsonCodec.encode(&message, &mut out).unwrap();
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert!(value.get("data").is_none());
    }

    #[test]
    fn rejected_response_decodes() {
        let payload =
            br#"{"type":"response","id":3,"accepted":false,"error":"TypeError","reason":"bad"}"#;
        let message = JsonCodec.decode(payload).unwrap();
        assert_eq!(
            message,
            Message::Response(Response {
                id: 3,
                accepted: false,
                error: Some("TypeError".into()),
                reason: Some("bad".into()),
                data: None,
            })
        );
    }

    #[test]
    fn unknown_event_maps_to_unknown() {
        let payload = br#"{"type":"notification","handlerId":"x","event":"router.future"}"#;
        match JsonCodec.decode(payload).unwrap() {
            Message::Notification(notification) => {
                assert_eq!(notification.event, Event::Unknown);
                assert_eq!(notification.handler_id, "x");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(JsonCodec.decode(b"{not json").is_err());
    }

    #[test]
    fn log_severity_comes_from_first_character() {
        let log = |s: &str| Log { data: s.into() };
        assert_eq!(
            log("Dsome debug").parse(),
            Some((LogSeverity::Debug, "some debug"))
        );
        assert_eq!(log("Woops").parse(), Some((LogSeverity::Warn, "oops")));
        assert_eq!(log("Ebad").parse(), Some((LogSeverity::Error, "bad")));
        assert_eq!(log("X{}").parse(), Some((LogSeverity::Dump, "{}")));
        assert_eq!(log("?what").parse(), None);
        assert_eq!(log("").parse(), None);
    }

    #[test]
    fn method_display_is_wire_name() {
        assert_eq!(Method::RouterCreatePipeTransport.to_string(), "router.createPipeTransport");
    }
}
