//! Control-plane client for a media worker process.
//!
//! rtcplane drives a worker that does the actual media forwarding. It
//! talks to the worker over a pair of local sockets and keeps a mirror of
//! the worker's resource tree: workers own routers, routers own
//! transports and RTP observers, transports own producers, consumers,
//! data producers and data consumers.
//!
//! # Crate Structure
//!
//! - [`transport`]: worker control sockets
//! - [`frame`]: length-prefixed framing
//! - [`channel`]: request/response correlation and notification fan-out
//! - [`Worker`], [`router`]: the resource tree
//! - [`ortc`]: RTP capability negotiation
//!
//! Closing a resource closes everything below it locally with a single
//! request to the worker. Nothing is closed on drop.

/// Re-export transport types.
pub mod transport {
    pub use rtcplane_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use rtcplane_frame::*;
}

/// Re-export channel types.
pub mod channel {
    pub use rtcplane_channel::*;
}

pub mod data_structures;
pub mod error;
pub mod event;
pub mod ortc;
mod request;
pub mod router;
pub mod rtp_parameters;
pub mod sctp_parameters;
mod worker;

pub use data_structures::AppData;
pub use error::{Error, Result};
pub use event::HandlerId;
pub use ortc::{DefaultNegotiation, RtpNegotiation};
pub use router::consumer::{Consumer, ConsumerOptions};
pub use router::data_consumer::{DataConsumer, DataConsumerOptions};
pub use router::data_producer::{DataProducer, DataProducerOptions, DataType, WebRtcMessage};
pub use router::producer::{Producer, ProducerOptions};
pub use router::rtp_observer::{
    ActiveSpeakerObserverOptions, AudioLevelObserverOptions, AudioLevelVolume, RtpObserver,
    RtpObserverKind,
};
pub use router::transport::{
    DirectTransportOptions, PipeTransportOptions, PlainTransportOptions, Transport,
    TransportConnectParams, TransportKind, WebRtcTransportOptions,
};
pub use router::{
    PipeDataProducerToRouterPair, PipeProducerToRouterPair, PipeToRouterOptions, Router,
    RouterOptions,
};
pub use worker::{Worker, WorkerSettings, WorkerUpdateSettings};
