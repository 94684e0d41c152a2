//! Duplex control channel to a media worker process.
//!
//! One socket carries our requests and notifications to the worker, the
//! other carries responses, notifications and log lines back. This crate
//! correlates responses with pending requests, fans notifications out to
//! per-resource subscribers and routes worker log lines into `tracing`.

pub mod channel;
pub mod config;
pub mod error;
pub mod message;
pub mod pending;
pub mod subscriptions;

pub use channel::{Channel, PendingResponse};
pub use config::ChannelConfig;
pub use error::{ChannelError, CodecError, RequestError, Result};
pub use message::{
    Event, JsonCodec, Log, LogSeverity, Message, MessageCodec, Method, Notification, Request,
    Response,
};
pub use pending::RequestIdAllocator;
pub use subscriptions::SubscriptionHandler;
