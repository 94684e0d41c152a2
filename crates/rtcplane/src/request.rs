//! Thin typed layer over [`Channel::request`].

use std::future::Future;

use rtcplane_channel::{Channel, Method, Notification};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Serialize a request body.
pub(crate) fn body(value: impl Serialize) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|err| Error::TypeValidation(format!("cannot serialize request: {err}")))
}

/// Send a request and return the raw response body.
pub(crate) async fn request_raw(
    channel: &Channel,
    method: Method,
    handler_id: impl Into<String>,
    data: Option<Value>,
) -> Result<Value> {
    Ok(channel.request(method, handler_id, data).await?)
}

/// Send a request and decode the response body. An absent body decodes
/// like an empty object, so response structs should default every field.
pub(crate) async fn request<T: DeserializeOwned>(
    channel: &Channel,
    method: Method,
    handler_id: impl Into<String>,
    data: Option<Value>,
) -> Result<T> {
    let value = match request_raw(channel, method, handler_id, data).await? {
        Value::Null => Value::Object(serde_json::Map::new()),
        value => value,
    };
    serde_json::from_value(value)
        .map_err(|err| Error::InvalidResponse(format!("{method}: {err}")))
}

/// Send a request whose response body carries nothing of interest.
pub(crate) async fn request_ignore(
    channel: &Channel,
    method: Method,
    handler_id: impl Into<String>,
    data: Option<Value>,
) -> Result<()> {
    request_raw(channel, method, handler_id, data).await.map(drop)
}

/// Queue a request now and only log its outcome. Used by synchronous
/// `close()` methods.
pub(crate) fn request_in_background(
    channel: &Channel,
    method: Method,
    handler_id: impl Into<String>,
    data: Option<Value>,
) {
    let response = channel.request(method, handler_id, data);
    spawn_detached(async move {
        if let Err(err) = response.await {
            debug!(%method, error = %err, "background request failed");
        }
    });
}

/// Run a future on the current runtime without waiting for it.
pub(crate) fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => warn!("no tokio runtime, dropping background task"),
    }
}

/// Decode the body of a notification, logging and dropping bad ones.
pub(crate) fn notification_data<T: DeserializeOwned>(notification: &Notification) -> Option<T> {
    let value = notification.data.clone().unwrap_or(Value::Null);
    match serde_json::from_value(value) {
        Ok(data) => Some(data),
        Err(err) => {
            warn!(
                event = ?notification.event,
                error = %err,
                "ignoring notification with unreadable body"
            );
            None
        }
    }
}
