//! Handle to a running media worker.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rtcplane_channel::{Channel, ChannelConfig, Method};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::data_structures::{AppData, RouterId};
use crate::error::{Error, Result};
use crate::event::{Bag, BagOnce, HandlerId};
use crate::ortc::{DefaultNegotiation, RtpNegotiation};
use crate::request::{body, request_ignore, request_in_background, request_raw};
use crate::router::{adopt, Router, RouterOptions, RouterParams};

/// Settings a [`Worker`] is started with.
#[derive(Clone)]
pub struct WorkerSettings {
    pub channel: ChannelConfig,
    /// Capability negotiation used by every router of the worker.
    pub negotiation: Arc<dyn RtpNegotiation>,
    pub app_data: AppData,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            negotiation: Arc::new(DefaultNegotiation),
            app_data: AppData::new(),
        }
    }
}

impl fmt::Debug for WorkerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSettings")
            .field("channel", &self.channel)
            .field("app_data", &self.app_data)
            .finish_non_exhaustive()
    }
}

/// Runtime settings changeable through [`Worker::update_settings`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerUpdateSettings {
    /// `debug`, `warn`, `error` or `none`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_tags: Option<Vec<String>>,
}

#[derive(Default)]
struct Handlers {
    new_router: Bag<dyn Fn(&Router) + Send + Sync>,
    close: BagOnce<dyn FnOnce() + Send>,
}

struct Inner {
    channel: Channel,
    negotiation: Arc<dyn RtpNegotiation>,
    routers: Mutex<HashMap<RouterId, Router>>,
    closed: AtomicBool,
    app_data: AppData,
    handlers: Handlers,
}

/// Entry point of the control plane: one per worker process.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

impl Worker {
    /// Wrap a channel that is already connected to a worker.
    pub fn new(channel: Channel, settings: WorkerSettings) -> Self {
        let inner = Arc::new(Inner {
            channel,
            negotiation: settings.negotiation,
            routers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            app_data: settings.app_data,
            handlers: Handlers::default(),
        });

        let weak = Arc::downgrade(&inner);
        inner.channel.on_close(move || {
            if let Some(inner) = weak.upgrade() {
                inner.channel_closed();
            }
        });

        Self { inner }
    }

    /// Start a channel over the worker's control sockets and wrap it.
    #[cfg(unix)]
    pub fn from_sockets(
        sockets: rtcplane_transport::WorkerSockets,
        settings: WorkerSettings,
    ) -> rtcplane_channel::Result<Self> {
        let channel = Channel::from_sockets(sockets, settings.channel.clone())?;
        Ok(Self::new(channel, settings))
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.channel.config().worker_pid
    }

    pub fn app_data(&self) -> &AppData {
        &self.inner.app_data
    }

    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// The underlying control channel.
    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    pub async fn dump(&self) -> Result<Value> {
        debug!("dump()");
        self.ensure_open()?;
        request_raw(&self.inner.channel, Method::WorkerDump, "", None).await
    }

    pub async fn get_resource_usage(&self) -> Result<Value> {
        debug!("get_resource_usage()");
        self.ensure_open()?;
        request_raw(&self.inner.channel, Method::WorkerGetResourceUsage, "", None).await
    }

    pub async fn update_settings(&self, settings: WorkerUpdateSettings) -> Result<()> {
        debug!("update_settings()");
        self.ensure_open()?;
        request_ignore(
            &self.inner.channel,
            Method::WorkerUpdateSettings,
            "",
            Some(body(settings)?),
        )
        .await
    }

    pub async fn create_router(&self, options: RouterOptions) -> Result<Router> {
        debug!("create_router()");
        self.ensure_open()?;

        let rtp_capabilities = self
            .inner
            .negotiation
            .router_rtp_capabilities(&options.media_codecs)?;

        let router_id = RouterId::new();
        request_ignore(
            &self.inner.channel,
            Method::WorkerCreateRouter,
            "",
            Some(json!({ "routerId": router_id })),
        )
        .await
        .map_err(|err| if self.closed() { Error::closed("worker") } else { err })?;
        self.ensure_open()?;

        let router = Router::new(RouterParams {
            id: router_id,
            rtp_capabilities,
            negotiation: Arc::clone(&self.inner.negotiation),
            channel: self.inner.channel.clone(),
            app_data: options.app_data,
        });

        let weak = Arc::downgrade(&self.inner);
        router
            .on_internal_close(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.routers.lock().remove(&router_id);
                }
            })
            .detach();
        if !adopt(&self.inner.closed, &self.inner.routers, router_id, &router) {
            router.worker_closed();
            return Err(Error::closed("worker"));
        }

        self.inner
            .handlers
            .new_router
            .call(|handler| handler(&router));
        Ok(router)
    }

    /// Close the worker: tell it to exit, close the channel and close
    /// every router locally.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(pid = ?self.pid(), "close()");

        request_in_background(&self.inner.channel, Method::WorkerClose, "", None);
        self.inner.channel.close();
        self.inner.finish_close();
    }

    pub fn on_new_router<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&Router) + Send + Sync + 'static,
    {
        self.inner.handlers.new_router.add(Arc::new(callback))
    }

    /// Fires once, on explicit close or when the channel to the worker
    /// dies.
    pub fn on_close<F>(&self, callback: F) -> HandlerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.handlers.close.add(Box::new(callback))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed() {
            Err(Error::closed("worker"))
        } else {
            Ok(())
        }
    }
}

impl Inner {
    fn channel_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(pid = ?self.channel.config().worker_pid, "worker channel closed unexpectedly");
        self.finish_close();
    }

    fn finish_close(&self) {
        let routers = std::mem::take(&mut *self.routers.lock());
        for router in routers.into_values() {
            router.worker_closed();
        }
        self.handlers.close.call_simple();
        self.handlers.new_router.clear();
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.pid())
            .field("closed", &self.closed())
            .finish()
    }
}
