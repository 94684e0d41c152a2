use std::time::Duration;

use rtcplane_frame::FrameConfig;

/// Time the reader and writer keep running after [`crate::Channel::close`],
/// so frames already queued still reach the worker.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(200);

/// Channel settings.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Framing limits for both directions.
    pub frame: FrameConfig,
    pub close_grace: Duration,
    /// Worker process id, attached to re-emitted worker log lines.
    pub worker_pid: Option<u32>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            close_grace: DEFAULT_CLOSE_GRACE,
            worker_pid: None,
        }
    }
}
