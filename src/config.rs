use std::time::Duration;

/// Engine-wide configuration. Defaults suit a single-node deployment; every
/// knob can be overridden through `STATMILL_*` environment variables.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
    pub channel: ChannelConfig,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum concurrently executing jobs.
    pub worker_count: usize,
    /// Maximum jobs waiting for a worker; submissions beyond it fail fast.
    pub queue_depth: usize,
    /// How long a running job gets to acknowledge cooperative cancellation
    /// before it is force-marked cancelled.
    pub cancel_grace: Duration,
    /// How long terminal job records stay queryable before eviction.
    pub retention: Duration,
    /// Cadence of the retention/idle-channel sweep.
    pub sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_depth: 64,
            cancel_grace: Duration::from_secs(5),
            retention: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_total_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            max_total_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Progress events retained per execution for replay. Subscribers that
    /// fall further behind are told to resync.
    pub buffer_events: usize,
    /// Serialized results above this size are split into chunk frames.
    pub max_frame_bytes: usize,
    /// Outbound frames buffered per subscriber before delivery pauses.
    pub outbound_buffer_frames: usize,
    /// Hard limit on how long delivery to a stalled subscriber may pause
    /// before the subscription is torn down.
    pub send_timeout: Duration,
    /// Subscriptions with no activity beyond this window are closed.
    pub idle_timeout: Duration,
    /// Fallback re-check cadence while a subscriber waits for new events.
    pub poll_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            buffer_events: 512,
            max_frame_bytes: 64 * 1024,
            outbound_buffer_frames: 32,
            send_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Some(n) = env_usize("STATMILL_WORKERS") {
            config.scheduler.worker_count = n.max(1);
        }
        if let Some(n) = env_usize("STATMILL_QUEUE_DEPTH") {
            config.scheduler.queue_depth = n.max(1);
        }
        if let Some(secs) = env_u64("STATMILL_RETENTION_SECS") {
            config.scheduler.retention = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("STATMILL_CANCEL_GRACE_SECS") {
            config.scheduler.cancel_grace = Duration::from_secs(secs);
        }
        if let Some(n) = env_usize("STATMILL_CACHE_ENTRIES") {
            config.cache.max_entries = n;
        }
        if let Some(n) = env_usize("STATMILL_CACHE_BYTES") {
            config.cache.max_total_bytes = n;
        }
        if let Some(n) = env_usize("STATMILL_CHANNEL_BUFFER") {
            config.channel.buffer_events = n.max(1);
        }
        if let Some(n) = env_usize("STATMILL_FRAME_BYTES") {
            config.channel.max_frame_bytes = n.max(1024);
        }
        if let Some(secs) = env_u64("STATMILL_CHANNEL_IDLE_SECS") {
            config.channel.idle_timeout = Duration::from_secs(secs);
        }
        config
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = Config::default();
        assert!(config.scheduler.worker_count >= 1);
        assert!(config.scheduler.queue_depth >= config.scheduler.worker_count);
        assert!(config.channel.max_frame_bytes >= 1024);
    }
}
