use std::str::FromStr;
use std::time::Duration;

use kreflect_kubehub::DEFAULT_MAX_LINE_BYTES;

/// Upper bound of any single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(3600);
/// Upper bound of the per-reflector event channel.
pub const MAX_EVENT_CHANNEL_CAP: usize = 65_536;

/// Tunables of one reflector. Defaults come from `KREFLECT_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ReflectorConfig {
    /// Page size of listings; `None` lists in one request.
    pub page_size: Option<u32>,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Relist on this interval even when the watch is healthy.
    pub resync_interval: Option<Duration>,
    /// Treat a watch silent for this long as dead. Unset keeps the watch open indefinitely.
    pub watch_idle_timeout: Option<Duration>,
    /// `timeoutSeconds` sent with each watch.
    pub watch_timeout_secs: Option<u32>,
    pub allow_bookmarks: bool,
    pub max_line_bytes: usize,
    pub event_channel_cap: usize,
    pub stop_timeout: Duration,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            page_size: Some(500),
            backoff_initial: Duration::from_millis(800),
            backoff_max: Duration::from_secs(30),
            resync_interval: None,
            watch_idle_timeout: None,
            watch_timeout_secs: None,
            allow_bookmarks: true,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            event_channel_cap: 1024,
            stop_timeout: Duration::from_millis(5000),
        }
    }
}

fn env<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl ReflectorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            page_size: match env::<u32>("KREFLECT_PAGE_SIZE") {
                Some(0) => None,
                Some(n) => Some(n),
                None => d.page_size,
            },
            backoff_initial: env("KREFLECT_BACKOFF_INITIAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.backoff_initial)
                .min(MAX_BACKOFF),
            backoff_max: env("KREFLECT_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.backoff_max).min(MAX_BACKOFF),
            resync_interval: env("KREFLECT_RESYNC_SECS").filter(|s| *s > 0).map(Duration::from_secs),
            watch_idle_timeout: env("KREFLECT_WATCH_IDLE_SECS").filter(|s| *s > 0).map(Duration::from_secs),
            watch_timeout_secs: env("KREFLECT_WATCH_TIMEOUT_SECS").filter(|s| *s > 0),
            allow_bookmarks: d.allow_bookmarks,
            max_line_bytes: env("KREFLECT_MAX_LINE_BYTES").unwrap_or(d.max_line_bytes),
            event_channel_cap: env::<usize>("KREFLECT_EVENT_CAP")
                .map(|c| c.clamp(1, MAX_EVENT_CHANNEL_CAP))
                .unwrap_or(d.event_channel_cap),
            stop_timeout: env("KREFLECT_STOP_TIMEOUT_MS").map(Duration::from_millis).unwrap_or(d.stop_timeout),
        }
    }

    pub fn with_page_size(mut self, page_size: Option<u32>) -> Self {
        self.page_size = page_size.filter(|p| *p > 0);
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self
    }

    pub fn with_resync(mut self, interval: Option<Duration>) -> Self {
        self.resync_interval = interval;
        self
    }

    pub fn with_watch_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.watch_idle_timeout = timeout;
        self
    }

    pub fn with_watch_timeout_secs(mut self, secs: Option<u32>) -> Self {
        self.watch_timeout_secs = secs;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}
