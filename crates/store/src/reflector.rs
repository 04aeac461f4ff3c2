use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kreflect_core::{Error, Resource, Result, WatchEvent};
use kreflect_kubehub::{list_all, EventDecoder, ListWatch, WatchOptions, WatchStream};

use crate::config::MAX_EVENT_CHANNEL_CAP;
use crate::{ApplyOutcome, Backoff, ReflectorConfig, Store};

/// Where the list/watch cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectorPhase {
    Idle,
    /// First listing and its retries.
    Listing,
    Watching,
    /// Listing again after a watch ended.
    Relisting,
    Stopped,
}

/// Coarse class of a failure seen by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Listing,
    Connection,
    Decode,
    Expired,
    Server,
}

impl FailureKind {
    pub fn of(err: &Error) -> Self {
        match err {
            Error::Decode(_) => Self::Decode,
            Error::SnapshotExpired(_) => Self::Expired,
            Error::Listing(_) => Self::Listing,
            Error::Connection(_) | Error::Cancelled => Self::Connection,
            _ => Self::Server,
        }
    }
}

/// Notifications broadcast to observers of one reflector.
#[derive(Debug, Clone)]
pub enum ReflectorEvent {
    /// A listing replaced the store.
    Synced { resource_version: String, items: usize },
    /// A watch event changed the store or advanced its cursor. Stale events are not sent.
    Event(WatchEvent),
    /// A recovered failure; the loop keeps running.
    Error { kind: FailureKind, message: String },
}

/// Keeps a [`Store`] in sync with one remote collection.
pub struct Reflector {
    lw: Arc<dyn ListWatch>,
    store: Arc<Store>,
    config: ReflectorConfig,
    events: broadcast::Sender<ReflectorEvent>,
}

impl Reflector {
    pub fn new(lw: Arc<dyn ListWatch>, config: ReflectorConfig) -> Self {
        Self::with_store(lw, Arc::new(Store::new()), config)
    }

    pub fn with_store(lw: Arc<dyn ListWatch>, store: Arc<Store>, config: ReflectorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_cap.clamp(1, MAX_EVENT_CHANNEL_CAP));
        Self { lw, store, config, events }
    }

    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    /// Subscribe before `spawn` to see the first `Synced`.
    pub fn subscribe(&self) -> broadcast::Receiver<ReflectorEvent> {
        self.events.subscribe()
    }

    /// Start the loop on the current tokio runtime.
    pub fn spawn(self) -> ReflectorHandle {
        let stop = CancellationToken::new();
        let (phase_tx, phase_rx) = watch::channel(ReflectorPhase::Idle);
        let (synced_tx, synced_rx) = watch::channel(false);
        let handle_events = self.events.clone();
        let store = Arc::clone(&self.store);
        let stop_timeout = self.config.stop_timeout;
        let worker = Worker { r: self, stop: stop.clone(), phase_tx, synced_tx };
        let task = tokio::spawn(worker.run());
        ReflectorHandle { store, stop, task: Some(task), phase_rx, synced_rx, events: handle_events, stop_timeout }
    }
}

/// A watch open this long counts as healthy even if it delivered nothing.
const HEALTHY_WATCH: Duration = Duration::from_secs(5);

/// Why one watch ended.
enum WatchExit {
    Stopped,
    /// Server closed the stream or the resync interval elapsed.
    Ended,
    /// 410, in the open response or as an ERROR event.
    Expired(String),
    Failed(Error),
}

enum Step {
    Stop,
    Resync,
    Next(Option<Result<WatchEvent>>),
}

struct Worker {
    r: Reflector,
    stop: CancellationToken,
    phase_tx: watch::Sender<ReflectorPhase>,
    synced_tx: watch::Sender<bool>,
}

impl Worker {
    fn set_phase(&self, phase: ReflectorPhase) {
        self.phase_tx.send_if_modified(|p| {
            let changed = *p != phase;
            *p = phase;
            changed
        });
    }

    fn report(&self, err: &Error) {
        let _ = self.r.events.send(ReflectorEvent::Error { kind: FailureKind::of(err), message: err.to_string() });
    }

    /// Sleep for the next backoff delay; false if stop was requested meanwhile.
    async fn pause(&self, backoff: &mut Backoff) -> bool {
        let delay = backoff.next_delay();
        debug!(collection = %self.r.lw.describe(), attempt = backoff.attempt(), delay_ms = %delay.as_millis(), "reflector: backing off");
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn run(self) {
        let what = self.r.lw.describe();
        let cfg = &self.r.config;
        let mut backoff = Backoff::new(cfg.backoff_initial, cfg.backoff_max);
        let mut listed_once = false;
        // early watch ends since the last healthy watch
        let mut quick_relists = 0u32;
        info!(collection = %what, "reflector: started");
        loop {
            self.set_phase(if listed_once { ReflectorPhase::Relisting } else { ReflectorPhase::Listing });
            let t0 = Instant::now();
            let listed = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                r = list_all(self.r.lw.as_ref(), cfg.page_size) => r,
            };
            let list = match listed {
                Ok(list) => list,
                Err(e) => {
                    warn!(collection = %what, error = %e, attempt = backoff.attempt() + 1, "reflector: listing failed");
                    self.report(&e);
                    if self.pause(&mut backoff).await {
                        continue;
                    }
                    break;
                }
            };
            if listed_once {
                counter!("kreflect_relists_total", 1);
            }
            listed_once = true;
            let rv = list.resource_version.clone();
            let items = list.items.len();
            self.r.store.replace_all(list);
            info!(collection = %what, rv = %rv, items, took_ms = %t0.elapsed().as_millis(), "reflector: synced");
            let _ = self.r.events.send(ReflectorEvent::Synced { resource_version: rv.clone(), items });
            self.synced_tx.send_replace(true);

            let (exit, healthy) = self.watch_once(&rv).await;
            if healthy {
                backoff.reset();
                quick_relists = 0;
            }
            let early_end = match exit {
                WatchExit::Stopped => break,
                WatchExit::Ended => {
                    debug!(collection = %what, healthy, "reflector: watch ended; relisting");
                    !healthy
                }
                WatchExit::Expired(msg) => {
                    info!(collection = %what, reason = %msg, healthy, "reflector: resource version expired; relisting");
                    self.report(&Error::SnapshotExpired(msg));
                    !healthy
                }
                WatchExit::Failed(e) => {
                    warn!(collection = %what, error = %e, healthy, "reflector: watch failed");
                    self.report(&e);
                    if !self.pause(&mut backoff).await {
                        break;
                    }
                    false
                }
            };
            counter!("kreflect_watch_restarts_total", 1);
            // an early end relists at once only the first time; repeats back off
            if early_end {
                quick_relists += 1;
                if quick_relists > 1 && !self.pause(&mut backoff).await {
                    break;
                }
            }
        }
        self.r.store.clear();
        self.synced_tx.send_replace(false);
        self.set_phase(ReflectorPhase::Stopped);
        info!(collection = %what, "reflector: stopped");
    }

    /// Watch from `rv`. The flag is true when the watch was healthy: it made progress
    /// (applied an event or a bookmark), reached a periodic resync, or stayed open for
    /// [`HEALTHY_WATCH`].
    async fn watch_once(&self, rv: &str) -> (WatchExit, bool) {
        let opened_at = Instant::now();
        let mut progressed = false;
        let exit = self.watch_from(rv, &mut progressed).await;
        (exit, progressed || opened_at.elapsed() >= HEALTHY_WATCH)
    }

    /// Apply events from `rv` until the stream ends or stop is requested.
    async fn watch_from(&self, rv: &str, progressed: &mut bool) -> WatchExit {
        let cfg = &self.r.config;
        let opts = WatchOptions { allow_bookmarks: cfg.allow_bookmarks, timeout_secs: cfg.watch_timeout_secs };
        let opened = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return WatchExit::Stopped,
            r = self.r.lw.watch(rv, opts) => r,
        };
        let conn = match opened {
            Ok(conn) => conn,
            Err(e) if e.is_expired() => return WatchExit::Expired(e.to_string()),
            Err(e) => return WatchExit::Failed(e),
        };
        let mut stream =
            WatchStream::new(conn, EventDecoder::with_limit(cfg.max_line_bytes)).with_idle_timeout(cfg.watch_idle_timeout);
        self.set_phase(ReflectorPhase::Watching);

        let resync = async {
            match cfg.resync_interval {
                Some(every) => tokio::time::sleep(every).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(resync);

        loop {
            let step = tokio::select! {
                biased;
                _ = self.stop.cancelled() => Step::Stop,
                _ = &mut resync => Step::Resync,
                n = stream.next_event() => Step::Next(n),
            };
            let next = match step {
                Step::Stop => {
                    stream.finish();
                    return WatchExit::Stopped;
                }
                Step::Resync => {
                    stream.finish();
                    debug!(collection = %self.r.lw.describe(), "reflector: periodic resync");
                    *progressed = true;
                    return WatchExit::Ended;
                }
                Step::Next(n) => n,
            };
            let ev = match next {
                Some(Ok(ev)) => ev,
                None => return WatchExit::Ended,
                Some(Err(Error::Cancelled)) if self.stop.is_cancelled() => return WatchExit::Stopped,
                Some(Err(Error::Cancelled)) => return WatchExit::Ended,
                Some(Err(e)) if e.is_expired() => return WatchExit::Expired(e.to_string()),
                Some(Err(e)) => return WatchExit::Failed(e),
            };
            match self.r.store.apply(&ev) {
                ApplyOutcome::Relist => {
                    stream.finish();
                    let message = ev.error_message();
                    if ev.is_expired() {
                        return WatchExit::Expired(message);
                    }
                    let code = ev.status_code().and_then(|c| u16::try_from(c).ok()).unwrap_or(500);
                    return WatchExit::Failed(Error::Api { code, message });
                }
                ApplyOutcome::Unchanged => {
                    debug!(rv = %ev.resource_version, event = %ev.event_type, "reflector: event changed nothing");
                }
                _ => {
                    *progressed = true;
                    counter!("kreflect_watch_events_total", 1, "type" => ev.event_type.as_str());
                    let _ = self.r.events.send(ReflectorEvent::Event(ev));
                }
            }
        }
    }
}

/// Owner of a running reflector. Dropping it requests stop without waiting.
pub struct ReflectorHandle {
    store: Arc<Store>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
    phase_rx: watch::Receiver<ReflectorPhase>,
    synced_rx: watch::Receiver<bool>,
    events: broadcast::Sender<ReflectorEvent>,
    stop_timeout: Duration,
}

impl ReflectorHandle {
    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    pub fn snapshot(&self) -> Vec<Resource> {
        self.store.list()
    }

    pub fn last_resource_version(&self) -> String {
        self.store.resource_version()
    }

    pub fn phase(&self) -> ReflectorPhase {
        *self.phase_rx.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ReflectorPhase> {
        self.phase_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReflectorEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Resolve once the first listing has populated the store.
    ///
    /// Fails with `Cancelled` if the reflector stops before that.
    pub async fn wait_synced(&self) -> Result<()> {
        let mut rx = self.synced_rx.clone();
        rx.wait_for(|s| *s).await.map(|_| ()).map_err(|_| Error::Cancelled)
    }

    /// Request stop and wait for the loop to exit, aborting it after the configured timeout.
    pub async fn stop(mut self) {
        self.stop.cancel();
        let Some(mut task) = self.task.take() else { return };
        match tokio::time::timeout(self.stop_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "reflector: task ended abnormally"),
            Err(_) => {
                warn!(timeout_ms = %self.stop_timeout.as_millis(), "reflector: stop timed out; aborting");
                task.abort();
                self.store.clear();
            }
        }
    }
}

impl Drop for ReflectorHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
