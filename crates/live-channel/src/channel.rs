use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::backoff::BackoffPolicy;
use crate::events::{EventKind, LiveEvent, RawEvent};
use crate::source::{EventSource, EventStream};
use crate::state::ConnectionState;
use crate::subscriptions::{Listener, SubscriptionTable};
use crate::ChannelError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    pub backoff: BackoffPolicy,
    pub connect_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

struct Inner {
    source: Arc<dyn EventSource>,
    options: ChannelOptions,
    subscriptions: SubscriptionTable,
    state: watch::Sender<ConnectionState>,
    /// Bumped by every `disconnect()`; a driver whose epoch is behind must stop.
    epoch: AtomicU64,
    driver: Mutex<Option<JoinHandle<()>>>,
    errors: broadcast::Sender<ChannelError>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.get_mut().take() {
            handle.abort();
        }
    }
}

/// Handle to a live update channel. Clones share the same connection and
/// subscription table.
#[derive(Clone)]
pub struct LiveChannel {
    inner: Arc<Inner>,
}

impl LiveChannel {
    pub fn new<S: EventSource + 'static>(source: S, options: ChannelOptions) -> Self {
        Self::with_source(Arc::new(source), options)
    }

    pub fn with_source(source: Arc<dyn EventSource>, options: ChannelOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (errors, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                source,
                options,
                subscriptions: SubscriptionTable::new(),
                state,
                epoch: AtomicU64::new(0),
                driver: Mutex::new(None),
                errors,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Terminal failures only: one message per exhausted reconnect cycle.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ChannelError> {
        self.inner.errors.subscribe()
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    pub fn on(&self, kind: EventKind, listener: &Listener) -> bool {
        self.inner.subscriptions.on(kind, listener)
    }

    pub fn off(&self, kind: EventKind, listener: &Listener) -> bool {
        self.inner.subscriptions.off(kind, listener)
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.inner.subscriptions
    }

    /// Opens the connection. A no-op unless currently `Disconnected`.
    ///
    /// An initial failure returns the error and leaves the channel
    /// `Disconnected`; automatic retries only start after a connection that
    /// was once established drops.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let Some(epoch) = self.inner.begin_connect() else {
            debug!(
                target = "live_channel::state",
                state = %self.state(),
                "connect ignored; channel already active"
            );
            return Ok(());
        };

        match self.inner.open().await {
            Ok(stream) => {
                if !self.inner.advance(epoch, ConnectionState::Connected) {
                    debug!(
                        target = "live_channel::state",
                        "connect superseded by disconnect"
                    );
                    return Ok(());
                }
                info!(target = "live_channel::state", "live channel connected");
                let handle = tokio::spawn(drive(Arc::downgrade(&self.inner), epoch, stream));
                let mut driver = self.inner.driver.lock();
                if let Some(previous) = driver.replace(handle) {
                    previous.abort();
                }
                if !self.inner.is_current(epoch) {
                    if let Some(stale) = driver.take() {
                        stale.abort();
                    }
                }
                Ok(())
            }
            Err(err) => {
                self.inner.advance(epoch, ConnectionState::Disconnected);
                warn!(
                    target = "live_channel::state",
                    error = %err,
                    "initial connect failed"
                );
                Err(err)
            }
        }
    }

    /// Stops the connection and any pending reconnect immediately. Listeners
    /// stay registered.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        inner.state.send_if_modified(|current| {
            inner.epoch.fetch_add(1, Ordering::SeqCst);
            let changed = *current != ConnectionState::Disconnected;
            *current = ConnectionState::Disconnected;
            changed
        });
        if let Some(handle) = inner.driver.lock().take() {
            handle.abort();
        }
        debug!(target = "live_channel::state", "live channel disconnected");
    }
}

impl Inner {
    fn begin_connect(&self) -> Option<u64> {
        let mut epoch = None;
        self.state.send_if_modified(|current| {
            if *current != ConnectionState::Disconnected {
                return false;
            }
            epoch = Some(self.epoch.load(Ordering::SeqCst));
            *current = ConnectionState::Connecting;
            true
        });
        epoch
    }

    /// Moves to `next` only along a legal edge and only while `epoch` is current.
    fn advance(&self, epoch: u64, next: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if self.epoch.load(Ordering::SeqCst) != epoch || !current.can_transition_to(next) {
                return false;
            }
            trace!(
                target = "live_channel::state",
                from = %current,
                to = %next,
                "connection state transition"
            );
            *current = next;
            true
        })
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    async fn open(&self) -> Result<EventStream, ChannelError> {
        open_with_timeout(self.source.as_ref(), self.options.connect_timeout).await
    }

    fn deliver(&self, raw: &RawEvent) {
        match LiveEvent::decode(raw) {
            Ok(Some(event)) => {
                let delivered = self.subscriptions.dispatch(&event);
                trace!(
                    target = "live_channel::dispatch",
                    event = raw.event.as_str(),
                    listeners = delivered,
                    "dispatched live event"
                );
            }
            Ok(None) => {
                debug!(
                    target = "live_channel::dispatch",
                    event = raw.event.as_str(),
                    "ignoring unknown event"
                );
            }
            Err(err) => {
                warn!(
                    target = "live_channel::dispatch",
                    error = %err,
                    "dropping malformed live event"
                );
            }
        }
    }
}

/// Pumps one stream until it drops. Returns the drop reason, or `None` when
/// the channel itself has gone away.
async fn pump(inner: &Weak<Inner>, epoch: u64, stream: &mut EventStream) -> Option<String> {
    loop {
        let next = stream.next().await;
        let shared = inner.upgrade()?;
        if !shared.is_current(epoch) {
            return None;
        }
        match next {
            Some(Ok(raw)) => shared.deliver(&raw),
            Some(Err(err)) => return Some(err.to_string()),
            None => return Some("event stream ended".into()),
        }
    }
}

async fn drive(inner: Weak<Inner>, epoch: u64, mut stream: EventStream) {
    loop {
        let Some(reason) = pump(&inner, epoch, &mut stream).await else {
            return;
        };
        let Some(shared) = inner.upgrade() else {
            return;
        };
        if !shared.advance(epoch, ConnectionState::Reconnecting) {
            return;
        }
        drop(shared);
        warn!(
            target = "live_channel::reconnect",
            reason = reason.as_str(),
            "live channel dropped; reconnecting"
        );
        match reconnect(&inner, epoch, reason).await {
            Some(next) => stream = next,
            None => return,
        }
    }
}

/// Runs one reconnect cycle. Returns the new stream once connected, or `None`
/// when the cycle was cancelled, exhausted or the channel has gone away. The
/// channel is only borrowed between awaits so dropping the last handle ends
/// the cycle.
async fn reconnect(inner: &Weak<Inner>, epoch: u64, reason: String) -> Option<EventStream> {
    let (source, options) = {
        let shared = inner.upgrade()?;
        (shared.source.clone(), shared.options.clone())
    };
    let policy = &options.backoff;
    let mut last = reason;
    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay_for(attempt);
        debug!(
            target = "live_channel::reconnect",
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect attempt"
        );
        sleep(delay).await;
        if !inner.upgrade()?.is_current(epoch) {
            return None;
        }
        match open_with_timeout(source.as_ref(), options.connect_timeout).await {
            Ok(stream) => {
                if inner.upgrade()?.advance(epoch, ConnectionState::Connected) {
                    info!(
                        target = "live_channel::reconnect",
                        attempt,
                        "live channel reconnected"
                    );
                    return Some(stream);
                }
                return None;
            }
            Err(err) => {
                warn!(
                    target = "live_channel::reconnect",
                    attempt,
                    error = %err,
                    "reconnect attempt failed"
                );
                last = err.to_string();
            }
        }
    }

    let shared = inner.upgrade()?;
    if shared.advance(epoch, ConnectionState::Disconnected) {
        let err = ChannelError::RetriesExhausted {
            attempts: policy.max_attempts,
            last,
        };
        error!(
            target = "live_channel::reconnect",
            error = %err,
            "exhausted reconnect attempts"
        );
        let _ = shared.errors.send(err);
    }
    None
}

async fn open_with_timeout(
    source: &dyn EventSource,
    limit: Duration,
) -> Result<EventStream, ChannelError> {
    match timeout(limit, source.open()).await {
        Ok(result) => result,
        Err(_) => Err(ChannelError::Timeout(limit)),
    }
}
