//! Live update channel: a persistent, auto-reconnecting subscription to
//! server-pushed catalog events.
//!
//! Responsibilities:
//! - opening the event stream and tracking [`ConnectionState`]
//! - decoding raw named messages into the closed [`LiveEvent`] set
//! - dispatching events synchronously to registered listeners
//! - reconnecting with a bounded [`BackoffPolicy`] after unexpected drops
//!
//! The channel only produces events. Applying them to cached data is the
//! caller's job.

use std::time::Duration;

use thiserror::Error;

pub mod backoff;
pub mod channel;
pub mod events;
pub mod source;
pub mod state;
pub mod subscriptions;

pub use backoff::BackoffPolicy;
pub use channel::{ChannelOptions, LiveChannel};
pub use events::{EventKind, LiveEvent, RawEvent};
pub use source::{EventSource, EventStream, SseSource};
pub use state::ConnectionState;
pub use subscriptions::{listener, Listener, SubscriptionTable};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("failed to open event stream: {0}")]
    Connect(String),
    #[error("event stream dropped: {0}")]
    Dropped(String),
    #[error("connect attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed {event} message: {reason}")]
    Protocol { event: String, reason: String },
    #[error("gave up reconnecting after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

pub type ChannelResult<T> = Result<T, ChannelError>;
