use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest_eventsource::{retry, Event as SseEvent, EventSource as SseStream};
use tracing::debug;
use url::Url;

use crate::events::RawEvent;
use crate::ChannelError;

/// Stream of raw messages for one connection. The stream ending, or yielding
/// an error, means the connection dropped.
pub type EventStream = BoxStream<'static, Result<RawEvent, ChannelError>>;

/// Opens one connection to the push endpoint.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn open(&self) -> Result<EventStream, ChannelError>;
}

/// Server-Sent Events source backed by `reqwest-eventsource`.
///
/// The library's own retry loop is disabled; reconnects are owned by
/// [`LiveChannel`](crate::LiveChannel).
#[derive(Debug, Clone)]
pub struct SseSource {
    http: reqwest::Client,
    url: Url,
    token: Option<String>,
}

impl SseSource {
    pub fn new(url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl EventSource for SseSource {
    async fn open(&self) -> Result<EventStream, ChannelError> {
        let mut request = self.http.get(self.url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let mut es =
            SseStream::new(request).map_err(|err| ChannelError::Connect(err.to_string()))?;
        es.set_retry_policy(Box::new(retry::Never));

        let mut early: Option<RawEvent> = None;
        match es.next().await {
            Some(Ok(SseEvent::Open)) => {}
            Some(Ok(SseEvent::Message(msg))) => {
                early = Some(RawEvent::new(msg.event, msg.data));
            }
            Some(Err(err)) => {
                es.close();
                return Err(ChannelError::Connect(err.to_string()));
            }
            None => {
                return Err(ChannelError::Connect(
                    "event stream closed before opening".into(),
                ))
            }
        }
        debug!(target = "live_channel::sse", url = %self.url, "event stream open");

        let rest = stream::unfold(Some(es), |state| async move {
            let mut es = state?;
            loop {
                match es.next().await {
                    Some(Ok(SseEvent::Open)) => continue,
                    Some(Ok(SseEvent::Message(msg))) => {
                        return Some((Ok(RawEvent::new(msg.event, msg.data)), Some(es)));
                    }
                    Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => {
                        es.close();
                        return None;
                    }
                    Some(Err(err)) => {
                        es.close();
                        return Some((Err(ChannelError::Dropped(err.to_string())), None));
                    }
                }
            }
        });

        Ok(stream::iter(early.map(Ok)).chain(rest).boxed())
    }
}
