use std::ops::ControlFlow;
use std::time::Duration;

use futures::Stream;
use metrics::counter;
use tracing::{debug, warn};

use kreflect_core::{Error, Result, WatchEvent};

use crate::decoder::EventDecoder;
use crate::watch::{WatchCancel, WatchConnection};

/// Forward-only sequence of events read from one watch connection.
///
/// Ends on server close, transport error, decode error or cancellation and cannot be restarted;
/// a new stream needs a new connection. The connection is released by [`WatchStream::finish`],
/// which also runs on drop, so every exit path closes the socket.
pub struct WatchStream {
    conn: Option<WatchConnection>,
    decoder: EventDecoder,
    idle_timeout: Option<Duration>,
    done: bool,
}

impl WatchStream {
    pub fn new(conn: WatchConnection, decoder: EventDecoder) -> Self {
        Self { conn: Some(conn), decoder, idle_timeout: None, done: false }
    }

    /// Fail the stream when the server sends nothing (not even a bookmark) for `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn canceller(&self) -> Option<WatchCancel> {
        self.conn.as_ref().map(|c| c.canceller())
    }

    pub fn is_finished(&self) -> bool {
        self.done
    }

    /// Next event; `None` once the stream has ended.
    ///
    /// A cancelled read yields `Err(Error::Cancelled)` once, then `None`.
    pub async fn next_event(&mut self) -> Option<Result<WatchEvent>> {
        if self.done {
            return None;
        }
        loop {
            match self.decoder.next_event() {
                Ok(Some(ev)) => return Some(Ok(ev)),
                Ok(None) => {}
                Err(e) => {
                    counter!("kreflect_decode_errors_total", 1);
                    warn!(error = %e, "watch line failed to decode");
                    self.finish();
                    return Some(Err(e.into()));
                }
            }
            let conn = self.conn.as_mut()?;
            let read = match self.idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, conn.read_chunk()).await {
                    Ok(read) => read,
                    Err(_) => Err(Error::Connection(format!("watch idle for {}s", limit.as_secs()))),
                },
                None => conn.read_chunk().await,
            };
            match read {
                Ok(Some(chunk)) => self.decoder.feed(&chunk),
                Ok(None) => {
                    debug!("watch closed by server");
                    let tail = self.decoder.finish();
                    self.finish();
                    return match tail {
                        Ok(Some(ev)) => Some(Ok(ev)),
                        Ok(None) => None,
                        Err(e) => Some(Err(e.into())),
                    };
                }
                Err(e) => {
                    self.finish();
                    return Some(Err(e));
                }
            }
        }
    }

    /// Drive the stream, handing each event to `f` until it breaks, fails, or the stream ends.
    ///
    /// The connection is closed before returning on every path; if `f` panics the drop of
    /// `self` closes it during unwinding. Cancellation is a clean exit.
    pub async fn for_each_event<F, E>(mut self, mut f: F) -> std::result::Result<(), E>
    where
        F: FnMut(WatchEvent) -> std::result::Result<ControlFlow<()>, E>,
        E: From<Error>,
    {
        let outcome = loop {
            match self.next_event().await {
                Some(Ok(ev)) => match f(ev) {
                    Ok(ControlFlow::Continue(())) => {}
                    Ok(ControlFlow::Break(())) => break Ok(()),
                    Err(e) => break Err(e),
                },
                Some(Err(Error::Cancelled)) | None => break Ok(()),
                Some(Err(e)) => break Err(E::from(e)),
            }
        };
        self.finish();
        outcome
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<WatchEvent>> + Send {
        futures::stream::unfold(self, |mut s| async move { s.next_event().await.map(|ev| (ev, s)) })
    }

    /// Cancel the connection and release it. Safe to call any number of times.
    pub fn finish(&mut self) {
        self.done = true;
        if let Some(mut conn) = self.conn.take() {
            conn.cancel();
        }
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::StreamExt;
    use kreflect_core::EventType;

    fn line(kind: &str, name: &str, rv: &str) -> String {
        format!(
            "{{\"type\":\"{}\",\"object\":{{\"metadata\":{{\"name\":\"{}\",\"namespace\":\"d\",\"resourceVersion\":\"{}\"}}}}}}\n",
            kind, name, rv
        )
    }

    fn stream_of(chunks: Vec<Result<Bytes>>) -> WatchStream {
        WatchStream::new(WatchConnection::from_stream(futures::stream::iter(chunks)), EventDecoder::new())
    }

    #[tokio::test]
    async fn yields_events_in_order_then_ends() {
        let body = format!("{}{}", line("ADDED", "a", "1"), line("MODIFIED", "a", "2"));
        let (first, second) = body.split_at(30);
        let mut s = stream_of(vec![Ok(Bytes::from(first.to_string())), Ok(Bytes::from(second.to_string()))]);
        let a = s.next_event().await.unwrap().unwrap();
        let b = s.next_event().await.unwrap().unwrap();
        assert_eq!((a.event_type, a.resource_version.as_str()), (EventType::Added, "1"));
        assert_eq!((b.event_type, b.resource_version.as_str()), (EventType::Modified, "2"));
        assert!(s.next_event().await.is_none());
        assert!(s.is_finished());
        assert!(s.next_event().await.is_none());
    }

    #[tokio::test]
    async fn decode_failure_terminates_stream() {
        let body = format!("{}garbage\n{}", line("ADDED", "a", "1"), line("ADDED", "b", "2"));
        let mut s = stream_of(vec![Ok(Bytes::from(body))]);
        assert!(s.next_event().await.unwrap().is_ok());
        assert!(matches!(s.next_event().await, Some(Err(Error::Decode(_)))));
        assert!(s.next_event().await.is_none());
    }

    #[tokio::test]
    async fn transport_error_is_surfaced() {
        let mut s = stream_of(vec![Err(Error::Connection("reset by peer".into()))]);
        assert!(matches!(s.next_event().await, Some(Err(Error::Connection(_)))));
        assert!(s.is_finished());
    }

    #[tokio::test]
    async fn callback_break_finishes_stream() {
        let body = format!("{}{}{}", line("ADDED", "a", "1"), line("ADDED", "b", "2"), line("ADDED", "c", "3"));
        let s = stream_of(vec![Ok(Bytes::from(body))]);
        let mut seen = Vec::new();
        let res: Result<()> = s
            .for_each_event(|ev| {
                seen.push(ev.resource_version.clone());
                Ok(if seen.len() == 2 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) })
            })
            .await;
        assert!(res.is_ok());
        assert_eq!(seen, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn callback_error_propagates_after_cleanup() {
        let s = WatchStream::new(
            WatchConnection::from_stream(futures::stream::iter(vec![Ok::<_, Error>(Bytes::from(line("ADDED", "a", "1")))])
                .chain(futures::stream::pending())),
            EventDecoder::new(),
        );
        let res: Result<()> = s.for_each_event(|_| Err(Error::Listing("consumer failed".into()))).await;
        assert!(matches!(res, Err(Error::Listing(_))));
    }

    #[tokio::test]
    async fn idle_watchdog_fails_silent_stream() {
        let mut s = WatchStream::new(WatchConnection::from_stream(futures::stream::pending::<Result<Bytes>>()), EventDecoder::new())
            .with_idle_timeout(Some(Duration::from_millis(30)));
        assert!(matches!(s.next_event().await, Some(Err(Error::Connection(_)))));
    }

    #[tokio::test]
    async fn external_cancel_ends_for_each_cleanly() {
        let s = WatchStream::new(WatchConnection::from_stream(futures::stream::pending::<Result<Bytes>>()), EventDecoder::new());
        let cancel = s.canceller().unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let res: Result<()> = tokio::time::timeout(Duration::from_secs(2), s.for_each_event(|_| Ok(ControlFlow::Continue(()))))
            .await
            .expect("cancel did not unblock");
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn finish_is_reentrant() {
        let mut s = stream_of(vec![]);
        s.finish();
        s.finish();
        assert!(s.next_event().await.is_none());
    }
}
