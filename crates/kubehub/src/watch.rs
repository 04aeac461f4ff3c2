use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use kreflect_core::{Error, Result};

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// One open, streamed watch response.
///
/// Holds the response body (and with it the socket) until cancelled or dropped. `cancel` may be
/// called from any task through a [`WatchCancel`]; a read pending on the connection then returns
/// `Error::Cancelled` instead of waiting for the next chunk.
pub struct WatchConnection {
    uri: String,
    body: Option<ByteStream>,
    cancel: CancellationToken,
}

/// Cloneable remote control for a [`WatchConnection`].
#[derive(Debug, Clone)]
pub struct WatchCancel(CancellationToken);

impl WatchCancel {
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

impl WatchConnection {
    pub fn new(uri: String, body: ByteStream) -> Self {
        Self { uri, body: Some(body), cancel: CancellationToken::new() }
    }

    /// Wrap any byte stream, e.g. a scripted body in tests or a proxied transport.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        Self::new(String::from("<stream>"), stream.boxed())
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn canceller(&self) -> WatchCancel {
        WatchCancel(self.cancel.clone())
    }

    pub fn is_open(&self) -> bool {
        self.body.is_some() && !self.cancel.is_cancelled()
    }

    /// Next chunk of the body; `Ok(None)` when the server closed the stream.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        let Self { body, cancel, .. } = self;
        let Some(stream) = body.as_mut() else {
            return Err(Error::Cancelled);
        };
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            next = stream.next() => Some(next),
        };
        match next {
            None => {
                *body = None;
                Err(Error::Cancelled)
            }
            Some(Some(Ok(chunk))) => Ok(Some(chunk)),
            Some(Some(Err(e))) => {
                *body = None;
                Err(e)
            }
            Some(None) => {
                *body = None;
                Ok(None)
            }
        }
    }

    /// Close the connection. Dropping the body releases the socket.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        if self.body.take().is_some() {
            debug!(uri = %self.uri, "watch connection closed");
        }
    }
}

impl Drop for WatchConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
