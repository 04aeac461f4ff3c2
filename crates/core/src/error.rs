/// Failure to turn one watch line into an event. Always fatal to the stream it came from.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid json in watch line {line:?}: {source}")]
    InvalidJson {
        line: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("watch line missing field `{0}`")]
    MissingField(&'static str),
    #[error("unknown watch event type {0:?}")]
    UnknownType(String),
    #[error("watch line exceeds {limit} bytes without a terminator")]
    LineTooLong { limit: usize },
    #[error("watch line is not valid utf-8")]
    InvalidUtf8,
    #[error("stream ended inside a watch line ({0} bytes buffered)")]
    Truncated(usize),
}

impl DecodeError {
    pub(crate) fn invalid_json(raw: &[u8], source: serde_json::Error) -> Self {
        const PREVIEW: usize = 256;
        let end = raw.len().min(PREVIEW);
        Self::InvalidJson { line: String::from_utf8_lossy(&raw[..end]).into_owned(), source }
    }
}

/// Errors surfaced by listing, watching and the one-shot verbs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("connection: {0}")]
    Connection(String),
    #[error("resource version expired: {0}")]
    SnapshotExpired(String),
    #[error("listing: {0}")]
    Listing(String),
    #[error("cancelled")]
    Cancelled,
    #[error("api status {code}: {message}")]
    Api { code: u16, message: String },
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("discovery: {0}")]
    Discovery(String),
    #[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidGvk(String),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// HTTP 410: the requested resource version is no longer served; only a relist recovers.
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::SnapshotExpired(_))
    }

    /// Map a non-success HTTP status and its body into the taxonomy.
    pub fn from_status(code: u16, body: &[u8]) -> Self {
        let message = serde_json::from_slice::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());
        match code {
            410 => Self::SnapshotExpired(message),
            404 => Self::NotFound(message),
            _ => Self::Api { code, message },
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_410_maps_to_expired() {
        let body = br#"{"kind":"Status","apiVersion":"v1","status":"Failure","message":"too old resource version: 1 (5)","reason":"Expired","code":410}"#;
        let e = Error::from_status(410, body);
        assert!(e.is_expired());
        assert_eq!(e.to_string(), "resource version expired: too old resource version: 1 (5)");
    }

    #[test]
    fn plain_text_body_is_kept_as_message() {
        match Error::from_status(503, b"upstream down\n") {
            Error::Api { code, message } => {
                assert_eq!(code, 503);
                assert_eq!(message, "upstream down");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
