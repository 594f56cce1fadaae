// Typed client failures. The loop controller is the only place that decides
// whether one of these is fatal or retried.
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{action} failed: {source}")]
    Connection {
        action: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("payload too large: {len} bytes (cap {max})")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("record too large: {len} bytes (budget {max})")]
    RecordTooLarge { len: usize, max: usize },
    #[error("server rejected request: {reason}")]
    ServerRejected { reason: String },
    #[error("malformed record at line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },
    #[error("invalid record: {0}")]
    InvalidRecord(lotto_wire::Error),
    #[error("read records: {0}")]
    Source(#[source] io::Error),
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn connection(action: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Error::Connection { action, source }
    }

    /// Whether a winners poll that failed this way should be retried after the
    /// backoff. Transport failures and server-side "not ready" answers are
    /// expected while other agencies are still submitting.
    pub fn is_retryable_poll(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. } | Error::ServerRejected { .. }
        )
    }
}

impl From<lotto_wire::Error> for Error {
    fn from(err: lotto_wire::Error) -> Self {
        use lotto_wire::Error as Wire;
        match err {
            Wire::PayloadTooLarge { len, max } => Error::PayloadTooLarge { len, max },
            Wire::InvalidField { .. } => Error::InvalidRecord(err),
            other => Error::Protocol(other.to_string()),
        }
    }
}
