use thiserror::Error;

/// Errors produced by the relay core.
///
/// Only [`TeeError::Bind`], [`TeeError::Dial`], [`TeeError::Accept`] and
/// [`TeeError::GateClosed`] ever leave [`RelayEngine::run`](crate::RelayEngine::run).
/// The rest describe why a single relay direction ended and stay inside the
/// relay that produced them.
#[derive(Debug, Error)]
pub enum TeeError {
    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("sink write failed: {0}")]
    Sink(#[source] std::io::Error),

    #[error("idle timeout")]
    IdleTimeout,

    #[error("aborted by paired direction")]
    Aborted,

    #[error("admission gate closed")]
    GateClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TeeError {
    /// Whether this error ends the whole run rather than a single relay.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TeeError::Bind { .. }
                | TeeError::Dial { .. }
                | TeeError::Accept(_)
                | TeeError::GateClosed
        )
    }
}

pub type TeeResult<T> = Result<T, TeeError>;
