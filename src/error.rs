use std::time::Duration;

/// Failures that cross component seams.
///
/// Network and parse failures abort a sync attempt and are retried only by the
/// next scheduled or manual sync. Embed failures are terminal for the
/// placeholder attempt that produced them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("request to {url} failed: {reason}")]
    Network { url: String, reason: String },
    #[error("malformed response from {url}: {reason}")]
    Parse { url: String, reason: String },
    #[error("{provider} embed failed: {reason}")]
    EmbedLoad {
        provider: &'static str,
        reason: String,
    },
    #[error("{provider} embed timed out after {after:?}")]
    EmbedTimeout {
        provider: &'static str,
        after: Duration,
    },
}

impl Error {
    pub fn network(url: impl Into<String>, reason: impl ToString) -> Self {
        Error::Network {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn parse(url: impl Into<String>, reason: impl ToString) -> Self {
        Error::Parse {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network { .. } | Error::Parse { .. })
    }

    pub fn is_embed(&self) -> bool {
        matches!(self, Error::EmbedLoad { .. } | Error::EmbedTimeout { .. })
    }

    /// Short machine-friendly label used as the `reason` field in logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Error::Network { .. } => "network",
            Error::Parse { .. } => "parse",
            Error::EmbedLoad { .. } => "load_failed",
            Error::EmbedTimeout { .. } => "timeout",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
