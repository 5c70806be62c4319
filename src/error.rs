use thiserror::Error;

use crate::har::CREATOR_NAME;

/// Crate-wide error type.
///
/// Most variants are fatal misconfiguration: they terminate the request's
/// completion handle and retrying the same request cannot succeed until the
/// operator changes something. [`Error::ReplayUnavailable`] is the one policy
/// outcome that is logged as a warning rather than treated as fatal.
#[derive(Debug, Error)]
pub enum Error {
    #[error("a store must be configured in order to record and replay requests")]
    StoreRequired,

    #[error(
        "recording `{recording_id}` is invalid: it was not written by `{CREATOR_NAME}`; \
         delete the recording so a new one can be created"
    )]
    ForeignRecording { recording_id: String },

    #[error("no recording found for [{method}] {url} and `record_if_missing` is disabled")]
    RecordingMissing { method: String, url: String },

    #[error(
        "cannot record response for [{method}] {url}: status {status} is not ok and \
         `record_failed_requests` is disabled"
    )]
    RecordFailedResponse {
        method: String,
        url: String,
        status: u16,
    },

    #[error("recording for [{method}] {url} has expired and cannot be refreshed")]
    ReplayUnavailable { method: String, url: String },

    #[error("cannot enqueue [{method}] {url}: the request has no response")]
    MissingResponse { method: String, url: String },

    #[error("failed to compute fingerprint for [{method}] {url}")]
    Fingerprint {
        method: String,
        url: String,
        #[source]
        source: crate::matching::MatchError,
    },

    #[error("unknown store backend `{name}`")]
    UnknownBackend { name: String },

    #[error("synthetic handler failed")]
    Handler(#[source] anyhow::Error),

    #[error("transport request failed")]
    Transport(#[source] anyhow::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl Error {
    /// Whether this error terminates the request with a hard failure.
    ///
    /// Non-fatal errors are policy warnings: the request could not be
    /// resolved, but nothing is misconfigured.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ReplayUnavailable { .. })
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::StoreRequired => "store_required",
            Self::ForeignRecording { .. } => "foreign_recording",
            Self::RecordingMissing { .. } => "recording_missing",
            Self::RecordFailedResponse { .. } => "record_failed_response",
            Self::ReplayUnavailable { .. } => "replay_unavailable",
            Self::MissingResponse { .. } => "missing_response",
            Self::Fingerprint { .. } => "fingerprint",
            Self::UnknownBackend { .. } => "unknown_backend",
            Self::Handler(_) => "handler",
            Self::Transport(_) => "transport",
            Self::Store(_) => "store",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn replay_unavailable_is_the_only_non_fatal_class() {
        let warning = Error::ReplayUnavailable {
            method: "GET".to_owned(),
            url: "http://example.test/".to_owned(),
        };
        assert!(!warning.is_fatal());

        let fatal = Error::RecordingMissing {
            method: "GET".to_owned(),
            url: "http://example.test/".to_owned(),
        };
        assert!(fatal.is_fatal());
        assert!(Error::StoreRequired.is_fatal());
    }

    #[test]
    fn messages_name_the_offending_request() {
        let err = Error::RecordFailedResponse {
            method: "POST".to_owned(),
            url: "http://example.test/v1/chat".to_owned(),
            status: 502,
        };
        let message = err.to_string();
        assert!(message.contains("POST"), "message: {message}");
        assert!(message.contains("http://example.test/v1/chat"), "message: {message}");
        assert!(message.contains("502"), "message: {message}");
    }
}
