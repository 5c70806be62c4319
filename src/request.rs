use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{
    config::PlaybackConfig,
    engine::SyntheticHandler,
    error::Error,
    har::Entry,
    headers::HeaderMap,
};

/// The resolved fate of a single request. Set exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Passthrough,
    Intercept,
    Record,
    Replay,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Passthrough => "passthrough",
            Self::Intercept => "intercept",
            Self::Record => "record",
            Self::Replay => "replay",
        };
        f.write_str(label)
    }
}

/// A response observed from the network, produced by a synthetic handler, or
/// rebuilt from a recorded entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: Option<String>,
}

impl CapturedResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            status_text: default_status_text(status).to_owned(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Whether the status code counts as a success (2xx/3xx).
    pub fn ok(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

fn default_status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}

/// Lightweight error delivered through the completion handle.
///
/// The full [`Error`] is returned by `dispose` itself; the handle carries a
/// cloneable projection of it so both surfaces can observe the failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionError {
    pub message: String,
    pub fatal: bool,
}

impl From<&Error> for CompletionError {
    fn from(err: &Error) -> Self {
        Self {
            message: err.to_string(),
            fatal: err.is_fatal(),
        }
    }
}

pub type CompletionResult = Result<CapturedResponse, CompletionError>;

/// One-shot settlement channel for a request. Settling twice is a
/// programming error and panics.
pub(crate) struct Completion {
    tx: Mutex<Option<oneshot::Sender<CompletionResult>>>,
    rx: Mutex<Option<oneshot::Receiver<CompletionResult>>>,
}

impl Completion {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    pub(crate) fn settle(&self, result: CompletionResult) {
        let sender = self
            .tx
            .lock()
            .take()
            .expect("request completion handle settled twice");
        // The originator may have dropped its handle; settlement still counts.
        let _ = sender.send(result);
    }

    fn take_receiver(&self) -> Option<oneshot::Receiver<CompletionResult>> {
        self.rx.lock().take()
    }
}

/// Awaitable side of a request's completion.
pub struct CompletionHandle {
    rx: oneshot::Receiver<CompletionResult>,
}

impl CompletionHandle {
    pub async fn wait(self) -> CompletionResult {
        self.rx.await.unwrap_or_else(|_| {
            Err(CompletionError {
                message: "request was dropped before being disposed".to_owned(),
                fatal: true,
            })
        })
    }
}

pub(crate) type BeforeReplayHook = Arc<dyn Fn(&Entry) + Send + Sync>;
pub(crate) type BeforePersistHook = Arc<dyn Fn(&mut Entry) + Send + Sync>;

/// One outbound request captured from the program under test.
///
/// Owned exclusively by its originator until handed to
/// [`DispositionEngine::dispose`](crate::engine::DispositionEngine::dispose).
/// The `config` snapshot is immutable for the lifetime of the request.
#[derive(Clone)]
pub struct CapturedRequest {
    pub recording_id: String,
    pub recording_name: String,
    pub method: String,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<String>,
    pub config: PlaybackConfig,
    started_at: DateTime<Utc>,
    id: Option<String>,
    order: u64,
    disposition: Option<Disposition>,
    response: Option<CapturedResponse>,
    response_time_ms: f64,
    passthrough_requested: bool,
    handler: Option<Arc<dyn SyntheticHandler>>,
    before_replay: Option<BeforeReplayHook>,
    before_persist: Option<BeforePersistHook>,
    completion: Arc<Completion>,
}

impl CapturedRequest {
    pub fn new(
        recording_id: impl Into<String>,
        recording_name: impl Into<String>,
        method: impl Into<String>,
        url: impl Into<String>,
        config: PlaybackConfig,
    ) -> Self {
        Self {
            recording_id: recording_id.into(),
            recording_name: recording_name.into(),
            method: method.into(),
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            config,
            started_at: Utc::now(),
            id: None,
            order: 0,
            disposition: None,
            response: None,
            response_time_ms: 0.0,
            passthrough_requested: false,
            handler: None,
            before_replay: None,
            before_persist: None,
            completion: Arc::new(Completion::new()),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Attaches the synthetic handler matched for this request by the
    /// caller's route table.
    pub fn with_handler(mut self, handler: Arc<dyn SyntheticHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Forces the passthrough path regardless of mode.
    pub fn with_passthrough(mut self) -> Self {
        self.passthrough_requested = true;
        self
    }

    /// Invoked with the matched entry just before a replay resolves.
    pub fn on_before_replay(mut self, hook: impl Fn(&Entry) + Send + Sync + 'static) -> Self {
        self.before_replay = Some(Arc::new(hook));
        self
    }

    /// Invoked with each freshly built entry before it is persisted; the
    /// hook may rewrite the entry payload.
    pub fn on_before_persist(
        mut self,
        hook: impl Fn(&mut Entry) + Send + Sync + 'static,
    ) -> Self {
        self.before_persist = Some(Arc::new(hook));
        self
    }

    /// Takes the awaitable completion handle. Returns `None` if it was
    /// already taken.
    pub fn completion_handle(&self) -> Option<CompletionHandle> {
        self.completion
            .take_receiver()
            .map(|rx| CompletionHandle { rx })
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn order(&self) -> u64 {
        self.order
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn disposition(&self) -> Option<Disposition> {
        self.disposition
    }

    pub fn response(&self) -> Option<&CapturedResponse> {
        self.response.as_ref()
    }

    /// Observed latency of the forwarded network call, in milliseconds.
    pub fn response_time_ms(&self) -> f64 {
        self.response_time_ms
    }

    pub fn passthrough_requested(&self) -> bool {
        self.passthrough_requested
    }

    pub(crate) fn assign_identity(&mut self, id: String, order: u64) {
        self.id = Some(id);
        self.order = order;
    }

    pub(crate) fn set_disposition(&mut self, disposition: Disposition) {
        assert!(
            self.disposition.is_none(),
            "request disposition resolved twice"
        );
        self.disposition = Some(disposition);
    }

    pub(crate) fn record_response(&mut self, response: CapturedResponse, elapsed: Duration) {
        self.response_time_ms = elapsed.as_millis() as f64;
        self.response = Some(response);
    }

    pub(crate) fn respond(&mut self, response: CapturedResponse) {
        self.response = Some(response);
    }

    pub(crate) fn take_handler(&mut self) -> Option<Arc<dyn SyntheticHandler>> {
        self.handler.take()
    }

    pub(crate) fn before_replay_hook(&self) -> Option<&BeforeReplayHook> {
        self.before_replay.as_ref()
    }

    pub(crate) fn before_persist_hook(&self) -> Option<&BeforePersistHook> {
        self.before_persist.as_ref()
    }

    pub(crate) fn settle_ok(&self, response: &CapturedResponse) {
        self.completion.settle(Ok(response.clone()));
    }

    pub(crate) fn settle_err(&self, err: &Error) {
        self.completion.settle(Err(CompletionError::from(err)));
    }
}

impl fmt::Debug for CapturedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedRequest")
            .field("recording_id", &self.recording_id)
            .field("method", &self.method)
            .field("url", &self.url)
            .field("id", &self.id)
            .field("order", &self.order)
            .field("disposition", &self.disposition)
            .field("has_response", &self.response.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{CapturedRequest, CapturedResponse, Completion, CompletionError};
    use crate::config::PlaybackConfig;

    fn request() -> CapturedRequest {
        CapturedRequest::new(
            "suite",
            "suite",
            "GET",
            "http://example.test/",
            PlaybackConfig::default(),
        )
    }

    #[test]
    fn response_ok_covers_2xx_and_3xx() {
        assert!(CapturedResponse::new(200).ok());
        assert!(CapturedResponse::new(304).ok());
        assert!(!CapturedResponse::new(404).ok());
        assert!(!CapturedResponse::new(502).ok());
        assert!(!CapturedResponse::new(101).ok());
    }

    #[tokio::test]
    async fn completion_delivers_the_settled_response() {
        let request = request();
        let handle = request.completion_handle().expect("first take succeeds");
        assert!(request.completion_handle().is_none());

        request.settle_ok(&CapturedResponse::new(200).with_body("hello"));

        let resolved = handle.wait().await.expect("settled ok");
        assert_eq!(resolved.status, 200);
        assert_eq!(resolved.body.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn dropping_an_unsettled_request_fails_the_handle() {
        let request = request();
        let handle = request.completion_handle().expect("first take succeeds");
        drop(request);

        let err = handle.wait().await.expect_err("handle should fail");
        assert!(err.fatal);
        assert!(err.message.contains("dropped"), "message: {}", err.message);
    }

    #[test]
    #[should_panic(expected = "settled twice")]
    fn settling_twice_is_a_programming_error() {
        let completion = Completion::new();
        completion.settle(Ok(CapturedResponse::new(200)));
        completion.settle(Err(CompletionError {
            message: "again".to_owned(),
            fatal: true,
        }));
    }

    #[test]
    #[should_panic(expected = "disposition resolved twice")]
    fn disposition_is_set_exactly_once() {
        let mut request = request();
        request.set_disposition(super::Disposition::Record);
        request.set_disposition(super::Disposition::Replay);
    }
}
