use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::{
    cache::RecordingCache,
    config::Mode,
    error::{Error, Result},
    har::{self, Entry},
    matching,
    request::{CapturedRequest, CapturedResponse, Disposition},
};

/// Collaborator that performs the real network call for passthrough and
/// record dispositions.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &CapturedRequest) -> anyhow::Result<CapturedResponse>;
}

/// A synthetic route handler attached to a request by the caller's route
/// table. The handler reports its verdict through the [`Interceptor`].
#[async_trait]
pub trait SyntheticHandler: Send + Sync {
    async fn invoke(
        &self,
        request: &mut CapturedRequest,
        interceptor: &mut Interceptor,
    ) -> anyhow::Result<()>;
}

/// Verdict carrier for one synthetic-handler invocation: either serve a
/// response and skip the network, or ignore the handler and continue.
/// The two flags are mutually exclusive.
#[derive(Default)]
pub struct Interceptor {
    response: Option<CapturedResponse>,
    intercept: bool,
    passthrough: bool,
}

impl Interceptor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Serve `response` without contacting the network.
    pub fn intercept(&mut self, response: CapturedResponse) {
        assert!(
            !self.passthrough,
            "a synthetic handler cannot both intercept and pass through"
        );
        self.response = Some(response);
        self.intercept = true;
    }

    /// Ignore this handler and let the request continue to the network.
    pub fn passthrough(&mut self) {
        assert!(
            !self.intercept,
            "a synthetic handler cannot both intercept and pass through"
        );
        self.passthrough = true;
    }

    fn intercepted_response(&mut self) -> Option<CapturedResponse> {
        if self.intercept { self.response.take() } else { None }
    }

    fn is_passthrough(&self) -> bool {
        self.passthrough
    }
}

enum ExpirationOutcome {
    Fresh,
    ReRecord,
    Unavailable,
}

/// Decides the fate of each in-flight request and drives the corresponding
/// side effect.
///
/// One engine serves many concurrent requests; each request is owned by a
/// single `dispose` call and nothing here blocks a scheduler thread.
pub struct DispositionEngine {
    transport: Arc<dyn Transport>,
    cache: Option<Arc<RecordingCache>>,
    online: AtomicBool,
    /// Sequence counters keyed by `(recording_id, fingerprint)`, used to
    /// disambiguate repeated identical requests when order matching is on.
    orders: Mutex<HashMap<(String, String), u64>>,
}

impl DispositionEngine {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            cache: None,
            online: AtomicBool::new(true),
            orders: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_cache(mut self, cache: Arc<RecordingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache(&self) -> Option<&Arc<RecordingCache>> {
        self.cache.as_ref()
    }

    /// Marks network connectivity as known-unavailable (or available again).
    /// Expired entries are not re-recorded while offline.
    pub fn set_offline(&self, offline: bool) {
        self.online.store(!offline, Ordering::Relaxed);
    }

    fn is_offline(&self) -> bool {
        !self.online.load(Ordering::Relaxed)
    }

    /// Resolves one captured request to a response and settles its
    /// completion handle exactly once.
    pub async fn dispose(&self, mut request: CapturedRequest) -> Result<CapturedResponse> {
        match self.resolve(&mut request).await {
            Ok(response) => {
                tracing::debug!(
                    method = %request.method,
                    url = %request.url,
                    disposition = %request
                        .disposition()
                        .map(|disposition| disposition.to_string())
                        .unwrap_or_default(),
                    status = response.status,
                    "request disposed"
                );
                request.settle_ok(&response);
                Ok(response)
            }
            Err(err) => {
                if err.is_fatal() {
                    tracing::debug!(
                        method = %request.method,
                        url = %request.url,
                        error_kind = err.kind(),
                        "request failed: {err}"
                    );
                } else {
                    tracing::warn!(
                        method = %request.method,
                        url = %request.url,
                        "request left unresolved: {err}"
                    );
                }
                request.settle_err(&err);
                Err(err)
            }
        }
    }

    async fn resolve(&self, request: &mut CapturedRequest) -> Result<CapturedResponse> {
        self.identify(request)?;

        let mut handler_passthrough = false;
        if let Some(handler) = request.take_handler() {
            let mut interceptor = Interceptor::new();
            handler
                .invoke(request, &mut interceptor)
                .await
                .map_err(Error::Handler)?;

            if let Some(response) = interceptor.intercepted_response() {
                request.set_disposition(Disposition::Intercept);
                request.respond(response.clone());
                return Ok(response);
            }
            handler_passthrough = interceptor.is_passthrough();
        }

        if request.config.mode == Mode::Passthrough
            || request.passthrough_requested()
            || handler_passthrough
        {
            request.set_disposition(Disposition::Passthrough);
            return self.forward(request).await;
        }

        let cache = self.cache.as_deref().ok_or(Error::StoreRequired)?;

        match request.config.mode {
            Mode::Record => self.record(request, cache).await,
            Mode::Replay => self.replay(request, cache).await,
            Mode::Passthrough => unreachable!("passthrough resolved before the store check"),
        }
    }

    /// Computes the request's fingerprint and sequence number.
    fn identify(&self, request: &mut CapturedRequest) -> Result<()> {
        let rules = &request.config.match_requests_by;
        let id = matching::fingerprint(
            &request.method,
            &request.url,
            &request.headers,
            request.body.as_deref(),
            rules,
        )
        .map_err(|source| Error::Fingerprint {
            method: request.method.clone(),
            url: request.url.clone(),
            source,
        })?;

        let order = if rules.order {
            let mut orders = self.orders.lock();
            let counter = orders
                .entry((request.recording_id.clone(), id.clone()))
                .or_insert(0);
            let order = *counter;
            *counter += 1;
            order
        } else {
            0
        };

        request.assign_identity(id, order);
        Ok(())
    }

    /// Forwards to the real network and attributes the observed latency to
    /// the request.
    async fn forward(&self, request: &mut CapturedRequest) -> Result<CapturedResponse> {
        let started = Instant::now();
        let response = self
            .transport
            .send(request)
            .await
            .map_err(Error::Transport)?;
        request.record_response(response.clone(), started.elapsed());
        Ok(response)
    }

    async fn record(
        &self,
        request: &mut CapturedRequest,
        cache: &RecordingCache,
    ) -> Result<CapturedResponse> {
        request.set_disposition(Disposition::Record);
        let response = self.forward(request).await?;
        cache.note_observed(request);
        cache.enqueue(request.clone())?;
        Ok(response)
    }

    async fn replay(
        &self,
        request: &mut CapturedRequest,
        cache: &RecordingCache,
    ) -> Result<CapturedResponse> {
        let entry = cache.find_entry(request).await?;

        let Some(entry) = entry else {
            if request.config.record_if_missing {
                return self.record(request, cache).await;
            }
            return Err(Error::RecordingMissing {
                method: request.method.clone(),
                url: request.url.clone(),
            });
        };

        if let Some(hook) = request.before_replay_hook() {
            hook(&entry);
        }

        match self.expiration_outcome(request, &entry) {
            ExpirationOutcome::Fresh => {}
            ExpirationOutcome::ReRecord => return self.record(request, cache).await,
            ExpirationOutcome::Unavailable => {
                return Err(Error::ReplayUnavailable {
                    method: request.method.clone(),
                    url: request.url.clone(),
                });
            }
        }

        let delay = request.config.timing.delay_for(entry.time);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        request.set_disposition(Disposition::Replay);
        cache.note_observed(request);
        let response = har::normalize_response(&entry.response);
        request.respond(response.clone());
        Ok(response)
    }

    fn expiration_outcome(&self, request: &CapturedRequest, entry: &Entry) -> ExpirationOutcome {
        let Some(expires_in) = request.config.expires_in else {
            return ExpirationOutcome::Fresh;
        };

        let age = Utc::now().signed_duration_since(entry.started_date_time);
        // Entries dated in the future count as fresh.
        let fresh = age.to_std().map(|age| age < expires_in).unwrap_or(true);
        if fresh {
            return ExpirationOutcome::Fresh;
        }

        if !request.config.record_if_expired {
            tracing::warn!(
                method = %request.method,
                url = %request.url,
                "recording has expired but `record_if_expired` is disabled"
            );
            return ExpirationOutcome::Unavailable;
        }

        if self.is_offline() {
            tracing::warn!(
                method = %request.method,
                url = %request.url,
                "recording has expired but the network is offline"
            );
            return ExpirationOutcome::Unavailable;
        }

        ExpirationOutcome::ReRecord
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;

    use super::{DispositionEngine, Interceptor, SyntheticHandler, Transport};
    use crate::{
        cache::RecordingCache,
        config::{Mode, PlaybackConfig},
        error::Error,
        request::{CapturedRequest, CapturedResponse},
        store::MemoryStore,
    };

    struct ScriptedTransport {
        response: CapturedResponse,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(response: CapturedResponse) -> Arc<Self> {
            Arc::new(Self {
                response,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, _request: &CapturedRequest) -> anyhow::Result<CapturedResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        async fn send(&self, _request: &CapturedRequest) -> anyhow::Result<CapturedResponse> {
            anyhow::bail!("connection refused")
        }
    }

    struct InterceptingHandler;

    #[async_trait]
    impl SyntheticHandler for InterceptingHandler {
        async fn invoke(
            &self,
            _request: &mut CapturedRequest,
            interceptor: &mut Interceptor,
        ) -> anyhow::Result<()> {
            interceptor.intercept(CapturedResponse::new(200).with_body("synthetic"));
            Ok(())
        }
    }

    struct PassthroughHandler;

    #[async_trait]
    impl SyntheticHandler for PassthroughHandler {
        async fn invoke(
            &self,
            _request: &mut CapturedRequest,
            interceptor: &mut Interceptor,
        ) -> anyhow::Result<()> {
            interceptor.passthrough();
            Ok(())
        }
    }

    fn request_with_mode(mode: Mode) -> CapturedRequest {
        let config = PlaybackConfig {
            mode,
            ..PlaybackConfig::default()
        };
        CapturedRequest::new("suite", "suite", "GET", "http://example.test/resource", config)
    }

    #[tokio::test]
    async fn passthrough_mode_forwards_without_a_store() {
        let transport = ScriptedTransport::new(CapturedResponse::new(200).with_body("live"));
        let engine = DispositionEngine::new(transport.clone());

        let request = request_with_mode(Mode::Passthrough);
        let handle = request.completion_handle().unwrap();
        let response = engine.dispose(request).await.unwrap();

        assert_eq!(response.body.as_deref(), Some("live"));
        assert_eq!(transport.calls(), 1);
        assert_eq!(handle.wait().await.unwrap().status, 200);
    }

    #[tokio::test]
    async fn synthetic_intercept_skips_the_network() {
        let transport = ScriptedTransport::new(CapturedResponse::new(200).with_body("live"));
        let engine = DispositionEngine::new(transport.clone());

        let request =
            request_with_mode(Mode::Passthrough).with_handler(Arc::new(InterceptingHandler));
        let response = engine.dispose(request).await.unwrap();

        assert_eq!(response.body.as_deref(), Some("synthetic"));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn synthetic_passthrough_continues_to_the_network() {
        let transport = ScriptedTransport::new(CapturedResponse::new(200).with_body("live"));
        let engine = DispositionEngine::new(transport.clone());

        // Replay mode with no store would normally be fatal; the handler's
        // passthrough verdict short-circuits before the store check.
        let request = request_with_mode(Mode::Replay).with_handler(Arc::new(PassthroughHandler));
        let response = engine.dispose(request).await.unwrap();

        assert_eq!(response.body.as_deref(), Some("live"));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn record_and_replay_require_a_store() {
        let transport = ScriptedTransport::new(CapturedResponse::new(200));
        let engine = DispositionEngine::new(transport);

        for mode in [Mode::Record, Mode::Replay] {
            let err = engine.dispose(request_with_mode(mode)).await.unwrap_err();
            assert!(matches!(err, Error::StoreRequired), "err: {err}");
        }
    }

    #[tokio::test]
    async fn record_mode_relays_and_enqueues() {
        let transport = ScriptedTransport::new(CapturedResponse::new(200).with_body("live"));
        let cache = Arc::new(RecordingCache::new(Arc::new(MemoryStore::new())));
        let engine = DispositionEngine::new(transport.clone()).with_cache(cache.clone());

        let response = engine
            .dispose(request_with_mode(Mode::Record))
            .await
            .unwrap();

        assert_eq!(response.body.as_deref(), Some("live"));
        assert_eq!(cache.pending_len("suite"), 1);
    }

    #[tokio::test]
    async fn transport_failure_settles_the_handle_without_enqueueing() {
        let cache = Arc::new(RecordingCache::new(Arc::new(MemoryStore::new())));
        let engine = DispositionEngine::new(Arc::new(FailingTransport)).with_cache(cache.clone());

        let request = request_with_mode(Mode::Record);
        let handle = request.completion_handle().unwrap();
        let err = engine.dispose(request).await.unwrap_err();

        assert!(matches!(err, Error::Transport(_)), "err: {err}");
        assert!(!cache.has_pending());
        let settled = handle.wait().await.unwrap_err();
        assert!(settled.fatal);
    }

    #[tokio::test]
    async fn repeated_identical_requests_get_increasing_orders() {
        let transport = ScriptedTransport::new(CapturedResponse::new(200));
        let cache = Arc::new(RecordingCache::new(Arc::new(MemoryStore::new())));
        let engine = DispositionEngine::new(transport).with_cache(cache.clone());

        for _ in 0..3 {
            engine
                .dispose(request_with_mode(Mode::Record))
                .await
                .unwrap();
        }
        cache.flush().await.unwrap();

        let recording = cache.find_recording("suite").await.unwrap().unwrap();
        let mut orders: Vec<u64> = recording.log.entries.iter().map(|entry| entry.order).collect();
        orders.sort_unstable();
        assert_eq!(orders, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn order_matching_disabled_pins_order_to_zero() {
        let transport = ScriptedTransport::new(CapturedResponse::new(200));
        let cache = Arc::new(RecordingCache::new(Arc::new(MemoryStore::new())));
        let engine = DispositionEngine::new(transport).with_cache(cache.clone());

        for _ in 0..2 {
            let mut request = request_with_mode(Mode::Record);
            request.config.match_requests_by.order = false;
            engine.dispose(request).await.unwrap();
        }
        cache.flush().await.unwrap();

        // Same (id, order) for both exchanges: the newer entry replaced the
        // older one.
        let recording = cache.find_recording("suite").await.unwrap().unwrap();
        assert_eq!(recording.log.entries.len(), 1);
        assert_eq!(recording.log.entries[0].order, 0);
    }

    #[test]
    #[should_panic(expected = "intercept and pass through")]
    fn interceptor_flags_are_mutually_exclusive() {
        let mut interceptor = Interceptor::new();
        interceptor.passthrough();
        interceptor.intercept(CapturedResponse::new(200));
    }
}
