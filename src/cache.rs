use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::{
    error::{Error, Result},
    har::{CREATOR_NAME, Creator, Entry, Har},
    request::CapturedRequest,
    store::Store,
};

/// Not-yet-persisted exchanges for one recording id.
struct PendingBucket {
    name: String,
    requests: Vec<CapturedRequest>,
}

#[derive(Debug, PartialEq, Eq)]
struct ObservedKey {
    recording_id: String,
    id: String,
    order: u64,
}

type LoadSlot = Arc<OnceCell<Option<Arc<Har>>>>;

/// In-process layer over the [`Store`]: memoized recording lookups, the
/// pending-write buffer, and the eviction pass. This is the only component
/// that touches the store.
pub struct RecordingCache {
    store: Arc<dyn Store>,
    /// Memoized loads. A slot holding `None` after init means the store
    /// confirmed absence; such slots are removed so later lookups re-read
    /// the store (recordings may be created lazily by a flush).
    loads: Mutex<HashMap<String, LoadSlot>>,
    pending: Mutex<BTreeMap<String, PendingBucket>>,
    /// `(recording_id, id, order)` triples seen with a record or replay
    /// disposition this run; drives the unused-entry eviction on flush.
    observed: Mutex<Vec<ObservedKey>>,
}

impl RecordingCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            loads: Mutex::new(HashMap::new()),
            pending: Mutex::new(BTreeMap::new()),
            observed: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Looks up a recording, collapsing concurrent first lookups for the
    /// same id into a single store read.
    pub async fn find_recording(&self, recording_id: &str) -> Result<Option<Arc<Har>>> {
        let slot = self
            .loads
            .lock()
            .entry(recording_id.to_owned())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let loaded = slot
            .get_or_try_init(|| self.load_recording(recording_id))
            .await?
            .clone();

        if loaded.is_none() {
            let mut loads = self.loads.lock();
            if loads
                .get(recording_id)
                .is_some_and(|current| Arc::ptr_eq(current, &slot))
            {
                loads.remove(recording_id);
            }
        }

        Ok(loaded)
    }

    async fn load_recording(&self, recording_id: &str) -> Result<Option<Arc<Har>>> {
        let Some(recording) = self.store.find(recording_id).await.map_err(Error::Store)? else {
            return Ok(None);
        };

        if recording.log.creator.name != CREATOR_NAME {
            return Err(Error::ForeignRecording {
                recording_id: recording_id.to_owned(),
            });
        }

        tracing::debug!(
            recording_id,
            entries = recording.log.entries.len(),
            "loaded recording"
        );
        Ok(Some(Arc::new(recording)))
    }

    /// Finds the entry matching the request's `(id, order)` fingerprint
    /// within its recording.
    pub async fn find_entry(&self, request: &CapturedRequest) -> Result<Option<Entry>> {
        let Some(id) = request.id() else {
            return Ok(None);
        };
        let recording = self.find_recording(&request.recording_id).await?;
        Ok(recording
            .and_then(|recording| recording.log.find_entry(id, request.order()).cloned()))
    }

    /// Appends a disposed exchange to the pending buffer for its recording.
    ///
    /// The request must already carry a response. A non-ok response is
    /// rejected outright unless `record_failed_requests` is set, so a failed
    /// exchange is never silently dropped at persist time.
    pub fn enqueue(&self, request: CapturedRequest) -> Result<()> {
        let Some(response) = request.response() else {
            return Err(Error::MissingResponse {
                method: request.method.clone(),
                url: request.url.clone(),
            });
        };

        if !response.ok() && !request.config.record_failed_requests {
            return Err(Error::RecordFailedResponse {
                method: request.method.clone(),
                url: request.url.clone(),
                status: response.status,
            });
        }

        let mut pending = self.pending.lock();
        let bucket = pending
            .entry(request.recording_id.clone())
            .or_insert_with(|| PendingBucket {
                name: request.recording_name.clone(),
                requests: Vec::new(),
            });
        bucket.requests.push(request);
        Ok(())
    }

    /// Marks a `(recording_id, id, order)` triple as used this run. Entries
    /// that were never marked are evicted on flush unless
    /// `keep_unused_requests` asks otherwise.
    pub(crate) fn note_observed(&self, request: &CapturedRequest) {
        let Some(id) = request.id() else { return };
        self.observed.lock().push(ObservedKey {
            recording_id: request.recording_id.clone(),
            id: id.to_owned(),
            order: request.order(),
        });
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    pub fn pending_len(&self, recording_id: &str) -> usize {
        self.pending
            .lock()
            .get(recording_id)
            .map(|bucket| bucket.requests.len())
            .unwrap_or(0)
    }

    /// Persists every pending exchange, one recording at a time.
    ///
    /// Each recording id either fully succeeds (bucket cleared, memoization
    /// invalidated) or fully fails (bucket restored for a later retry).
    /// Enqueues racing in during the flush land in fresh buckets and belong
    /// to the next cycle. The first failure is returned after every
    /// recording id has been attempted.
    pub async fn flush(&self) -> Result<()> {
        let drained: Vec<(String, PendingBucket)> = {
            let mut pending = self.pending.lock();
            std::mem::take(&mut *pending).into_iter().collect()
        };
        if drained.is_empty() {
            return Ok(());
        }

        let mut first_error = None;
        for (recording_id, bucket) in drained {
            match self.flush_recording(&recording_id, &bucket).await {
                Ok(()) => {
                    tracing::debug!(
                        %recording_id,
                        exchanges = bucket.requests.len(),
                        "persisted pending exchanges"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        %recording_id,
                        error = %err,
                        "flush failed; pending exchanges retained for retry"
                    );
                    self.restore_bucket(recording_id, bucket);
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn flush_recording(&self, recording_id: &str, bucket: &PendingBucket) -> Result<()> {
        let mut har = match self.find_recording(recording_id).await? {
            Some(existing) => (*existing).clone(),
            None => Har::new(Creator::this_producer(self.store.name()), &bucket.name),
        };

        let mut entries = Vec::with_capacity(bucket.requests.len());
        for request in &bucket.requests {
            let mut entry = Entry::build(request)?;
            if let Some(hook) = request.before_persist_hook() {
                hook(&mut entry);
            }
            entries.push(entry);
        }

        har.log.add_entries(entries);

        let keep_unused = bucket
            .requests
            .iter()
            .any(|request| request.config.keep_unused_requests);
        if !keep_unused {
            self.remove_unused_entries(recording_id, &mut har);
        }

        self.store
            .save(recording_id, &har)
            .await
            .map_err(Error::Store)?;
        self.invalidate(recording_id);
        Ok(())
    }

    fn remove_unused_entries(&self, recording_id: &str, har: &mut Har) {
        let observed = self.observed.lock();
        har.log.entries.retain(|entry| {
            observed.iter().any(|key| {
                key.recording_id == recording_id && key.id == entry.id && key.order == entry.order
            })
        });
    }

    fn restore_bucket(&self, recording_id: String, mut bucket: PendingBucket) {
        let mut pending = self.pending.lock();
        match pending.get_mut(&recording_id) {
            // Late arrivals enqueued during the failed flush stay behind the
            // restored exchanges so the original order is preserved.
            Some(existing) => {
                bucket.requests.append(&mut existing.requests);
                existing.requests = bucket.requests;
            }
            None => {
                pending.insert(recording_id, bucket);
            }
        }
    }

    /// Drops the store and memoization state for a recording.
    pub async fn delete(&self, recording_id: &str) -> Result<()> {
        self.store
            .delete(recording_id)
            .await
            .map_err(Error::Store)?;
        self.invalidate(recording_id);
        Ok(())
    }

    fn invalidate(&self, recording_id: &str) {
        self.loads.lock().remove(recording_id);
    }
}
