//! Deterministic record/replay engine for HTTP exchanges made by a program
//! under test.
//!
//! A [`engine::DispositionEngine`] decides the fate of each captured request
//! (passthrough, synthetic intercept, record, or replay), a
//! [`cache::RecordingCache`] layers memoized lookups and a pending-write
//! buffer over a pluggable [`store::Store`], and recordings are persisted as
//! HAR-shaped logs keyed by request fingerprint.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod har;
pub mod headers;
pub mod logging;
pub mod matching;
pub mod request;
pub mod store;

pub use cache::RecordingCache;
pub use config::{Config, Mode, PlaybackConfig, Timing};
pub use engine::{DispositionEngine, Interceptor, SyntheticHandler, Transport};
pub use error::{Error, Result};
pub use har::{Entry, Har};
pub use headers::{HeaderMap, HeaderValue};
pub use request::{CapturedRequest, CapturedResponse, Disposition};
pub use store::{FsStore, MemoryStore, Store, StoreRegistry};
