use std::{fs, path::Path, path::PathBuf, str::FromStr, time::Duration};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

/// Global operating mode for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Record,
    Replay,
    Passthrough,
}

/// Replay timing profile: how much of the recorded latency to re-inject
/// before resolving a replayed response.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Timing {
    /// Resolve immediately.
    None,
    /// A constant delay regardless of the recorded time.
    Fixed { millis: u64 },
    /// A multiple of the recorded elapsed time.
    Relative { factor: f64 },
}

impl Timing {
    pub fn fixed(millis: u64) -> Self {
        Self::Fixed { millis }
    }

    pub fn relative(factor: f64) -> Self {
        Self::Relative { factor }
    }

    /// Delay to inject for an entry whose recorded total time is
    /// `recorded_millis`.
    pub fn delay_for(&self, recorded_millis: f64) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed { millis } => Duration::from_millis(*millis),
            Self::Relative { factor } => {
                let millis = recorded_millis * factor;
                if millis.is_finite() && millis > 0.0 {
                    Duration::from_millis(millis.round() as u64)
                } else {
                    Duration::ZERO
                }
            }
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::Fixed { millis: 0 }
    }
}

/// Which parts of a request participate in its fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchRequestsBy {
    pub method: bool,
    pub headers: HeaderMatch,
    pub body: bool,
    /// Disambiguate repeated identical fingerprints with a sequence number.
    pub order: bool,
    pub url: UrlMatch,
}

impl Default for MatchRequestsBy {
    fn default() -> Self {
        Self {
            method: true,
            headers: HeaderMatch::default(),
            body: true,
            order: true,
            url: UrlMatch::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderMatch {
    pub enabled: bool,
    /// Header names (case-insensitive) excluded from the fingerprint.
    pub exclude: Vec<String>,
}

impl Default for HeaderMatch {
    fn default() -> Self {
        Self {
            enabled: true,
            exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlMatch {
    pub protocol: bool,
    pub username: bool,
    pub password: bool,
    pub hostname: bool,
    pub port: bool,
    pub pathname: bool,
    pub query: bool,
    pub hash: bool,
}

impl Default for UrlMatch {
    fn default() -> Self {
        Self {
            protocol: true,
            username: true,
            password: true,
            hostname: true,
            port: true,
            pathname: true,
            query: true,
            hash: false,
        }
    }
}

/// The per-request policy snapshot consumed by the disposition engine.
///
/// Callers merge their global and per-request settings into one of these
/// before handing a request over; the engine never re-reads shared mutable
/// configuration mid-flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub mode: Mode,
    pub record_if_missing: bool,
    pub record_if_expired: bool,
    pub record_failed_requests: bool,
    /// Age after which a recorded entry is considered expired. Absent means
    /// entries never expire.
    #[serde(with = "humantime_option")]
    pub expires_in: Option<Duration>,
    pub timing: Timing,
    pub keep_unused_requests: bool,
    pub match_requests_by: MatchRequestsBy,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Replay,
            record_if_missing: true,
            record_if_expired: false,
            record_failed_requests: false,
            expires_in: None,
            timing: Timing::default(),
            keep_unused_requests: false,
            match_requests_by: MatchRequestsBy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Registered backend name, e.g. `fs` or `memory`.
    pub backend: String,
    /// Root directory for file-backed stores.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

/// Root configuration document.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub playback: PlaybackConfig,
    pub store: Option<StoreConfig>,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

mod humantime_option {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => {
                serializer.serialize_str(&humantime::format_duration(*duration).to_string())
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
