use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    error::{Error, Result},
    headers::HeaderMap,
    request::{CapturedRequest, CapturedResponse},
};

/// Producer identity written into every recording and validated on load.
pub const CREATOR_NAME: &str = "tapedeck";

pub const LOG_VERSION: &str = "1.2";

const HTTP_VERSION: &str = "HTTP/1.1";

/// Sentinel for a timing phase that was not measured.
const NOT_MEASURED: f64 = -1.0;

/// A durable recording document: an ordered log of entries plus provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Har {
    pub log: Log,
}

impl Har {
    pub fn new(creator: Creator, recording_name: impl Into<String>) -> Self {
        Self {
            log: Log {
                version: LOG_VERSION.to_owned(),
                creator,
                browser: None,
                entries: Vec::new(),
                recording_name: recording_name.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    pub version: String,
    pub creator: Creator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<Browser>,
    #[serde(default)]
    pub entries: Vec<Entry>,
    #[serde(rename = "_recordingName", default)]
    pub recording_name: String,
}

impl Log {
    /// Merges `entries` into the log. New entries take priority over
    /// existing ones sharing the same `(_id, _order)`; the result is
    /// re-sorted by `startedDateTime` ascending.
    pub fn add_entries(&mut self, entries: Vec<Entry>) {
        let mut merged = entries;
        merged.append(&mut self.entries);

        let mut seen: HashSet<(String, u64)> = HashSet::with_capacity(merged.len());
        merged.retain(|entry| seen.insert((entry.id.clone(), entry.order)));

        self.entries = merged;
        self.sort_entries();
    }

    pub fn sort_entries(&mut self) {
        self.entries.sort_by_key(|entry| entry.started_date_time);
    }

    pub fn find_entry(&self, id: &str, order: u64) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|entry| entry.id == id && entry.order == order)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Creator {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Creator {
    /// Creator stamp for recordings written by this process.
    pub fn this_producer(store_name: &str) -> Self {
        Self {
            name: CREATOR_NAME.to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            comment: Some(format!("store:{store_name}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Browser {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// One durable, immutable record of a request/response exchange.
///
/// `(_id, _order)` uniquely identifies an entry within a recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_order")]
    pub order: u64,
    pub started_date_time: DateTime<Utc>,
    pub request: HarRequest,
    pub response: HarResponse,
    #[serde(default)]
    pub cache: serde_json::Map<String, serde_json::Value>,
    pub timings: Timings,
    /// Total elapsed time: the sum of all non-negative timing phases.
    pub time: f64,
}

impl Entry {
    /// Builds an entry from a disposed request carrying a response.
    ///
    /// Pure transform: derived sizes and timings are computed here and
    /// nowhere else.
    pub fn build(request: &CapturedRequest) -> Result<Entry> {
        let Some(response) = request.response() else {
            return Err(Error::MissingResponse {
                method: request.method.clone(),
                url: request.url.clone(),
            });
        };

        let timings = Timings::wait_only(request.response_time_ms());
        let time = timings.total();

        Ok(Entry {
            id: request.id().unwrap_or_default().to_owned(),
            order: request.order(),
            started_date_time: request.started_at(),
            request: HarRequest::from_captured(request),
            response: HarResponse::from_captured(response),
            cache: serde_json::Map::new(),
            timings,
            time,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarRequest {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub headers: Vec<NvPair>,
    pub headers_size: i64,
    pub query_string: Vec<NvPair>,
    pub cookies: Vec<Cookie>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_data: Option<PostData>,
    pub body_size: i64,
}

impl HarRequest {
    fn from_captured(request: &CapturedRequest) -> Self {
        let headers = nv_pairs(&request.headers);
        let post_data = request.body.as_ref().map(|body| PostData {
            mime_type: request
                .headers
                .first("content-type")
                .unwrap_or("text/plain")
                .to_owned(),
            params: Vec::new(),
            text: Some(body.clone()),
        });

        let body_size = match content_length(&request.headers) {
            Some(length) => length,
            None => post_data
                .as_ref()
                .and_then(|post_data| post_data.text.as_deref())
                .map(|text| text.len() as i64)
                .unwrap_or(0),
        };

        Self {
            method: request.method.clone(),
            url: request.url.clone(),
            http_version: HTTP_VERSION.to_owned(),
            headers_size: request_headers_size(&request.method, &request.url, &headers),
            query_string: query_string_pairs(&request.url),
            cookies: request_cookies(&request.headers),
            headers,
            post_data,
            body_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarResponse {
    pub status: u16,
    pub status_text: String,
    pub http_version: String,
    pub headers: Vec<NvPair>,
    pub headers_size: i64,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    pub cookies: Vec<Cookie>,
    pub content: Content,
    pub body_size: i64,
}

impl HarResponse {
    fn from_captured(response: &CapturedResponse) -> Self {
        let headers = nv_pairs(&response.headers);
        let text = response.body.clone();
        let size = match content_length(&response.headers) {
            Some(length) => length,
            None => text.as_deref().map(|text| text.len() as i64).unwrap_or(0),
        };

        Self {
            status: response.status,
            status_text: response.status_text.clone(),
            http_version: HTTP_VERSION.to_owned(),
            headers_size: response_headers_size(&headers),
            redirect_url: response
                .headers
                .first("location")
                .unwrap_or_default()
                .to_owned(),
            cookies: response_cookies(&response.headers),
            headers,
            content: Content {
                mime_type: response
                    .headers
                    .first("content-type")
                    .unwrap_or("text/plain")
                    .to_owned(),
                size,
                text,
            },
            body_size: size,
        }
    }
}

/// Rebuilds a response from a recorded entry.
///
/// The header multimap is reassembled from the stored name/value pairs,
/// collapsing duplicates into an array only when more than one value shares
/// a name; the body comes from the stored content text.
pub fn normalize_response(response: &HarResponse) -> CapturedResponse {
    let headers = HeaderMap::from_pairs(
        response
            .headers
            .iter()
            .map(|pair| (pair.name.as_str(), pair.value.clone())),
    );

    CapturedResponse {
        status: response.status,
        status_text: response.status_text.clone(),
        headers,
        body: response.content.text.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvPair {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostData {
    pub mime_type: String,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub mime_type: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Per-phase timings in milliseconds; `-1` marks a phase that was not
/// measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub blocked: f64,
    pub dns: f64,
    pub connect: f64,
    pub send: f64,
    pub wait: f64,
    pub receive: f64,
    pub ssl: f64,
}

impl Timings {
    /// Only the wait phase carries the observed response latency; send and
    /// receive are measured-but-instant, everything else is unmeasured.
    pub fn wait_only(wait_ms: f64) -> Self {
        Self {
            blocked: NOT_MEASURED,
            dns: NOT_MEASURED,
            connect: NOT_MEASURED,
            send: 0.0,
            wait: wait_ms,
            receive: 0.0,
            ssl: NOT_MEASURED,
        }
    }

    pub fn total(&self) -> f64 {
        [
            self.blocked,
            self.dns,
            self.connect,
            self.send,
            self.wait,
            self.receive,
            self.ssl,
        ]
        .into_iter()
        .filter(|phase| *phase > 0.0)
        .sum()
    }
}

fn nv_pairs(headers: &HeaderMap) -> Vec<NvPair> {
    headers
        .to_pairs()
        .into_iter()
        .map(|(name, value)| NvPair { name, value })
        .collect()
}

fn content_length(headers: &HeaderMap) -> Option<i64> {
    headers
        .first("content-length")
        .and_then(|value| value.trim().parse().ok())
}

// Wire-size arithmetic for a serialized header block:
//   start line: [method] [url] HTTP/1.1\r\n  = 12
//   end line: \r\n                           = 2
//   every header's \r\n                      = * 2
// Names and values are joined with `,` to charge one separator byte per
// combined header, matching the documented size semantics of the format.
fn request_headers_size(method: &str, url: &str, headers: &[NvPair]) -> i64 {
    (method.len() + url.len() + joined_len(headers) + headers.len() * 2 + 2 + 12 + 2) as i64
}

fn response_headers_size(headers: &[NvPair]) -> i64 {
    (joined_len(headers) + headers.len() * 2 + 2 + 2) as i64
}

fn joined_len(headers: &[NvPair]) -> usize {
    let names: usize = headers.iter().map(|pair| pair.name.len()).sum();
    let values: usize = headers.iter().map(|pair| pair.value.len()).sum();
    let separators = headers.len().saturating_sub(1) * 2;
    names + values + separators
}

fn query_string_pairs(url: &str) -> Vec<NvPair> {
    let Ok(parsed) = Url::parse(url) else {
        return Vec::new();
    };
    parsed
        .query_pairs()
        .map(|(name, value)| NvPair {
            name: name.into_owned(),
            value: value.into_owned(),
        })
        .collect()
}

fn request_cookies(headers: &HeaderMap) -> Vec<Cookie> {
    let Some(header) = headers.first("cookie") else {
        return Vec::new();
    };
    header
        .split(';')
        .filter_map(|segment| parse_cookie_pair(segment))
        .collect()
}

fn response_cookies(headers: &HeaderMap) -> Vec<Cookie> {
    let Some(value) = headers.get("set-cookie") else {
        return Vec::new();
    };
    let values: Vec<&str> = match value {
        crate::headers::HeaderValue::One(value) => vec![value.as_str()],
        crate::headers::HeaderValue::Many(values) => {
            values.iter().map(String::as_str).collect()
        }
    };
    values
        .into_iter()
        .filter_map(|value| parse_cookie_pair(value.split(';').next().unwrap_or_default()))
        .collect()
}

fn parse_cookie_pair(segment: &str) -> Option<Cookie> {
    let (name, value) = segment.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some(Cookie {
        name: name.to_owned(),
        value: value.trim().to_owned(),
    })
}
