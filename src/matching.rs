use std::borrow::Cow;

use sha2::{Digest as _, Sha256};
use url::Url;

use crate::{config::MatchRequestsBy, headers::HeaderMap};

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("parse request URL for matching")]
    InvalidUrl(#[source] url::ParseError),
}

/// Computes the fingerprint used as the lookup key into a recording.
///
/// The fingerprint is a SHA-256 hash over the *normalized* request
/// dimensions selected by `rules`. Every field is hashed length-prefixed
/// under a tag so that boundaries between fields cannot collide.
///
/// Included dimensions:
/// - `method`: uppercased (ASCII) HTTP method
/// - `url`: each enabled component (protocol, username, password, hostname,
///   port, pathname, query, hash) hashed separately; query pairs are parsed
///   as raw `name=value` pairs and sorted by name then value with repeated
///   keys preserved
/// - `headers`: case-insensitive names, serialized lowercased, minus the
///   configured exclude list; already sorted by name
/// - `body`: text as captured
pub fn fingerprint(
    method: &str,
    url: &str,
    headers: &HeaderMap,
    body: Option<&str>,
    rules: &MatchRequestsBy,
) -> Result<String, MatchError> {
    let mut hasher = Sha256::new();

    if rules.method {
        hash_tagged_str(&mut hasher, b"method", normalized_method(method).as_ref());
    }

    hash_url(&mut hasher, url, rules)?;

    if rules.headers.enabled {
        let exclude: Vec<String> = rules
            .headers
            .exclude
            .iter()
            .map(|name| name.to_ascii_lowercase())
            .collect();
        let selected: Vec<(String, String)> = headers
            .to_pairs()
            .into_iter()
            .filter(|(name, _)| !exclude.iter().any(|excluded| excluded == name))
            .collect();

        hash_len_prefixed(&mut hasher, b"headers");
        hash_len_prefixed(&mut hasher, selected.len().to_string().as_bytes());
        for (name, value) in &selected {
            hash_len_prefixed(&mut hasher, name.as_bytes());
            hash_len_prefixed(&mut hasher, value.as_bytes());
        }
    }

    if rules.body {
        hash_tagged_str(&mut hasher, b"body", body.unwrap_or_default());
    }

    let digest = hasher.finalize();
    Ok(hex_encode(&digest))
}

fn hash_url(hasher: &mut Sha256, url: &str, rules: &MatchRequestsBy) -> Result<(), MatchError> {
    let parsed = Url::parse(url).map_err(MatchError::InvalidUrl)?;
    let url_rules = &rules.url;

    if url_rules.protocol {
        hash_tagged_str(hasher, b"protocol", parsed.scheme());
    }
    if url_rules.username {
        hash_tagged_str(hasher, b"username", parsed.username());
    }
    if url_rules.password {
        hash_tagged_str(hasher, b"password", parsed.password().unwrap_or_default());
    }
    if url_rules.hostname {
        hash_tagged_str(hasher, b"hostname", parsed.host_str().unwrap_or_default());
    }
    if url_rules.port {
        let port = parsed
            .port()
            .map(|port| port.to_string())
            .unwrap_or_default();
        hash_tagged_str(hasher, b"port", &port);
    }
    if url_rules.pathname {
        hash_tagged_str(hasher, b"pathname", parsed.path());
    }
    if url_rules.query {
        let params = query_params_sorted(parsed.query());
        hash_len_prefixed(hasher, b"query");
        hash_len_prefixed(hasher, params.len().to_string().as_bytes());
        for (name, value) in params {
            hash_len_prefixed(hasher, name.as_bytes());
            hash_len_prefixed(hasher, value.as_bytes());
        }
    }
    if url_rules.hash {
        hash_tagged_str(hasher, b"hash", parsed.fragment().unwrap_or_default());
    }

    Ok(())
}

fn normalized_method(method: &str) -> Cow<'_, str> {
    if method.bytes().any(|byte| byte.is_ascii_lowercase()) {
        return Cow::Owned(method.to_ascii_uppercase());
    }
    Cow::Borrowed(method)
}

fn query_params_sorted(query: Option<&str>) -> Vec<(&str, &str)> {
    let mut out = Vec::new();
    let Some(query) = query else { return out };

    for segment in query.split('&') {
        if segment.is_empty() {
            continue;
        }
        let mut parts = segment.splitn(2, '=');
        let name = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_default();
        out.push((name, value));
    }

    out.sort_unstable_by(|(a_name, a_value), (b_name, b_value)| {
        a_name.cmp(b_name).then_with(|| a_value.cmp(b_value))
    });
    out
}

fn hash_tagged_str(hasher: &mut Sha256, tag: &[u8], value: &str) {
    hash_len_prefixed(hasher, tag);
    hash_len_prefixed(hasher, value.as_bytes());
}

fn hash_len_prefixed(hasher: &mut Sha256, value: &[u8]) {
    hasher.update(u64::try_from(value.len()).unwrap_or(u64::MAX).to_le_bytes());
    hasher.update(value);
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes.iter().copied() {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}
