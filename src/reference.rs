//! Canonicalization of user supplied YouTube watch URLs.

use url::{ParseError, Url};

use crate::error::ReferenceError;

pub const CANONICAL_HOST: &str = "www.youtube.com";
const HOST_ALIASES: &[&str] = &["youtube.com", "m.youtube.com"];
const WATCH_PATH: &str = "/watch";

/// A validated video reference. The content id is the primary key for the
/// metadata cache, artifact layout and task ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentReference {
    pub canonical_url: String,
    pub content_id: String,
}

/// Validates `raw` and rewrites it into `https://www.youtube.com/watch?v=<id>`.
///
/// Plain `http` and scheme-less inputs are upgraded to `https`; the bare and
/// mobile hosts collapse onto the canonical host. Every other query
/// parameter and the fragment are dropped so URL variants of the same video
/// share one canonical form.
pub fn normalize(raw: &str) -> Result<ContentReference, ReferenceError> {
    let mut parsed = parse_lenient(raw.trim())?;

    match parsed.scheme() {
        "https" => {}
        "http" => {
            parsed
                .set_scheme("https")
                .map_err(|_| ReferenceError::Scheme(parsed.scheme().to_string()))?;
        }
        other => return Err(ReferenceError::Scheme(other.to_string())),
    }

    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    if let Some(port) = parsed.port() {
        return Err(ReferenceError::Host(format!("{host}:{port}")));
    }
    if host != CANONICAL_HOST && !HOST_ALIASES.contains(&host.as_str()) {
        return Err(ReferenceError::Host(host));
    }

    if parsed.path() != WATCH_PATH {
        return Err(ReferenceError::Path(parsed.path().to_string()));
    }

    let content_id = parsed
        .query_pairs()
        .find(|(key, _)| key == "v")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
        .ok_or(ReferenceError::MissingVideoId)?;
    ensure_safe_content_id(&content_id)?;

    let mut canonical = Url::parse(&format!("https://{CANONICAL_HOST}{WATCH_PATH}"))
        .map_err(|err| ReferenceError::Malformed(err.to_string()))?;
    canonical.query_pairs_mut().append_pair("v", &content_id);

    Ok(ContentReference {
        canonical_url: canonical.into(),
        content_id,
    })
}

fn parse_lenient(raw: &str) -> Result<Url, ReferenceError> {
    if raw.is_empty() {
        return Err(ReferenceError::Malformed("empty URL".into()));
    }
    let candidate = match raw.strip_prefix("//") {
        Some(rest) => format!("https://{rest}"),
        None => raw.to_string(),
    };
    match Url::parse(&candidate) {
        Ok(url) => Ok(url),
        Err(ParseError::RelativeUrlWithoutBase) => Url::parse(&format!("https://{candidate}"))
            .map_err(|err| ReferenceError::Malformed(err.to_string())),
        Err(err) => Err(ReferenceError::Malformed(err.to_string())),
    }
}

/// The content id becomes a directory name, so it must stay a single
/// normal path segment.
fn ensure_safe_content_id(value: &str) -> Result<(), ReferenceError> {
    let unsafe_id = value == "."
        || value == ".."
        || value
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control());
    if unsafe_id {
        return Err(ReferenceError::VideoId(value.to_string()));
    }
    Ok(())
}
