//! Video metadata: the lenient `--dump-json` schema, quality variant
//! selection, token shaping and the cached single-flight fetcher.
//!
//! Everything upstream-shaped stays in the `Raw*` structs. Missing or
//! mistyped fields decode to empty strings and zeros so a yt-dlp schema drift
//! degrades the response instead of failing it. Only `id` is mandatory.

use std::{
    cmp::Ordering,
    collections::HashMap,
    sync::{Arc, LazyLock},
};

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::YtdlpConfig;
use crate::error::MetadataError;
use crate::format_token::{AudioSelection, FormatToken, MediaKind, VideoSelection};
use crate::reference::ContentReference;
use crate::storage::{Storage, write_atomic};
use crate::ytdlp::YtDlp;

static RESOLUTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+x\d+|\d+p)").expect("resolution regex"));

const AUDIO_ONLY: &str = "audio only";
const UNKNOWN_RESOLUTION: &str = "unknown";

/// Response body of `GET /info`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoInfo {
    pub id: String,
    pub webpage_url: String,
    pub title: String,
    pub description: String,
    pub duration: i64,
    pub thumbnail: String,
    pub view_count: i64,
    pub comment_count: i64,
    pub like_count: i64,
    pub upload_date: String,
    pub uploader: String,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub channel: String,
    pub channel_url: String,
    pub channel_follower_count: i64,
    pub audio: Vec<FormatGroup>,
    pub video: Vec<FormatGroup>,
}

/// Downloadable tokens that share a target container.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatGroup {
    pub ext: String,
    pub formats: Vec<FormatEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatEntry {
    /// Opaque token accepted by `POST /download`.
    pub format_id: String,
    pub ext: String,
    pub resolution: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    /// Upstream size estimate of the selected stream, zero when unknown.
    pub filesize: i64,
}

/// Extensions the service offers per media kind, in presentation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedFormats {
    pub audio: Vec<String>,
    pub video: Vec<String>,
}

impl OfferedFormats {
    pub fn from_config(config: &YtdlpConfig) -> Self {
        Self {
            audio: config.audio_formats.clone(),
            video: config.video_formats.clone(),
        }
    }

    /// Whether `token` targets an extension this service would have handed
    /// out for its kind.
    pub fn allows(&self, token: &FormatToken) -> bool {
        let offered = match token.kind() {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        };
        offered.iter().any(|ext| ext == token.extension())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioVariant {
    pub format_id: String,
    pub ext: String,
    pub sample_rate: u32,
    bitrate: f64,
    filesize: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoVariant {
    pub format_id: String,
    pub ext: String,
    pub resolution: String,
    bitrate: f64,
    fps: f64,
    filesize: i64,
}

/// Best variant per sample rate (audio) and per resolution (video), in the
/// order their buckets were first seen upstream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variants {
    pub audio: Vec<AudioVariant>,
    pub video: Vec<VideoVariant>,
}

impl Variants {
    /// Audio stream paired into every video token. Ties keep the first seen.
    pub fn best_audio(&self) -> Option<&AudioVariant> {
        self.audio.iter().fold(None, |best, candidate| match best {
            Some(current) if current.sample_rate >= candidate.sample_rate => Some(current),
            _ => Some(candidate),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawInfo {
    #[serde(deserialize_with = "lenient_string")]
    id: String,
    #[serde(deserialize_with = "lenient_string")]
    webpage_url: String,
    #[serde(deserialize_with = "lenient_string")]
    title: String,
    #[serde(deserialize_with = "lenient_string")]
    description: String,
    #[serde(deserialize_with = "lenient_i64")]
    duration: i64,
    #[serde(deserialize_with = "lenient_string")]
    thumbnail: String,
    #[serde(deserialize_with = "lenient_i64")]
    view_count: i64,
    #[serde(deserialize_with = "lenient_i64")]
    comment_count: i64,
    #[serde(deserialize_with = "lenient_i64")]
    like_count: i64,
    #[serde(deserialize_with = "lenient_string")]
    upload_date: String,
    #[serde(deserialize_with = "lenient_string")]
    uploader: String,
    #[serde(deserialize_with = "lenient_strings")]
    categories: Vec<String>,
    #[serde(deserialize_with = "lenient_strings")]
    tags: Vec<String>,
    #[serde(deserialize_with = "lenient_string")]
    channel: String,
    #[serde(deserialize_with = "lenient_string")]
    channel_url: String,
    #[serde(deserialize_with = "lenient_i64")]
    channel_follower_count: i64,
    #[serde(deserialize_with = "lenient_i64")]
    subscriber_count: i64,
    #[serde(deserialize_with = "lenient_formats")]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawFormat {
    #[serde(deserialize_with = "lenient_string")]
    format_id: String,
    #[serde(deserialize_with = "lenient_string")]
    format: String,
    #[serde(deserialize_with = "lenient_string")]
    format_note: String,
    #[serde(deserialize_with = "lenient_string")]
    ext: String,
    #[serde(deserialize_with = "lenient_string")]
    vcodec: String,
    #[serde(deserialize_with = "lenient_string")]
    acodec: String,
    #[serde(deserialize_with = "lenient_string")]
    resolution: String,
    #[serde(deserialize_with = "lenient_i64")]
    width: i64,
    #[serde(deserialize_with = "lenient_i64")]
    height: i64,
    #[serde(deserialize_with = "lenient_i64")]
    asr: i64,
    #[serde(deserialize_with = "lenient_f64")]
    fps: f64,
    #[serde(deserialize_with = "lenient_f64")]
    tbr: f64,
    #[serde(deserialize_with = "lenient_f64")]
    abr: f64,
    #[serde(deserialize_with = "lenient_f64")]
    vbr: f64,
    #[serde(deserialize_with = "lenient_i64")]
    filesize: i64,
    #[serde(deserialize_with = "lenient_i64")]
    filesize_approx: i64,
}

impl RawFormat {
    fn is_storyboard(&self) -> bool {
        self.format_note.contains("storyboard") || self.ext == "mhtml"
    }

    fn is_audio_only(&self) -> bool {
        self.vcodec == "none" && !self.acodec.is_empty() && self.acodec != "none"
    }

    fn is_video_only(&self) -> bool {
        self.acodec == "none" && !self.vcodec.is_empty() && self.vcodec != "none"
    }

    fn bitrate(&self, specific: f64) -> f64 {
        if self.tbr > 0.0 { self.tbr } else { specific }
    }

    fn size(&self) -> i64 {
        if self.filesize > 0 {
            self.filesize
        } else {
            self.filesize_approx
        }
    }

    fn resolution(&self) -> String {
        if !self.resolution.is_empty() && self.resolution != AUDIO_ONLY {
            return self.resolution.clone();
        }
        if self.width > 0 && self.height > 0 {
            return format!("{}x{}", self.width, self.height);
        }
        RESOLUTION_RE
            .find(&self.format)
            .map(|found| found.as_str().to_string())
            .unwrap_or_else(|| UNKNOWN_RESOLUTION.to_string())
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(value) => value,
        _ => String::new(),
    })
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|value| value as i64))
            .unwrap_or_default(),
        _ => 0,
    })
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(number) => number.as_f64().unwrap_or_default(),
        _ => 0.0,
    })
}

fn lenient_strings<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(value) => Some(value),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    })
}

fn lenient_formats<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<RawFormat>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    })
}

/// Decodes one `--dump-json` document and shapes it into the public record.
pub fn parse_video_info(
    raw: &[u8],
    offered: &OfferedFormats,
) -> Result<VideoInfo, MetadataError> {
    let raw: RawInfo =
        serde_json::from_slice(raw).map_err(|err| MetadataError::Parse(err.to_string()))?;
    if raw.id.trim().is_empty() {
        return Err(MetadataError::MissingField("id"));
    }

    let variants = select_variants(&raw.formats);
    let (audio, video) = shape(&variants, offered);
    let channel_follower_count = if raw.channel_follower_count > 0 {
        raw.channel_follower_count
    } else {
        raw.subscriber_count
    };

    Ok(VideoInfo {
        id: raw.id,
        webpage_url: raw.webpage_url,
        title: raw.title,
        description: raw.description,
        duration: raw.duration,
        thumbnail: raw.thumbnail,
        view_count: raw.view_count,
        comment_count: raw.comment_count,
        like_count: raw.like_count,
        upload_date: raw.upload_date,
        uploader: raw.uploader,
        // Only the primary category is reported.
        categories: raw.categories.into_iter().take(1).collect(),
        tags: raw.tags,
        channel: raw.channel,
        channel_url: raw.channel_url,
        channel_follower_count,
        audio,
        video,
    })
}

fn select_variants(formats: &[RawFormat]) -> Variants {
    let usable = formats.iter().filter(|format| {
        !format.is_storyboard()
            && !format.format_id.is_empty()
            && !format.format_id.contains('|')
            && !format.ext.is_empty()
    });

    let mut audio = Vec::new();
    let mut video = Vec::new();
    for format in usable {
        if format.is_audio_only() {
            let Some(sample_rate) = u32::try_from(format.asr).ok().filter(|rate| *rate > 0) else {
                continue;
            };
            audio.push(AudioVariant {
                format_id: format.format_id.clone(),
                ext: format.ext.clone(),
                sample_rate,
                bitrate: format.bitrate(format.abr),
                filesize: format.size(),
            });
        } else if format.is_video_only() {
            video.push(VideoVariant {
                format_id: format.format_id.clone(),
                ext: format.ext.clone(),
                resolution: format.resolution(),
                bitrate: format.bitrate(format.vbr),
                fps: format.fps,
                filesize: format.size(),
            });
        }
    }

    Variants {
        audio: keep_best(
            audio,
            |variant| variant.sample_rate.to_string(),
            |candidate, current| {
                candidate
                    .bitrate
                    .total_cmp(&current.bitrate)
                    .then(candidate.filesize.cmp(&current.filesize))
            },
        ),
        video: keep_best(
            video,
            |variant| variant.resolution.clone(),
            |candidate, current| {
                candidate
                    .bitrate
                    .total_cmp(&current.bitrate)
                    .then(candidate.fps.total_cmp(&current.fps))
                    .then(candidate.filesize.cmp(&current.filesize))
            },
        ),
    }
}

/// A later variant replaces the bucket holder only when it ranks strictly
/// higher.
fn keep_best<T>(
    variants: Vec<T>,
    bucket: impl Fn(&T) -> String,
    rank: impl Fn(&T, &T) -> Ordering,
) -> Vec<T> {
    let mut kept: Vec<T> = Vec::new();
    let mut slots: HashMap<String, usize> = HashMap::new();
    for variant in variants {
        let key = bucket(&variant);
        match slots.get(&key) {
            Some(&slot) => {
                if rank(&variant, &kept[slot]) == Ordering::Greater {
                    kept[slot] = variant;
                }
            }
            None => {
                slots.insert(key, kept.len());
                kept.push(variant);
            }
        }
    }
    kept
}

fn shape(variants: &Variants, offered: &OfferedFormats) -> (Vec<FormatGroup>, Vec<FormatGroup>) {
    let audio = if variants.audio.is_empty() {
        Vec::new()
    } else {
        offered
            .audio
            .iter()
            .map(|ext| FormatGroup {
                ext: ext.clone(),
                formats: variants
                    .audio
                    .iter()
                    .map(|variant| {
                        let token = FormatToken::Audio(AudioSelection {
                            extension: ext.clone(),
                            sample_rate: variant.sample_rate,
                            format_id: variant.format_id.clone(),
                        });
                        FormatEntry {
                            format_id: token.encode(),
                            ext: ext.clone(),
                            resolution: AUDIO_ONLY.to_string(),
                            sample_rate: Some(variant.sample_rate),
                            filesize: variant.filesize,
                        }
                    })
                    .collect(),
            })
            .collect()
    };

    let paired_audio = variants.best_audio();
    let video = if variants.video.is_empty() {
        Vec::new()
    } else {
        offered
            .video
            .iter()
            .map(|ext| FormatGroup {
                ext: ext.clone(),
                formats: variants
                    .video
                    .iter()
                    .map(|variant| {
                        let token = FormatToken::Video(VideoSelection {
                            extension: ext.clone(),
                            resolution: variant.resolution.clone(),
                            video_format_id: variant.format_id.clone(),
                            audio_format_id: paired_audio.map(|audio| audio.format_id.clone()),
                        });
                        FormatEntry {
                            format_id: token.encode(),
                            ext: ext.clone(),
                            resolution: variant.resolution.clone(),
                            sample_rate: None,
                            filesize: variant.filesize
                                + paired_audio.map(|audio| audio.filesize).unwrap_or_default(),
                        }
                    })
                    .collect(),
            })
            .collect()
    };

    (audio, video)
}

type SharedFetch = Arc<OnceCell<Result<Arc<VideoInfo>, MetadataError>>>;

/// Drops the single-flight entry once its last waiter is gone, including
/// waiters whose future was abandoned mid-fetch.
struct InflightGuard<'a> {
    inflight: &'a Mutex<HashMap<String, SharedFetch>>,
    content_id: &'a str,
    shared: SharedFetch,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock();
        // The map holds one reference and this guard another.
        let last_waiter = inflight
            .get(self.content_id)
            .is_some_and(|current| {
                Arc::ptr_eq(current, &self.shared) && Arc::strong_count(current) <= 2
            });
        if last_waiter {
            inflight.remove(self.content_id);
        }
    }
}

/// Runs the info tool at most once per content id at a time and keeps the raw
/// output on the storage mount for later requests.
pub struct MetadataFetcher {
    ytdlp: YtDlp,
    storage: Storage,
    offered: OfferedFormats,
    inflight: Mutex<HashMap<String, SharedFetch>>,
}

impl MetadataFetcher {
    pub fn new(ytdlp: YtDlp, storage: Storage, offered: OfferedFormats) -> Self {
        Self {
            ytdlp,
            storage,
            offered,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn fetch(
        &self,
        reference: &ContentReference,
    ) -> Result<Arc<VideoInfo>, MetadataError> {
        let content_id = reference.content_id.as_str();
        let flight = {
            let mut inflight = self.inflight.lock();
            let shared = inflight
                .entry(content_id.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();
            InflightGuard {
                inflight: &self.inflight,
                content_id,
                shared,
            }
        };
        flight.shared.get_or_init(|| self.load(reference)).await.clone()
    }

    async fn load(
        &self,
        reference: &ContentReference,
    ) -> Result<Arc<VideoInfo>, MetadataError> {
        let content_id = reference.content_id.as_str();
        let cache_path = self.storage.info_cache_path(content_id);

        match tokio::fs::read(&cache_path).await {
            Ok(cached) => match parse_video_info(&cached, &self.offered) {
                Ok(info) => {
                    debug!(content_id, "video info served from cache");
                    return Ok(Arc::new(info));
                }
                Err(err) => {
                    warn!(
                        content_id,
                        path = %cache_path.display(),
                        "ignoring unreadable info cache: {err}"
                    );
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(content_id, path = %cache_path.display(), "failed to read info cache: {err}");
            }
        }

        info!(content_id, url = %reference.canonical_url, "fetching video info");
        let output = self
            .ytdlp
            .info_command(&reference.canonical_url)
            .output()
            .await
            .map_err(|err| {
                MetadataError::Spawn(format!("{}: {err}", self.ytdlp.binary().display()))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(content_id, status = %output.status, "info extraction failed: {stderr}");
            return Err(MetadataError::Exit {
                status: output.status.to_string(),
                stderr,
            });
        }

        let info = parse_video_info(&output.stdout, &self.offered)?;
        let stdout = output.stdout;
        let written = tokio::task::spawn_blocking(move || write_atomic(&cache_path, &stdout)).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(content_id, "failed to persist info cache: {err:#}"),
            Err(err) => warn!(content_id, "info cache writer panicked: {err}"),
        }
        Ok(Arc::new(info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::reference::normalize;
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    fn offered(audio: &[&str], video: &[&str]) -> OfferedFormats {
        OfferedFormats {
            audio: audio.iter().map(|ext| ext.to_string()).collect(),
            video: video.iter().map(|ext| ext.to_string()).collect(),
        }
    }

    fn sample_payload() -> Value {
        json!({
            "id": "abc123",
            "webpage_url": "https://www.youtube.com/watch?v=abc123",
            "title": "Sample",
            "description": null,
            "duration": 213.0,
            "view_count": 10,
            "categories": ["Music", "Entertainment"],
            "tags": ["one", 2, "three"],
            "channel": "Channel",
            "subscriber_count": 42,
            "formats": [
                {"format_id": "sb0", "format_note": "storyboard", "ext": "mhtml",
                 "vcodec": "none", "acodec": "none"},
                {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2",
                 "asr": 44100, "abr": 129.5, "filesize": 3000},
                {"format_id": "137", "ext": "mp4", "vcodec": "avc1.640028", "acodec": "none",
                 "width": 1920, "height": 1080, "fps": 25, "vbr": 1379.0, "filesize": 29000}
            ]
        })
    }

    fn install_ytdlp_stub(dir: &Path, payload: &str, exit_code: i32) -> Result<(PathBuf, PathBuf)> {
        let counter = dir.join("invocations");
        let script_path = dir.join("yt-dlp");
        let script = format!(
            r#"#!/usr/bin/env bash
set -eu
echo "$*" >> '{counter}'
sleep 0.2
if [[ {exit_code} -ne 0 ]]; then
  echo "ERROR: Video unavailable" >&2
  exit {exit_code}
fi
cat <<'JSON'
{payload}
JSON
"#,
            counter = counter.display(),
        );
        fs::write(&script_path, script)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&script_path)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&script_path, perms)?;
        }
        Ok((script_path, counter))
    }

    fn invocations(counter: &Path) -> usize {
        fs::read_to_string(counter)
            .map(|contents| contents.lines().count())
            .unwrap_or(0)
    }

    fn fetcher(stub: PathBuf, mount: &Path, offer: OfferedFormats) -> MetadataFetcher {
        let ytdlp = YtDlp::new(&YtdlpConfig {
            path: stub,
            ..YtdlpConfig::default()
        });
        let storage = Storage::new(&StorageConfig {
            mount: mount.to_path_buf(),
            url_prefix: "https://cdn.example.test".into(),
        });
        MetadataFetcher::new(ytdlp, storage, offer)
    }

    #[test]
    fn higher_bitrate_wins_within_a_sample_rate() {
        let payload = json!({
            "id": "x",
            "formats": [
                {"format_id": "139", "ext": "m4a", "vcodec": "none", "acodec": "mp4a", "asr": 44100, "abr": 48.0},
                {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a", "asr": 44100, "abr": 129.0},
                {"format_id": "141", "ext": "m4a", "vcodec": "none", "acodec": "mp4a", "asr": 44100, "abr": 64.0},
                {"format_id": "251", "ext": "webm", "vcodec": "none", "acodec": "opus", "asr": 48000, "abr": 140.0},
                {"format_id": "599", "ext": "m4a", "vcodec": "none", "acodec": "mp4a", "abr": 31.0}
            ]
        });
        let raw: RawInfo = serde_json::from_value(payload).unwrap();
        let variants = select_variants(&raw.formats);
        let kept: Vec<(&str, u32)> = variants
            .audio
            .iter()
            .map(|variant| (variant.format_id.as_str(), variant.sample_rate))
            .collect();
        assert_eq!(kept, vec![("140", 44100), ("251", 48000)]);
        assert_eq!(variants.best_audio().unwrap().format_id, "251");
    }

    #[test]
    fn video_ties_fall_back_to_fps_then_size_then_first_seen() {
        let payload = json!({
            "id": "x",
            "formats": [
                {"format_id": "a", "ext": "mp4", "vcodec": "avc1", "acodec": "none", "resolution": "1280x720", "tbr": 500.0, "fps": 30, "filesize": 10},
                {"format_id": "b", "ext": "webm", "vcodec": "vp9", "acodec": "none", "resolution": "1280x720", "tbr": 500.0, "fps": 60, "filesize": 5},
                {"format_id": "c", "ext": "mp4", "vcodec": "avc1", "acodec": "none", "resolution": "1280x720", "tbr": 500.0, "fps": 60, "filesize_approx": 8},
                {"format_id": "d", "ext": "mp4", "vcodec": "avc1", "acodec": "none", "resolution": "1280x720", "tbr": 500.0, "fps": 60, "filesize": 8},
                {"format_id": "e", "ext": "mp4", "vcodec": "avc1", "acodec": "none", "width": 640, "height": 360, "tbr": 100.0},
                {"format_id": "f", "ext": "mp4", "vcodec": "avc1", "acodec": "none", "format": "f - 144p"},
                {"format_id": "18", "ext": "mp4", "vcodec": "avc1", "acodec": "mp4a", "resolution": "640x360", "tbr": 900.0}
            ]
        });
        let raw: RawInfo = serde_json::from_value(payload).unwrap();
        let variants = select_variants(&raw.formats);
        let kept: Vec<(&str, &str)> = variants
            .video
            .iter()
            .map(|variant| (variant.format_id.as_str(), variant.resolution.as_str()))
            .collect();
        assert_eq!(kept, vec![("c", "1280x720"), ("e", "640x360"), ("f", "144p")]);
        assert!(variants.audio.is_empty());
    }

    #[test]
    fn flat_fields_use_lenient_defaults() {
        let payload = sample_payload().to_string();
        let info = parse_video_info(payload.as_bytes(), &offered(&["m4a"], &["mp4"])).unwrap();
        assert_eq!(info.id, "abc123");
        assert_eq!(info.description, "");
        assert_eq!(info.duration, 213);
        assert_eq!(info.like_count, 0);
        assert_eq!(info.categories, vec!["Music"]);
        assert_eq!(info.tags, vec!["one", "three"]);
        assert_eq!(info.channel_follower_count, 42);
    }

    #[test]
    fn missing_id_or_invalid_json_is_an_error() {
        let offer = offered(&["m4a"], &["mp4"]);
        assert_eq!(
            parse_video_info(br#"{"title": "no id"}"#, &offer).unwrap_err(),
            MetadataError::MissingField("id")
        );
        assert!(matches!(
            parse_video_info(b"not json", &offer).unwrap_err(),
            MetadataError::Parse(_)
        ));
    }

    #[test]
    fn every_variant_is_offered_in_every_configured_extension() {
        let payload = json!({
            "id": "x",
            "formats": [
                {"format_id": "139", "ext": "m4a", "vcodec": "none", "acodec": "mp4a", "asr": 22050},
                {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a", "asr": 44100},
                {"format_id": "251", "ext": "webm", "vcodec": "none", "acodec": "opus", "asr": 48000},
                {"format_id": "136", "ext": "mp4", "vcodec": "avc1", "acodec": "none", "resolution": "1280x720"},
                {"format_id": "137", "ext": "mp4", "vcodec": "avc1", "acodec": "none", "resolution": "1920x1080"}
            ]
        })
        .to_string();
        let offer = offered(&["mp3", "m4a", "opus"], &["mp4", "webm", "mkv"]);
        let info = parse_video_info(payload.as_bytes(), &offer).unwrap();

        let audio_exts: Vec<&str> = info.audio.iter().map(|group| group.ext.as_str()).collect();
        assert_eq!(audio_exts, vec!["mp3", "m4a", "opus"]);
        assert!(info.audio.iter().all(|group| group.formats.len() == 3));
        assert_eq!(info.video.len(), 3);
        assert!(info.video.iter().all(|group| group.formats.len() == 2));

        for group in &info.video {
            for entry in &group.formats {
                let FormatToken::Video(selection) = FormatToken::decode(&entry.format_id).unwrap()
                else {
                    panic!("video group holds a non video token");
                };
                assert_eq!(selection.extension, group.ext);
                assert_eq!(selection.audio_format_id.as_deref(), Some("251"));
            }
        }
    }

    #[test]
    fn video_tokens_without_audio_streams_carry_no_pairing() {
        let payload = json!({
            "id": "x",
            "formats": [
                {"format_id": "137", "ext": "mp4", "vcodec": "avc1", "acodec": "none", "resolution": "1920x1080"}
            ]
        })
        .to_string();
        let info = parse_video_info(payload.as_bytes(), &offered(&["m4a"], &["mp4"])).unwrap();
        assert!(info.audio.is_empty());
        let token = FormatToken::decode(&info.video[0].formats[0].format_id).unwrap();
        assert_eq!(token.format_selector(), "137");
    }

    #[test]
    fn allows_only_configured_extensions_per_kind() {
        let offer = offered(&["m4a"], &["mp4"]);
        let audio = FormatToken::Audio(AudioSelection {
            extension: "m4a".into(),
            sample_rate: 44100,
            format_id: "140".into(),
        });
        let smuggled = FormatToken::Audio(AudioSelection {
            extension: "mp4".into(),
            sample_rate: 44100,
            format_id: "140".into(),
        });
        assert!(offer.allows(&audio));
        assert!(!offer.allows(&smuggled));
    }

    #[tokio::test]
    async fn fetch_shapes_alias_url_and_caches_raw_output() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let (stub, counter) = install_ytdlp_stub(temp.path(), &sample_payload().to_string(), 0)?;
        let mount = temp.path().join("mount");
        let fetcher = fetcher(stub, &mount, offered(&["m4a"], &["mp4"]));

        let reference = normalize("https://youtube.com/watch?v=abc123")?;
        assert_eq!(reference.canonical_url, "https://www.youtube.com/watch?v=abc123");
        assert_eq!(reference.content_id, "abc123");

        let info = fetcher.fetch(&reference).await?;
        assert_eq!(info.audio.len(), 1);
        assert_eq!(info.audio[0].ext, "m4a");
        assert_eq!(info.audio[0].formats.len(), 1);
        assert_eq!(info.video.len(), 1);
        assert_eq!(info.video[0].ext, "mp4");
        assert_eq!(info.video[0].formats.len(), 1);
        let token = FormatToken::decode(&info.video[0].formats[0].format_id)?;
        assert_eq!(token.format_selector(), "137+140");

        assert!(mount.join("abc123").join("abc123.json").exists());
        let again = fetcher.fetch(&reference).await?;
        assert_eq!(again, info);
        assert_eq!(invocations(&counter), 1);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_invocation() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let (stub, counter) = install_ytdlp_stub(temp.path(), &sample_payload().to_string(), 0)?;
        let fetcher = fetcher(stub, &temp.path().join("mount"), offered(&["m4a"], &["mp4"]));
        let reference = normalize("https://m.youtube.com/watch?v=abc123")?;

        let (first, second, third) = tokio::join!(
            fetcher.fetch(&reference),
            fetcher.fetch(&reference),
            fetcher.fetch(&reference)
        );
        assert_eq!(first?, second?);
        assert!(third.is_ok());
        assert_eq!(invocations(&counter), 1);
        assert!(fetcher.inflight.lock().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failures_are_shared_and_not_cached() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let (stub, counter) = install_ytdlp_stub(temp.path(), "{}", 1)?;
        let mount = temp.path().join("mount");
        let fetcher = fetcher(stub, &mount, offered(&["m4a"], &["mp4"]));
        let reference = normalize("https://www.youtube.com/watch?v=gone")?;

        let (first, second) = tokio::join!(fetcher.fetch(&reference), fetcher.fetch(&reference));
        let first = first.unwrap_err();
        assert_eq!(first, second.unwrap_err());
        match first {
            MetadataError::Exit { stderr, .. } => assert!(stderr.contains("Video unavailable")),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(invocations(&counter), 1);
        assert!(!mount.join("gone").join("gone.json").exists());

        // A later request retries instead of replaying the failure.
        assert!(fetcher.fetch(&reference).await.is_err());
        assert_eq!(invocations(&counter), 2);
        Ok(())
    }

    #[tokio::test]
    async fn abandoned_fetches_release_their_inflight_entry() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let (stub, counter) = install_ytdlp_stub(temp.path(), &sample_payload().to_string(), 0)?;
        let fetcher = fetcher(stub, &temp.path().join("mount"), offered(&["m4a"], &["mp4"]));

        for id in ["a1", "a2", "a3"] {
            let reference = normalize(&format!("https://www.youtube.com/watch?v={id}"))?;
            let abandoned =
                tokio::time::timeout(Duration::from_millis(50), fetcher.fetch(&reference)).await;
            assert!(abandoned.is_err());
        }
        assert!(fetcher.inflight.lock().is_empty());

        // The next caller starts a fresh fetch instead of waiting on a dead one.
        let reference = normalize("https://www.youtube.com/watch?v=a1")?;
        assert_eq!(fetcher.fetch(&reference).await?.id, "abc123");
        assert!(fetcher.inflight.lock().is_empty());
        assert!(invocations(&counter) >= 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_binary_reports_spawn_error() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let fetcher = fetcher(
            temp.path().join("no-such-yt-dlp"),
            &temp.path().join("mount"),
            offered(&["m4a"], &["mp4"]),
        );
        let reference = normalize("https://www.youtube.com/watch?v=abc123")?;
        assert!(matches!(
            fetcher.fetch(&reference).await.unwrap_err(),
            MetadataError::Spawn(_)
        ));
        Ok(())
    }
}
