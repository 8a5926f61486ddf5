//! Opaque `format_id` tokens handed to clients by `/info` and accepted back
//! by `/download`.
//!
//! The token is the `|` separated field list followed by a four byte blake3
//! check value, wrapped in unpadded URL-safe base64. It only keeps the
//! internal identifier scheme out of sight and catches typos or truncation;
//! it is not a security boundary.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};

use crate::error::FormatTokenError;

const SEPARATOR: &str = "|";
const CHECK_LEN: usize = 4;
const AUDIO_TAG: &str = "a";
const VIDEO_TAG: &str = "v";
const AUDIO_FIELDS: usize = 4;
const VIDEO_FIELDS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Audio extraction of one upstream stream into `extension`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSelection {
    pub extension: String,
    pub sample_rate: u32,
    pub format_id: String,
}

/// A video stream, optionally merged with an audio stream, remuxed into
/// `extension`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSelection {
    pub extension: String,
    pub resolution: String,
    pub video_format_id: String,
    pub audio_format_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatToken {
    Audio(AudioSelection),
    Video(VideoSelection),
}

impl FormatToken {
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Audio(_) => MediaKind::Audio,
            Self::Video(_) => MediaKind::Video,
        }
    }

    pub fn extension(&self) -> &str {
        match self {
            Self::Audio(audio) => &audio.extension,
            Self::Video(video) => &video.extension,
        }
    }

    /// Sample rate for audio, resolution for video. Used as a directory name
    /// in the artifact layout.
    pub fn discriminator(&self) -> String {
        match self {
            Self::Audio(audio) => audio.sample_rate.to_string(),
            Self::Video(video) => video.resolution.clone(),
        }
    }

    /// The `-f` argument for the download tool.
    pub fn format_selector(&self) -> String {
        match self {
            Self::Audio(audio) => audio.format_id.clone(),
            Self::Video(video) => match &video.audio_format_id {
                Some(audio_id) => format!("{}+{}", video.video_format_id, audio_id),
                None => video.video_format_id.clone(),
            },
        }
    }

    /// Field values must not contain `|`; the metadata layer never emits
    /// such upstream ids.
    pub fn encode(&self) -> String {
        match self {
            Self::Audio(audio) => seal(&[
                AUDIO_TAG,
                audio.extension.as_str(),
                audio.sample_rate.to_string().as_str(),
                audio.format_id.as_str(),
            ]),
            Self::Video(video) => seal(&[
                VIDEO_TAG,
                video.extension.as_str(),
                video.resolution.as_str(),
                video.video_format_id.as_str(),
                video.audio_format_id.as_deref().unwrap_or_default(),
            ]),
        }
    }

    pub fn decode(token: &str) -> Result<Self, FormatTokenError> {
        let raw = unseal(token)?;
        let fields: Vec<&str> = raw.split(SEPARATOR).collect();
        match fields.first().copied() {
            Some(AUDIO_TAG) => audio_from_fields(&fields).map(Self::Audio),
            Some(VIDEO_TAG) => video_from_fields(&fields).map(Self::Video),
            Some(other) => Err(FormatTokenError::Kind(other.to_string())),
            None => Err(FormatTokenError::FieldCount {
                expected: AUDIO_FIELDS,
                found: 0,
            }),
        }
    }
}

pub fn decode_audio(token: &str) -> Result<AudioSelection, FormatTokenError> {
    let raw = unseal(token)?;
    let fields: Vec<&str> = raw.split(SEPARATOR).collect();
    audio_from_fields(&fields)
}

pub fn decode_video(token: &str) -> Result<VideoSelection, FormatTokenError> {
    let raw = unseal(token)?;
    let fields: Vec<&str> = raw.split(SEPARATOR).collect();
    video_from_fields(&fields)
}

/// Kind check that skips field parsing. Invalid tokens are never video.
pub fn is_video_token(token: &str) -> bool {
    unseal(token)
        .map(|raw| raw.split(SEPARATOR).next() == Some(VIDEO_TAG))
        .unwrap_or(false)
}

fn seal(fields: &[&str]) -> String {
    let raw = fields.join(SEPARATOR);
    let mut payload = raw.into_bytes();
    let check = blake3::hash(&payload);
    payload.extend_from_slice(&check.as_bytes()[..CHECK_LEN]);
    URL_SAFE_NO_PAD.encode(payload)
}

fn unseal(token: &str) -> Result<String, FormatTokenError> {
    let payload = URL_SAFE_NO_PAD
        .decode(token.trim())
        .map_err(|_| FormatTokenError::Encoding)?;
    if payload.len() <= CHECK_LEN {
        return Err(FormatTokenError::Encoding);
    }
    let (raw, check) = payload.split_at(payload.len() - CHECK_LEN);
    if &blake3::hash(raw).as_bytes()[..CHECK_LEN] != check {
        return Err(FormatTokenError::Checksum);
    }
    String::from_utf8(raw.to_vec()).map_err(|_| FormatTokenError::Encoding)
}

fn audio_from_fields(fields: &[&str]) -> Result<AudioSelection, FormatTokenError> {
    expect_layout(fields, AUDIO_TAG, AUDIO_FIELDS)?;
    let extension = non_empty(fields[1], "extension")?;
    let sample_rate = non_empty(fields[2], "sample_rate")?
        .parse::<u32>()
        .ok()
        .filter(|rate| *rate > 0)
        .ok_or(FormatTokenError::InvalidField("sample_rate"))?;
    let format_id = non_empty(fields[3], "format_id")?;
    Ok(AudioSelection {
        extension,
        sample_rate,
        format_id,
    })
}

fn video_from_fields(fields: &[&str]) -> Result<VideoSelection, FormatTokenError> {
    expect_layout(fields, VIDEO_TAG, VIDEO_FIELDS)?;
    Ok(VideoSelection {
        extension: non_empty(fields[1], "extension")?,
        resolution: non_empty(fields[2], "resolution")?,
        video_format_id: non_empty(fields[3], "video_format_id")?,
        audio_format_id: Some(fields[4])
            .filter(|id| !id.is_empty())
            .map(str::to_string),
    })
}

fn expect_layout(fields: &[&str], tag: &str, expected: usize) -> Result<(), FormatTokenError> {
    let found_tag = fields.first().copied().unwrap_or_default();
    if found_tag != tag {
        return Err(FormatTokenError::Kind(found_tag.to_string()));
    }
    if fields.len() != expected {
        return Err(FormatTokenError::FieldCount {
            expected,
            found: fields.len(),
        });
    }
    Ok(())
}

fn non_empty(value: &str, field: &'static str) -> Result<String, FormatTokenError> {
    if value.is_empty() {
        Err(FormatTokenError::EmptyField(field))
    } else {
        Ok(value.to_string())
    }
}
