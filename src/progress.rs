//! Parser for the human readable progress lines yt-dlp prints with
//! `--newline`.
//!
//! Everything here is best effort. yt-dlp's text output is not a stable
//! interface, so any line we do not recognise is reported as
//! [`ProgressLine::Other`] and simply ignored by the caller.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)%").expect("percent regex"));
static SPEED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"at\s+~?\s*(\d+(?:\.\d+)?\s*[KMGTP]?i?B/s)").expect("speed regex")
});
static ETA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ETA\s+(\d+(?::\d+)+)").expect("eta regex"));
static DESTINATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(?:download|ExtractAudio|VideoRemuxer|VideoConvertor)\]\s+Destination:\s+(.+)$")
        .expect("destination regex")
});
static ALREADY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[download\]\s+(.+?)\s+has already been downloaded").expect("already regex")
});
static MERGER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\[Merger\]\s+Merging formats into\s+"?([^"]+)"?$"#).expect("merger regex")
});

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub percent: f64,
    pub speed: Option<String>,
    pub eta: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressLine {
    Progress(ProgressUpdate),
    Destination(PathBuf),
    AlreadyDownloaded(PathBuf),
    Merging(PathBuf),
    Other,
}

pub fn parse_line(line: &str) -> ProgressLine {
    let line = line.trim();

    if let Some(caps) = DESTINATION_RE.captures(line) {
        return ProgressLine::Destination(PathBuf::from(caps[1].trim()));
    }
    if let Some(caps) = ALREADY_RE.captures(line) {
        return ProgressLine::AlreadyDownloaded(PathBuf::from(caps[1].trim()));
    }
    if let Some(caps) = MERGER_RE.captures(line) {
        return ProgressLine::Merging(PathBuf::from(caps[1].trim()));
    }

    if !line.starts_with("[download]") || !line.contains("% of") {
        return ProgressLine::Other;
    }
    let Some(percent) = PERCENT_RE
        .captures(line)
        .and_then(|caps| caps[1].parse::<f64>().ok())
    else {
        return ProgressLine::Other;
    };

    ProgressLine::Progress(ProgressUpdate {
        percent: percent.clamp(0.0, 100.0),
        speed: SPEED_RE
            .captures(line)
            .map(|caps| caps[1].split_whitespace().collect::<String>()),
        eta: ETA_RE.captures(line).map(|caps| caps[1].to_string()),
    })
}
