#![forbid(unsafe_code)]

//! Shared library behind the `backend` binary: URL normalization, format
//! tokens, metadata fetching and the download task lifecycle around yt-dlp.

pub mod config;
pub mod error;
pub mod executor;
pub mod format_token;
pub mod logging;
pub mod metadata;
pub mod progress;
pub mod reference;
pub mod storage;
pub mod tasks;
pub mod ytdlp;
