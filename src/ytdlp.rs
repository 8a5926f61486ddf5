//! Argument lists for the two yt-dlp invocations the service makes.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::config::YtdlpConfig;
use crate::format_token::FormatToken;

#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
    ffmpeg: Option<PathBuf>,
    cookies: Option<PathBuf>,
    proxy: Option<String>,
    max_file_size: Option<u64>,
}

impl YtDlp {
    pub fn new(config: &YtdlpConfig) -> Self {
        Self {
            binary: config.path.clone(),
            ffmpeg: config.ffmpeg_path.clone(),
            cookies: config.cookies_path.clone(),
            proxy: config.proxy.clone(),
            max_file_size: config.max_file_size,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// `yt-dlp --dump-json` for a single video; stdout carries one JSON document.
    pub fn info_command(&self, url: &str) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(self.info_args(url));
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    pub fn info_args(&self, url: &str) -> Vec<String> {
        let mut args = vec![
            "--dump-json".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--skip-download".to_string(),
        ];
        self.push_network_args(&mut args);
        args.push(url.to_string());
        args
    }

    /// Download invocation writing to `output_template` (a yt-dlp `-o`
    /// template ending in `.%(ext)s`).
    pub fn download_command(
        &self,
        url: &str,
        token: &FormatToken,
        output_template: &Path,
    ) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(self.download_args(url, token, output_template));
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    pub fn download_args(
        &self,
        url: &str,
        token: &FormatToken,
        output_template: &Path,
    ) -> Vec<String> {
        let mut args = vec![
            "--newline".to_string(),
            "--progress".to_string(),
            "--no-playlist".to_string(),
            "--no-part".to_string(),
            "--no-mtime".to_string(),
            "--format".to_string(),
            token.format_selector(),
        ];

        match token {
            FormatToken::Audio(audio) => {
                args.extend([
                    "--extract-audio".to_string(),
                    "--audio-format".to_string(),
                    audio.extension.clone(),
                    "--audio-quality".to_string(),
                    "0".to_string(),
                ]);
            }
            FormatToken::Video(video) => {
                args.extend([
                    "--merge-output-format".to_string(),
                    video.extension.clone(),
                    "--remux-video".to_string(),
                    video.extension.clone(),
                ]);
            }
        }

        if let Some(limit) = self.max_file_size {
            args.push("--max-filesize".to_string());
            args.push(limit.to_string());
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            args.push("--ffmpeg-location".to_string());
            args.push(ffmpeg.to_string_lossy().into_owned());
        }
        self.push_network_args(&mut args);
        args.push("--output".to_string());
        args.push(output_template.to_string_lossy().into_owned());
        args.push(url.to_string());
        args
    }

    fn push_network_args(&self, args: &mut Vec<String>) {
        if let Some(cookies) = self.cookies.as_ref().filter(|path| path.exists()) {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().into_owned());
        }
        if let Some(proxy) = &self.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
    }
}
