//! Runs one yt-dlp download per task and publishes the result on the
//! storage mount.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::ExitStatus,
    sync::Arc,
    time::Duration,
};

use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Child,
    sync::Semaphore,
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::YtdlpConfig;
use crate::error::DownloadError;
use crate::progress::{ProgressLine, parse_line};
use crate::storage::{Storage, relocate};
use crate::tasks::TaskHandle;
use crate::ytdlp::YtDlp;

/// How long yt-dlp gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const STDERR_TAIL_LINES: usize = 5;

pub struct DownloadExecutor {
    ytdlp: YtDlp,
    storage: Storage,
    work_root: PathBuf,
    permits: Arc<Semaphore>,
}

impl DownloadExecutor {
    pub fn new(config: &YtdlpConfig, storage: Storage) -> Self {
        Self {
            ytdlp: YtDlp::new(config),
            storage,
            work_root: config.download_dir.clone(),
            permits: Arc::new(Semaphore::new(config.max_downloads.max(1))),
        }
    }

    /// Drives `task` to a terminal state. Spawned detached by the registry.
    pub async fn run(self: Arc<Self>, task: Arc<TaskHandle>) {
        let work_dir = self.work_root.join(task.id());
        let outcome = self.execute(&task, &work_dir).await;

        if let Err(err) = tokio::fs::remove_dir_all(&work_dir).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            debug!(
                task_id = task.id(),
                path = %work_dir.display(),
                "could not clean working directory: {err}"
            );
        }

        match outcome {
            Ok(download_url) => {
                if task.complete(download_url) {
                    info!(
                        task_id = task.id(),
                        content_id = task.content_id(),
                        "download completed"
                    );
                }
            }
            Err(err) => {
                if task.fail(&err) {
                    warn!(
                        task_id = task.id(),
                        content_id = task.content_id(),
                        "download failed: {err}"
                    );
                } else {
                    debug!(task_id = task.id(), "download ended after cancellation: {err}");
                }
            }
        }
    }

    async fn execute(
        &self,
        task: &Arc<TaskHandle>,
        work_dir: &Path,
    ) -> Result<String, DownloadError> {
        let destination = self.storage.artifact_path(task.artifact_key());
        let download_url = self.storage.public_url(task.artifact_key());
        // Stored artifacts never wait for a download slot.
        if tokio::fs::try_exists(&destination).await.unwrap_or(false) {
            if !task.mark_downloading() {
                return Err(DownloadError::Cancelled);
            }
            info!(task_id = task.id(), path = %destination.display(), "artifact already stored");
            return Ok(download_url);
        }

        let cancel = task.cancellation().clone();
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            permit = self.permits.clone().acquire_owned() => permit
                .map_err(|_| DownloadError::Spawn("download queue is closed".to_string()))?,
        };
        if !task.mark_downloading() {
            return Err(DownloadError::Cancelled);
        }

        tokio::fs::create_dir_all(work_dir).await.map_err(|err| {
            DownloadError::Spawn(format!("creating {}: {err}", work_dir.display()))
        })?;
        let template = work_dir.join(format!("{}.%(ext)s", task.content_id()));
        let mut child = self
            .ytdlp
            .download_command(task.url(), task.token(), &template)
            .spawn()
            .map_err(|err| {
                DownloadError::Spawn(format!("{}: {err}", self.ytdlp.binary().display()))
            })?;
        info!(
            task_id = task.id(),
            selector = %task.token().format_selector(),
            pid = child.id().unwrap_or_default(),
            "download started"
        );

        let stdout_reader = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(drain_stdout(stdout, task.clone())));
        let stderr_reader = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(stderr, task.id().to_string())));

        let status = tokio::select! {
            status = child.wait() => status
                .map_err(|err| DownloadError::Exit(format!("waiting for yt-dlp: {err}")))?,
            _ = cancel.cancelled() => {
                terminate(&mut child, task.id()).await;
                return Err(DownloadError::Cancelled);
            }
        };

        let reported = match stdout_reader {
            Some(reader) => reader.await.ok().flatten(),
            None => None,
        };
        let stderr_tail = match stderr_reader {
            Some(reader) => reader.await.unwrap_or_default(),
            None => String::new(),
        };

        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        if !status.success() {
            return Err(DownloadError::Exit(exit_diagnostic(status, &stderr_tail)));
        }

        let file_name = format!("{}.{}", task.content_id(), task.token().extension());
        let produced = locate_output(work_dir, reported.as_deref(), &file_name).ok_or_else(|| {
            DownloadError::Relocation(format!("{file_name} not found in {}", work_dir.display()))
        })?;
        debug!(
            task_id = task.id(),
            from = %produced.display(),
            to = %destination.display(),
            "relocating artifact"
        );

        let target = destination.clone();
        tokio::task::spawn_blocking(move || relocate(&produced, &target))
            .await
            .map_err(|err| DownloadError::Relocation(err.to_string()))?
            .map_err(|err| DownloadError::Relocation(format!("{err:#}")))?;
        Ok(download_url)
    }
}

/// Feeds progress lines into the task and returns the last file yt-dlp said
/// it wrote.
async fn drain_stdout(stdout: impl AsyncRead + Unpin, task: Arc<TaskHandle>) -> Option<PathBuf> {
    let mut lines = BufReader::new(stdout).lines();
    let mut reported = None;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                debug!(task_id = task.id(), "stdout reader stopped: {err}");
                break;
            }
        };
        match parse_line(&line) {
            ProgressLine::Progress(update) => task.record_progress(&update),
            ProgressLine::Destination(path)
            | ProgressLine::AlreadyDownloaded(path)
            | ProgressLine::Merging(path) => {
                debug!(task_id = task.id(), path = %path.display(), "yt-dlp output file");
                reported = Some(path);
            }
            ProgressLine::Other => {}
        }
    }
    reported
}

/// Logs stderr and keeps the last few lines for the failure message.
async fn drain_stderr(stderr: impl AsyncRead + Unpin, task_id: String) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!(task_id = %task_id, "yt-dlp: {line}");
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

async fn terminate(child: &mut Child, task_id: &str) {
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!(task_id, "SIGTERM failed: {err}");
        } else if tokio::time::timeout(TERMINATE_GRACE, child.wait())
            .await
            .is_ok()
        {
            return;
        }
    }
    if let Err(err) = child.kill().await {
        debug!(task_id, "killing yt-dlp failed: {err}");
    }
}

fn exit_diagnostic(status: ExitStatus, stderr_tail: &str) -> String {
    let errors: Vec<&str> = stderr_tail
        .lines()
        .filter(|line| line.starts_with("ERROR"))
        .collect();
    match (errors.is_empty(), stderr_tail.is_empty()) {
        (false, _) => format!("{status}: {}", errors.join("; ")),
        (true, false) => format!("{status}: {}", stderr_tail.replace('\n', "; ")),
        (true, true) => status.to_string(),
    }
}

/// Finds the finished `file_name`: directly in the working directory, then
/// wherever yt-dlp reported writing it, then one level further down. Files
/// in any other container are never picked.
fn locate_output(work_dir: &Path, reported: Option<&Path>, file_name: &str) -> Option<PathBuf> {
    let expected = work_dir.join(file_name);
    if expected.is_file() {
        return Some(expected);
    }
    let named = |path: &Path| path.file_name().is_some_and(|name| name == file_name);
    if let Some(path) =
        reported.filter(|path| named(path) && path.is_file() && path.starts_with(work_dir))
    {
        return Some(path.to_path_buf());
    }
    WalkDir::new(work_dir)
        .max_depth(2)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && named(entry.path()))
        .map(|entry| entry.into_path())
        .next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::format_token::{AudioSelection, FormatToken, VideoSelection};
    use crate::metadata::OfferedFormats;
    use crate::reference::normalize;
    use crate::tasks::{DownloadTask, TaskRegistry, TaskState};
    use anyhow::Result;
    use std::fs;

    /// Behaves like `yt-dlp --newline`: prints progress, then writes the
    /// output template with the requested container. `MODE` switches the
    /// failure paths.
    fn install_ytdlp_stub(dir: &Path, mode: &str) -> Result<PathBuf> {
        let script_path = dir.join("yt-dlp");
        let script = format!(
            r#"#!/usr/bin/env bash
set -eu
mode='{mode}'
output=""
ext=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    --output) shift; output="$1" ;;
    --audio-format|--merge-output-format) shift; ext="$1" ;;
  esac
  shift
done
echo "WARNING: stub yt-dlp" >&2
echo "[download]  50.0% of 1.00MiB at 2.00MiB/s ETA 00:01"
if [[ "$mode" == "fail" ]]; then
  echo "ERROR: [youtube] abc123: Requested format is not available" >&2
  exit 1
fi
if [[ "$mode" == "hang" ]]; then
  exec sleep 30
fi
if [[ "$mode" == "silent" ]]; then
  exit 0
fi
target="${{output//%(ext)s/$ext}}"
if [[ "$mode" == "rename" ]]; then
  target="${{output//%(ext)s/mkv}}"
fi
mkdir -p "$(dirname "$target")"
echo "[download] Destination: $target"
echo "media" > "$target"
echo "partial" > "$target.part"
echo "[download] 100% of 1.00MiB in 00:00:01 at 2.00MiB/s"
"#
        );
        fs::write(&script_path, script)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&script_path)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&script_path, perms)?;
        }
        Ok(script_path)
    }

    struct ExecutorContext {
        _temp: tempfile::TempDir,
        mount: PathBuf,
        work: PathBuf,
        registry: TaskRegistry,
    }

    impl ExecutorContext {
        fn new(mode: &str) -> Result<Self> {
            let temp = tempfile::tempdir()?;
            let stub = install_ytdlp_stub(temp.path(), mode)?;
            let mount = temp.path().join("mount");
            let work = temp.path().join("work");
            let config = YtdlpConfig {
                path: stub,
                download_dir: work.clone(),
                max_downloads: 1,
                audio_formats: vec!["mp3".into()],
                video_formats: vec!["mp4".into()],
                ..YtdlpConfig::default()
            };
            let storage = Storage::new(&StorageConfig {
                mount: mount.clone(),
                url_prefix: "https://cdn.example.test/yt/".into(),
            });
            let executor = Arc::new(DownloadExecutor::new(&config, storage));
            let registry = TaskRegistry::new(
                executor,
                OfferedFormats::from_config(&config),
                Duration::from_secs(600),
            );
            Ok(Self {
                _temp: temp,
                mount,
                work,
                registry,
            })
        }

        async fn finish(&self, token: &FormatToken) -> Result<DownloadTask> {
            let reference = normalize("https://www.youtube.com/watch?v=abc123")?;
            let task_id = self.registry.get_or_create(&reference, &token.encode())?;
            for _ in 0..200 {
                let task = self.registry.status(&task_id)?;
                if task.state.is_terminal() {
                    return Ok(task);
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            anyhow::bail!("task {task_id} did not finish")
        }
    }

    fn audio_token() -> FormatToken {
        FormatToken::Audio(AudioSelection {
            extension: "mp3".into(),
            sample_rate: 48000,
            format_id: "251".into(),
        })
    }

    fn video_token() -> FormatToken {
        FormatToken::Video(VideoSelection {
            extension: "mp4".into(),
            resolution: "1280x720".into(),
            video_format_id: "136".into(),
            audio_format_id: Some("251".into()),
        })
    }

    #[tokio::test]
    async fn successful_download_is_relocated_and_published() -> Result<()> {
        let ctx = ExecutorContext::new("ok")?;
        let task = ctx.finish(&audio_token()).await?;
        assert_eq!(task.state, TaskState::Completed, "error: {}", task.error);
        assert_eq!(task.progress, 100.0);
        assert_eq!(
            task.download_url,
            "https://cdn.example.test/yt/abc123/audio/48000/abc123.mp3"
        );
        assert!(task.end_time.is_some());
        let stored = ctx.mount.join("abc123/audio/48000/abc123.mp3");
        assert_eq!(fs::read_to_string(stored)?, "media\n");
        assert!(!ctx.work.join(&task.task_id).exists());
        Ok(())
    }

    #[tokio::test]
    async fn output_in_another_container_is_not_published() -> Result<()> {
        let ctx = ExecutorContext::new("rename")?;
        let task = ctx.finish(&video_token()).await?;
        assert_eq!(task.state, TaskState::Failed);
        assert!(
            task.error.starts_with("Failed to store downloaded file: abc123.mp4 not found"),
            "{}",
            task.error
        );
        assert!(!ctx.mount.join("abc123/video/1280x720/abc123.mp4").exists());
        assert!(task.download_url.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn clean_exit_without_output_fails_the_task() -> Result<()> {
        let ctx = ExecutorContext::new("silent")?;
        let task = ctx.finish(&audio_token()).await?;
        assert_eq!(task.state, TaskState::Failed);
        assert!(
            task.error.starts_with("Failed to store downloaded file: "),
            "{}",
            task.error
        );
        assert!(task.end_time.is_some());
        assert!(!ctx.work.join(&task.task_id).exists());
        Ok(())
    }

    #[tokio::test]
    async fn unwritable_mount_fails_the_task() -> Result<()> {
        let ctx = ExecutorContext::new("ok")?;
        fs::write(&ctx.mount, "not a directory")?;
        let task = ctx.finish(&audio_token()).await?;
        assert_eq!(task.state, TaskState::Failed);
        assert!(
            task.error.starts_with("Failed to store downloaded file: "),
            "{}",
            task.error
        );
        assert!(task.download_url.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn stored_artifacts_skip_the_download_queue() -> Result<()> {
        let ctx = ExecutorContext::new("hang")?;
        let reference = normalize("https://www.youtube.com/watch?v=abc123")?;
        let running = ctx.registry.get_or_create(&reference, &audio_token().encode())?;
        for _ in 0..200 {
            if ctx.registry.status(&running)?.state == TaskState::Downloading {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(ctx.registry.status(&running)?.state, TaskState::Downloading);

        let stored = ctx.mount.join("abc123/video/1280x720/abc123.mp4");
        fs::create_dir_all(stored.parent().unwrap_or(&ctx.mount))?;
        fs::write(&stored, "media")?;
        let task = ctx.finish(&video_token()).await?;
        assert_eq!(task.state, TaskState::Completed, "error: {}", task.error);
        assert_eq!(
            task.download_url,
            "https://cdn.example.test/yt/abc123/video/1280x720/abc123.mp4"
        );
        assert_eq!(ctx.registry.status(&running)?.state, TaskState::Downloading);
        assert_eq!(ctx.registry.cancel_all(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn non_zero_exit_fails_with_the_tool_diagnostic() -> Result<()> {
        let ctx = ExecutorContext::new("fail")?;
        let task = ctx.finish(&video_token()).await?;
        assert_eq!(task.state, TaskState::Failed);
        assert!(task.error.starts_with("Download failed: "), "{}", task.error);
        assert!(task.error.contains("Requested format is not available"));
        assert!(!task.error.contains("WARNING"));
        assert!(task.download_url.is_empty());
        assert!(!ctx.mount.join("abc123").exists());
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_stops_the_subprocess() -> Result<()> {
        let ctx = ExecutorContext::new("hang")?;
        let reference = normalize("https://www.youtube.com/watch?v=abc123")?;
        let task_id = ctx.registry.get_or_create(&reference, &audio_token().encode())?;
        let mut progressed = false;
        for _ in 0..200 {
            if ctx.registry.status(&task_id)?.progress > 0.0 {
                progressed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(progressed);
        let live = ctx.registry.status(&task_id)?;
        assert_eq!(live.state, TaskState::Downloading);
        assert_eq!(live.speed, "2.00MiB/s");
        assert_eq!(live.eta, "00:01");

        let cancelled = ctx.registry.cancel(&task_id)?;
        assert_eq!(cancelled.error, "Download cancelled by user");
        for _ in 0..200 {
            if !ctx.work.join(&task_id).exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(!ctx.work.join(&task_id).exists());
        Ok(())
    }

    #[tokio::test]
    async fn queued_tasks_wait_for_a_permit_and_can_be_cancelled() -> Result<()> {
        let ctx = ExecutorContext::new("hang")?;
        let reference = normalize("https://www.youtube.com/watch?v=abc123")?;
        let running = ctx.registry.get_or_create(&reference, &audio_token().encode())?;
        let queued = ctx.registry.get_or_create(&reference, &video_token().encode())?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ctx.registry.status(&running)?.state, TaskState::Downloading);
        assert_eq!(ctx.registry.status(&queued)?.state, TaskState::Pending);

        let cancelled = ctx.registry.cancel(&queued)?;
        assert_eq!(cancelled.state, TaskState::Failed);
        assert_eq!(cancelled.error, "Download cancelled by user");
        assert_eq!(ctx.registry.cancel_all(), 1);
        Ok(())
    }

    #[test]
    fn locate_output_only_accepts_the_requested_container() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let work = temp.path();
        fs::write(work.join("abc123.mp3.part"), "partial")?;
        fs::write(work.join("abc123.f251.webm.ytdl"), "state")?;
        fs::write(work.join("abc123.opus"), "audio")?;
        assert_eq!(locate_output(work, None, "abc123.mp3"), None);
        assert_eq!(
            locate_output(work, Some(&work.join("abc123.opus")), "abc123.mp3"),
            None
        );

        fs::create_dir_all(work.join("nested"))?;
        fs::write(work.join("nested/abc123.mp3"), "audio")?;
        assert_eq!(
            locate_output(work, None, "abc123.mp3"),
            Some(work.join("nested/abc123.mp3"))
        );
        fs::write(work.join("abc123.mp3"), "audio")?;
        assert_eq!(
            locate_output(work, None, "abc123.mp3"),
            Some(work.join("abc123.mp3"))
        );
        Ok(())
    }

    #[test]
    fn exit_diagnostic_prefers_error_lines() {
        use std::os::unix::process::ExitStatusExt;
        let status = ExitStatus::from_raw(1 << 8);
        assert_eq!(
            exit_diagnostic(status, "WARNING: slow\nERROR: gone"),
            "exit status: 1: ERROR: gone"
        );
        assert_eq!(exit_diagnostic(status, ""), "exit status: 1");
    }
}
