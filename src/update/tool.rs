use crate::update::error::UpdateError;
use crate::update::events::{ErrorEvent, EventBus, ProgressEvent, UpdateEvent};
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Longest stdout line that is parsed; longer lines are dropped whole.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, PartialEq, Eq)]
enum Line {
    Complete,
    Oversized,
}

/// Read up to the next `\n` into `buf`, holding at most `max` bytes. The rest
/// of an oversized line is consumed and thrown away. `None` at end of stream.
async fn read_bounded_line<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<Option<Line>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut oversized = false;
    let mut seen = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if !seen {
                return Ok(None);
            }
            break;
        }
        seen = true;

        let (chunk, used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (&available[..i], i + 1, true),
            None => (available, available.len(), false),
        };
        if !oversized {
            if buf.len() + chunk.len() > max {
                oversized = true;
                buf.clear();
            } else {
                buf.extend_from_slice(chunk);
            }
        }
        reader.consume(used);
        if done {
            break;
        }
    }
    Ok(Some(if oversized { Line::Oversized } else { Line::Complete }))
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ToolMessage {
    Progress { bps: f64, progress: f64 },
    Error { message: String },
    #[serde(other)]
    Other,
}

/// Map one stdout line of the patch tool to an event. Non-JSON lines,
/// untyped objects and unknown types yield `None`.
pub fn parse_line(line: &[u8]) -> Option<UpdateEvent> {
    match serde_json::from_slice::<ToolMessage>(line).ok()? {
        ToolMessage::Progress { bps, progress } => Some(UpdateEvent::Progress(ProgressEvent {
            bytes_per_second: bps,
            fraction: progress.clamp(0.0, 1.0),
        })),
        ToolMessage::Error { message } => Some(UpdateEvent::Error(ErrorEvent { message })),
        ToolMessage::Other => None,
    }
}

/// Runs the external verify/patch executable and streams its JSON status
/// lines onto the event bus.
#[derive(Clone)]
pub struct PatchTool {
    program: PathBuf,
    leading_args: Vec<OsString>,
    bus: Arc<EventBus>,
}

impl PatchTool {
    pub fn new(program: PathBuf, bus: Arc<EventBus>) -> Self {
        Self { program, leading_args: vec![], bus }
    }

    /// Arguments placed before the subcommand, for tools launched through a wrapper.
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Check `install_dir` against `signature_url`, repairing from `heal_archive_url`.
    pub async fn verify(&self, signature_url: &str, install_dir: &Path, heal_archive_url: &str) -> Result<(), UpdateError> {
        tracing::info!(signature = signature_url, dir = %install_dir.display(), "verifying installation");
        let args: Vec<OsString> = vec![
            "verify".into(),
            signature_url.into(),
            install_dir.into(),
            format!("--heal=archive,{}", heal_archive_url).into(),
            "--json".into(),
        ];
        self.run(args).await
    }

    /// Apply `patch_file` to `install_dir`. The staging directory is emptied
    /// before the run and again after a successful one.
    pub async fn apply(&self, staging_dir: &Path, patch_file: &Path, install_dir: &Path) -> Result<(), UpdateError> {
        prepare_staging(staging_dir).await;

        tracing::info!(patch = %patch_file.display(), dir = %install_dir.display(), "applying patch");
        let mut staging_arg = OsString::from("--staging-dir=");
        staging_arg.push(staging_dir);
        let args: Vec<OsString> = vec![
            "apply".into(),
            staging_arg,
            patch_file.into(),
            install_dir.into(),
            "--json".into(),
        ];
        self.run(args).await?;

        clear_dir(staging_dir).await;
        Ok(())
    }

    async fn run(&self, args: Vec<OsString>) -> Result<(), UpdateError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(UpdateError::ToolSpawn)?;

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "patch_tool", "{}", line);
                }
            })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| UpdateError::ToolSpawn(std::io::Error::new(std::io::ErrorKind::Other, "stdout not captured")))?;
        let mut reader = BufReader::new(stdout);
        let mut line = Vec::with_capacity(4096);
        loop {
            match read_bounded_line(&mut reader, &mut line, MAX_LINE_BYTES).await {
                Ok(Some(Line::Complete)) => match parse_line(&line) {
                    Some(event) => self.bus.publish(&event),
                    None => tracing::trace!(line = %String::from_utf8_lossy(&line), "skipping tool output"),
                },
                Ok(Some(Line::Oversized)) => tracing::trace!(limit = MAX_LINE_BYTES, "skipping oversized tool output line"),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "reading patch tool output failed");
                    break;
                }
            }
        }

        let status = child.wait().await.map_err(UpdateError::ToolSpawn)?;
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        if status.success() {
            Ok(())
        } else {
            tracing::warn!(code = ?status.code(), "patch tool failed");
            Err(UpdateError::ToolExit(status.code()))
        }
    }
}

async fn prepare_staging(dir: &Path) {
    match tokio::fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => clear_dir(dir).await,
        Ok(_) => tracing::warn!(dir = %dir.display(), "staging path exists but is not a directory"),
        Err(_) => {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to create staging directory");
            }
        }
    }
}

/// Remove everything inside `dir`, keeping `dir` itself. Failures are logged.
async fn clear_dir(dir: &Path) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to list staging directory");
            return;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to list staging directory");
                break;
            }
        };
        let path = entry.path();
        let removed = match entry.file_type().await {
            Ok(ft) if ft.is_dir() => tokio::fs::remove_dir_all(&path).await,
            _ => tokio::fs::remove_file(&path).await,
        };
        if let Err(e) = removed {
            tracing::warn!(path = %path.display(), error = %e, "failed to delete staging entry");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::update::events::EventKind;
    use parking_lot::Mutex;

    /// A tool backed by an inline shell script; `$1..` are the tool arguments.
    fn script_tool(script: &str, bus: Arc<EventBus>) -> PatchTool {
        PatchTool::new(PathBuf::from("/bin/sh"), bus).with_leading_args(["-c", script, "patch-tool"])
    }

    fn collecting_bus() -> (Arc<EventBus>, Arc<Mutex<Vec<UpdateEvent>>>) {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in [EventKind::Progress, EventKind::Error] {
            let seen = seen.clone();
            bus.subscribe(kind, move |ev| seen.lock().push(ev.clone()));
        }
        (bus, seen)
    }

    #[test]
    fn progress_line_maps_to_progress_event() {
        let ev = parse_line(br#"{"type":"progress","bps":1200.5,"progress":0.42}"#).unwrap();
        assert_eq!(ev, UpdateEvent::Progress(ProgressEvent { bytes_per_second: 1200.5, fraction: 0.42 }));
    }

    #[test]
    fn error_line_maps_to_error_event() {
        let ev = parse_line(br#"{"type":"error","message":"disk full"}"#).unwrap();
        assert_eq!(ev, UpdateEvent::Error(ErrorEvent { message: "disk full".into() }));
    }

    #[test]
    fn other_lines_are_ignored() {
        assert!(parse_line(b"not json at all").is_none());
        assert!(parse_line(b"").is_none());
        assert!(parse_line(br#"{"type":"log","message":"hello"}"#).is_none());
        assert!(parse_line(br#"{"bps":1.0,"progress":0.1}"#).is_none());
        assert!(parse_line(br#"{"type":"progress","bps":"fast"}"#).is_none());
    }

    #[tokio::test]
    async fn bounded_reader_drops_long_lines_and_keeps_going() {
        let input = b"0123456789abcdef\nshort\nlast".to_vec();
        let mut reader = &input[..];
        let mut buf = Vec::new();

        assert_eq!(read_bounded_line(&mut reader, &mut buf, 8).await.unwrap(), Some(Line::Oversized));
        assert!(buf.is_empty());
        assert_eq!(read_bounded_line(&mut reader, &mut buf, 8).await.unwrap(), Some(Line::Complete));
        assert_eq!(buf, b"short");
        assert_eq!(read_bounded_line(&mut reader, &mut buf, 8).await.unwrap(), Some(Line::Complete));
        assert_eq!(buf, b"last");
        assert_eq!(read_bounded_line(&mut reader, &mut buf, 8).await.unwrap(), None);
    }

    #[tokio::test]
    async fn newline_free_flood_is_skipped() {
        let (bus, seen) = collecting_bus();
        let tool = script_tool(
            r#"head -c 200000 /dev/zero | tr '\0' 'x'
echo
echo '{"type":"progress","bps":1,"progress":0.25}'"#,
            bus,
        );

        tool.verify("sig", Path::new("/nowhere"), "archive").await.unwrap();

        let seen = seen.lock();
        assert_eq!(*seen, vec![UpdateEvent::Progress(ProgressEvent { bytes_per_second: 1.0, fraction: 0.25 })]);
    }

    #[tokio::test]
    async fn garbage_lines_do_not_stop_the_stream() {
        let (bus, seen) = collecting_bus();
        let tool = script_tool(
            r#"echo 'warming up'
echo '{"type":"progress","bps":10,"progress":0.5}'
echo '{{{'
echo '{"type":"error","message":"disk full"}'
printf '{"type":"progress","bps":20,"progress":1.0}'"#,
            bus,
        );

        tool.verify("sig", Path::new("/nowhere"), "archive").await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1], UpdateEvent::Error(ErrorEvent { message: "disk full".into() }));
        assert_eq!(seen[2], UpdateEvent::Progress(ProgressEvent { bytes_per_second: 20.0, fraction: 1.0 }));
    }

    #[tokio::test]
    async fn exit_code_is_the_only_failure_signal() {
        let (bus, _) = collecting_bus();
        let tool = script_tool(r#"echo '{"type":"progress","bps":1,"progress":1}'; exit 3"#, bus.clone());
        assert!(matches!(tool.verify("s", Path::new("/d"), "a").await, Err(UpdateError::ToolExit(Some(3)))));

        let tool = script_tool(r#"echo '{"type":"error","message":"ignored"}'; exit 0"#, bus);
        assert!(tool.verify("s", Path::new("/d"), "a").await.is_ok());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_failure() {
        let tool = PatchTool::new(PathBuf::from("/definitely/not/a/tool"), Arc::new(EventBus::new()));
        assert!(matches!(tool.verify("s", Path::new("/d"), "a").await, Err(UpdateError::ToolSpawn(_))));
    }

    #[tokio::test]
    async fn verify_passes_heal_and_json_flags() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("args");
        let script = format!(r#"printf '%s\n' "$@" > '{}'"#, log.display());
        let tool = script_tool(&script, Arc::new(EventBus::new()));

        tool.verify("http://h/s.sig", Path::new("/games/content"), "http://h/c.zip").await.unwrap();

        let args = std::fs::read_to_string(&log).unwrap();
        let args: Vec<&str> = args.lines().collect();
        assert_eq!(args, vec!["verify", "http://h/s.sig", "/games/content", "--heal=archive,http://h/c.zip", "--json"]);
    }

    #[tokio::test]
    async fn apply_clears_stale_staging_before_and_after() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(staging.join("nested")).unwrap();
        std::fs::write(staging.join("stale.bin"), b"old").unwrap();
        std::fs::write(staging.join("nested/partial"), b"old").unwrap();

        let seen_at_start = dir.path().join("seen");
        let script = format!(
            r#"ls -A '{staging}' | wc -l > '{seen}'; touch '{staging}/work.tmp'"#,
            staging = staging.display(),
            seen = seen_at_start.display()
        );
        let tool = script_tool(&script, Arc::new(EventBus::new()));

        tool.apply(&staging, Path::new("/tmp/p.pwr"), dir.path()).await.unwrap();

        assert_eq!(std::fs::read_to_string(&seen_at_start).unwrap().trim(), "0");
        assert!(staging.is_dir());
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn apply_creates_missing_staging_dir() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("fresh");
        let tool = script_tool("exit 0", Arc::new(EventBus::new()));

        tool.apply(&staging, Path::new("/tmp/p.pwr"), dir.path()).await.unwrap();
        assert!(staging.is_dir());
    }

    #[tokio::test]
    async fn failed_apply_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let tool = script_tool("exit 2", Arc::new(EventBus::new()));
        let res = tool.apply(&dir.path().join("s"), Path::new("/tmp/p.pwr"), dir.path()).await;
        assert!(matches!(res, Err(UpdateError::ToolExit(Some(2)))));
    }
}
