//! External encoder/prober process execution.
//!
//! Every ffmpeg/ffprobe invocation in the crate goes through [`Toolchain::run`],
//! which captures the exit status and both output streams. A non-zero exit is
//! always surfaced as an error carrying the stderr tail.

use std::ffi::OsString;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

const STDERR_TAIL_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FfmpegMode {
    #[default]
    Auto,
    System,
    Sidecar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Ffmpeg,
    Ffprobe,
}

impl Tool {
    fn label(self) -> &'static str {
        match self {
            Tool::Ffmpeg => "ffmpeg",
            Tool::Ffprobe => "ffprobe",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Resolved encoder/prober binaries.
#[derive(Debug, Clone)]
pub struct Toolchain {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    mode_label: &'static str,
}

impl Toolchain {
    pub fn system() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            mode_label: "system",
        }
    }

    pub fn with_paths(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            mode_label: "custom",
        }
    }

    pub fn resolve(mode: FfmpegMode) -> Result<Self> {
        match mode {
            FfmpegMode::Auto | FfmpegMode::System => Ok(Self::system()),
            FfmpegMode::Sidecar => {
                #[cfg(feature = "sidecar_ffmpeg")]
                {
                    let ffmpeg = ffmpeg_sidecar::paths::ffmpeg_path();
                    if !ffmpeg.exists() {
                        ffmpeg_sidecar::download::auto_download()
                            .context("failed to auto-download ffmpeg sidecar binary")?;
                    }
                    let ffprobe = ffmpeg.with_file_name(if cfg!(windows) {
                        "ffprobe.exe"
                    } else {
                        "ffprobe"
                    });
                    Ok(Self {
                        ffmpeg,
                        ffprobe,
                        mode_label: "sidecar",
                    })
                }
                #[cfg(not(feature = "sidecar_ffmpeg"))]
                {
                    Err(anyhow!(
                        "ffmpeg sidecar mode requested but chatreel was built without `sidecar_ffmpeg`. Rebuild with `--features sidecar_ffmpeg`."
                    ))
                }
            }
        }
    }

    pub fn ffmpeg_path(&self) -> &Path {
        &self.ffmpeg
    }

    pub fn binary(&self, tool: Tool) -> &Path {
        match tool {
            Tool::Ffmpeg => &self.ffmpeg,
            Tool::Ffprobe => &self.ffprobe,
        }
    }

    /// Runs a tool to completion and fails on non-zero exit.
    pub fn run<I, S>(&self, tool: Tool, args: I) -> Result<ToolOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let output = self.run_unchecked(tool, args, None)?;
        ensure_success(tool, &output)?;
        Ok(output)
    }

    /// Runs a tool and returns its output regardless of exit status. Spawn
    /// failures and timeouts are still errors.
    pub fn run_unchecked<I, S>(
        &self,
        tool: Tool,
        args: I,
        timeout: Option<Duration>,
    ) -> Result<ToolOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let binary = self.binary(tool);
        let args = args.into_iter().map(Into::into).collect::<Vec<OsString>>();
        let mut child = Command::new(binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| spawn_error(tool, binary, self.mode_label, &args, error))?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        // Drain both pipes on helper threads so a chatty child never blocks.
        let stdout_reader = thread::spawn(move || read_pipe(&mut stdout_pipe));
        let stderr_reader = thread::spawn(move || read_pipe(&mut stderr_pipe));

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child
                .try_wait()
                .with_context(|| format!("failed while waiting for {}", tool.label()))?
            {
                break status;
            }
            if let Some(limit) = timeout {
                if started.elapsed() > limit {
                    child
                        .kill()
                        .with_context(|| format!("failed to kill timed-out {}", tool.label()))?;
                    let _ = child.wait();
                    bail!(
                        "{} timed out after {} seconds",
                        tool.label(),
                        limit.as_secs_f64()
                    );
                }
            }
            thread::sleep(Duration::from_millis(10));
        };

        let stdout = stdout_reader
            .join()
            .map_err(|_| anyhow!("{} stdout reader panicked", tool.label()))?;
        let stderr = stderr_reader
            .join()
            .map_err(|_| anyhow!("{} stderr reader panicked", tool.label()))?;

        Ok(ToolOutput {
            status,
            stdout,
            stderr,
        })
    }
}

pub fn ensure_success(tool: Tool, output: &ToolOutput) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    bail!(
        "{} failed with status {} (stderr_tail='{}')",
        tool.label(),
        output.status,
        last_n_chars(&output.stderr, STDERR_TAIL_CHARS)
    )
}

pub(crate) fn spawn_error(
    tool: Tool,
    binary: &Path,
    mode_label: &str,
    args: &[OsString],
    error: std::io::Error,
) -> anyhow::Error {
    if error.kind() == ErrorKind::NotFound {
        anyhow!(
            "{} executable not found (mode={mode_label}, resolved_path={}). Install ffmpeg or use sidecar mode with `--features sidecar_ffmpeg`.",
            tool.label(),
            binary.display()
        )
    } else {
        anyhow!(
            "failed to spawn {} (mode={mode_label}, resolved_path={}, args='{}'): {error}",
            tool.label(),
            binary.display(),
            args.iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        )
    }
}

fn read_pipe<R: Read>(pipe: &mut Option<R>) -> String {
    let Some(pipe) = pipe.as_mut() else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).to_string()
}

pub fn last_n_chars(s: &str, max_chars: usize) -> String {
    let mut chars = s.chars().collect::<Vec<_>>();
    if chars.len() > max_chars {
        chars = chars[chars.len().saturating_sub(max_chars)..].to_vec();
    }
    chars.into_iter().collect::<String>().trim().to_owned()
}

/// Formats seconds for ffmpeg arguments without exponent notation.
pub fn seconds_arg(seconds: f64) -> String {
    format!("{:.6}", seconds.max(0.0))
}

pub fn command_available(name: &str, version_arg: &str) -> bool {
    Command::new(name)
        .arg(version_arg)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
