//! Octogram Exec
//!
//! Guarded execution of configured shell hooks and webcam clip capture.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::debug;

const DEFAULT_MAX_OUTPUT_CHARS: usize = 3500;
const MIN_CLIP_SECS: u64 = 1;
const MAX_CLIP_SECS: u64 = 60;
/// Percent of one core granted to ffmpeg per used core.
const CPU_SHARE_PER_CORE: usize = 65;

pub const FFMPEG_PRESETS: &[&str] = &[
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    pub fn summary(&self) -> String {
        if self.timed_out {
            return format!("'{}' timed out", self.command);
        }
        let mut line = format!("'{}' exited with {}", self.command, self.exit_code);
        if !self.stderr.trim().is_empty() {
            line.push_str(&format!(": {}", self.stderr.trim()));
        }
        line
    }
}

/// Runs a configured command line through `sh -c`, as typed by the administrator.
pub async fn run_shell(raw_command: &str, timeout_secs: u64) -> Result<ExecResult> {
    let raw_command = raw_command.trim();
    if raw_command.is_empty() {
        bail!("Missing command");
    }
    if raw_command.contains('\0') {
        bail!("Command contains null byte");
    }
    shlex::split(raw_command).ok_or_else(|| anyhow!("Invalid command syntax"))?;

    let mut process = Command::new("sh");
    process.arg("-c").arg(raw_command);
    execute(process, raw_command.to_string(), timeout_secs).await
}

/// Runs a program with explicit arguments, no shell involved.
pub async fn run_program(program: &Path, args: &[String], timeout_secs: u64) -> Result<ExecResult> {
    for arg in args {
        if arg.contains('\0') {
            bail!("Argument contains null byte");
        }
    }
    let mut process = Command::new(program);
    process.args(args);
    let display = join_for_display(&program.display().to_string(), args);
    execute(process, display, timeout_secs).await
}

async fn execute(mut process: Command, display: String, timeout_secs: u64) -> Result<ExecResult> {
    process
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let shown = &display;
    debug!("Executing {}", shown);
    let timeout_secs = timeout_secs.max(1);
    let output = match timeout(Duration::from_secs(timeout_secs), process.output()).await {
        Ok(result) => result.map_err(|e| anyhow!("Failed to execute '{}': {}", display, e))?,
        Err(_) => {
            return Ok(ExecResult {
                command: display,
                exit_code: -1,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: true,
            });
        }
    };

    Ok(ExecResult {
        command: display,
        exit_code: output.status.code().unwrap_or(-1),
        stdout: truncate_output(&String::from_utf8_lossy(&output.stdout), DEFAULT_MAX_OUTPUT_CHARS),
        stderr: truncate_output(&String::from_utf8_lossy(&output.stderr), DEFAULT_MAX_OUTPUT_CHARS),
        timed_out: false,
    })
}

/// Looks a program up on `PATH`.
pub fn which(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Configured ffmpeg when it is an executable file, otherwise the one on `PATH`.
pub fn resolve_ffmpeg(configured: Option<&str>) -> Option<PathBuf> {
    configured
        .map(PathBuf::from)
        .filter(|p| is_executable(p))
        .or_else(|| which("ffmpeg"))
}

pub fn resolve_cpulimiter() -> Option<PathBuf> {
    which("cpulimit").or_else(|| which("limitcpu"))
}

pub fn valid_preset(preset: &str) -> &str {
    if FFMPEG_PRESETS.contains(&preset) {
        preset
    } else {
        "medium"
    }
}

/// Everything needed to record a short mp4 clip from a webcam stream.
#[derive(Debug, Clone)]
pub struct ClipRequest {
    pub ffmpeg: PathBuf,
    pub nice: Option<PathBuf>,
    pub cpulimiter: Option<PathBuf>,
    pub stream_url: String,
    pub duration_secs: u64,
    pub preset: String,
    pub cpu_count: usize,
    pub output: PathBuf,
    pub flip_h: bool,
    pub flip_v: bool,
    pub rotate90: bool,
}

impl ClipRequest {
    pub fn clamped_duration(&self) -> u64 {
        self.duration_secs.clamp(MIN_CLIP_SECS, MAX_CLIP_SECS)
    }

    /// Threads given to ffmpeg and the cpulimit percentage that goes with them.
    pub fn cpu_budget(&self) -> (usize, usize) {
        if self.cpu_count > 1 {
            let used = self.cpu_count / 2;
            (used, CPU_SHARE_PER_CORE * used)
        } else {
            (1, CPU_SHARE_PER_CORE)
        }
    }

    /// `-vf` chain: pixel format first, then the webcam orientation fixes.
    pub fn video_filters(&self) -> String {
        let mut filters = vec!["format=yuv420p"];
        if self.flip_v {
            filters.push("vflip");
        }
        if self.flip_h {
            filters.push("hflip");
        }
        if self.rotate90 {
            filters.push("transpose=2");
        }
        filters.join(",")
    }

    /// Full argv, starting with the program to launch.
    pub fn argv(&self) -> Vec<String> {
        let (used_cpu, limit_cpu) = self.cpu_budget();
        let mut argv = Vec::new();
        if let Some(nice) = &self.nice {
            argv.extend([nice.display().to_string(), "-n".into(), "20".into()]);
        }
        if let Some(limiter) = &self.cpulimiter {
            argv.extend([
                limiter.display().to_string(),
                "-l".into(),
                limit_cpu.to_string(),
                "-f".into(),
                "-z".into(),
                "--".into(),
            ]);
        }
        argv.push(self.ffmpeg.display().to_string());
        let threads = used_cpu.to_string();
        let duration = format_hms(self.clamped_duration());
        for arg in [
            "-y",
            "-threads",
            threads.as_str(),
            "-i",
            self.stream_url.as_str(),
            "-t",
            duration.as_str(),
            "-color_range",
            "tv",
            "-c:v",
            "libx264",
            "-preset",
            valid_preset(&self.preset),
            "-profile:v",
            "baseline",
            "-c:a",
            "aac",
            "-ac",
            "2",
            "-movflags",
            "+faststart",
        ] {
            argv.push(arg.to_string());
        }
        argv.push("-vf".to_string());
        argv.push(self.video_filters());
        argv.push(self.output.display().to_string());
        argv
    }
}

/// Records the clip and returns the written file.
pub async fn capture_clip(request: &ClipRequest) -> Result<PathBuf> {
    match std::fs::remove_file(&request.output) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(anyhow!("cannot replace {}: {}", request.output.display(), e)),
    }

    let argv = request.argv();
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty clip command"))?;
    // ffmpeg needs some time past the recording length to finish the file.
    let budget = request.clamped_duration() + 60;
    let result = run_program(Path::new(program), args, budget).await?;
    if !result.success() {
        bail!("clip capture failed: {}", result.summary());
    }
    if !request.output.is_file() {
        bail!("expected clip was not created: {}", request.output.display());
    }
    Ok(request.output.clone())
}

fn format_hms(total_secs: u64) -> String {
    format!(
        "{}:{:02}:{:02}",
        total_secs / 3600,
        (total_secs % 3600) / 60,
        total_secs % 60
    )
}

fn join_for_display(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        return command.to_string();
    }
    let joined = shlex::try_join(args.iter().map(String::as_str)).unwrap_or_else(|_| args.join(" "));
    format!("{} {}", command, joined)
}

fn truncate_output(content: &str, max_chars: usize) -> String {
    let mut chars = content.chars();
    let truncated: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}\n...[truncated]", truncated)
    } else {
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip(cpu_count: usize, duration_secs: u64) -> ClipRequest {
        ClipRequest {
            ffmpeg: PathBuf::from("/usr/bin/ffmpeg"),
            nice: Some(PathBuf::from("/usr/bin/nice")),
            cpulimiter: Some(PathBuf::from("/usr/bin/cpulimit")),
            stream_url: "http://cam/stream".to_string(),
            duration_secs,
            preset: "bogus".to_string(),
            cpu_count,
            output: PathBuf::from("/tmp/clip.mp4"),
            flip_h: false,
            flip_v: false,
            rotate90: false,
        }
    }

    #[test]
    fn orientation_filters_follow_pixel_format() {
        let mut request = clip(2, 5);
        assert_eq!(request.video_filters(), "format=yuv420p");
        request.flip_h = true;
        request.rotate90 = true;
        assert_eq!(request.video_filters(), "format=yuv420p,hflip,transpose=2");
    }

    #[test]
    fn clip_duration_is_clamped() {
        assert_eq!(clip(1, 0).clamped_duration(), 1);
        assert_eq!(clip(1, 600).clamped_duration(), 60);
        assert_eq!(clip(1, 5).clamped_duration(), 5);
    }

    #[test]
    fn clip_argv_limits_cpu_and_falls_back_to_medium() {
        let argv = clip(4, 5).argv();
        assert_eq!(&argv[..3], &["/usr/bin/nice", "-n", "20"]);
        assert_eq!(&argv[3..9], &["/usr/bin/cpulimit", "-l", "130", "-f", "-z", "--"]);
        assert_eq!(argv[9], "/usr/bin/ffmpeg");
        let threads = argv.iter().position(|a| a == "-threads").expect("threads flag");
        assert_eq!(argv[threads + 1], "2");
        let preset = argv.iter().position(|a| a == "-preset").expect("preset flag");
        assert_eq!(argv[preset + 1], "medium");
        let time = argv.iter().position(|a| a == "-t").expect("duration flag");
        assert_eq!(argv[time + 1], "0:00:05");
        assert_eq!(argv.last().map(String::as_str), Some("/tmp/clip.mp4"));
    }

    #[test]
    fn clip_argv_without_limiter_starts_with_ffmpeg() {
        let mut request = clip(1, 5);
        request.nice = None;
        request.cpulimiter = None;
        let argv = request.argv();
        assert_eq!(argv[0], "/usr/bin/ffmpeg");
        assert_eq!(request.cpu_budget(), (1, 65));
    }

    #[test]
    fn format_hms_matches_duration_notation() {
        assert_eq!(format_hms(59), "0:00:59");
        assert_eq!(format_hms(3725), "1:02:05");
    }

    #[test]
    fn truncate_output_marks_cut() {
        assert_eq!(truncate_output("abc", 5), "abc");
        assert_eq!(truncate_output("abcdef", 3), "abc\n...[truncated]");
    }

    #[tokio::test]
    async fn run_shell_rejects_unbalanced_quotes() {
        assert!(run_shell("echo 'oops", 5).await.is_err());
        assert!(run_shell("   ", 5).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_shell_captures_exit_code_and_output() {
        let result = run_shell("echo hello; exit 3", 5).await.expect("run");
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout.trim(), "hello");
        assert!(!result.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_shell_times_out() {
        let result = run_shell("sleep 5", 1).await.expect("run");
        assert!(result.timed_out);
        assert!(result.summary().contains("timed out"));
    }
}
