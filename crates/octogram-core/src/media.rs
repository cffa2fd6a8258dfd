//! Webcam snapshots, short clips and chat pictures.

use anyhow::{anyhow, bail, Result};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use octogram_config::{ImageHook, MediaConfig};
use octogram_exec::{capture_clip, resolve_cpulimiter, resolve_ffmpeg, run_shell, which, ClipRequest};
use octogram_octoprint::{plugins, HostServices, PrinterControl, WebcamProfile};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const HOOK_TIMEOUT_SECS: u64 = 120;
const CHAT_PICTURE_SIZE: u32 = 40;

pub struct MediaCapture {
    config: MediaConfig,
    host: Arc<dyn HostServices>,
    printer: Arc<dyn PrinterControl>,
    data_dir: PathBuf,
}

impl MediaCapture {
    pub fn new(
        config: MediaConfig,
        host: Arc<dyn HostServices>,
        printer: Arc<dyn PrinterControl>,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            host,
            printer,
            data_dir,
        }
    }

    /// Configured URLs win over the webcams OctoPrint knows about.
    pub async fn webcams(&self) -> Vec<WebcamProfile> {
        if !self.config.snapshot_urls.is_empty() || !self.config.stream_urls.is_empty() {
            return configured_webcams(&self.config);
        }
        match self.host.settings().await {
            Ok(settings) => plugins::webcam_profiles(&settings),
            Err(e) => {
                warn!("Cannot read webcam settings: {}", e);
                Vec::new()
            }
        }
    }

    /// One JPEG per webcam with a snapshot URL; failing cameras are skipped.
    pub async fn snapshots(&self) -> Vec<Vec<u8>> {
        let mut images = Vec::new();
        for cam in self.webcams().await {
            let Some(url) = cam.snapshot.as_deref() else {
                debug!("Webcam {} has no snapshot url", cam.name);
                continue;
            };
            let timeout = Duration::from_secs(cam.snapshot_timeout_secs.max(1));
            let taken = match self.host.fetch(url, timeout).await {
                Ok(bytes) => transform_snapshot(&bytes, cam.flip_h, cam.flip_v, cam.rotate90),
                Err(e) => Err(e),
            };
            match taken {
                Ok(image) => images.push(image),
                Err(e) => warn!("Snapshot from webcam {} failed: {}", cam.name, e),
            }
        }
        images
    }

    /// Records an mp4 clip of `duration_secs` from every webcam with a stream URL.
    pub async fn clips(&self, duration_secs: u64) -> Vec<PathBuf> {
        let mut clips = Vec::new();
        for cam in self.webcams().await {
            let Some(stream) = cam.stream.clone() else {
                debug!("Webcam {} has no stream url", cam.name);
                continue;
            };
            match self.clip(&cam, stream, duration_secs).await {
                Ok(path) => clips.push(path),
                Err(e) => warn!("Clip from webcam {} failed: {}", cam.name, e),
            }
        }
        clips
    }

    async fn clip(&self, cam: &WebcamProfile, stream_url: String, duration_secs: u64) -> Result<PathBuf> {
        let ffmpeg = resolve_ffmpeg(self.config.ffmpeg_path.as_deref())
            .ok_or_else(|| anyhow!("ffmpeg not found"))?;
        let cpulimiter = if self.config.no_cpulimit {
            None
        } else {
            Some(resolve_cpulimiter().ok_or_else(|| anyhow!("No CPU limiter (cpulimit or limitcpu) available"))?)
        };
        let tmp = self.data_dir.join("tmp");
        std::fs::create_dir_all(&tmp)?;
        let name = if cam.name.is_empty() { "default" } else { cam.name.as_str() };

        let request = ClipRequest {
            ffmpeg,
            nice: which("nice"),
            cpulimiter,
            stream_url: absolute_url(&stream_url),
            duration_secs,
            preset: self.config.ffmpeg_preset.clone(),
            cpu_count: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            output: tmp.join(clip_file_name(name)),
            flip_h: cam.flip_h,
            flip_v: cam.flip_v,
            rotate90: cam.rotate90,
        };
        capture_clip(&request).await
    }

    /// Runs the pre-capture hook, then waits its delay.
    pub async fn pre_image(&self) {
        let hook = &self.config.pre_image;
        if self.run_hook("pre_image", hook).await {
            sleep_secs(hook.delay_secs).await;
        }
    }

    /// Waits the post-capture delay, then runs the hook.
    pub async fn post_image(&self) {
        let hook = &self.config.post_image;
        if hook_method(hook).is_some() {
            sleep_secs(hook.delay_secs).await;
        }
        self.run_hook("post_image", hook).await;
    }

    /// Returns false when no hook is configured.
    async fn run_hook(&self, name: &str, hook: &ImageHook) -> bool {
        let Some(method) = hook_method(hook) else {
            return false;
        };
        debug!("Running {} hook ({}): {}", name, method, hook.command);
        match method {
            HookMethod::Gcode => {
                let lines: Vec<String> = hook
                    .command
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect();
                if let Err(e) = self.printer.commands(&lines).await {
                    warn!("{} gcode hook failed: {}", name, e);
                }
            }
            HookMethod::System => match run_shell(&hook.command, HOOK_TIMEOUT_SECS).await {
                Ok(result) if result.success() => debug!("{} hook finished", name),
                Ok(result) => warn!("{} hook failed: {}", name, result.summary()),
                Err(e) => warn!("{} hook could not run: {}", name, e),
            },
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HookMethod {
    Gcode,
    System,
}

impl std::fmt::Display for HookMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookMethod::Gcode => write!(f, "gcode"),
            HookMethod::System => write!(f, "system"),
        }
    }
}

fn hook_method(hook: &ImageHook) -> Option<HookMethod> {
    match hook.method.to_ascii_lowercase().as_str() {
        "gcode" if !hook.command.trim().is_empty() => Some(HookMethod::Gcode),
        "system" if !hook.command.trim().is_empty() => Some(HookMethod::System),
        _ => None,
    }
}

async fn sleep_secs(secs: u64) {
    if secs > 0 {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
}

fn configured_webcams(config: &MediaConfig) -> Vec<WebcamProfile> {
    let count = config.snapshot_urls.len().max(config.stream_urls.len());
    let pick = |urls: &[String], i: usize| {
        urls.get(i)
            .map(|u| u.trim())
            .filter(|u| !u.is_empty())
            .map(str::to_string)
    };
    (0..count)
        .map(|i| WebcamProfile {
            name: format!("webcam{}", i),
            snapshot: pick(&config.snapshot_urls, i),
            stream: pick(&config.stream_urls, i),
            snapshot_timeout_secs: config.snapshot_timeout_secs,
            ..WebcamProfile::default()
        })
        .collect()
}

/// Relative stream URLs point at the local host.
fn absolute_url(url: &str) -> String {
    if url.contains("://") {
        url.to_string()
    } else {
        format!("http://localhost/{}", url.trim_start_matches('/'))
    }
}

fn clip_file_name(profile: &str) -> String {
    let safe: String = profile
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("gif_{}.mp4", safe)
}

fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.to_rgb8())
        .write_to(&mut out, ImageFormat::Jpeg)
        .map_err(|e| anyhow!("jpeg encoding failed: {}", e))?;
    Ok(out.into_inner())
}

/// Applies the webcam orientation flags and re-encodes as JPEG.
/// `rotate90` turns the picture a quarter counter-clockwise.
pub fn transform_snapshot(bytes: &[u8], flip_h: bool, flip_v: bool, rotate90: bool) -> Result<Vec<u8>> {
    let mut image =
        image::load_from_memory(bytes).map_err(|e| anyhow!("snapshot is not an image: {}", e))?;
    if flip_h {
        image = image.fliph();
    }
    if flip_v {
        image = image.flipv();
    }
    if rotate90 {
        image = image.rotate270();
    }
    encode_jpeg(&image)
}

/// 40x40 JPEG used as the chat picture.
pub fn chat_thumbnail(bytes: &[u8]) -> Result<Vec<u8>> {
    let image = image::load_from_memory(bytes).map_err(|e| anyhow!("chat photo is not an image: {}", e))?;
    let small = image.resize_exact(CHAT_PICTURE_SIZE, CHAT_PICTURE_SIZE, FilterType::Lanczos3);
    encode_jpeg(&small)
}

/// Cached picture of a chat under the data directory.
pub fn chat_picture_path(data_dir: &Path, chat_id: &str) -> PathBuf {
    data_dir.join("img").join("user").join(format!("pic{}.jpg", chat_id))
}

pub fn read_file_limited(path: &Path, limit: u64) -> Result<Vec<u8>> {
    let size = std::fs::metadata(path)?.len();
    if size > limit {
        bail!("{} is bigger than {} bytes", path.display(), limit);
    }
    Ok(std::fs::read(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_fn(width, height, |x, _| {
            if x == 0 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut out, ImageFormat::Png)
            .expect("png");
        out.into_inner()
    }

    #[test]
    fn rotation_swaps_dimensions() {
        let jpeg = transform_snapshot(&png(8, 4), false, false, true).expect("transform");
        let decoded = image::load_from_memory(&jpeg).expect("decode");
        assert_eq!(decoded.dimensions(), (4, 8));
    }

    #[test]
    fn horizontal_flip_moves_dark_column() {
        let jpeg = transform_snapshot(&png(16, 16), true, false, false).expect("transform");
        let decoded = image::load_from_memory(&jpeg).expect("decode").to_rgb8();
        let left = decoded.get_pixel(0, 8)[0];
        let right = decoded.get_pixel(15, 8)[0];
        assert!(right < left);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(transform_snapshot(b"not an image", false, false, false).is_err());
    }

    #[test]
    fn chat_thumbnails_are_small_squares() {
        let jpeg = chat_thumbnail(&png(120, 80)).expect("thumbnail");
        let decoded = image::load_from_memory(&jpeg).expect("decode");
        assert_eq!(decoded.dimensions(), (40, 40));
    }

    #[test]
    fn configured_urls_become_webcams() {
        let config = MediaConfig {
            snapshot_urls: vec!["http://cam/snap".to_string(), " ".to_string()],
            stream_urls: vec!["http://cam/stream".to_string()],
            ..MediaConfig::default()
        };
        let cams = configured_webcams(&config);
        assert_eq!(cams.len(), 2);
        assert_eq!(cams[0].stream.as_deref(), Some("http://cam/stream"));
        assert_eq!(cams[1].snapshot, None);
    }

    #[test]
    fn hooks_need_a_command() {
        let hook = ImageHook {
            method: "GCODE".to_string(),
            command: "M117 hi".to_string(),
            delay_secs: 0,
        };
        assert_eq!(hook_method(&hook), Some(HookMethod::Gcode));
        assert_eq!(hook_method(&ImageHook::default()), None);
        assert_eq!(clip_file_name("Front cam"), "gif_Front_cam.mp4");
        assert_eq!(absolute_url("/webcam/?action=stream"), "http://localhost/webcam/?action=stream");
    }
}
