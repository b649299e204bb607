use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use crate::toolchain::FfmpegMode;

pub const API_KEY_ENV: &str = "CHATREEL_API_KEY";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    pub fps: u32,
    pub canvas: Canvas,
    pub theme: String,
    /// Bubbles per page of a thread.
    pub window_size: usize,
    /// Bubbles per page when the page holds an image.
    pub image_window_size: usize,
    pub speech: SpeechConfig,
    pub cache_dir: Option<PathBuf>,
    pub trim: TrimConfig,
    pub card_timeout_secs: u64,
    pub sounds: SoundConfig,
    pub ffmpeg: FfmpegMode,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            canvas: Canvas::default(),
            theme: "light".to_owned(),
            window_size: 6,
            image_window_size: 3,
            speech: SpeechConfig::default(),
            cache_dir: None,
            trim: TrimConfig::default(),
            card_timeout_secs: 20,
            sounds: SoundConfig::default(),
            ffmpeg: FfmpegMode::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
}

impl Default for Canvas {
    fn default() -> Self {
        Self {
            width: 1080,
            height: 1920,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpeechConfig {
    pub base_url: String,
    pub poll_interval_ms: u64,
    pub max_polls: u32,
    pub request_timeout_secs: u64,
    pub max_concurrency: usize,
    pub default_voice: String,
    /// Speaker name (any case) to provider voice id.
    pub voices: BTreeMap<String, String>,
    pub stability: f32,
    pub similarity_boost: f32,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8088".to_owned(),
            poll_interval_ms: 1000,
            max_polls: 60,
            request_timeout_secs: 30,
            max_concurrency: 4,
            default_voice: "narrator".to_owned(),
            voices: BTreeMap::new(),
            stability: 0.5,
            similarity_boost: 0.75,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrimConfig {
    pub enabled: bool,
    pub noise_db: f64,
    pub min_silence_seconds: f64,
    pub padding_seconds: f64,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            noise_db: -40.0,
            min_silence_seconds: 0.35,
            padding_seconds: 0.12,
        }
    }
}

/// Optional custom notification sounds; generated tones are used otherwise.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SoundConfig {
    pub outgoing: Option<PathBuf>,
    pub incoming: Option<PathBuf>,
}

impl JobConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fps == 0 {
            bail!("fps must be > 0");
        }
        if self.canvas.width == 0 || self.canvas.height == 0 {
            bail!(
                "canvas must be non-empty, got {}x{}",
                self.canvas.width,
                self.canvas.height
            );
        }
        if self.canvas.width % 2 != 0 || self.canvas.height % 2 != 0 {
            bail!(
                "canvas dimensions must be even for yuv420p output, got {}x{}",
                self.canvas.width,
                self.canvas.height
            );
        }
        if self.window_size == 0 || self.image_window_size == 0 {
            bail!("window_size and image_window_size must be >= 1");
        }
        if self.image_window_size > self.window_size {
            bail!(
                "image_window_size ({}) cannot exceed window_size ({})",
                self.image_window_size,
                self.window_size
            );
        }
        if self.speech.max_concurrency == 0 {
            bail!("speech.max_concurrency must be >= 1");
        }
        if self.speech.max_polls == 0 {
            bail!("speech.max_polls must be >= 1");
        }
        if self.speech.default_voice.trim().is_empty() {
            bail!("speech.default_voice cannot be empty");
        }
        url::Url::parse(&self.speech.base_url)
            .with_context(|| format!("speech.base_url '{}' is not a URL", self.speech.base_url))?;
        for (name, value) in [
            ("trim.noise_db", self.trim.noise_db),
            ("trim.min_silence_seconds", self.trim.min_silence_seconds),
            ("trim.padding_seconds", self.trim.padding_seconds),
        ] {
            if !value.is_finite() {
                bail!("{name} must be finite");
            }
        }
        if self.trim.min_silence_seconds <= 0.0 || self.trim.padding_seconds < 0.0 {
            bail!("trim.min_silence_seconds must be > 0 and trim.padding_seconds >= 0");
        }
        Ok(())
    }
}

pub fn load_and_validate_config(path: &Path) -> Result<JobConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config = parse_config(&contents).map_err(|error| {
        anyhow!("invalid config {}: {error:#}", path.display())
    })?;
    Ok(config)
}

pub fn parse_config(contents: &str) -> Result<JobConfig> {
    let config: JobConfig = if contents.trim().is_empty() {
        JobConfig::default()
    } else {
        serde_yaml::from_str(contents).map_err(|error| {
            let location = error
                .location()
                .map(|location| format!("line {}, column {}", location.line(), location.column()))
                .unwrap_or_else(|| "unknown location".to_owned());
            anyhow!("failed to parse yaml at {}: {}", location, error)
        })?
    };
    config.validate()?;
    Ok(config)
}

/// CLI value wins over the environment.
pub fn resolve_api_key(cli_arg: Option<String>, env_var: Option<String>) -> Option<String> {
    cli_arg
        .or(env_var)
        .map(|key| key.trim().to_owned())
        .filter(|key| !key.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse_config("").expect("defaults should validate");
        assert_eq!(config.fps, 30);
        assert_eq!(config.canvas, Canvas::default());
        assert_eq!(config.window_size, 6);
        assert!(config.trim.enabled);
    }

    #[test]
    fn partial_yaml_overrides_fields() {
        let config = parse_config(
            r#"
fps: 24
theme: dark
speech:
  voices:
    Bob: voice-bob
trim:
  noise_db: -35
"#,
        )
        .expect("config should parse");
        assert_eq!(config.fps, 24);
        assert_eq!(config.theme, "dark");
        assert_eq!(config.speech.voices.get("Bob").map(String::as_str), Some("voice-bob"));
        assert_eq!(config.trim.noise_db, -35.0);
        assert_eq!(config.trim.padding_seconds, 0.12);
    }

    #[test]
    fn rejects_zero_fps_and_unknown_fields() {
        assert!(parse_config("fps: 0").is_err());
        let error = parse_config("fsp: 30").expect_err("typo should be rejected");
        assert!(error.to_string().contains("line"), "{error}");
    }

    #[test]
    fn rejects_odd_canvas() {
        assert!(parse_config("canvas: { width: 721, height: 1280 }").is_err());
    }

    #[test]
    fn api_key_resolution_prefers_cli() {
        assert_eq!(
            resolve_api_key(Some("cli".into()), Some("env".into())).as_deref(),
            Some("cli")
        );
        assert_eq!(resolve_api_key(None, Some("env".into())).as_deref(), Some("env"));
        assert_eq!(resolve_api_key(Some("  ".into()), None), None);
    }
}
