//! Compression settings value objects.
//!
//! Settings are immutable once attached to a job; a new run uses whatever was
//! last stored through `Registry::replace_settings`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SettingsError;
use crate::JobKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "preset")]
pub enum Resolution {
    Original,
    #[serde(rename = "1920x1080")]
    Fhd,
    #[serde(rename = "1280x720")]
    Hd,
    #[serde(rename = "854x480")]
    Sd,
    Custom { width: u32, height: u32 },
}

impl Resolution {
    /// Target dimensions, or `None` to keep the source size.
    pub fn dimensions(self) -> Option<(u32, u32)> {
        match self {
            Resolution::Original => None,
            Resolution::Fhd => Some((1920, 1080)),
            Resolution::Hd => Some((1280, 720)),
            Resolution::Sd => Some((854, 480)),
            Resolution::Custom { width, height } => Some((width, height)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum Quality {
    /// Constant rate factor, software encoders.
    Crf(u8),
    /// `-q:v` scale, hardware encoders. Also used as the 0-100 image quality.
    Qv(u8),
    /// Named encoder profile, e.g. ProRes.
    Profile(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareAcceleration {
    Cpu,
    Gpu,
}

/// Trim window in seconds. A missing end means "until the end of input".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<f64>,
    pub end: Option<f64>,
}

impl TimeRange {
    /// Output duration implied by the range, if one can be computed.
    pub fn duration(&self) -> Option<f64> {
        match (self.start, self.end) {
            (Some(start), Some(end)) if end > start => Some(end - start),
            (None, Some(end)) => Some(end),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionSettings {
    pub format: String,
    pub video_codec: String,
    pub resolution: Resolution,
    pub quality: Quality,
    pub time_range: Option<TimeRange>,
    pub hardware_acceleration: Option<HardwareAcceleration>,
    pub bit_depth: Option<u8>,
    pub audio_codec: String,
    pub sample_rate: Option<u32>,
}

impl CompressionSettings {
    /// Rejects settings no encoder run could turn into an output file.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.format.trim().is_empty() {
            return Err(SettingsError::EmptyFormat);
        }
        if let Resolution::Custom { width, height } = self.resolution {
            if width == 0 || height == 0 {
                return Err(SettingsError::Resolution { width, height });
            }
        }
        if let Some(TimeRange {
            start: Some(start),
            end: Some(end),
        }) = self.time_range
        {
            if end <= start {
                return Err(SettingsError::TimeRange);
            }
        }
        Ok(())
    }

    pub fn default_for(kind: JobKind) -> Self {
        match kind {
            JobKind::Video => Self {
                format: "mp4".into(),
                video_codec: "libx264".into(),
                resolution: Resolution::Original,
                quality: Quality::Crf(23),
                time_range: None,
                hardware_acceleration: None,
                bit_depth: None,
                audio_codec: "aac".into(),
                sample_rate: None,
            },
            JobKind::Image => Self {
                format: "jpeg".into(),
                video_codec: "mjpeg".into(),
                resolution: Resolution::Original,
                quality: Quality::Qv(80),
                time_range: None,
                hardware_acceleration: None,
                bit_depth: None,
                audio_codec: "copy".into(),
                sample_rate: None,
            },
        }
    }
}

/// Partial settings applied over a job's own settings, field by field.
///
/// Used by batch runs to push shared choices onto every job while keeping
/// whatever each job had for the fields left unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsOverride {
    pub format: Option<String>,
    pub video_codec: Option<String>,
    pub resolution: Option<Resolution>,
    pub quality: Option<Quality>,
    pub time_range: Option<TimeRange>,
    pub hardware_acceleration: Option<HardwareAcceleration>,
    pub bit_depth: Option<u8>,
    pub audio_codec: Option<String>,
    pub sample_rate: Option<u32>,
}

impl SettingsOverride {
    pub fn is_empty(&self) -> bool {
        *self == SettingsOverride::default()
    }

    pub fn apply(&self, base: &CompressionSettings) -> CompressionSettings {
        let mut merged = base.clone();
        if let Some(format) = &self.format {
            merged.format = format.clone();
        }
        if let Some(codec) = &self.video_codec {
            merged.video_codec = codec.clone();
        }
        if let Some(resolution) = self.resolution {
            merged.resolution = resolution;
        }
        if let Some(quality) = &self.quality {
            merged.quality = quality.clone();
        }
        if self.time_range.is_some() {
            merged.time_range = self.time_range;
        }
        if self.hardware_acceleration.is_some() {
            merged.hardware_acceleration = self.hardware_acceleration;
        }
        if self.bit_depth.is_some() {
            merged.bit_depth = self.bit_depth;
        }
        if let Some(codec) = &self.audio_codec {
            merged.audio_codec = codec.clone();
        }
        if self.sample_rate.is_some() {
            merged.sample_rate = self.sample_rate;
        }
        merged
    }
}

/// `<dir>/<input stem>_compressed.<format>`
pub fn output_path_for(input: &Path, dir: &Path, format: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    dir.join(format!("{stem}_compressed.{format}"))
}
